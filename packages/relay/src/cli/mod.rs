pub mod attach;
pub mod chat;
pub mod terminal;
