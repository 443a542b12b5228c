pub mod chat;
pub mod health;
pub mod terminal;

// Re-export all handlers for easy route registration
pub use chat::{chat_handler, prewarm_handler};
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use terminal::terminal_ws_handler;
