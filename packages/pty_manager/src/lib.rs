//! PTY Manager - interactive shell sessions keyed by id
//!
//! Each session is a PTY actor that serializes writes and resizes, plus a
//! forwarder that publishes output and removes the session once the shell
//! exits. The manager has no HTTP dependencies; the relay server wraps it in
//! a WebSocket.
//!
//! # Example
//!
//! ```no_run
//! use pty_manager::{PtyManager, PtyOptions, PtyOutput};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = PtyManager::new();
//!
//!     let mut spawned = manager.spawn(PtyOptions::default()).await.unwrap();
//!     let id = spawned.session.id.clone();
//!
//!     manager.write(&id, b"echo hello\n").await.unwrap();
//!
//!     while let Ok(output) = spawned.output.recv().await {
//!         match output {
//!             PtyOutput::Data { data, .. } => {
//!                 print!("{}", String::from_utf8_lossy(&data));
//!             }
//!             PtyOutput::Exited { exit_code } => {
//!                 println!("exited with {:?}", exit_code);
//!                 break;
//!             }
//!         }
//!     }
//! }
//! ```

mod error;
mod manager;
pub mod pty;

pub use error::PtyError;
pub use manager::{PtyManager, PtySession, SpawnedPty};
pub use pty::{PtyHandle, PtyOptions, PtyOutput, TERM_NAME, default_cwd, default_shell};
