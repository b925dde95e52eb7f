//! PTY Manager - PTY lifecycle management library
//!
//! Each PTY is owned by an actor task. Callers hold a cheap [`PtyHandle`] for
//! input, resize and kill, and receive [`PtyEvent`]s on a channel of their
//! choosing, so the embedding application can fold terminal output into its
//! own event loop. It has no HTTP dependencies and no knowledge of what runs
//! inside the terminal.
//!
//! # Example
//!
//! ```no_run
//! use pty_manager::{PtyActor, PtyConfig, PtyEvent, PtyId};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (tx, mut rx) = mpsc::channel::<PtyEvent>(64);
//!
//!     let config = PtyConfig {
//!         command: "/bin/bash".to_string(),
//!         working_dir: Some("/tmp".to_string()),
//!         ..Default::default()
//!     };
//!
//!     let handle = PtyActor::spawn(PtyId(1), config, tx).unwrap();
//!     handle.write_str("echo hello; exit\n").unwrap();
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             PtyEvent::Output { id, data } => {
//!                 println!("{}: {:?}", id, String::from_utf8_lossy(&data));
//!             }
//!             PtyEvent::Exited { id, .. } => {
//!                 println!("{} exited", id);
//!                 break;
//!             }
//!         }
//!     }
//! }
//! ```

mod error;
pub mod pty;
mod scrollback;

pub use error::PtyError;
pub use pty::{PtyActor, PtyConfig, PtyEvent, PtyHandle, PtyId};
pub use scrollback::Scrollback;
