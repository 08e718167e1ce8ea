//! Inter-node relay for the push service.
//!
//! When a client's live connection is held by another node, the node that
//! sees the update forwards it there over the private cluster network with
//! [`Router::send_update`].  Every node runs [`Router::handle_updates`] to
//! receive those forwards and hand them to the local push logic.

pub mod codec;
pub mod config;
pub mod error;
pub mod reporter;
pub mod router;
pub mod types;
pub mod updater;

pub use config::Config;
pub use error::{RelayError, Result};
pub use reporter::{LogReporter, NoopReporter, Reporter};
pub use router::Router;
pub use types::Update;
pub use updater::Updater;
