//! Consumer-side core of the ferry buffer bridge: the single-client session
//! loop over the Unix socket, the per-session descriptor registry and the
//! render handoff rendezvous.
//!
//! The host embeds this by binding a [`SessionManager`], wiring its
//! [`RenderNotifier`] into the render loop and servicing the
//! [`HandoffBridge`] from the render thread. Everything socket-side runs on
//! the manager's own thread.

mod bridge;
mod config;
mod error;
mod registry;
mod session;

pub use bridge::{HandoffBridge, HandoffEvent, RenderNotifier};
pub use config::{
	FOCUSED_RECEIVE_TIMEOUT, NO_BUFFER_THRESHOLD, SessionConfig, UNFOCUSED_RECEIVE_TIMEOUT,
};
pub use error::SetupError;
pub use registry::BufferRegistry;
pub use session::{ProducerWake, SessionController, SessionManager};
