use thiserror::Error;

/// Errors that abort session manager startup. Once the manager is running
/// nothing aborts it; per-client failures end the session and the loop
/// returns to accepting.
#[derive(Debug, Error)]
pub enum SetupError {
	#[error("failed to bind session socket: {0}")]
	Bind(#[from] nix::Error),
	#[error("receive timeouts must be non-zero")]
	ZeroTimeout,
}
