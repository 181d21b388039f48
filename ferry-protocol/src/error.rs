use thiserror::Error;

/// Errors surfaced by the transfer primitives and the descriptor codec.
///
/// `Timeout` is the only recoverable case for a session loop; everything
/// else means the stream can no longer be trusted and the peer has to be
/// dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("receive timed out")]
	Timeout,

	#[error("peer closed the connection")]
	UnexpectedEof,

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("socket error: {0}")]
	Nix(#[from] nix::Error),

	#[error("message truncated by the kernel")]
	Truncated,

	#[error("invalid descriptor: {0}")]
	InvalidDescriptor(&'static str),

	#[error("unknown pixel format {0}")]
	UnknownPixelFormat(u32),

	#[error("descriptor declared {declared} plane fds, received {received}")]
	PlaneCountMismatch { declared: u32, received: usize },

	#[error("reuse index {index} out of range ({registered} buffers registered)")]
	InvalidIndex { index: u8, registered: usize },
}

impl ProtocolError {
	/// True for the one error a session loop absorbs without dropping the
	/// client.
	pub fn is_timeout(&self) -> bool {
		matches!(self, ProtocolError::Timeout)
	}
}
