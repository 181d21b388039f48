use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("protocol error: {0}")]
	Protocol(#[from] ferry_protocol::ProtocolError),
	#[error("failed to connect to consumer: {0}")]
	Connect(#[from] nix::Error),
	#[error("registry is full, no index left for another buffer")]
	RegistryFull,
	#[error("buffer index {index} was never submitted ({submitted} transferred)")]
	UnknownIndex { index: u8, submitted: usize },
}
