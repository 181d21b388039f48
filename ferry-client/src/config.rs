use std::path::{Path, PathBuf};

use ferry_protocol::DEFAULT_SOCKET_PATH;

/// Builder-style configuration for connecting to a consumer.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
	socket_path: PathBuf,
}

impl ProducerConfig {
	pub fn new() -> Self {
		Self {
			socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
		}
	}

	pub fn socket_path(mut self, path: impl AsRef<Path>) -> Self {
		self.socket_path = path.as_ref().into();
		self
	}

	pub fn socket_path_ref(&self) -> &Path {
		&self.socket_path
	}
}

impl Default for ProducerConfig {
	fn default() -> Self {
		Self::new()
	}
}
