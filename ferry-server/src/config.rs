use std::path::{Path, PathBuf};
use std::time::Duration;

use ferry_protocol::DEFAULT_SOCKET_PATH;

/// Receive timeout while the consumer surface holds focus. Short, so a
/// producer that stops posting is noticed within a frame or two.
pub const FOCUSED_RECEIVE_TIMEOUT: Duration = Duration::from_millis(25);

/// Receive timeout while focus is lost. Long, so an idle surface costs
/// almost no wakeups.
pub const UNFOCUSED_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Focused idle time after which a single fallback frame is published.
pub const NO_BUFFER_THRESHOLD: Duration = Duration::from_millis(500);

/// Builder-style configuration for a session manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	socket_path: PathBuf,
	focused_timeout: Duration,
	unfocused_timeout: Duration,
	no_buffer_threshold: Duration,
	start_focused: bool,
}

impl SessionConfig {
	pub fn new() -> Self {
		Self {
			socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
			focused_timeout: FOCUSED_RECEIVE_TIMEOUT,
			unfocused_timeout: UNFOCUSED_RECEIVE_TIMEOUT,
			no_buffer_threshold: NO_BUFFER_THRESHOLD,
			start_focused: true,
		}
	}

	pub fn socket_path(mut self, path: impl AsRef<Path>) -> Self {
		self.socket_path = path.as_ref().into();
		self
	}

	pub fn focused_timeout(mut self, timeout: Duration) -> Self {
		self.focused_timeout = timeout;
		self
	}

	pub fn unfocused_timeout(mut self, timeout: Duration) -> Self {
		self.unfocused_timeout = timeout;
		self
	}

	pub fn no_buffer_threshold(mut self, threshold: Duration) -> Self {
		self.no_buffer_threshold = threshold;
		self
	}

	pub fn start_focused(mut self, focused: bool) -> Self {
		self.start_focused = focused;
		self
	}

	pub fn socket_path_ref(&self) -> &Path {
		&self.socket_path
	}

	pub(crate) fn receive_timeout(&self, focused: bool) -> Duration {
		if focused {
			self.focused_timeout
		} else {
			self.unfocused_timeout
		}
	}

	pub(crate) fn threshold(&self) -> Duration {
		self.no_buffer_threshold
	}

	pub(crate) fn initial_focus(&self) -> bool {
		self.start_focused
	}
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self::new()
	}
}
