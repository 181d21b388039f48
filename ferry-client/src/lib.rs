//! Producer-side library for the ferry buffer bridge.
//!
//! A [`ProducerClient`] connects to the consumer's session socket, transfers
//! buffer descriptors (geometry plus one fd per plane) and afterwards posts
//! them again by registry index, which costs a single byte on the wire. The
//! consumer answers every posted buffer with a render status byte.

mod config;
mod error;

pub use config::ProducerConfig;
pub use error::ClientError;

use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use ferry_protocol::{
	BufferInfo, MAX_INDEXED_BUFFERS, RenderStatus, transfer, unix_socket_utils,
};

/// Synchronous producer handle, one per connection.
///
/// The client mirrors the consumer's registry with a plain submission
/// counter: buffers get consecutive indices in transfer order, so both
/// sides agree on the numbering without any index traveling in the
/// descriptor itself.
pub struct ProducerClient {
	socket: UnixStream,
	submitted: usize,
}

impl ProducerClient {
	/// Connect to the consumer's session endpoint.
	pub fn connect(config: ProducerConfig) -> Result<Self, ClientError> {
		let socket = unix_socket_utils::connect_session(config.socket_path_ref())?;
		tracing::debug!(path = %config.socket_path_ref().display(), "connected to consumer");
		Ok(Self { socket, submitted: 0 })
	}

	/// Transfer a new buffer and request a render of it. The kernel
	/// duplicates the plane fds during the transfer, so the caller keeps
	/// its own. Returns the index under which the buffer can be posted
	/// again later.
	pub fn submit_buffer<F: AsFd>(
		&mut self,
		info: BufferInfo,
		planes: &[F],
	) -> Result<u8, ClientError> {
		if self.submitted >= MAX_INDEXED_BUFFERS {
			return Err(ClientError::RegistryFull);
		}
		let borrowed: Vec<BorrowedFd<'_>> = planes.iter().map(|fd| fd.as_fd()).collect();
		transfer::send_descriptor(&self.socket, info, &borrowed)?;
		let index = self.submitted as u8;
		self.submitted += 1;
		Ok(index)
	}

	/// Request a render of an already transferred buffer.
	pub fn post(&mut self, index: u8) -> Result<(), ClientError> {
		if usize::from(index) >= self.submitted {
			return Err(ClientError::UnknownIndex {
				index,
				submitted: self.submitted,
			});
		}
		transfer::send_control_byte(&self.socket, index)?;
		Ok(())
	}

	/// Block until the consumer reports the render outcome of the last
	/// submitted or posted buffer. Exactly one status byte arrives per
	/// request.
	pub fn wait_status(&mut self) -> Result<RenderStatus, ClientError> {
		Ok(transfer::receive_status(&self.socket)?)
	}

	/// Number of buffers transferred over this connection so far.
	pub fn submitted(&self) -> usize {
		self.submitted
	}
}
