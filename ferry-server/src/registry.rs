use std::sync::Arc;

use ferry_protocol::BufferDescriptor;

/// Ordered store of every descriptor transferred during one client session.
///
/// Arrival order defines the wire index: the producer refers back to the
/// n-th transferred buffer with a bare control byte of value n. Indices stay
/// stable for the whole session because the registry is only ever cleared as
/// a whole, never compacted.
#[derive(Debug, Default)]
pub struct BufferRegistry {
	entries: Vec<Arc<BufferDescriptor>>,
}

impl BufferRegistry {
	pub fn new() -> Self {
		Self { entries: Vec::new() }
	}

	/// Store a freshly transferred descriptor and return its wire index.
	pub fn append(&mut self, descriptor: BufferDescriptor) -> usize {
		self.entries.push(Arc::new(descriptor));
		self.entries.len() - 1
	}

	/// Look up a reuse index received from the wire. The index is untrusted
	/// input; anything outside the occupied range is `None`.
	pub fn get(&self, index: usize) -> Option<Arc<BufferDescriptor>> {
		self.entries.get(index).cloned()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Drop every descriptor. Plane fds close when the last reference goes
	/// away, so a descriptor still held by the render side stays usable.
	pub fn clear(&mut self) {
		if !self.entries.is_empty() {
			tracing::debug!(buffers = self.entries.len(), "clearing buffer registry");
		}
		self.entries.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ferry_protocol::{BufferInfo, PixelFormat};
	use std::io::Read;
	use std::os::fd::OwnedFd;
	use std::os::unix::net::UnixStream;
	use std::time::Duration;

	fn descriptor_with_plane() -> (BufferDescriptor, UnixStream) {
		let (keep, give) = UnixStream::pair().unwrap();
		let info = BufferInfo {
			width: 16,
			height: 16,
			stride: 64,
			format: PixelFormat::Rgba8888,
		};
		(BufferDescriptor::new(info, vec![OwnedFd::from(give)]), keep)
	}

	fn assert_peer_closed(peer: &UnixStream) {
		peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
		let mut reader = peer;
		let mut byte = [0u8; 1];
		assert_eq!(reader.read(&mut byte).unwrap(), 0);
	}

	fn assert_peer_open(peer: &UnixStream) {
		peer.set_read_timeout(Some(Duration::from_millis(25))).unwrap();
		let mut reader = peer;
		let mut byte = [0u8; 1];
		let err = reader.read(&mut byte).unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
	}

	#[test]
	fn indices_follow_arrival_order() {
		let mut registry = BufferRegistry::new();
		assert!(registry.is_empty());
		assert!(registry.get(0).is_none());

		let (first, _k1) = descriptor_with_plane();
		let (second, _k2) = descriptor_with_plane();
		assert_eq!(registry.append(first), 0);
		assert_eq!(registry.append(second), 1);
		assert_eq!(registry.len(), 2);

		assert!(registry.get(1).is_some());
		assert!(registry.get(2).is_none());
		assert!(registry.get(255).is_none());
	}

	#[test]
	fn clear_closes_plane_fds() {
		let mut registry = BufferRegistry::new();
		let (descriptor, peer) = descriptor_with_plane();
		registry.append(descriptor);
		assert_peer_open(&peer);

		registry.clear();
		assert!(registry.is_empty());
		assert_peer_closed(&peer);
	}

	#[test]
	fn outstanding_reference_outlives_clear() {
		let mut registry = BufferRegistry::new();
		let (descriptor, peer) = descriptor_with_plane();
		registry.append(descriptor);

		let held = registry.get(0).unwrap();
		registry.clear();
		// The render side still holds the descriptor, so its fd stays open.
		assert_eq!(held.planes().len(), 1);
		assert_peer_open(&peer);

		drop(held);
		assert_peer_closed(&peer);
	}
}
