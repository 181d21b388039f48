//! Shared wire-level definitions for the ferry buffer bridge.
//!
//! Both sides of the bridge speak the same single-byte-prefixed protocol
//! over a Unix domain stream socket: a control byte announces either a full
//! descriptor transfer (header plus plane fds via `SCM_RIGHTS`) or the reuse
//! of an already-registered buffer by index. This crate holds the message
//! types, the fixed header codec and the fd-carrying transfer primitives.

pub mod transfer;
pub mod unix_socket_utils;

mod error;

pub use error::ProtocolError;

use std::os::fd::{IntoRawFd, OwnedFd};

/// Default Unix domain socket the session endpoint is bound to.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/ferry.sock";

/// Control byte announcing a full descriptor transfer. Every other value is
/// an index into the receiver's buffer registry.
pub const DESCRIPTOR_SENTINEL: u8 = 0xFF;

/// Highest number of buffers addressable by index reuse; the sentinel value
/// itself can never be an index.
pub const MAX_INDEXED_BUFFERS: usize = 255;

/// Upper bound on plane fds attached to a single descriptor transfer.
pub const MAX_PLANE_FDS: usize = 8;

/// Byte length of the fixed descriptor header: five little-endian u32
/// fields (width, height, stride, format, plane count).
pub const DESCRIPTOR_HEADER_LEN: usize = 20;

/// Pixel format of a transferred buffer.
///
/// The wire values follow the producer's native format numbering so the
/// header field round-trips without a mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelFormat {
	Rgba8888 = 1,
	Rgbx8888 = 2,
	Rgb888 = 3,
	Rgb565 = 4,
	Bgra8888 = 5,
}

impl PixelFormat {
	pub fn from_wire(raw: u32) -> Option<Self> {
		match raw {
			1 => Some(Self::Rgba8888),
			2 => Some(Self::Rgbx8888),
			3 => Some(Self::Rgb888),
			4 => Some(Self::Rgb565),
			5 => Some(Self::Bgra8888),
			_ => None,
		}
	}

	pub fn as_wire(self) -> u32 {
		self as u32
	}
}

/// Outcome of one render pass, reported back to the producer as a single
/// byte after its buffer was handed to the render side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RenderStatus {
	Ok = 0,
	Failed = 1,
}

impl RenderStatus {
	/// Any nonzero byte is treated as a failure report.
	pub fn from_wire(raw: u8) -> Self {
		if raw == 0 { Self::Ok } else { Self::Failed }
	}

	pub fn as_wire(self) -> u8 {
		self as u8
	}
}

/// Geometry and format of one producer buffer, as carried in the wire
/// header. Plane fds travel next to it as ancillary data, never inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
	pub width: u32,
	pub height: u32,
	pub stride: u32,
	pub format: PixelFormat,
}

/// One transferred graphics buffer: its geometry plus the kernel handles
/// backing it.
///
/// The descriptor owns its plane fds. They are duplicates created by the
/// kernel during the `SCM_RIGHTS` transfer and are closed exactly once when
/// the descriptor is dropped; the producer's originals are unaffected.
#[derive(Debug)]
pub struct BufferDescriptor {
	info: BufferInfo,
	planes: Vec<OwnedFd>,
}

impl BufferDescriptor {
	pub fn new(info: BufferInfo, planes: Vec<OwnedFd>) -> Self {
		debug_assert!(!planes.is_empty(), "descriptor without plane fds");
		Self { info, planes }
	}

	pub fn info(&self) -> BufferInfo {
		self.info
	}

	pub fn planes(&self) -> &[OwnedFd] {
		&self.planes
	}
}

impl Drop for BufferDescriptor {
	fn drop(&mut self) {
		for fd in self.planes.drain(..) {
			let raw = fd.into_raw_fd();
			if let Err(err) = nix::unistd::close(raw) {
				tracing::warn!(fd = raw, "failed to close buffer plane fd: {err}");
			}
		}
	}
}
