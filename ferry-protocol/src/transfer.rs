//! Blocking transfer primitives over a Unix domain stream socket.
//!
//! Every producer message starts with one control byte. The sentinel value
//! announces a descriptor segment (fixed header plus plane fds carried as
//! `SCM_RIGHTS` ancillary data in a single `sendmsg`); any other byte is a
//! reuse index and carries nothing else. The control byte is sent as its
//! own segment so that the receiver's plain one-byte read can never consume
//! or discard the ancillary payload attached to the header.

use std::io::{ErrorKind, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};

use crate::{
	BufferDescriptor, BufferInfo, DESCRIPTOR_HEADER_LEN, DESCRIPTOR_SENTINEL, MAX_PLANE_FDS,
	PixelFormat, ProtocolError, RenderStatus,
};

/// Read the control byte that prefixes every producer message.
pub fn receive_control_byte(stream: &UnixStream) -> Result<u8, ProtocolError> {
	let mut byte = [0u8; 1];
	read_exact(stream, &mut byte)?;
	Ok(byte[0])
}

/// Send a bare control byte. Used by producers for index reuse.
pub fn send_control_byte(stream: &UnixStream, byte: u8) -> Result<(), ProtocolError> {
	let mut writer = stream;
	writer.write_all(&[byte])?;
	Ok(())
}

/// Send the descriptor sentinel followed by the descriptor segment carrying
/// the plane fds. The kernel duplicates the fds at send time; the caller
/// keeps its own.
pub fn send_descriptor(
	stream: &UnixStream,
	info: BufferInfo,
	planes: &[BorrowedFd<'_>],
) -> Result<(), ProtocolError> {
	if planes.is_empty() || planes.len() > MAX_PLANE_FDS {
		return Err(ProtocolError::InvalidDescriptor("plane count out of range"));
	}
	send_control_byte(stream, DESCRIPTOR_SENTINEL)?;

	let header = encode_header(info, planes.len());
	let raw_fds: Vec<RawFd> = planes.iter().map(|fd| fd.as_raw_fd()).collect();
	let iov = [IoSlice::new(&header)];
	let cmsgs = [ControlMessage::ScmRights(&raw_fds)];
	loop {
		match sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
			Err(errno) if errno == Errno::EINTR => continue,
			Err(errno) => return Err(ProtocolError::Nix(errno.into())),
			Ok(_) => return Ok(()),
		}
	}
}

/// Receive one descriptor segment: the fixed header plus its `SCM_RIGHTS`
/// payload. The caller must already have consumed the sentinel byte.
///
/// Received fds are adopted as `OwnedFd` before any validation runs, so no
/// error path can leak them.
#[tracing::instrument(skip_all, fields(fd = stream.as_raw_fd()))]
pub fn receive_descriptor(stream: &UnixStream) -> Result<BufferDescriptor, ProtocolError> {
	let mut buf = [0u8; DESCRIPTOR_HEADER_LEN];
	let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_PLANE_FDS]);
	let mut iov = [IoSliceMut::new(&mut buf)];

	let msg = loop {
		match recvmsg::<()>(
			stream.as_raw_fd(),
			&mut iov,
			Some(&mut cmsg_space),
			MsgFlags::empty(),
		) {
			Err(errno) if errno == Errno::EINTR => continue,
			Err(errno) if errno == Errno::EAGAIN || errno == Errno::EWOULDBLOCK => {
				break Err(ProtocolError::Timeout);
			}
			Err(errno) => break Err(ProtocolError::Nix(errno.into())),
			Ok(msg) => break Ok(msg),
		}
	}?;
	if msg.bytes == 0 {
		return Err(ProtocolError::UnexpectedEof);
	}
	let bytes_read = msg.bytes;
	let truncated = msg.flags.intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC);

	let mut planes = Vec::new();
	let mut c_iter = msg.cmsgs()?;
	while let Some(cmsg) = c_iter.next() {
		if let ControlMessageOwned::ScmRights(rights) = cmsg {
			for raw in rights {
				// The kernel created this fd for us during recvmsg and
				// nothing else tracks it yet.
				planes.push(unsafe { OwnedFd::from_raw_fd(raw) });
			}
		}
	}
	let _ = msg; // release borrow on iov/buf

	if truncated {
		return Err(ProtocolError::Truncated);
	}
	// A stream peer may split the header across reads; the fds always ride
	// on the first chunk.
	if bytes_read < DESCRIPTOR_HEADER_LEN {
		read_exact(stream, &mut buf[bytes_read..])?;
	}

	let (info, declared) = decode_header(&buf)?;
	if planes.len() != declared {
		return Err(ProtocolError::PlaneCountMismatch {
			declared: declared as u32,
			received: planes.len(),
		});
	}
	Ok(BufferDescriptor::new(info, planes))
}

/// Report the render outcome for the last dispatched buffer.
///
/// The producer socket never has a send timeout configured, so a would-block
/// here is a pathologically full buffer rather than a lost peer; the status
/// byte is dropped and the session continues.
pub fn send_status(stream: &UnixStream, status: RenderStatus) -> Result<(), ProtocolError> {
	let mut writer = stream;
	match writer.write_all(&[status.as_wire()]) {
		Ok(()) => Ok(()),
		Err(err) if err.kind() == ErrorKind::WouldBlock => {
			tracing::debug!("status write would block, dropping report");
			Ok(())
		}
		Err(err) => Err(ProtocolError::Io(err)),
	}
}

/// Block until the peer reports a render status byte.
pub fn receive_status(stream: &UnixStream) -> Result<RenderStatus, ProtocolError> {
	let mut byte = [0u8; 1];
	read_exact(stream, &mut byte)?;
	Ok(RenderStatus::from_wire(byte[0]))
}

fn read_exact(stream: &UnixStream, buf: &mut [u8]) -> Result<(), ProtocolError> {
	let mut reader = stream;
	match reader.read_exact(buf) {
		Ok(()) => Ok(()),
		Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
			Err(ProtocolError::Timeout)
		}
		Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(ProtocolError::UnexpectedEof),
		Err(err) => Err(ProtocolError::Io(err)),
	}
}

fn encode_header(info: BufferInfo, plane_count: usize) -> [u8; DESCRIPTOR_HEADER_LEN] {
	let fields = [
		info.width,
		info.height,
		info.stride,
		info.format.as_wire(),
		plane_count as u32,
	];
	let mut buf = [0u8; DESCRIPTOR_HEADER_LEN];
	for (slot, value) in buf.chunks_exact_mut(4).zip(fields) {
		slot.copy_from_slice(&value.to_le_bytes());
	}
	buf
}

fn decode_header(buf: &[u8]) -> Result<(BufferInfo, usize), ProtocolError> {
	let width = read_u32(buf, 0);
	let height = read_u32(buf, 4);
	let stride = read_u32(buf, 8);
	let format_raw = read_u32(buf, 12);
	let plane_count = read_u32(buf, 16);

	if width == 0 || height == 0 || stride == 0 {
		return Err(ProtocolError::InvalidDescriptor("zero width, height or stride"));
	}
	let format = PixelFormat::from_wire(format_raw)
		.ok_or(ProtocolError::UnknownPixelFormat(format_raw))?;
	if plane_count == 0 || plane_count as usize > MAX_PLANE_FDS {
		return Err(ProtocolError::InvalidDescriptor("plane count out of range"));
	}
	Ok((BufferInfo { width, height, stride, format }, plane_count as usize))
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
	u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::os::fd::AsFd;
	use std::time::Duration;

	fn test_info() -> BufferInfo {
		BufferInfo {
			width: 64,
			height: 64,
			stride: 256,
			format: PixelFormat::Rgba8888,
		}
	}

	fn raw_header(width: u32, height: u32, stride: u32, format: u32, planes: u32) -> [u8; DESCRIPTOR_HEADER_LEN] {
		let mut buf = [0u8; DESCRIPTOR_HEADER_LEN];
		for (slot, value) in buf
			.chunks_exact_mut(4)
			.zip([width, height, stride, format, planes])
		{
			slot.copy_from_slice(&value.to_le_bytes());
		}
		buf
	}

	fn send_raw_descriptor(stream: &UnixStream, header: &[u8], fds: &[RawFd]) {
		send_control_byte(stream, DESCRIPTOR_SENTINEL).unwrap();
		let iov = [IoSlice::new(header)];
		let cmsgs: Vec<ControlMessage> = if fds.is_empty() {
			Vec::new()
		} else {
			vec![ControlMessage::ScmRights(fds)]
		};
		sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None).unwrap();
	}

	#[test]
	fn control_byte_round_trip() {
		let (tx, rx) = UnixStream::pair().unwrap();
		send_control_byte(&tx, 7).unwrap();
		assert_eq!(receive_control_byte(&rx).unwrap(), 7);
	}

	#[test]
	fn status_round_trip() {
		let (tx, rx) = UnixStream::pair().unwrap();
		send_status(&tx, RenderStatus::Failed).unwrap();
		assert_eq!(receive_status(&rx).unwrap(), RenderStatus::Failed);
		send_status(&tx, RenderStatus::Ok).unwrap();
		assert_eq!(receive_status(&rx).unwrap(), RenderStatus::Ok);
	}

	#[test]
	fn descriptor_round_trip_transfers_live_fd() {
		let (tx, rx) = UnixStream::pair().unwrap();
		let (plane_local, plane_remote) = UnixStream::pair().unwrap();

		send_descriptor(&tx, test_info(), &[plane_remote.as_fd()]).unwrap();

		assert_eq!(receive_control_byte(&rx).unwrap(), DESCRIPTOR_SENTINEL);
		let descriptor = receive_descriptor(&rx).unwrap();
		assert_eq!(descriptor.info(), test_info());
		assert_eq!(descriptor.planes().len(), 1);

		// The received fd must be a live duplicate: bytes written into the
		// local end come out of it.
		let dup = descriptor.planes()[0].try_clone().unwrap();
		let received = UnixStream::from(dup);
		received
			.set_read_timeout(Some(Duration::from_secs(5)))
			.unwrap();
		(&plane_local).write_all(b"ping").unwrap();
		let mut buf = [0u8; 4];
		(&received).read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"ping");
	}

	#[test]
	fn send_rejects_empty_plane_list() {
		let (tx, rx) = UnixStream::pair().unwrap();
		assert!(matches!(
			send_descriptor(&tx, test_info(), &[]),
			Err(ProtocolError::InvalidDescriptor(_))
		));
		// Nothing must have hit the wire, not even the sentinel.
		rx.set_read_timeout(Some(Duration::from_millis(25))).unwrap();
		assert!(matches!(
			receive_control_byte(&rx),
			Err(ProtocolError::Timeout)
		));
	}

	#[test]
	fn receive_times_out_on_silent_peer() {
		let (_tx, rx) = UnixStream::pair().unwrap();
		rx.set_read_timeout(Some(Duration::from_millis(25))).unwrap();
		assert!(matches!(
			receive_control_byte(&rx),
			Err(ProtocolError::Timeout)
		));
	}

	#[test]
	fn descriptor_stall_times_out() {
		let (tx, rx) = UnixStream::pair().unwrap();
		rx.set_read_timeout(Some(Duration::from_millis(25))).unwrap();
		send_control_byte(&tx, DESCRIPTOR_SENTINEL).unwrap();
		assert_eq!(receive_control_byte(&rx).unwrap(), DESCRIPTOR_SENTINEL);
		assert!(matches!(
			receive_descriptor(&rx),
			Err(ProtocolError::Timeout)
		));
	}

	#[test]
	fn closed_peer_reports_eof() {
		let (tx, rx) = UnixStream::pair().unwrap();
		drop(tx);
		assert!(matches!(
			receive_control_byte(&rx),
			Err(ProtocolError::UnexpectedEof)
		));

		let (tx, rx) = UnixStream::pair().unwrap();
		drop(tx);
		assert!(matches!(
			receive_descriptor(&rx),
			Err(ProtocolError::UnexpectedEof)
		));
	}

	#[test]
	fn rejects_plane_count_mismatch() {
		let (tx, rx) = UnixStream::pair().unwrap();
		let (_keep, plane) = UnixStream::pair().unwrap();

		// Header declares two fds, only one is attached.
		send_raw_descriptor(&tx, &raw_header(64, 64, 256, 1, 2), &[plane.as_raw_fd()]);
		assert_eq!(receive_control_byte(&rx).unwrap(), DESCRIPTOR_SENTINEL);
		assert!(matches!(
			receive_descriptor(&rx),
			Err(ProtocolError::PlaneCountMismatch { declared: 2, received: 1 })
		));

		// Header declares one fd, none are attached.
		send_raw_descriptor(&tx, &raw_header(64, 64, 256, 1, 1), &[]);
		assert_eq!(receive_control_byte(&rx).unwrap(), DESCRIPTOR_SENTINEL);
		assert!(matches!(
			receive_descriptor(&rx),
			Err(ProtocolError::PlaneCountMismatch { declared: 1, received: 0 })
		));
	}

	#[test]
	fn rejects_zero_geometry() {
		let (tx, rx) = UnixStream::pair().unwrap();
		let (_keep, plane) = UnixStream::pair().unwrap();
		send_raw_descriptor(&tx, &raw_header(0, 64, 256, 1, 1), &[plane.as_raw_fd()]);
		assert_eq!(receive_control_byte(&rx).unwrap(), DESCRIPTOR_SENTINEL);
		assert!(matches!(
			receive_descriptor(&rx),
			Err(ProtocolError::InvalidDescriptor(_))
		));
	}

	#[test]
	fn rejects_unknown_pixel_format() {
		let (tx, rx) = UnixStream::pair().unwrap();
		let (_keep, plane) = UnixStream::pair().unwrap();
		send_raw_descriptor(&tx, &raw_header(64, 64, 256, 99, 1), &[plane.as_raw_fd()]);
		assert_eq!(receive_control_byte(&rx).unwrap(), DESCRIPTOR_SENTINEL);
		assert!(matches!(
			receive_descriptor(&rx),
			Err(ProtocolError::UnknownPixelFormat(99))
		));
	}
}
