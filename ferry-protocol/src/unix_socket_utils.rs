use nix::sys::socket::{
	AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind, connect, listen, socket,
};
use std::fs::Permissions;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

/// Pending connections queue behind the single serviced client.
const SESSION_BACKLOG: i32 = 5;

/// Bind the session listener at the given path, replacing any stale socket
/// file. The socket is restricted to owner and group access.
pub fn bind_session_listener(path: impl AsRef<Path>) -> Result<UnixListener, nix::Error> {
	let path = path.as_ref();
	let _ = std::fs::remove_file(path);

	let fd = socket(
		AddressFamily::Unix,
		SockType::Stream,
		SockFlag::SOCK_CLOEXEC,
		None,
	)?;
	let addr = UnixAddr::new(path)?;
	bind(fd.as_raw_fd(), &addr)?;
	std::fs::set_permissions(path, Permissions::from_mode(0o770)).ok();
	listen(&fd, Backlog::new(SESSION_BACKLOG)?)?;
	Ok(UnixListener::from(fd))
}

/// Connect to the session socket at the given path.
pub fn connect_session(path: impl AsRef<Path>) -> Result<UnixStream, nix::Error> {
	let fd = socket(
		AddressFamily::Unix,
		SockType::Stream,
		SockFlag::SOCK_CLOEXEC,
		None,
	)?;
	let addr = UnixAddr::new(path.as_ref())?;
	connect(fd.as_raw_fd(), &addr)?;
	Ok(UnixStream::from(fd))
}
