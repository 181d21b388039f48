use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use ferry_protocol::{
	BufferDescriptor, DESCRIPTOR_SENTINEL, ProtocolError, transfer, unix_socket_utils,
};
use nix::sys::socket::{Shutdown as SockShutdown, shutdown as socket_shutdown};

use crate::bridge::{HandoffBridge, HandoffEvent, RenderNotifier};
use crate::config::SessionConfig;
use crate::error::SetupError;
use crate::registry::BufferRegistry;

/// Producer-side wake hook: a fire-and-forget hint that the consumer is
/// ready to receive buffers again. Called from the session thread, must not
/// block.
pub trait ProducerWake: Send {
	fn wake(&self);
}

impl<F: Fn() + Send> ProducerWake for F {
	fn wake(&self) {
		self()
	}
}

/// Pause after a failed accept so a broken listener cannot spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct SessionStats {
	full_transfers: u64,
	index_reuses: u64,
	timeouts: u64,
	fallback_frames: u64,
}

/// State shared between the session thread and its controller.
struct SessionShared {
	running: AtomicBool,
	focused: AtomicBool,
	client: Mutex<Option<Arc<UnixStream>>>,
}

/// Owns the session endpoint and runs the single-client message loop on a
/// dedicated thread.
///
/// Exactly one producer is serviced at a time. A protocol violation or a
/// disconnect ends that producer's session, clears its registry and returns
/// the loop to accepting; it never takes the manager down.
pub struct SessionManager {
	config: SessionConfig,
	listener: Arc<UnixListener>,
	shared: Arc<SessionShared>,
	bridge: Arc<HandoffBridge>,
	wake: Box<dyn ProducerWake>,
	registry: BufferRegistry,
	current: Option<Arc<BufferDescriptor>>,
	applied_timeout: Option<Duration>,
	idle: Duration,
	stats: SessionStats,
}

impl SessionManager {
	/// Bind the session socket and prepare the handoff bridge.
	#[tracing::instrument(level = "info", skip(config, notifier, wake), fields(path = ?config.socket_path_ref().display()))]
	pub fn bind(
		config: SessionConfig,
		notifier: impl RenderNotifier + 'static,
		wake: impl ProducerWake + 'static,
	) -> Result<Self, SetupError> {
		if config.receive_timeout(true).is_zero() || config.receive_timeout(false).is_zero() {
			return Err(SetupError::ZeroTimeout);
		}
		let listener = unix_socket_utils::bind_session_listener(config.socket_path_ref())?;
		tracing::info!(path = %config.socket_path_ref().display(), "session socket bound");
		Ok(Self {
			shared: Arc::new(SessionShared {
				running: AtomicBool::new(true),
				focused: AtomicBool::new(config.initial_focus()),
				client: Mutex::new(None),
			}),
			listener: Arc::new(listener),
			bridge: HandoffBridge::new(Box::new(notifier)),
			wake: Box::new(wake),
			registry: BufferRegistry::new(),
			current: None,
			applied_timeout: None,
			idle: Duration::ZERO,
			stats: SessionStats::default(),
			config,
		})
	}

	/// Start the session thread and hand back its controller.
	pub fn spawn(self) -> SessionController {
		let shared = Arc::clone(&self.shared);
		let bridge = Arc::clone(&self.bridge);
		let listener = Arc::clone(&self.listener);
		let thread = std::thread::Builder::new()
			.name("ferry-session".into())
			.spawn(move || self.run())
			.expect("failed to spawn session thread");
		SessionController {
			shared,
			bridge,
			listener,
			thread: Some(thread),
		}
	}

	fn run(mut self) {
		tracing::debug!("session loop started");
		while self.shared.running.load(Ordering::Acquire) {
			let Some(stream) = self.client() else {
				// Tell the producer someone is listening before blocking in
				// accept, in case it gave up while no consumer was around.
				self.wake.wake();
				self.accept_client();
				continue;
			};
			self.apply_receive_timeout(&stream);
			match transfer::receive_control_byte(&stream) {
				Ok(DESCRIPTOR_SENTINEL) => self.handle_full_transfer(&stream),
				Ok(index) => self.handle_index_reuse(&stream, index),
				Err(ProtocolError::Timeout) => self.handle_receive_timeout(),
				Err(err) => self.lose_client(&err),
			}
		}
		self.shutdown();
	}

	fn client(&self) -> Option<Arc<UnixStream>> {
		self.shared.client.lock().unwrap().clone()
	}

	fn accept_client(&mut self) {
		match self.listener.accept() {
			Ok((stream, _)) => {
				tracing::info!("producer connected");
				self.applied_timeout = None;
				self.idle = Duration::ZERO;
				self.stats = SessionStats::default();
				*self.shared.client.lock().unwrap() = Some(Arc::new(stream));
			}
			Err(err) if err.kind() == ErrorKind::Interrupted => {}
			Err(err) => {
				// Expected when stop() shuts the listener down under us.
				if self.shared.running.load(Ordering::Acquire) {
					tracing::error!("failed to accept producer connection: {err}");
					std::thread::sleep(ACCEPT_RETRY_DELAY);
				}
			}
		}
	}

	/// Re-derive the receive timeout from the focus flag. A focus change
	/// only ever affects the next receive, never one already in flight.
	fn apply_receive_timeout(&mut self, stream: &UnixStream) {
		let focused = self.shared.focused.load(Ordering::Acquire);
		let timeout = self.config.receive_timeout(focused);
		if self.applied_timeout == Some(timeout) {
			return;
		}
		match stream.set_read_timeout(Some(timeout)) {
			Ok(()) => {
				tracing::trace!(?timeout, focused, "receive timeout updated");
				self.applied_timeout = Some(timeout);
			}
			Err(err) => tracing::warn!("failed to update receive timeout: {err}"),
		}
	}

	fn handle_full_transfer(&mut self, stream: &UnixStream) {
		let descriptor = match transfer::receive_descriptor(stream) {
			Ok(descriptor) => descriptor,
			// Includes a stall inside the descriptor segment: the stream
			// offset is unknown afterwards, so resync is impossible.
			Err(err) => return self.lose_client(&err),
		};
		let info = descriptor.info();
		let planes = descriptor.planes().len();
		let index = self.registry.append(descriptor);
		tracing::debug!(
			index,
			width = info.width,
			height = info.height,
			stride = info.stride,
			format = ?info.format,
			planes,
			"buffer registered"
		);
		self.stats.full_transfers += 1;
		self.current = self.registry.get(index);
		self.dispatch_current(stream);
	}

	fn handle_index_reuse(&mut self, stream: &UnixStream, index: u8) {
		match self.registry.get(usize::from(index)) {
			Some(descriptor) => {
				tracing::trace!(index, "buffer reused");
				self.stats.index_reuses += 1;
				self.current = Some(descriptor);
				self.dispatch_current(stream);
			}
			None => {
				let err = ProtocolError::InvalidIndex {
					index,
					registered: self.registry.len(),
				};
				self.lose_client(&err);
			}
		}
	}

	/// Hand the selected buffer to the render side, wait for the result and
	/// report it to the producer.
	fn dispatch_current(&mut self, stream: &UnixStream) {
		let Some(descriptor) = self.current.clone() else {
			return;
		};
		let Some(status) = self.bridge.publish(HandoffEvent::Buffer(descriptor)) else {
			// Shut down mid-render; the loop exits on its next flag check.
			return;
		};
		self.idle = Duration::ZERO;
		if let Err(err) = transfer::send_status(stream, status) {
			self.lose_client(&err);
		}
	}

	fn handle_receive_timeout(&mut self) {
		self.stats.timeouts += 1;
		if !self.shared.focused.load(Ordering::Acquire) {
			// Nobody can see the surface; neither escalate nor wake the
			// producer.
			return;
		}
		if let Some(applied) = self.applied_timeout {
			self.idle += applied;
		}
		if self.idle >= self.config.threshold() {
			tracing::debug!(idle = ?self.idle, "no buffer arrived, publishing fallback frame");
			self.stats.fallback_frames += 1;
			self.idle = Duration::ZERO;
			// The producer is not told about fallback frames, so the
			// render status is dropped.
			let _ = self.bridge.publish(HandoffEvent::NoBuffer);
		} else {
			self.wake.wake();
		}
	}

	fn lose_client(&mut self, reason: &dyn std::fmt::Display) {
		tracing::warn!(
			full_transfers = self.stats.full_transfers,
			index_reuses = self.stats.index_reuses,
			timeouts = self.stats.timeouts,
			fallback_frames = self.stats.fallback_frames,
			"producer session ended: {reason}"
		);
		self.drop_client();
	}

	fn drop_client(&mut self) {
		self.current = None;
		self.registry.clear();
		self.idle = Duration::ZERO;
		self.applied_timeout = None;
		*self.shared.client.lock().unwrap() = None;
	}

	fn shutdown(&mut self) {
		self.drop_client();
		let _ = std::fs::remove_file(self.config.socket_path_ref());
		tracing::info!(
			full_transfers = self.stats.full_transfers,
			index_reuses = self.stats.index_reuses,
			timeouts = self.stats.timeouts,
			fallback_frames = self.stats.fallback_frames,
			"session manager stopped"
		);
	}
}

/// Thread-safe handle to a running session manager.
///
/// Focus flips may come from any thread; they take effect the next time the
/// session loop computes its receive timeout.
pub struct SessionController {
	shared: Arc<SessionShared>,
	bridge: Arc<HandoffBridge>,
	listener: Arc<UnixListener>,
	thread: Option<JoinHandle<()>>,
}

impl SessionController {
	pub fn focus_gained(&self) {
		self.shared.focused.store(true, Ordering::Release);
	}

	pub fn focus_lost(&self) {
		self.shared.focused.store(false, Ordering::Release);
	}

	pub fn has_client(&self) -> bool {
		self.shared.client.lock().unwrap().is_some()
	}

	pub fn is_running(&self) -> bool {
		self.shared.running.load(Ordering::Acquire)
			&& self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
	}

	/// The rendezvous serviced by the host's render thread.
	pub fn bridge(&self) -> Arc<HandoffBridge> {
		Arc::clone(&self.bridge)
	}

	/// Stop the session thread and join it. Any blocked accept, receive or
	/// handoff wait is unblocked first.
	pub fn stop(mut self) {
		self.stop_and_join();
	}

	fn stop_and_join(&mut self) {
		let Some(thread) = self.thread.take() else {
			return;
		};
		self.shared.running.store(false, Ordering::Release);
		self.bridge.shutdown();
		if let Some(stream) = self.shared.client.lock().unwrap().as_ref() {
			let _ = stream.shutdown(std::net::Shutdown::Both);
		}
		let _ = socket_shutdown(self.listener.as_raw_fd(), SockShutdown::Both);
		if thread.join().is_err() {
			tracing::error!("session thread panicked");
		}
	}
}

impl Drop for SessionController {
	fn drop(&mut self) {
		self.stop_and_join();
	}
}
