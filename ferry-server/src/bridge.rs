use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use ferry_protocol::{BufferDescriptor, RenderStatus};

/// Wait slice after which a blocked publisher re-checks the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(2);

/// Host-side hook fired once per published event, from the session thread.
/// Implementations forward the signal into the host's own render loop and
/// must not block; the render thread then calls
/// [`HandoffBridge::take_pending`].
pub trait RenderNotifier: Send + Sync {
	fn handoff_ready(&self);
}

impl<F: Fn() + Send + Sync> RenderNotifier for F {
	fn handoff_ready(&self) {
		self()
	}
}

/// What the render side is asked to draw.
#[derive(Debug, Clone)]
pub enum HandoffEvent {
	/// Draw the referenced producer buffer.
	Buffer(Arc<BufferDescriptor>),
	/// Nothing arrived for a while on a focused surface; draw the fallback
	/// frame instead.
	NoBuffer,
}

enum Slot {
	Idle,
	Published(HandoffEvent),
	Rendering,
	Done(RenderStatus),
}

/// Single-slot rendezvous between the session thread and the render thread.
///
/// At most one event is ever in flight: the publisher blocks until the
/// render side has taken the event and acknowledged it, so a second
/// publication can never overwrite an unacknowledged one and the producer
/// is back-pressured to the real render rate.
pub struct HandoffBridge {
	slot: Mutex<Slot>,
	ready: Condvar,
	notifier: Box<dyn RenderNotifier>,
	stopped: AtomicBool,
}

impl HandoffBridge {
	pub(crate) fn new(notifier: Box<dyn RenderNotifier>) -> Arc<Self> {
		Arc::new(Self {
			slot: Mutex::new(Slot::Idle),
			ready: Condvar::new(),
			notifier,
			stopped: AtomicBool::new(false),
		})
	}

	/// Publish one event and wait for the render side's acknowledgment.
	///
	/// Returns `None` when the bridge shuts down mid-wait; the event is
	/// withdrawn and the caller must not report any status for it.
	pub(crate) fn publish(&self, event: HandoffEvent) -> Option<RenderStatus> {
		{
			let mut slot = self.slot.lock().unwrap();
			debug_assert!(
				matches!(*slot, Slot::Idle),
				"published over an unacknowledged event"
			);
			*slot = Slot::Published(event);
		}
		// Outside the lock, so a notifier that renders inline cannot
		// deadlock against take_pending.
		self.notifier.handoff_ready();

		let mut slot = self.slot.lock().unwrap();
		loop {
			if self.stopped.load(Ordering::Acquire) {
				*slot = Slot::Idle;
				return None;
			}
			if let Slot::Done(status) = *slot {
				*slot = Slot::Idle;
				return Some(status);
			}
			let (guard, _) = self.ready.wait_timeout(slot, SHUTDOWN_POLL).unwrap();
			slot = guard;
		}
	}

	/// Take the pending event, if any. Called from the render thread after
	/// the notifier fired; spurious calls return `None`.
	pub fn take_pending(&self) -> Option<HandoffEvent> {
		if self.stopped.load(Ordering::Acquire) {
			return None;
		}
		let mut slot = self.slot.lock().unwrap();
		match std::mem::replace(&mut *slot, Slot::Rendering) {
			Slot::Published(event) => Some(event),
			previous => {
				*slot = previous;
				None
			}
		}
	}

	/// Complete the rendezvous for the last taken event. Exactly one call
	/// per taken event; a call without one is a host bug and is ignored.
	pub fn acknowledge(&self, status: RenderStatus) {
		let mut slot = self.slot.lock().unwrap();
		match *slot {
			Slot::Rendering => {
				*slot = Slot::Done(status);
				self.ready.notify_one();
			}
			_ => tracing::warn!("render acknowledgment without a taken event"),
		}
	}

	/// Wake and permanently release any blocked publisher. Take and
	/// acknowledge become no-ops afterwards.
	pub(crate) fn shutdown(&self) {
		self.stopped.store(true, Ordering::Release);
		self.ready.notify_all();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::OnceLock;
	use std::sync::mpsc;
	use std::time::Instant;

	fn noop_bridge() -> Arc<HandoffBridge> {
		HandoffBridge::new(Box::new(|| {}))
	}

	fn wait_for_pending(bridge: &HandoffBridge) -> HandoffEvent {
		let deadline = Instant::now() + Duration::from_secs(5);
		loop {
			if let Some(event) = bridge.take_pending() {
				return event;
			}
			assert!(Instant::now() < deadline, "no event became pending");
			std::thread::sleep(Duration::from_millis(1));
		}
	}

	#[test]
	fn publish_returns_acknowledged_status() {
		let bridge = noop_bridge();
		let publisher = {
			let bridge = Arc::clone(&bridge);
			std::thread::spawn(move || bridge.publish(HandoffEvent::NoBuffer))
		};

		let event = wait_for_pending(&bridge);
		assert!(matches!(event, HandoffEvent::NoBuffer));
		bridge.acknowledge(RenderStatus::Failed);

		assert_eq!(publisher.join().unwrap(), Some(RenderStatus::Failed));
	}

	#[test]
	fn publisher_blocks_until_acknowledged() {
		let bridge = noop_bridge();
		let publisher = {
			let bridge = Arc::clone(&bridge);
			std::thread::spawn(move || bridge.publish(HandoffEvent::NoBuffer))
		};

		let _event = wait_for_pending(&bridge);
		// Taken but not acknowledged: the publisher must still be parked
		// and no second event can become pending.
		std::thread::sleep(Duration::from_millis(50));
		assert!(!publisher.is_finished());
		assert!(bridge.take_pending().is_none());

		bridge.acknowledge(RenderStatus::Ok);
		assert_eq!(publisher.join().unwrap(), Some(RenderStatus::Ok));
	}

	#[test]
	fn shutdown_releases_blocked_publisher() {
		let bridge = noop_bridge();
		let publisher = {
			let bridge = Arc::clone(&bridge);
			std::thread::spawn(move || bridge.publish(HandoffEvent::NoBuffer))
		};

		// Nobody takes the event; shutdown must withdraw it.
		std::thread::sleep(Duration::from_millis(20));
		bridge.shutdown();
		assert_eq!(publisher.join().unwrap(), None);
		assert!(bridge.take_pending().is_none());
	}

	#[test]
	fn notifier_fires_once_per_publication() {
		let (tx, rx) = mpsc::channel::<()>();
		let bridge = HandoffBridge::new(Box::new(move || {
			tx.send(()).unwrap();
		}));

		let publisher = {
			let bridge = Arc::clone(&bridge);
			std::thread::spawn(move || bridge.publish(HandoffEvent::NoBuffer))
		};
		rx.recv_timeout(Duration::from_secs(5)).unwrap();
		assert!(rx.try_recv().is_err());

		let _ = wait_for_pending(&bridge);
		bridge.acknowledge(RenderStatus::Ok);
		publisher.join().unwrap();
	}

	#[test]
	fn inline_rendering_notifier_does_not_deadlock() {
		// A notifier that renders synchronously from the session thread.
		static BRIDGE: OnceLock<Arc<HandoffBridge>> = OnceLock::new();
		let bridge = HandoffBridge::new(Box::new(|| {
			let bridge = BRIDGE.get().unwrap();
			let event = bridge.take_pending().unwrap();
			assert!(matches!(event, HandoffEvent::NoBuffer));
			bridge.acknowledge(RenderStatus::Ok);
		}));
		BRIDGE.set(Arc::clone(&bridge)).ok().unwrap();

		assert_eq!(bridge.publish(HandoffEvent::NoBuffer), Some(RenderStatus::Ok));
	}

	#[test]
	fn stray_acknowledge_is_ignored() {
		let bridge = noop_bridge();
		bridge.acknowledge(RenderStatus::Ok);

		let publisher = {
			let bridge = Arc::clone(&bridge);
			std::thread::spawn(move || bridge.publish(HandoffEvent::NoBuffer))
		};
		let _ = wait_for_pending(&bridge);
		bridge.acknowledge(RenderStatus::Ok);
		bridge.acknowledge(RenderStatus::Failed);
		assert_eq!(publisher.join().unwrap(), Some(RenderStatus::Ok));
	}
}
