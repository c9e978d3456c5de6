//! Bounded byte queue between the radio-callback thread and the event
//! loop.
//!
//! The producer side is the only code that runs on stack-owned threads:
//! it timestamps the slice, pushes it (evicting the oldest entry when
//! full) and pokes a wakeup channel registered with the poll. It never
//! blocks and never fails; when nobody is listening the payload is
//! simply lost, which is the correct behavior for a torn-down link.

use std::{
  collections::VecDeque,
  io,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
  },
};

use bytes::Bytes;
use mio::{Evented, Poll, PollOpt, Ready, Token};
use mio_extras::channel as mio_channel;

use crate::time::{Clock, Timestamp};

struct Shared {
  slices: Mutex<VecDeque<(Timestamp, Bytes)>>,
  capacity: usize,
  dropped: AtomicU64,
}

/// Producer half; lives inside the notification callback.
#[derive(Clone)]
pub struct ByteQueueSender {
  shared: Arc<Shared>,
  clock: Clock,
  signal: mio_channel::Sender<()>,
}

impl ByteQueueSender {
  /// Enqueue one raw notification slice. The single action permitted on
  /// the radio thread.
  pub fn push(&self, payload: &[u8]) {
    let at = self.clock.now();
    {
      let mut slices = self.shared.slices.lock().unwrap();
      if slices.len() == self.shared.capacity {
        slices.pop_front();
        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
      }
      slices.push_back((at, Bytes::copy_from_slice(payload)));
    }
    // Wake the event loop. A send error means the consumer is gone,
    // which is not an error from the producer's point of view.
    let _ = self.signal.send(());
  }
}

/// Consumer half; owned by the supervisor on the event-loop thread.
/// Registered with the poll through its [`Evented`] impl.
pub struct ByteQueueReceiver {
  shared: Arc<Shared>,
  signal: mio_channel::Receiver<()>,
}

impl ByteQueueReceiver {
  /// Drain everything currently queued, oldest first.
  pub fn take_all(&self) -> Vec<(Timestamp, Bytes)> {
    while self.signal.try_recv().is_ok() {}
    let mut slices = self.shared.slices.lock().unwrap();
    slices.drain(..).collect()
  }

  pub fn len(&self) -> usize {
    self.shared.slices.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Slices evicted because the queue was full.
  pub fn dropped(&self) -> u64 {
    self.shared.dropped.load(Ordering::Relaxed)
  }
}

impl Evented for ByteQueueReceiver {
  // Delegate to the wakeup channel, which already implements Evented.
  fn register(
    &self,
    poll: &Poll,
    token: Token,
    interest: Ready,
    opts: PollOpt,
  ) -> io::Result<()> {
    self.signal.register(poll, token, interest, opts)
  }

  fn reregister(
    &self,
    poll: &Poll,
    token: Token,
    interest: Ready,
    opts: PollOpt,
  ) -> io::Result<()> {
    self.signal.reregister(poll, token, interest, opts)
  }

  fn deregister(&self, poll: &Poll) -> io::Result<()> {
    self.signal.deregister(poll)
  }
}

/// Build a connected sender/receiver pair with the given slice capacity.
pub fn byte_queue(capacity: usize, clock: Clock) -> (ByteQueueSender, ByteQueueReceiver) {
  let shared = Arc::new(Shared {
    slices: Mutex::new(VecDeque::with_capacity(capacity)),
    capacity: capacity.max(1),
    dropped: AtomicU64::new(0),
  });
  let (signal_tx, signal_rx) = mio_channel::channel();
  (
    ByteQueueSender {
      shared: Arc::clone(&shared),
      clock,
      signal: signal_tx,
    },
    ByteQueueReceiver {
      shared,
      signal: signal_rx,
    },
  )
}

#[cfg(test)]
mod tests {
  use std::{thread, time::Instant};

  use super::*;

  #[test]
  fn drops_oldest_on_overflow() {
    let (tx, rx) = byte_queue(3, Clock::new());
    for i in 0..5u8 {
      tx.push(&[i]);
    }
    let slices = rx.take_all();
    assert_eq!(slices.len(), 3);
    assert_eq!(slices[0].1.as_ref(), &[2]);
    assert_eq!(slices[2].1.as_ref(), &[4]);
    assert_eq!(rx.dropped(), 2);
  }

  #[test]
  fn timestamps_are_nondecreasing() {
    let (tx, rx) = byte_queue(16, Clock::new());
    for _ in 0..10 {
      tx.push(&[0]);
    }
    let slices = rx.take_all();
    for pair in slices.windows(2) {
      assert!(pair[0].0 <= pair[1].0);
    }
  }

  #[test]
  fn push_from_foreign_thread_is_fast_and_nonblocking() {
    let (tx, rx) = byte_queue(100, Clock::new());
    let handle = thread::spawn(move || {
      let payload = [0u8; 20];
      let mut worst = std::time::Duration::ZERO;
      for _ in 0..1000 {
        let start = Instant::now();
        tx.push(&payload);
        worst = worst.max(start.elapsed());
      }
      worst
    });
    let worst = handle.join().unwrap();
    // The callback budget is 1 ms; an uncontended enqueue should be far
    // below it even on a loaded CI machine.
    assert!(worst < std::time::Duration::from_millis(1), "worst push took {worst:?}");
    assert_eq!(rx.take_all().len(), 100);
  }

  #[test]
  fn push_after_receiver_drop_is_silent() {
    let (tx, rx) = byte_queue(4, Clock::new());
    drop(rx);
    tx.push(&[1, 2, 3]);
  }
}
