//! One accepted peer connection.
//!
//! The write half lives behind an async mutex so that the queue-draining
//! writer task and the dispatcher's direct control replies (`registered`,
//! `pong`, errors) never interleave frames.  The outbound queue is a plain
//! FIFO with a high-water drop policy; control envelopes are kept in
//! preference to application envelopes when the queue is compacted.

use bus_protocol::{Envelope, FrameError, actions, write_envelope};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::{Notify, watch};
use tracing::warn;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Connection {
    id: u64,
    addr: SocketAddr,
    max_frame_len: usize,
    writer: tokio::sync::Mutex<BoxedWriter>,
    queue: Mutex<VecDeque<Envelope>>,
    /// Wakes the writer task when the queue becomes non-empty.
    notify: Notify,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        writer: BoxedWriter,
        max_frame_len: usize,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Connection {
            id,
            addr,
            max_frame_len,
            writer: tokio::sync::Mutex::new(writer),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Write one envelope directly on the socket, bypassing the queue.
    ///
    /// The `registered` reply must take this path: clients block on it before
    /// enabling general dispatch, and routing it through the queue races with
    /// already-queued broadcasts.
    pub async fn write_direct(&self, envelope: &Envelope) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().await;
        write_envelope(&mut *writer, envelope, self.max_frame_len).await
    }

    /// Queue an envelope for the writer task.  Returns the queue depth after
    /// the push (post-compaction, if the high-water mark was crossed).
    pub fn enqueue(&self, envelope: Envelope, high_water: usize) -> usize {
        let depth = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            queue.push_back(envelope);
            if queue.len() > high_water {
                let dropped = compact(&mut queue);
                warn!(
                    conn = self.id,
                    addr = %self.addr,
                    dropped,
                    remaining = queue.len(),
                    "outbound queue over high-water mark, dropped oldest messages"
                );
            }
            queue.len()
        };
        self.notify.notify_one();
        depth
    }

    /// Drain up to `max` queued envelopes.
    pub fn drain(&self, max: usize) -> Vec<Envelope> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Re-apply the high-water policy outside the enqueue path (reaper tick).
    /// Returns how many envelopes were discarded.
    pub fn compact_queue(&self, high_water: usize) -> usize {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        if queue.len() > high_water {
            compact(&mut queue)
        } else {
            0
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    /// Idempotent: signals both the reader and writer task to exit, which
    /// drops the socket halves and closes the connection.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

/// Drop the oldest half of the queue, keeping control envelopes.  Returns the
/// number of envelopes discarded.
fn compact(queue: &mut VecDeque<Envelope>) -> usize {
    let target = queue.len() / 2;
    let mut kept = VecDeque::with_capacity(queue.len() - target);
    let mut dropped = 0;
    while let Some(envelope) = queue.pop_front() {
        if dropped < target && !actions::is_control(&envelope.action) {
            dropped += 1;
        } else {
            kept.push_back(envelope);
        }
    }
    *queue = kept;
    dropped
}
