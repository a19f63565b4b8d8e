//! Bounded capture queue with drop-oldest overflow.
//!
//! The capture thread must never stall on a slow pipeline and the queue must
//! never grow without bound; losing the oldest packet is the least-bad
//! outcome for a meter. The sender holds a clone of the receiver so it can
//! pop the oldest item when the channel is full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, TrySendError};

use super::RawPacket;

pub fn capture_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        QueueSender {
            tx,
            rx: rx.clone(),
            dropped: dropped.clone(),
        },
        QueueReceiver { rx, dropped },
    )
}

pub struct QueueSender {
    tx: crossbeam::channel::Sender<RawPacket>,
    rx: Receiver<RawPacket>,
    dropped: Arc<AtomicU64>,
}

impl QueueSender {
    pub fn push(&self, packet: RawPacket) {
        let mut item = packet;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    item = returned;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

pub struct QueueReceiver {
    rx: Receiver<RawPacket>,
    dropped: Arc<AtomicU64>,
}

/// Outcome of a timed pop.
pub enum Pop {
    Packet(RawPacket),
    Timeout,
    /// All senders are gone; the stream is over once the queue is drained.
    Disconnected,
}

impl QueueReceiver {
    /// Blocking pop with a timeout so the pipeline can run periodic work
    /// (timeouts, snapshot publishes) during quiet stretches.
    pub fn pop(&self, timeout: Duration) -> Pop {
        match self.rx.recv_timeout(timeout) {
            Ok(packet) => Pop::Packet(packet),
            Err(RecvTimeoutError::Timeout) => Pop::Timeout,
            Err(RecvTimeoutError::Disconnected) => Pop::Disconnected,
        }
    }

    /// Drain whatever is queued without blocking. Used during shutdown.
    pub fn drain(&self) -> Vec<RawPacket> {
        let mut out = Vec::new();
        while let Ok(packet) = self.rx.try_recv() {
            out.push(packet);
        }
        out
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
