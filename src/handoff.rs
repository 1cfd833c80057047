//! Moving captures from the acquisition thread to the display.
//!
//! [`handoff`] builds a bounded, latest-wins queue: when the display falls
//! behind, the oldest undelivered capture is dropped instead of blocking the
//! acquisition loop.

use crate::SampleBuffer;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::debug;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

/// Consumer of delivered buffers. Implementations must return quickly.
pub trait DisplaySink: Send {
    fn deliver(&mut self, buffer: SampleBuffer);

    /// Deliver every channel of one capture, in channel order.
    fn deliver_capture(&mut self, capture: Vec<SampleBuffer>) {
        for buffer in capture {
            self.deliver(buffer);
        }
    }
}

impl<F> DisplaySink for F
where
    F: FnMut(SampleBuffer) + Send,
{
    fn deliver(&mut self, buffer: SampleBuffer) {
        self(buffer)
    }
}

pub fn handoff(capacity: usize) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let alive = Arc::new(());
    (
        HandoffSender {
            tx,
            stale: rx.clone(),
            dropped: Arc::clone(&dropped),
            receiver_alive: Arc::downgrade(&alive),
        },
        HandoffReceiver {
            rx,
            dropped,
            _alive: alive,
        },
    )
}

/// Producer half. Clones feed the same queue.
#[derive(Clone)]
pub struct HandoffSender {
    tx: Sender<Vec<SampleBuffer>>,
    // Lets the producer evict the oldest capture when the queue is full.
    stale: Receiver<Vec<SampleBuffer>>,
    dropped: Arc<AtomicU64>,
    receiver_alive: Weak<()>,
}

impl HandoffSender {
    fn push(&mut self, mut capture: Vec<SampleBuffer>) {
        if self.receiver_alive.strong_count() == 0 {
            debug!("Display gone, discarding capture");
            return;
        }
        loop {
            match self.tx.try_send(capture) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.stale.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    capture = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl DisplaySink for HandoffSender {
    fn deliver(&mut self, buffer: SampleBuffer) {
        self.push(vec![buffer]);
    }

    fn deliver_capture(&mut self, capture: Vec<SampleBuffer>) {
        self.push(capture);
    }
}

pub struct HandoffReceiver {
    rx: Receiver<Vec<SampleBuffer>>,
    dropped: Arc<AtomicU64>,
    _alive: Arc<()>,
}

impl HandoffReceiver {
    pub fn try_recv(&self) -> Option<Vec<SampleBuffer>> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<SampleBuffer>> {
        match self.rx.recv_timeout(timeout) {
            Ok(capture) => Some(capture),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Newest pending capture; older pending ones are discarded and counted as dropped.
    pub fn latest(&self) -> Option<Vec<SampleBuffer>> {
        let mut latest = None;
        while let Ok(capture) = self.rx.try_recv() {
            if latest.replace(capture).is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        latest
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Captures that were never shown because a newer one replaced them.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
