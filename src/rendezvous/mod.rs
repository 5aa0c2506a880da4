
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use util::sync::Mutex as SyncMutex;

use crate::error::*;

/// Single-slot handoff between the receiver tasks and the engine's
/// poll-style consumer.
///
/// Holding at most one datagram is deliberate: the engine polls one datagram
/// at a time, and back-pressure onto the UDP receivers lets kernel buffers
/// drop while the ARQ layer above re-requests.
pub struct Rendezvous {
    slot: SyncMutex<Option<(Vec<u8>, Vec<u8>)>>,
    not_empty: Notify,
    empty: Notify,
    closed: AtomicBool,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Rendezvous::new()
    }
}

impl Rendezvous {
    pub fn new() -> Self {
        Rendezvous {
            slot: SyncMutex::new(None),
            not_empty: Notify::new(),
            empty: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Deposits one datagram, waiting until the slot is free. `who` is the
    /// origin token on the server and empty on the client.
    pub async fn put(&self, who: Vec<u8>, data: Vec<u8>) -> Result<()> {
        let pending = (who, data);
        loop {
            let notified = self.empty.notified();
            {
                let mut slot = self.slot.lock();
                if self.closed.load(Ordering::SeqCst) {
                    // Pass the wakeup on so every blocked producer drains.
                    self.empty.notify_one();
                    return Err(Error::ErrClosed);
                }
                if slot.is_none() {
                    *slot = Some(pending);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Takes the pending datagram, waiting until one arrives. Returns the
    /// number of bytes copied into `buf`, or `Ok(0)` once the rendezvous is
    /// closed and the consumer should treat the stream as finished.
    pub async fn take(&self, buf: &mut [u8], who: &mut Vec<u8>) -> Result<usize> {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut slot = self.slot.lock();
                if let Some((origin, data)) = slot.take() {
                    if buf.len() < data.len() {
                        *slot = Some((origin, data));
                        return Err(Error::ErrShortBuffer);
                    }
                    buf[..data.len()].copy_from_slice(&data);
                    *who = origin;
                    self.empty.notify_one();
                    return Ok(data.len());
                }
                if self.closed.load(Ordering::SeqCst) {
                    self.not_empty.notify_one();
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    /// Clears the slot and unblocks every waiter. Waiting consumers observe
    /// end of stream; waiting producers get [`Error::ErrClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.slot.lock().take();
        self.not_empty.notify_waiters();
        self.not_empty.notify_one();
        self.empty.notify_waiters();
        self.empty.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
