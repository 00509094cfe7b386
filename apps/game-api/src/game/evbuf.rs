//! Bounded ring of a session's most recent events, the substrate for replay
//! on reconnect.

use std::collections::VecDeque;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Notify;

use crate::binary::Event;

#[derive(Debug, Error)]
pub enum EvBufError {
    /// The requested replay point was evicted; the session cannot be
    /// recovered on this buffer.
    #[error("sequence {from} already evicted (oldest held: {oldest})")]
    SequenceTooOld { from: u32, oldest: u32 },
    /// The requested replay point is ahead of anything ever appended.
    #[error("sequence {from} is ahead of the latest {latest}")]
    SequenceAhead { from: u32, latest: u32 },
}

struct Inner {
    buf: VecDeque<Event>,
    /// Sequence number of the most recently appended event; 0 before the
    /// first append. Strictly increasing, never reused.
    latest: u32,
}

/// Fixed-capacity event ring. Single writer (the room loop), many readers.
pub struct EvBuf {
    capacity: usize,
    inner: RwLock<Inner>,
    notify: Notify,
}

impl EvBuf {
    pub fn with_capacity(capacity: usize) -> EvBuf {
        assert!(capacity > 0, "evbuf capacity must be positive");
        EvBuf {
            capacity,
            inner: RwLock::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                latest: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Appends one event, assigning `latest + 1`. Evicts the oldest event
    /// when full. Wakes one pending `notified()` waiter.
    pub fn append(&self, ev: Event) -> u32 {
        let seq = {
            let mut inner = self.inner.write();
            if inner.buf.len() == self.capacity {
                inner.buf.pop_front();
            }
            inner.buf.push_back(ev);
            inner.latest += 1;
            inner.latest
        };
        self.notify.notify_one();
        seq
    }

    /// Returns the events with sequence in `(from, latest]`, oldest first.
    ///
    /// `from` one below the oldest held sequence is still recoverable (the
    /// whole buffer is returned); anything older has been evicted.
    pub fn read(&self, from: u32) -> Result<Vec<Event>, EvBufError> {
        let inner = self.inner.read();
        let len = inner.buf.len() as u32;
        let oldest = inner.latest - len + 1;

        if from > inner.latest {
            return Err(EvBufError::SequenceAhead {
                from,
                latest: inner.latest,
            });
        }
        if len > 0 && from + 1 < oldest {
            return Err(EvBufError::SequenceTooOld { from, oldest });
        }

        let count = (inner.latest - from) as usize;
        let start = inner.buf.len() - count;
        Ok(inner.buf.iter().skip(start).cloned().collect())
    }

    pub fn latest(&self) -> u32 {
        self.inner.read().latest
    }

    /// Resolves after the next `append`. One pending notification is
    /// retained, so an append between flushes is never missed.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
