//! Receiver-side proxy views over chunks the sender still owns.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::beam::Shared;
use crate::chunk::QueuedChunk;

/// The source chunk behind a proxy is gone: the sending side was torn
/// down while the view was still alive.
///
/// Reads through such a view yield no bytes and this error instead of
/// dangling into reclaimed storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("source chunk is gone")]
pub struct SourceReset;

/// Receiver-side view of a sender chunk parked in the beam's hold list.
///
/// Proxies are shared-ownership: cloning or splitting one yields another
/// view over the same source. Only when the last view goes away is the
/// beam notified, which releases the source chunk and wakes a sender
/// blocked on buffer space.
#[derive(Clone)]
pub struct ProxyChunk {
    shared: Arc<ProxyShared>,
    start: u64,
    len: u64,
}

impl ProxyChunk {
    pub(crate) fn new(beam: Weak<Shared>, source: Weak<QueuedChunk>, n: u64, len: u64) -> Self {
        Self {
            shared: Arc::new(ProxyShared { beam, source, n }),
            start: 0,
            len,
        }
    }

    pub(crate) fn shared_weak(&self) -> Weak<ProxyShared> {
        Arc::downgrade(&self.shared)
    }

    /// Number of bytes this view covers.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether the view covers no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Serial assigned when the view was materialized. Diagnostic only;
    /// monotonically increasing per beam.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.shared.n
    }

    /// Reads the viewed byte range out of the source chunk.
    ///
    /// This never blocks: the source payload is immutable heap memory
    /// once queued.
    ///
    /// # Errors
    ///
    /// Errors with [`SourceReset`] if the sending side has been torn
    /// down; the view then has no bytes to give.
    #[allow(clippy::missing_panics_doc)] // shouldn't panic
    pub fn read(&self) -> Result<Bytes, SourceReset> {
        let source = self.shared.source.upgrade().ok_or(SourceReset)?;
        // only heap-backed data chunks are ever proxied
        let payload = source.heap_payload().ok_or(SourceReset)?;
        let start = usize::try_from(self.start).expect("view offsets fit a buffer length");
        let len = usize::try_from(self.len).expect("view lengths fit a buffer length");
        Ok(payload.slice(start..start + len))
    }

    /// Splits off the bytes from `at` onward as a second view over the
    /// same source, leaving `self` with the first `at` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `at` is past the end of the view.
    pub fn split_off(&mut self, at: u64) -> Self {
        assert!(at <= self.len, "split past end of chunk");
        let rest = Self {
            shared: Arc::clone(&self.shared),
            start: self.start + at,
            len: self.len - at,
        };
        self.len = at;
        rest
    }
}

impl fmt::Debug for ProxyChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyChunk")
            .field("n", &self.shared.n)
            .field("start", &self.start)
            .field("len", &self.len)
            .field("live", &(self.shared.source.strong_count() > 0))
            .finish()
    }
}

pub(crate) struct ProxyShared {
    pub(crate) beam: Weak<Shared>,
    pub(crate) source: Weak<QueuedChunk>,
    pub(crate) n: u64,
}

impl Drop for ProxyShared {
    fn drop(&mut self) {
        // Views may be split and cloned freely; only the one that takes
        // the refcount to zero lands here.
        if let Some(beam) = self.beam.upgrade() {
            beam.emitted(self);
        }
    }
}
