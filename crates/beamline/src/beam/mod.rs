//! See [`Beam`].

mod recv;
mod send;

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use ahash::AHashMap;
use bytes::Bytes;
use tracing::{trace, warn};

use crate::chunk::{FileChunk, QueuedChunk, QueuedData, RecvChunk};
use crate::proxy::ProxyShared;

/// Which end of the beam owns it, and with it, which teardown strategy
/// runs on [`Beam::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// The sending side owns the beam. Its teardown wipes all queued
    /// chunks and cuts every live proxy off from its source.
    Sender,
    /// The receiving side owns the beam. Its teardown first discards
    /// the receive buffer, then runs the sender-side cleanup.
    Receiver,
}

/// Whether an operation may park the calling thread on the beam's
/// condition variable when it cannot make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Block {
    /// Wait for the other side, bounded by the configured timeout.
    Blocking,
    /// Fail with a would-block error instead of waiting.
    NonBlocking,
}

/// The beam was aborted: queued data is discarded and both sides fail
/// promptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("beam was aborted")]
pub struct Aborted;

/// Error from [`Beam::send`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No buffer space left and the call may not (or may no longer)
    /// block. Unsent chunks stay in the input for a retry.
    #[error("no buffer space left")]
    WouldBlock,
    /// Waited for buffer space past the configured timeout.
    #[error("timed out waiting for buffer space")]
    TimedOut,
    /// See [`Aborted`].
    #[error(transparent)]
    Aborted(#[from] Aborted),
    /// The beam is closed; nothing further may be queued.
    #[error("beam is closed")]
    Closed,
    /// Reading a chunk's payload on the sending side failed.
    #[error("failed to read chunk payload")]
    Read(#[from] std::io::Error),
}

/// Error from [`Beam::receive`].
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// Nothing ready and the call may not block.
    #[error("no chunks ready")]
    WouldBlock,
    /// Waited for chunks past the configured timeout.
    #[error("timed out waiting for chunks")]
    TimedOut,
    /// See [`Aborted`].
    #[error(transparent)]
    Aborted(#[from] Aborted),
    /// Clean end of stream: the beam is closed and fully drained.
    #[error("end of stream")]
    Eof,
}

/// Error from [`Beam::wait_empty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The beam still holds chunks and the call may not block.
    #[error("beam still holds chunks")]
    WouldBlock,
    /// Waited past the configured timeout.
    #[error("timed out waiting for the beam to drain")]
    TimedOut,
}

/// Hook that may materialize a custom receiver-side chunk from a queued
/// payload, in place of the default proxy view.
pub type Beamer = Box<dyn FnMut(&Bytes) -> Option<RecvChunk> + Send>;

type ReportFn = Box<dyn FnMut(u64) + Send>;
type FilePolicyFn = Box<dyn FnMut(&File) -> bool + Send>;

/// Configuration for a [`Beam`].
#[derive(Debug, Clone, Default)]
pub struct BeamConfig {
    /// Numeric identifier, used in diagnostics only.
    pub id: u64,
    /// Short diagnostic label.
    pub tag: String,
    /// Which side owns the beam.
    pub owner: Owner,
    /// Byte budget over queued, not-yet-received chunks. [`None`] is
    /// unbounded. The budget is opportunistic: one chunk may overshoot
    /// it, because making progress beats holding a strict cap.
    pub max_buf_size: Option<usize>,
    /// Upper bound on any single blocking wait. [`None`] waits
    /// indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for Owner {
    fn default() -> Self {
        Self::Sender
    }
}

/// Single-producer, single-consumer pipe that carries a FIFO stream of
/// chunks between two threads, keeping all sender storage out of the
/// receiver's reach.
///
/// A `Beam` is a cheap cloneable handle; clone it to hand one end to
/// another thread. Exactly one thread may act as the sender and one as
/// the receiver at a time.
///
/// Chunks queued by [`send`] are normalized so the receiver can read
/// them safely, then handed over by [`receive`] as proxy views that keep
/// the originals alive until the receiver is done with them. A byte
/// budget blocks the sender when the queue is full; closing delivers an
/// end-of-stream marker after the last chunk; aborting discards
/// everything and fails both sides promptly.
///
/// [`send`]: Beam::send
/// [`receive`]: Beam::receive
#[derive(Clone)]
pub struct Beam {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    id: u64,
    tag: String,
    owner: Owner,
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    max_buf_size: Option<usize>,
    timeout: Option<Duration>,
    closed: bool,
    aborted: bool,
    close_sent: bool,
    sent_bytes: u64,
    received_bytes: u64,
    reported_produced_bytes: u64,
    reported_consumed_bytes: u64,
    files_beamed: usize,
    /// Serial source for proxy views.
    buckets_sent: u64,
    /// Chunks queued by the sender, not yet handed over.
    send_list: VecDeque<Arc<QueuedChunk>>,
    /// Chunks handed over but still referenced by a receiver-side view.
    hold_list: VecDeque<Arc<QueuedChunk>>,
    /// Chunks whose last view is gone; reclaimed on the next sender-side
    /// operation.
    purge_list: Vec<Arc<QueuedChunk>>,
    /// Receiver-side chunks left over from a partial receive.
    recv_buffer: VecDeque<RecvChunk>,
    /// Live proxy views by serial.
    proxies: AHashMap<u64, Weak<ProxyShared>>,
    on_consumed: Option<ReportFn>,
    on_produced: Option<ReportFn>,
    can_beam_file: Option<FilePolicyFn>,
    beamers: Vec<Beamer>,
    /// Handle of the last file chunk that passed the policy hook; the
    /// hook is not asked again for the same handle.
    last_beamed: Option<Weak<File>>,
}

impl State {
    /// Bytes in the send list that occupy sender memory. File chunks
    /// have no real memory footprint and do not count.
    fn mem_buffered(&self) -> u64 {
        self.send_list
            .iter()
            .filter(|chunk| !chunk.is_file())
            .map(|chunk| chunk.len())
            .sum()
    }

    fn space_left(&self) -> usize {
        match self.max_buf_size {
            None => usize::MAX,
            Some(max) => {
                let buffered = usize::try_from(self.mem_buffered()).unwrap_or(usize::MAX);
                max.saturating_sub(buffered)
            }
        }
    }

    /// Reclaims chunks the receiver has released.
    fn purge_sent(&mut self) {
        self.purge_list.clear();
    }

    fn push_queued(&mut self, data: QueuedData) {
        let chunk = QueuedChunk { data };
        self.sent_bytes += chunk.len();
        self.send_list.push_back(Arc::new(chunk));
    }

    fn may_beam_file(&mut self, file: &FileChunk) -> bool {
        let same_as_last = self
            .last_beamed
            .as_ref()
            .is_some_and(|last| last.ptr_eq(&Arc::downgrade(file.handle())));
        if same_as_last {
            return true;
        }
        match self.can_beam_file.as_mut() {
            Some(hook) => hook(file.handle().as_ref()),
            None => true,
        }
    }

    fn report_consumption(&mut self, force: bool) {
        if force || self.received_bytes != self.reported_consumed_bytes {
            let delta = self.received_bytes - self.reported_consumed_bytes;
            if let Some(hook) = self.on_consumed.as_mut() {
                hook(delta);
            }
            self.reported_consumed_bytes = self.received_bytes;
        }
    }

    fn report_production(&mut self, force: bool) {
        if force || self.sent_bytes != self.reported_produced_bytes {
            let delta = self.sent_bytes - self.reported_produced_bytes;
            if let Some(hook) = self.on_produced.as_mut() {
                hook(delta);
            }
            self.reported_produced_bytes = self.sent_bytes;
        }
    }

    /// Sender-side teardown: wipe every list and cut all live views off
    /// from their sources.
    fn sender_cleanup(&mut self) {
        self.purge_sent();
        self.send_list.clear();
        self.report_consumption(false);
        self.proxies.clear();
        self.purge_list.clear();
        self.hold_list.clear();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // a poisoned lock means a holder panicked mid-operation; state
        // mutations complete before unlocking, so the data is usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits on the condition variable, honoring the configured timeout.
    /// Returns whether the wait timed out.
    fn wait<'g>(&'g self, st: MutexGuard<'g, State>) -> (MutexGuard<'g, State>, bool) {
        match st.timeout {
            Some(timeout) => {
                let (st, result) = self
                    .cond
                    .wait_timeout(st, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
                (st, result.timed_out())
            }
            None => (
                self.cond.wait(st).unwrap_or_else(PoisonError::into_inner),
                false,
            ),
        }
    }

    /// Called by the last proxy view over a sender chunk as it goes
    /// away: the source no longer needs to be held.
    pub(crate) fn emitted(&self, proxy: &ProxyShared) {
        let mut st = self.lock();
        st.proxies.remove(&proxy.n);
        if let Some(source) = proxy.source.upgrade() {
            match st
                .hold_list
                .iter()
                .position(|chunk| Arc::ptr_eq(chunk, &source))
            {
                Some(pos) => {
                    // The released chunk moves to purge, together with
                    // every metadata chunk queued ahead of it: those were
                    // only parked in hold to share its ordering and have
                    // no view of their own. Data chunks ahead of it stay;
                    // data need not be reclaimed in order.
                    let mut target = pos;
                    let mut i = 0;
                    while i <= target {
                        if i == target {
                            if let Some(chunk) = st.hold_list.remove(i) {
                                st.purge_list.push(chunk);
                            }
                            break;
                        }
                        if st.hold_list[i].is_meta() {
                            if let Some(chunk) = st.hold_list.remove(i) {
                                st.purge_list.push(chunk);
                            }
                            target -= 1;
                        } else {
                            i += 1;
                        }
                    }
                }
                None => {
                    warn!(
                        id = self.id,
                        tag = %self.tag,
                        n = proxy.n,
                        "emitted chunk not in hold list"
                    );
                }
            }
        }
        // wake a sender blocked on space; it reclaims purged chunks and
        // recomputes space on wake
        self.cond.notify_all();
    }
}

impl Beam {
    /// Creates a beam from the given configuration.
    #[must_use]
    pub fn new(config: BeamConfig) -> Self {
        let BeamConfig {
            id,
            tag,
            owner,
            max_buf_size,
            timeout,
        } = config;
        Self {
            shared: Arc::new(Shared {
                id,
                tag,
                owner,
                state: Mutex::new(State {
                    max_buf_size,
                    timeout,
                    ..State::default()
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Numeric identifier from the configuration.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Diagnostic label from the configuration.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    /// Which side owns the beam.
    #[must_use]
    pub fn owner(&self) -> Owner {
        self.shared.owner
    }

    /// Updates the byte budget. Takes effect on the next flow check.
    pub fn set_max_buf_size(&self, max_buf_size: Option<usize>) {
        self.shared.lock().max_buf_size = max_buf_size;
    }

    /// The configured byte budget. [`None`] is unbounded.
    #[must_use]
    pub fn max_buf_size(&self) -> Option<usize> {
        self.shared.lock().max_buf_size
    }

    /// Updates the blocking-wait timeout. Takes effect on the next wait.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.shared.lock().timeout = timeout;
    }

    /// The configured blocking-wait timeout. [`None`] waits
    /// indefinitely.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.shared.lock().timeout
    }

    /// Marks the beam closed: queued chunks stay deliverable, but
    /// nothing further may be sent. Idempotent.
    ///
    /// # Errors
    ///
    /// Errors with [`Aborted`] if the beam was aborted.
    pub fn close(&self) -> Result<(), Aborted> {
        let mut st = self.shared.lock();
        st.purge_sent();
        if !st.closed {
            st.closed = true;
            self.shared.cond.notify_all();
        }
        st.report_consumption(false);
        if st.aborted { Err(Aborted) } else { Ok(()) }
    }

    /// Aborts the beam: queued chunks are discarded immediately, and
    /// every subsequent operation on either side fails with [`Aborted`].
    /// Blocked threads wake promptly. Idempotent.
    pub fn abort(&self) {
        let mut st = self.shared.lock();
        if !st.aborted {
            trace!(id = self.shared.id, tag = %self.shared.tag, "beam aborted");
            st.aborted = true;
            st.closed = true;
            st.purge_sent();
            st.send_list.clear();
            st.report_consumption(false);
        }
        self.shared.cond.notify_all();
    }

    /// Tears the beam down early using the owner's cleanup strategy.
    ///
    /// All queued sender chunks are reclaimed; proxy views that outlive
    /// this read back [`SourceReset`](crate::proxy::SourceReset) instead
    /// of data. Dropping the last handle performs the same teardown
    /// implicitly. Idempotent.
    pub fn shutdown(&self) {
        let recv_buffer;
        {
            let mut st = self.shared.lock();
            trace!(id = self.shared.id, tag = %self.shared.tag, "beam shut down");
            st.closed = true;
            match self.shared.owner {
                Owner::Sender => {
                    st.sender_cleanup();
                    recv_buffer = mem::take(&mut st.recv_buffer);
                }
                Owner::Receiver => {
                    recv_buffer = mem::take(&mut st.recv_buffer);
                    st.sender_cleanup();
                }
            }
            self.shared.cond.notify_all();
        }
        // receiver chunks may hold proxy views whose teardown re-enters
        // the beam lock, so they go down outside of it
        drop(recv_buffer);
    }

    /// Waits until the send queue is drained and every proxy view is
    /// gone.
    ///
    /// # Errors
    ///
    /// Errors with [`WaitError::WouldBlock`] when non-blocking and not
    /// yet empty, or [`WaitError::TimedOut`] after the configured
    /// timeout.
    pub fn wait_empty(&self, block: Block) -> Result<(), WaitError> {
        let mut st = self.shared.lock();
        while !(st.send_list.is_empty() && st.proxies.is_empty()) {
            if block == Block::NonBlocking {
                return Err(WaitError::WouldBlock);
            }
            self.shared.cond.notify_all();
            let (guard, timed_out) = self.shared.wait(st);
            st = guard;
            if timed_out {
                return Err(WaitError::TimedOut);
            }
        }
        Ok(())
    }

    /// Installs the consumption callback, invoked with the number of
    /// bytes received since the last report.
    ///
    /// Callbacks run with the beam lock held and must not call back into
    /// the beam.
    pub fn on_consumed(&self, hook: impl FnMut(u64) + Send + 'static) {
        self.shared.lock().on_consumed = Some(Box::new(hook));
    }

    /// Installs the production callback, invoked with the number of
    /// bytes sent since the last report.
    ///
    /// Callbacks run with the beam lock held and must not call back into
    /// the beam.
    pub fn on_produced(&self, hook: impl FnMut(u64) + Send + 'static) {
        self.shared.lock().on_produced = Some(Box::new(hook));
    }

    /// Installs the file-beam policy hook. Returning `false` keeps the
    /// file handle on the sending side; the chunk's byte range is then
    /// streamed through the buffer like any opaque payload.
    ///
    /// Callbacks run with the beam lock held and must not call back into
    /// the beam.
    pub fn on_file_beam(&self, hook: impl FnMut(&File) -> bool + Send + 'static) {
        self.shared.lock().can_beam_file = Some(Box::new(hook));
    }

    /// Refuses to hand any file handle across, e.g. to keep the number
    /// of open descriptors on the receiving side down.
    pub fn deny_all_files(&self) {
        self.on_file_beam(|_| false);
    }

    /// Registers a beamer hook, tried in registration order before the
    /// default proxy materialization on every handed-over data chunk.
    ///
    /// Hooks run with the beam lock held and must not call back into the
    /// beam.
    pub fn register_beamer(&self, hook: impl FnMut(&Bytes) -> Option<RecvChunk> + Send + 'static) {
        self.shared.lock().beamers.push(Box::new(hook));
    }

    /// Bytes currently occupying the send queue, files included.
    #[must_use]
    pub fn buffered(&self) -> u64 {
        self.shared
            .lock()
            .send_list
            .iter()
            .map(|chunk| chunk.len())
            .sum()
    }

    /// Sender memory held by the send queue. Unlike [`buffered`], file
    /// chunks do not count; their bytes live in the file.
    ///
    /// [`buffered`]: Beam::buffered
    #[must_use]
    pub fn mem_used(&self) -> u64 {
        self.shared.lock().mem_buffered()
    }

    /// Number of file handles handed across so far.
    #[must_use]
    pub fn files_beamed(&self) -> usize {
        self.shared.lock().files_beamed
    }

    /// Whether both the send queue and the receive buffer are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let st = self.shared.lock();
        st.send_list.is_empty() && st.recv_buffer.is_empty()
    }

    /// Whether any proxy view over a sender chunk is still alive.
    #[must_use]
    pub fn holds_proxies(&self) -> bool {
        !self.shared.lock().proxies.is_empty()
    }

    /// Whether the receiver has taken any bytes yet.
    #[must_use]
    pub fn was_received(&self) -> bool {
        self.shared.lock().received_bytes > 0
    }

    /// Total bytes that have entered the send queue. Monotonic.
    #[must_use]
    pub fn sent_bytes(&self) -> u64 {
        self.shared.lock().sent_bytes
    }

    /// Total bytes handed over to the receiving side. Monotonic; never
    /// exceeds [`sent_bytes`](Beam::sent_bytes).
    #[must_use]
    pub fn received_bytes(&self) -> u64 {
        self.shared.lock().received_bytes
    }
}

impl fmt::Debug for Beam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.lock();
        f.debug_struct("Beam")
            .field("id", &self.shared.id)
            .field("tag", &self.shared.tag)
            .field("owner", &self.shared.owner)
            .field("closed", &st.closed)
            .field("aborted", &st.aborted)
            .field("sent_bytes", &st.sent_bytes)
            .field("received_bytes", &st.received_bytes)
            .field("send", &st.send_list.len())
            .field("hold", &st.hold_list.len())
            .field("purge", &st.purge_list.len())
            .field("proxies", &st.proxies.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::Bytes;

    use super::*;
    use crate::chunk::Chunk;

    fn beam(max_buf_size: Option<usize>) -> Beam {
        Beam::new(BeamConfig {
            tag: "test".into(),
            max_buf_size,
            ..BeamConfig::default()
        })
    }

    #[test]
    fn config_defaults() {
        let beam = Beam::new(BeamConfig::default());
        assert_eq!(0, beam.id());
        assert_eq!("", beam.tag());
        assert_eq!(Owner::Sender, beam.owner());
        assert_eq!(None, beam.max_buf_size());
        assert_eq!(None, beam.timeout());
    }

    #[test]
    fn live_config_updates() {
        let beam = beam(None);
        beam.set_max_buf_size(Some(128));
        assert_eq!(Some(128), beam.max_buf_size());
        beam.set_timeout(Some(Duration::from_millis(250)));
        assert_eq!(Some(Duration::from_millis(250)), beam.timeout());
    }

    #[test]
    fn close_is_idempotent() {
        let beam = beam(None);
        beam.close().unwrap();
        beam.close().unwrap();
        let mut input = VecDeque::new();
        input.push_back(Chunk::Heap(Bytes::from_static(b"late")));
        assert_matches!(
            beam.send(&mut input, Block::NonBlocking),
            Err(SendError::Closed)
        );
    }

    #[test]
    fn abort_discards_queued_data() {
        let beam = beam(None);
        let mut input = VecDeque::new();
        input.push_back(Chunk::Heap(Bytes::from_static(b"doomed")));
        beam.send(&mut input, Block::NonBlocking).unwrap();
        assert_eq!(6, beam.buffered());

        beam.abort();
        beam.abort();
        assert_eq!(0, beam.buffered());
        assert_matches!(beam.close(), Err(Aborted));

        input.push_back(Chunk::Heap(Bytes::from_static(b"more")));
        assert_matches!(
            beam.send(&mut input, Block::Blocking),
            Err(SendError::Aborted(Aborted))
        );
        assert!(input.is_empty());
    }

    #[test]
    fn production_reported_on_send() {
        let beam = beam(None);
        let produced = Arc::new(Mutex::new(0u64));
        let sink = Arc::clone(&produced);
        beam.on_produced(move |delta| {
            *sink.lock().unwrap_or_else(PoisonError::into_inner) += delta;
        });

        let mut input = VecDeque::new();
        input.push_back(Chunk::Heap(Bytes::from_static(b"0123456789")));
        beam.send(&mut input, Block::NonBlocking).unwrap();
        assert_eq!(10, *produced.lock().unwrap_or_else(PoisonError::into_inner));
        assert_eq!(10, beam.sent_bytes());
    }

    #[test]
    fn wait_empty_without_traffic() {
        let beam = beam(None);
        beam.wait_empty(Block::NonBlocking).unwrap();

        let mut input = VecDeque::new();
        input.push_back(Chunk::Heap(Bytes::from_static(b"x")));
        beam.send(&mut input, Block::NonBlocking).unwrap();
        assert_matches!(
            beam.wait_empty(Block::NonBlocking),
            Err(WaitError::WouldBlock)
        );
    }
}
