//! Sending-side logic for a [`Beam`]: chunk classification, append, and
//! the flow-control wait.

use std::collections::VecDeque;
use std::sync::{Arc, MutexGuard};

use bytes::Bytes;

use crate::chunk::{Chunk, FileSource, Meta, QueuedData, READ_CHUNK_SIZE, UnknownChunk};

use super::{Aborted, Beam, Block, SendError, State};

/// Outcome of trying to queue one chunk without waiting.
enum Append<'a> {
    /// Chunk fully queued.
    Queued,
    /// A head piece was queued; the rest goes back to the input head.
    Split(Chunk<'a>),
    /// No space at all; the chunk goes back so the caller can wait and
    /// retry.
    Full(Chunk<'a>),
    /// Read failure; the chunk goes back for a possible retry.
    Failed(Chunk<'a>, SendError),
}

impl Beam {
    /// Queues every chunk in `input` onto the beam, in order.
    ///
    /// Chunks are consumed from the front of `input` as they are
    /// accepted. Borrowed chunks are copied onto the heap and unknown
    /// chunks are read, both while still on this thread, so the receiver
    /// never touches caller storage.
    ///
    /// When the byte budget is full, a blocking call parks until the
    /// receiver frees space (bounded by the configured timeout). The
    /// budget is opportunistic: a chunk larger than the space left is
    /// still queued whole once *any* space is free, because progress
    /// beats a strict cap.
    ///
    /// Only the sending thread may call this.
    ///
    /// # Errors
    ///
    /// On error, chunks not yet queued (including the failing one) stay
    /// in `input` so the caller can retry or discard them — except on
    /// [`SendError::Aborted`], which discards the input outright.
    pub fn send(&self, input: &mut VecDeque<Chunk<'_>>, block: Block) -> Result<(), SendError> {
        let mut st = self.shared.lock();
        st.purge_sent();
        if st.aborted {
            st.report_consumption(false);
            drop(st);
            // the beam owns whatever the sender queues; an aborted beam
            // discards it
            input.clear();
            return Err(Aborted.into());
        }

        let force_report = !input.is_empty();
        let mut result = Ok(());
        'chunks: while let Some(mut chunk) = input.pop_front() {
            loop {
                if st.closed {
                    input.push_front(chunk);
                    result = Err(SendError::Closed);
                    break 'chunks;
                }
                match append(&mut st, chunk) {
                    Append::Queued => continue 'chunks,
                    Append::Split(rest) => {
                        input.push_front(rest);
                        continue 'chunks;
                    }
                    Append::Failed(rest, err) => {
                        input.push_front(rest);
                        result = Err(err);
                        break 'chunks;
                    }
                    Append::Full(rest) => {
                        chunk = rest;
                        let (guard, waited) = self.wait_space(st, block);
                        st = guard;
                        match waited {
                            Err(err) => {
                                input.push_front(chunk);
                                result = Err(err);
                                break 'chunks;
                            }
                            Ok(0) => {
                                input.push_front(chunk);
                                result = Err(SendError::WouldBlock);
                                break 'chunks;
                            }
                            Ok(_) => {}
                        }
                    }
                }
            }
        }

        st.report_production(force_report);
        self.shared.cond.notify_all();
        st.report_consumption(false);
        result
    }

    /// Blocks until the send queue has any space at all, reclaiming
    /// released chunks on every wakeup. Returns the space now available.
    fn wait_space<'g>(
        &'g self,
        mut st: MutexGuard<'g, State>,
        block: Block,
    ) -> (MutexGuard<'g, State>, Result<usize, SendError>) {
        let mut space = st.space_left();
        while !st.aborted && space == 0 && block == Block::Blocking {
            // publish progress before sleeping so the other side knows
            // there is something to drain
            st.report_production(true);
            let (guard, timed_out) = self.shared.wait(st);
            st = guard;
            if timed_out {
                return (st, Err(SendError::TimedOut));
            }
            st.purge_sent();
            space = st.space_left();
        }
        if st.aborted {
            (st, Err(Aborted.into()))
        } else {
            (st, Ok(space))
        }
    }
}

/// Whether queueing `len` more bytes has to wait for the receiver.
///
/// Any nonzero amount of space admits a whole chunk; zero-length chunks
/// always pass.
fn needs_space(st: &State, len: usize) -> bool {
    len > 0 && st.space_left() == 0
}

fn append<'a>(st: &mut State, chunk: Chunk<'a>) -> Append<'a> {
    match chunk {
        Chunk::Meta(meta) => {
            if meta == Meta::Eos {
                st.closed = true;
            }
            st.push_queued(QueuedData::Meta(meta));
            Append::Queued
        }
        Chunk::File(file) => {
            if st.may_beam_file(&file) {
                st.last_beamed = Some(Arc::downgrade(file.handle()));
                // file lengths do not count toward the buffer budget;
                // the bytes stay in the file
                st.push_queued(QueuedData::File(file));
                Append::Queued
            } else {
                // the policy hook keeps the handle on this side; stream
                // the byte range through the buffer instead
                append_unknown(st, UnknownChunk::new(FileSource::from(file)))
            }
        }
        Chunk::Heap(bytes) => {
            if needs_space(st, bytes.len()) {
                return Append::Full(Chunk::Heap(bytes));
            }
            // safe to read from the other thread as-is: the backing
            // storage lives until the chunk itself is reclaimed
            st.push_queued(QueuedData::Heap(bytes));
            Append::Queued
        }
        Chunk::Transient(slice) => {
            if needs_space(st, slice.len()) {
                return Append::Full(Chunk::Transient(slice));
            }
            st.push_queued(QueuedData::Heap(Bytes::copy_from_slice(slice)));
            Append::Queued
        }
        Chunk::ArenaBound(slice) => {
            if needs_space(st, slice.len()) {
                return Append::Full(Chunk::ArenaBound(slice));
            }
            // the sender's arena may reclaim this storage at any moment,
            // even after the pointer has been handed out; take the copy
            // now, under sender-thread control
            st.push_queued(QueuedData::Heap(Bytes::copy_from_slice(slice)));
            Append::Queued
        }
        Chunk::Unknown(unknown) => append_unknown(st, unknown),
    }
}

/// Queues an opaque-source chunk by pulling its payload in bounded
/// pieces, splitting it across appends when the budget is tighter than
/// the payload.
fn append_unknown<'a>(st: &mut State, mut unknown: UnknownChunk) -> Append<'a> {
    if unknown.remaining() == Some(0) {
        return Append::Queued;
    }
    let space = st.space_left();
    if space == 0 {
        return Append::Full(Chunk::Unknown(unknown));
    }

    // even a tight budget admits this much in one piece, so oversized
    // chunks keep making forward progress
    let budget = space.max(READ_CHUNK_SIZE);
    let want = match unknown.remaining() {
        Some(rem) if rem < budget as u64 => {
            usize::try_from(rem).expect("`rem` is smaller than a usize budget")
        }
        _ => budget,
    };
    let bytes = match unknown.pull(want) {
        Ok(bytes) => bytes,
        Err(err) => return Append::Failed(Chunk::Unknown(unknown), err.into()),
    };
    // an empty pull always ends the chunk, whatever `remaining` claims
    let exhausted = bytes.is_empty() || unknown.remaining() == Some(0);
    if !bytes.is_empty() {
        st.push_queued(QueuedData::Heap(bytes));
    }
    if exhausted {
        Append::Queued
    } else {
        Append::Split(Chunk::Unknown(unknown))
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex, PoisonError};

    use assert_matches::assert_matches;

    use crate::beam::BeamConfig;
    use crate::chunk::ChunkSource;

    use super::*;

    fn beam(max_buf_size: Option<usize>) -> Beam {
        Beam::new(BeamConfig {
            tag: "send-test".into(),
            max_buf_size,
            ..BeamConfig::default()
        })
    }

    /// In-memory payload source with an optionally unknown length.
    struct SliceSource {
        data: Vec<u8>,
        pos: usize,
        sized: bool,
    }

    impl SliceSource {
        fn new(data: impl Into<Vec<u8>>, sized: bool) -> Self {
            Self {
                data: data.into(),
                pos: 0,
                sized,
            }
        }
    }

    impl ChunkSource for SliceSource {
        fn remaining(&self) -> Option<u64> {
            self.sized.then(|| (self.data.len() - self.pos) as u64)
        }

        fn pull(&mut self, max: usize) -> io::Result<Bytes> {
            let take = usize::min(max, self.data.len() - self.pos);
            let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + take]);
            self.pos += take;
            Ok(bytes)
        }
    }

    #[test]
    fn transient_copied_before_queueing() {
        let beam = beam(None);
        let mut input = VecDeque::new();
        {
            let on_stack = *b"short lived";
            input.push_back(Chunk::Transient(&on_stack));
            beam.send(&mut input, Block::NonBlocking).unwrap();
        }
        // the payload now lives on the heap, independent of the caller
        assert_eq!(11, beam.buffered());
        assert_eq!(11, beam.sent_bytes());
    }

    #[test]
    fn full_beam_would_block() {
        let beam = beam(Some(4));
        let mut input = VecDeque::new();
        input.push_back(Chunk::Heap(Bytes::from_static(b"full")));
        beam.send(&mut input, Block::NonBlocking).unwrap();

        input.push_back(Chunk::Heap(Bytes::from_static(b"x")));
        assert_matches!(
            beam.send(&mut input, Block::NonBlocking),
            Err(SendError::WouldBlock)
        );
        // the rejected chunk stays queued for a retry
        assert_eq!(1, input.len());
        assert_eq!(4, beam.buffered());
    }

    #[test]
    fn one_chunk_may_overshoot_the_budget() {
        let beam = beam(Some(4));
        let mut input = VecDeque::new();
        input.push_back(Chunk::Heap(Bytes::from_static(b"0123456789")));
        beam.send(&mut input, Block::NonBlocking).unwrap();
        // progress beats a strict cap: the whole chunk went through
        assert_eq!(10, beam.buffered());
    }

    #[test]
    fn metadata_ignores_the_budget() {
        let beam = beam(Some(4));
        let mut input = VecDeque::new();
        input.push_back(Chunk::Heap(Bytes::from_static(b"full")));
        input.push_back(Chunk::flush());
        input.push_back(Chunk::eos());
        beam.send(&mut input, Block::NonBlocking).unwrap();
        assert!(input.is_empty());
        assert_eq!(4, beam.buffered());
    }

    #[test]
    fn eos_closes_the_beam() {
        let beam = beam(None);
        let mut input = VecDeque::new();
        input.push_back(Chunk::eos());
        input.push_back(Chunk::Heap(Bytes::from_static(b"late")));
        assert_matches!(
            beam.send(&mut input, Block::NonBlocking),
            Err(SendError::Closed)
        );
        // the marker went through; the late chunk did not
        assert_eq!(1, input.len());
    }

    #[test]
    fn unknown_chunk_splits_to_the_budget() {
        let beam = beam(Some(4));
        let payload = vec![7u8; READ_CHUNK_SIZE * 2];
        let mut input = VecDeque::new();
        input.push_back(Chunk::Unknown(UnknownChunk::new(SliceSource::new(
            payload, true,
        ))));

        assert_matches!(
            beam.send(&mut input, Block::NonBlocking),
            Err(SendError::WouldBlock)
        );
        // one bounded piece went through, the remainder waits at the
        // input head
        assert_eq!(READ_CHUNK_SIZE as u64, beam.buffered());
        assert_eq!(1, input.len());
        assert_eq!(
            Some(READ_CHUNK_SIZE as u64),
            input.front().and_then(Chunk::len)
        );
    }

    #[test]
    fn unsized_source_drains_to_exhaustion() {
        let beam = beam(None);
        let mut input = VecDeque::new();
        input.push_back(Chunk::Unknown(UnknownChunk::new(SliceSource::new(
            vec![3u8; 100],
            false,
        ))));
        beam.send(&mut input, Block::NonBlocking).unwrap();
        assert!(input.is_empty());
        assert_eq!(100, beam.sent_bytes());
    }

    #[test]
    fn read_failure_leaves_chunk_for_retry() {
        struct FailingSource;

        impl ChunkSource for FailingSource {
            fn remaining(&self) -> Option<u64> {
                Some(10)
            }

            fn pull(&mut self, _max: usize) -> io::Result<Bytes> {
                Err(io::Error::other("backing store went away"))
            }
        }

        let beam = beam(None);
        let mut input = VecDeque::new();
        input.push_back(Chunk::Unknown(UnknownChunk::new(FailingSource)));
        input.push_back(Chunk::eos());
        assert_matches!(
            beam.send(&mut input, Block::NonBlocking),
            Err(SendError::Read(_))
        );
        // the failing chunk and everything behind it stay in the input
        assert_eq!(2, input.len());
        assert_eq!(0, beam.sent_bytes());
    }

    #[test]
    fn production_reported_once_per_send() {
        let beam = beam(None);
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        beam.on_produced(move |delta| {
            sink.lock().unwrap_or_else(PoisonError::into_inner).push(delta);
        });

        let mut input = VecDeque::new();
        input.push_back(Chunk::Heap(Bytes::from_static(b"abc")));
        input.push_back(Chunk::Heap(Bytes::from_static(b"defgh")));
        beam.send(&mut input, Block::NonBlocking).unwrap();
        assert_eq!(
            vec![8],
            *reports.lock().unwrap_or_else(PoisonError::into_inner)
        );
    }
}
