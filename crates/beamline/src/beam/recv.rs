//! Receiving-side logic for a [`Beam`]: draining buffered leftovers,
//! materializing receiver chunks, and trimming to the byte budget.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use crate::chunk::{Meta, QueuedData, RecvChunk};
use crate::proxy::ProxyChunk;

use super::{Aborted, Beam, Block, RecvError, State};

impl Beam {
    /// Moves ready chunks onto the back of `output`, in FIFO order.
    ///
    /// Data chunks arrive as [`RecvChunk::Proxy`] views that keep the
    /// sender's originals alive until dropped; metadata is rebuilt
    /// fresh; file chunks share the sender's handle. At most `max_bytes`
    /// bytes are moved per call ([`None`] takes everything): the last
    /// chunk is split at the exact offset and the remainder is kept for
    /// the next call.
    ///
    /// Once the beam is closed and drained, a single end-of-stream
    /// marker is delivered, and every call after that reports
    /// [`RecvError::Eof`].
    ///
    /// Only the receiving thread may call this.
    ///
    /// # Errors
    ///
    /// Errors with [`RecvError::WouldBlock`] / [`RecvError::TimedOut`]
    /// when nothing is ready, [`RecvError::Eof`] at clean end of stream,
    /// or [`RecvError::Aborted`] once the beam is aborted. Chunks
    /// already buffered survive transient errors, so a retry resumes
    /// from the same point.
    pub fn receive(
        &self,
        output: &mut VecDeque<RecvChunk>,
        block: Block,
        max_bytes: Option<u64>,
    ) -> Result<(), RecvError> {
        let mut st = self.shared.lock();
        loop {
            if st.aborted {
                // dropping receiver chunks re-enters the beam lock, so
                // take them out before releasing it
                let dropped = mem::take(&mut st.recv_buffer);
                drop(st);
                drop(dropped);
                return Err(Aborted.into());
            }

            let mut taken: u64 = 0;
            let mut transferred = 0usize;

            // leftovers from a prior partial receive go out first
            loop {
                let Some(front_len) = st.recv_buffer.front().map(RecvChunk::len) else {
                    break;
                };
                if budget_blocks(max_bytes, taken, front_len) {
                    break;
                }
                if let Some(chunk) = st.recv_buffer.pop_front() {
                    taken += front_len;
                    transferred += 1;
                    output.push_back(chunk);
                }
            }

            // hand over queued sender chunks, materializing their
            // receiver-side form
            loop {
                let Some(head_len) = st.send_list.front().map(|chunk| chunk.len()) else {
                    break;
                };
                if budget_blocks(max_bytes, taken, head_len) {
                    break;
                }
                let Some(chunk) = st.send_list.pop_front() else {
                    break;
                };

                let out_len;
                match &chunk.data {
                    QueuedData::Meta(meta) => {
                        if *meta == Meta::Eos {
                            st.close_sent = true;
                        }
                        output.push_back(RecvChunk::Meta(meta.clone()));
                        out_len = 0;
                    }
                    QueuedData::File(file) => {
                        // the handle is re-homed to the receiving side;
                        // the bytes never travel through memory
                        st.files_beamed += 1;
                        output.push_back(RecvChunk::File(file.clone()));
                        out_len = head_len;
                    }
                    QueuedData::Heap(payload) => {
                        let mut beamers = mem::take(&mut st.beamers);
                        let custom = beamers.iter_mut().find_map(|hook| hook(payload));
                        st.beamers = beamers;
                        match custom {
                            Some(replacement) => {
                                out_len = replacement.len();
                                output.push_back(replacement);
                            }
                            None => {
                                let n = st.buckets_sent;
                                st.buckets_sent += 1;
                                let proxy = ProxyChunk::new(
                                    Arc::downgrade(&self.shared),
                                    Arc::downgrade(&chunk),
                                    n,
                                    head_len,
                                );
                                st.proxies.insert(n, proxy.shared_weak());
                                output.push_back(RecvChunk::Proxy(proxy));
                                out_len = head_len;
                            }
                        }
                    }
                }

                // the original is held until the last receiver-side view
                // of it is gone
                st.hold_list.push_back(chunk);
                st.received_bytes += head_len;
                taken += out_len;
                transferred += 1;
            }

            // too much went out: split at the exact byte offset and keep
            // the overrun for the next call
            if let Some(budget) = max_bytes {
                if taken > budget {
                    trim_output(&mut st, output, budget);
                }
            }

            if st.closed
                && !st.close_sent
                && st.recv_buffer.is_empty()
                && st.send_list.is_empty()
            {
                // nothing more will arrive; tell the receiver so
                output.push_back(RecvChunk::Meta(Meta::Eos));
                st.close_sent = true;
                transferred += 1;
            }

            if transferred > 0 {
                // a sender may be waiting on the space just freed
                self.shared.cond.notify_all();
                return Ok(());
            }
            if st.closed {
                return Err(RecvError::Eof);
            }
            if block == Block::Blocking {
                let (guard, timed_out) = self.shared.wait(st);
                st = guard;
                if timed_out {
                    return Err(RecvError::TimedOut);
                }
                continue;
            }
            self.shared.cond.notify_all();
            return Err(RecvError::WouldBlock);
        }
    }
}

/// Whether moving a chunk of `len` bytes would overrun the budget.
///
/// Zero-length (metadata) chunks pass until the budget is overrun;
/// after an overrun nothing more moves.
fn budget_blocks(budget: Option<u64>, taken: u64, len: u64) -> bool {
    match budget {
        None => false,
        Some(budget) => taken > budget || (len > 0 && taken >= budget),
    }
}

/// Walks `output` from the front, splits the chunk that first pushes
/// past `budget` at the exact offset, and moves the remainder plus all
/// chunks behind it back into the receive buffer — ahead of anything the
/// buffer already held, since they come earlier in the stream.
fn trim_output(st: &mut State, output: &mut VecDeque<RecvChunk>, budget: u64) {
    let mut acc: u64 = 0;
    let mut split = None;
    for (i, chunk) in output.iter().enumerate() {
        let len = chunk.len();
        if acc + len > budget {
            split = Some((i, budget - acc));
            break;
        }
        acc += len;
    }
    let Some((i, offset)) = split else {
        return;
    };

    let mut tail = output.split_off(i);
    if offset > 0 {
        if let Some(mut first) = tail.pop_front() {
            let rest = first.split_off(offset);
            output.push_back(first);
            tail.push_front(rest);
        }
    }
    let leftovers = mem::take(&mut st.recv_buffer);
    st.recv_buffer = tail;
    st.recv_buffer.extend(leftovers);
}
