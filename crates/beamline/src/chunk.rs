//! Chunk taxonomy carried by a [`Beam`].
//!
//! The sending side works with [`Chunk`], which may borrow caller
//! storage; [`Beam::send`] normalizes every chunk into an owned shape
//! before it crosses the thread boundary. The receiving side works with
//! [`RecvChunk`], whose data variant is a [`ProxyChunk`] view over the
//! sender's original.
//!
//! [`Beam`]: crate::beam::Beam
//! [`Beam::send`]: crate::beam::Beam::send

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::Bytes;

use crate::proxy::ProxyChunk;

/// Smallest read pulled out of an [`Unknown`] chunk in one go.
///
/// When the buffer budget is tighter than this, reads are still made in
/// pieces of at least this size, so a chunk larger than the whole budget
/// cannot stall the sender forever.
///
/// [`Unknown`]: Chunk::Unknown
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Stream markers carried in-band between data chunks.
///
/// Metadata has zero length and never counts toward the buffer budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Meta {
    /// End of stream: nothing follows this marker.
    Eos,
    /// Everything received so far should be pushed onward.
    Flush,
    /// The sender hit an error; the marker still travels in FIFO order
    /// so the receiver sees it after all preceding data.
    Error {
        /// Status code describing the error.
        status: u32,
        /// Optional payload with error details.
        data: Option<Bytes>,
    },
}

/// One unit of transfer on the sending side.
///
/// The borrowed variants reference caller storage and are copied onto
/// the heap while still on the sending thread, so nothing the receiver
/// ever observes can point into storage the sender may reclaim.
#[derive(Debug)]
pub enum Chunk<'a> {
    /// Stream marker. Zero-length.
    Meta(Meta),
    /// Immutable heap bytes whose backing storage outlives the chunk.
    /// Safe to read from either thread as-is.
    Heap(Bytes),
    /// Bytes in storage the sender's arena may reclaim at any moment.
    /// Copied on append, under sender-thread control.
    ArenaBound(&'a [u8]),
    /// Bytes in caller-owned (often stack) storage. Copied on append.
    Transient(&'a [u8]),
    /// An open file plus the byte range to serve from it. The handle is
    /// handed across instead of the bytes.
    File(FileChunk),
    /// A chunk type the beam has no special knowledge of; its payload
    /// is pulled through a [`ChunkSource`] on the sending thread.
    Unknown(UnknownChunk),
}

impl Chunk<'_> {
    /// End-of-stream marker chunk.
    #[must_use]
    pub const fn eos() -> Self {
        Self::Meta(Meta::Eos)
    }

    /// Flush marker chunk.
    #[must_use]
    pub const fn flush() -> Self {
        Self::Meta(Meta::Flush)
    }

    /// Length in bytes, if it is known without reading.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        match self {
            Self::Meta(_) => Some(0),
            Self::Heap(bytes) => Some(bytes.len() as u64),
            Self::ArenaBound(slice) | Self::Transient(slice) => Some(slice.len() as u64),
            Self::File(file) => Some(file.len()),
            Self::Unknown(unknown) => unknown.remaining(),
        }
    }
}

/// An open file and the byte range a chunk serves out of it.
///
/// The handle is shared: moving the chunk across the beam clones the
/// handle rather than copying file contents, and the last side to drop
/// it closes the file.
#[derive(Debug, Clone)]
pub struct FileChunk {
    file: Arc<File>,
    start: u64,
    len: u64,
}

impl FileChunk {
    /// Creates a chunk serving `len` bytes starting at `start`.
    #[must_use]
    pub fn new(file: File, start: u64, len: u64) -> Self {
        Self::from_arc(Arc::new(file), start, len)
    }

    /// Creates a chunk over an already-shared handle.
    #[must_use]
    pub const fn from_arc(file: Arc<File>, start: u64, len: u64) -> Self {
        Self { file, start, len }
    }

    /// The shared file handle.
    #[must_use]
    pub const fn handle(&self) -> &Arc<File> {
        &self.file
    }

    /// Offset of the first byte served.
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Number of bytes served.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether the served range is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the whole served range out of the file.
    ///
    /// # Errors
    ///
    /// Errors if seeking or reading fails, or if the file is shorter
    /// than the range claims.
    pub fn read_all(&self) -> io::Result<Bytes> {
        read_range(&self.file, self.start, self.len)
    }

    pub(crate) fn split_off(&mut self, at: u64) -> Self {
        debug_assert!(at <= self.len);
        let rest = Self {
            file: Arc::clone(&self.file),
            start: self.start + at,
            len: self.len - at,
        };
        self.len = at;
        rest
    }
}

fn read_range(file: &File, start: u64, len: u64) -> io::Result<Bytes> {
    let mut handle = file;
    handle.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    handle.take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file shorter than chunk range",
        ));
    }
    Ok(buf.into())
}

/// Pulls the payload out of a chunk whose backing storage the beam has
/// no knowledge of.
///
/// Implementations are only ever driven on the sending thread, so they
/// may freely touch sender-local storage. The beam assumes that bytes
/// already pulled stay immutable.
pub trait ChunkSource: Send {
    /// Bytes left to pull, if known up front.
    ///
    /// Must shrink as [`pull`](Self::pull) consumes the payload.
    fn remaining(&self) -> Option<u64>;

    /// Reads up to `max` bytes of payload, blocking if necessary.
    ///
    /// Returning an empty buffer signals that the payload is exhausted.
    ///
    /// # Errors
    ///
    /// Errors if the underlying read fails.
    fn pull(&mut self, max: usize) -> io::Result<Bytes>;
}

/// A chunk the beam has no special knowledge of.
///
/// Its payload is read in bounded pieces while still on the sending
/// thread, in the hope that data already read stays stable for the
/// lifetime of the chunk.
pub struct UnknownChunk {
    source: Box<dyn ChunkSource>,
}

impl UnknownChunk {
    /// Wraps a payload source.
    #[must_use]
    pub fn new(source: impl ChunkSource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    /// Bytes left to pull, if known.
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        self.source.remaining()
    }

    pub(crate) fn pull(&mut self, max: usize) -> io::Result<Bytes> {
        self.source.pull(max)
    }
}

impl fmt::Debug for UnknownChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnknownChunk")
            .field("remaining", &self.remaining())
            .finish_non_exhaustive()
    }
}

/// [`ChunkSource`] over a byte range of a file.
///
/// This is what a [`File`](Chunk::File) chunk degrades to when the
/// file-beam policy hook refuses to hand the handle across: the range is
/// streamed through the buffer instead.
#[derive(Debug)]
pub struct FileSource {
    file: Arc<File>,
    pos: u64,
    end: u64,
}

impl From<FileChunk> for FileSource {
    fn from(chunk: FileChunk) -> Self {
        Self {
            pos: chunk.start,
            end: chunk.start + chunk.len,
            file: chunk.file,
        }
    }
}

impl ChunkSource for FileSource {
    fn remaining(&self) -> Option<u64> {
        Some(self.end - self.pos)
    }

    fn pull(&mut self, max: usize) -> io::Result<Bytes> {
        let want = u64::min(self.end - self.pos, max as u64);
        let bytes = read_range(&self.file, self.pos, want)?;
        self.pos += want;
        Ok(bytes)
    }
}

/// One unit of transfer on the receiving side.
#[derive(Debug, Clone)]
pub enum RecvChunk {
    /// Stream marker, rebuilt fresh on the receiving side.
    Meta(Meta),
    /// View over a sender chunk still parked in the beam.
    Proxy(ProxyChunk),
    /// Shared file handle with the original byte range.
    File(FileChunk),
    /// Plain heap bytes, as produced by beamer hooks.
    Heap(Bytes),
}

impl RecvChunk {
    /// Length in bytes. Metadata is zero-length.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Meta(_) => 0,
            Self::Proxy(proxy) => proxy.len(),
            Self::File(file) => file.len(),
            Self::Heap(bytes) => bytes.len() as u64,
        }
    }

    /// Whether the chunk carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits off the bytes from `at` onward, leaving `self` with the
    /// first `at` bytes. Proxy and file chunks split into views over the
    /// same shared backing.
    ///
    /// # Panics
    ///
    /// Panics if `at` is past the end of the chunk, or if the chunk is
    /// metadata (which has no bytes to split).
    pub fn split_off(&mut self, at: u64) -> Self {
        assert!(at <= self.len(), "split past end of chunk");
        match self {
            Self::Meta(_) => panic!("cannot split a metadata chunk"),
            Self::Proxy(proxy) => Self::Proxy(proxy.split_off(at)),
            Self::File(file) => Self::File(file.split_off(at)),
            Self::Heap(bytes) => {
                let at = usize::try_from(at).expect("`at` is bounded by a buffer length");
                Self::Heap(bytes.split_off(at))
            }
        }
    }
}

/// A normalized sender chunk parked in one of the beam's lists.
///
/// Only these shapes survive append; everything else is copied or read
/// into one of them first.
#[derive(Debug)]
pub(crate) struct QueuedChunk {
    pub(crate) data: QueuedData,
}

#[derive(Debug)]
pub(crate) enum QueuedData {
    Meta(Meta),
    Heap(Bytes),
    File(FileChunk),
}

impl QueuedChunk {
    pub(crate) fn len(&self) -> u64 {
        match &self.data {
            QueuedData::Meta(_) => 0,
            QueuedData::Heap(bytes) => bytes.len() as u64,
            QueuedData::File(file) => file.len(),
        }
    }

    pub(crate) fn is_meta(&self) -> bool {
        matches!(self.data, QueuedData::Meta(_))
    }

    pub(crate) fn is_file(&self) -> bool {
        matches!(self.data, QueuedData::File(_))
    }

    pub(crate) fn heap_payload(&self) -> Option<&Bytes> {
        match &self.data {
            QueuedData::Heap(bytes) => Some(bytes),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_is_zero_length() {
        assert_eq!(Some(0), Chunk::eos().len());
        assert_eq!(Some(0), Chunk::flush().len());
        assert_eq!(
            Some(0),
            Chunk::Meta(Meta::Error {
                status: 502,
                data: Some(Bytes::from_static(b"bad gateway")),
            })
            .len()
        );
    }

    #[test]
    fn borrowed_lengths() {
        let on_stack = [1u8, 2, 3];
        assert_eq!(Some(3), Chunk::Transient(&on_stack).len());
        assert_eq!(Some(3), Chunk::ArenaBound(&on_stack).len());
    }

    #[test]
    fn heap_recv_split() {
        let mut chunk = RecvChunk::Heap(Bytes::from_static(b"hello world"));
        let rest = chunk.split_off(5);
        assert_eq!(5, chunk.len());
        assert_eq!(6, rest.len());
    }

    #[test]
    #[should_panic(expected = "split past end")]
    fn split_past_end() {
        let mut chunk = RecvChunk::Heap(Bytes::from_static(b"ab"));
        let _ = chunk.split_off(3);
    }
}
