//! Segmented receive log.
//!
//! A `RecvLog` accumulates a variable-sized byte stream from an inconsistent
//! source (typically a non-blocking socket) without ever moving bytes that
//! have already landed. Storage is a sequence of chunks where chunk `i` holds
//! `S₀·2^i` bytes, so capacity grows geometrically while the chunk for any
//! byte offset is computable in O(1). A separate read cursor supports
//! stream-style line extraction across chunk boundaries.

use std::{
    fmt,
    io::{self, IoSlice, Read, SeekFrom, Write},
};

use hearth_utils::safe_assert;
use thiserror::Error;
use tracing::warn;

/// Chunk 0 size used by [`RecvLog::new`].
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// Hard cap on the chunk count. With the default first-chunk size this
/// allows a shade under 2^30 bytes per connection, far beyond any request
/// this server is willing to buffer.
pub const MAX_CHUNKS: usize = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("first chunk size must be a nonzero power of two, got {0}")]
    ChunkSizeNotPowerOfTwo(usize),
    #[error("log reached its maximum chunk count")]
    Overflow,
    #[error("seek before the start of the log")]
    SeekNegative,
    #[error("seek past the end of the log")]
    SeekOverflow,
}

/// Outcome of [`RecvLog::fill_from`]. Each variant carries the number of
/// bytes appended before the source stopped yielding.
#[derive(Debug, PartialEq, Eq)]
pub enum Fill {
    /// The source returned `WouldBlock`; everything available was consumed.
    WouldBlock(usize),
    /// The source reported end-of-stream.
    Eof(usize),
    /// The byte limit was reached with the source still readable.
    Limit(usize),
}

impl Fill {
    pub fn count(&self) -> usize {
        match *self {
            Self::WouldBlock(n) | Self::Eof(n) | Self::Limit(n) => n,
        }
    }
}

/// Outcome of [`RecvLog::getline`].
#[derive(Debug, PartialEq, Eq)]
pub enum GetLine {
    /// A full line was copied into the caller's buffer; `n` bytes, with the
    /// terminating newline consumed from the log but not copied out.
    Line(usize),
    /// The buffer filled before a newline, but one exists later in the log.
    /// The read cursor is rolled back by one byte so the last byte is
    /// re-emitted on the next call; call again to continue the line.
    Partial(usize),
    /// The remainder of the log holds no newline: the line has not been
    /// fully received. The read cursor is unchanged.
    NoNewline,
}

struct Chunk {
    data: Box<[u8]>,
    fill: usize,
}

impl Chunk {
    fn filled(&self) -> &[u8] {
        &self.data[..self.fill]
    }
}

pub struct RecvLog {
    /// Total bytes appended.
    len: usize,
    /// Stream cursor advanced by `getline`/`seek`.
    read_offset: usize,
    /// Virtual start of the log, moved forward by `consolidate`.
    cutoff: usize,
    /// Size of chunk 0, a power of two.
    chunk_size: usize,
    /// Chunks currently holding data (the last one is the write tail).
    active: usize,
    /// Allocated chunks; `active..` were retained by `clear` for reuse.
    chunks: Vec<Chunk>,
}

impl RecvLog {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE).expect("default chunk size is a power of two")
    }

    pub fn with_chunk_size(chunk_size: usize) -> Result<Self, BufferError> {
        if chunk_size == 0 || !chunk_size.is_power_of_two() {
            return Err(BufferError::ChunkSizeNotPowerOfTwo(chunk_size));
        }
        let mut log = Self {
            len: 0,
            read_offset: 0,
            cutoff: 0,
            chunk_size,
            active: 0,
            chunks: Vec::new(),
        };
        log.grow().expect("growing an empty log cannot overflow");
        Ok(log)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    /// Bytes appended but not yet consumed by the read cursor.
    pub fn unread(&self) -> usize {
        self.len - self.read_offset
    }

    pub fn cutoff(&self) -> usize {
        self.cutoff
    }

    /// Number of chunks holding data.
    pub fn chunk_count(&self) -> usize {
        self.active
    }

    /// Filled portion of chunk `idx`.
    pub fn chunk(&self, idx: usize) -> &[u8] {
        self.chunks[idx].filled()
    }

    /// Capacity of chunk `idx`: `S₀·2^idx`.
    fn chunk_cap(&self, idx: usize) -> usize {
        self.chunk_size << idx
    }

    /// Combined capacity of chunks `0..k`, i.e. the log offset at which
    /// chunk `k` begins: `(S₀·2^k − 1) & ~(S₀−1)`.
    fn prefix(&self, k: usize) -> usize {
        ((self.chunk_size << k) - 1) & !(self.chunk_size - 1)
    }

    /// Index of the chunk holding the byte at `offset`:
    /// `⌊log₂((offset/S₀)+1)⌋`, computed with the leading-bit primitive.
    fn chunk_index(&self, offset: usize) -> usize {
        let order = self.chunk_size.trailing_zeros();
        (((offset | (self.chunk_size - 1)) + 1).ilog2() - order) as usize
    }

    /// Space left in the write tail before the next chunk is needed.
    fn remainder(&self) -> usize {
        self.prefix(self.active) - self.len
    }

    fn tail(&mut self) -> &mut Chunk {
        let idx = self.active - 1;
        &mut self.chunks[idx]
    }

    fn grow(&mut self) -> Result<(), BufferError> {
        if self.active < self.chunks.len() {
            self.chunks[self.active].fill = 0;
            self.active += 1;
            return Ok(());
        }
        if self.active == MAX_CHUNKS {
            return Err(BufferError::Overflow);
        }
        let size = self.chunk_cap(self.active);
        self.chunks.push(Chunk { data: vec![0u8; size].into_boxed_slice(), fill: 0 });
        self.active += 1;
        Ok(())
    }

    /// Copies `buf` onto the end of the log, growing as chunks fill.
    ///
    /// A chunk filled to its exact capacity grows the log eagerly, so the
    /// write tail always has room (until [`MAX_CHUNKS`], where `Overflow` is
    /// reported rather than silently truncating).
    pub fn append(&mut self, mut buf: &[u8]) -> Result<(), BufferError> {
        while !buf.is_empty() {
            let remainder = self.remainder();
            let n = remainder.min(buf.len());
            let chunk = self.tail();
            chunk.data[chunk.fill..chunk.fill + n].copy_from_slice(&buf[..n]);
            chunk.fill += n;
            self.len += n;
            buf = &buf[n..];
            if n == remainder {
                match self.grow() {
                    Ok(()) => {}
                    // all bytes landed; the next append will see the full log
                    Err(_) if buf.is_empty() => break,
                    Err(e) => return Err(e),
                }
            }
        }
        safe_assert!(self.len <= self.prefix(self.active));
        Ok(())
    }

    /// Reads from `src` directly into the write tail until the source would
    /// block, reports end-of-stream, or `limit` bytes have been consumed.
    ///
    /// `Interrupted` reads are retried; other IO errors propagate.
    pub fn fill_from<R: Read>(&mut self, src: &mut R, limit: usize) -> io::Result<Fill> {
        let mut total = 0;
        while total < limit {
            let remainder = self.remainder();
            if remainder == 0 {
                return Err(io::Error::other(BufferError::Overflow));
            }
            let want = remainder.min(limit - total);
            let chunk = self.tail();
            match src.read(&mut chunk.data[chunk.fill..chunk.fill + want]) {
                Ok(0) => return Ok(Fill::Eof(total)),
                Ok(n) => {
                    chunk.fill += n;
                    self.len += n;
                    total += n;
                    if n == remainder {
                        self.grow().map_err(io::Error::other)?;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Fill::WouldBlock(total));
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Fill::Limit(total))
    }

    /// Advances the read cursor looking for a newline, copying into `buf`.
    /// See [`GetLine`] for the three contracts.
    pub fn getline(&mut self, buf: &mut [u8]) -> GetLine {
        let cap = buf.len().min(self.unread());
        let mut off = self.read_offset;
        let mut copied = 0;

        while copied < cap {
            let idx = self.chunk_index(off);
            let base = self.prefix(idx);
            let chunk = &self.chunks[idx];
            let start = off - base;
            let end = chunk.fill.min(start + (cap - copied));
            let seg = &chunk.data[start..end];

            if let Some(p) = seg.iter().position(|&b| b == b'\n') {
                buf[copied..copied + p].copy_from_slice(&seg[..p]);
                copied += p;
                // consume the newline without copying it out
                self.read_offset = off + p + 1;
                return GetLine::Line(copied);
            }

            buf[copied..copied + seg.len()].copy_from_slice(seg);
            copied += seg.len();
            off += seg.len();
        }

        if copied == buf.len() && copied > 0 && self.newline_after(off) {
            // re-emit the last byte on the retry call
            self.read_offset = off - 1;
            return GetLine::Partial(copied);
        }
        GetLine::NoNewline
    }

    /// Whether any byte in `[from, len)` is a newline.
    fn newline_after(&self, from: usize) -> bool {
        let mut off = from;
        while off < self.len {
            let idx = self.chunk_index(off);
            let base = self.prefix(idx);
            let chunk = &self.chunks[idx];
            let seg = &chunk.data[off - base..chunk.fill];
            if seg.contains(&b'\n') {
                return true;
            }
            off += seg.len();
        }
        false
    }

    /// Repositions the read cursor. `Start`, `Current` and `End` mirror the
    /// usual whence options; the cursor must stay inside `[0, len]`.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<usize, BufferError> {
        let target = match pos {
            SeekFrom::Start(o) => i128::from(o),
            SeekFrom::Current(d) => self.read_offset as i128 + i128::from(d),
            SeekFrom::End(d) => self.len as i128 + i128::from(d),
        };
        if target < 0 {
            return Err(BufferError::SeekNegative);
        }
        if target > self.len as i128 {
            return Err(BufferError::SeekOverflow);
        }
        self.read_offset = target as usize;
        Ok(self.read_offset)
    }

    /// Marks everything before the read cursor as logically cut off.
    /// Storage is not reclaimed; the cutoff only moves forward.
    pub fn consolidate(&mut self) {
        self.cutoff = self.read_offset;
    }

    /// Emits the whole log with one vectored write, preserving chunk
    /// boundaries, then finishes any short write with plain writes.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        let slices: Vec<IoSlice<'_>> = self
            .chunks[..self.active]
            .iter()
            .filter(|c| c.fill > 0)
            .map(|c| IoSlice::new(c.filled()))
            .collect();
        if slices.is_empty() {
            return Ok(());
        }
        let mut written = sink.write_vectored(&slices)?;
        if written < self.len {
            warn!(written, len = self.len, "short vectored write, finishing byte-wise");
            for chunk in &self.chunks[..self.active] {
                let seg = chunk.filled();
                if written >= seg.len() {
                    written -= seg.len();
                    continue;
                }
                sink.write_all(&seg[written..])?;
                written = 0;
            }
        }
        Ok(())
    }

    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks[..self.active] {
            out.extend_from_slice(chunk.filled());
        }
        out
    }

    /// Resets the log to empty while keeping chunk allocations for reuse.
    pub fn clear(&mut self) {
        self.len = 0;
        self.read_offset = 0;
        self.cutoff = 0;
        for chunk in &mut self.chunks {
            chunk.fill = 0;
        }
        self.active = 1;
    }
}

impl Default for RecvLog {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecvLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvLog")
            .field("len", &self.len)
            .field("read_offset", &self.read_offset)
            .field("cutoff", &self.cutoff)
            .field("chunk_size", &self.chunk_size)
            .field("chunks", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `Read` source yielding scripted results, for exercising the
    /// would-block/EOF triage without sockets.
    struct Scripted {
        steps: Vec<io::Result<Vec<u8>>>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.steps.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            match self.steps.remove(0) {
                Ok(bytes) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    // anything that didn't fit reappears on the next read
                    if n < bytes.len() {
                        self.steps.insert(0, Ok(bytes[n..].to_vec()));
                    }
                    Ok(n)
                }
                Err(e) => Err(e),
            }
        }
    }

    fn occupancy_sum(log: &RecvLog) -> usize {
        (0..log.chunk_count()).map(|i| log.chunk(i).len()).sum()
    }

    #[test]
    fn rejects_bad_chunk_sizes() {
        assert_eq!(
            RecvLog::with_chunk_size(0).unwrap_err(),
            BufferError::ChunkSizeNotPowerOfTwo(0)
        );
        assert_eq!(
            RecvLog::with_chunk_size(3).unwrap_err(),
            BufferError::ChunkSizeNotPowerOfTwo(3)
        );
        for size in 17..32 {
            assert!(RecvLog::with_chunk_size(size).is_err());
        }
        assert!(RecvLog::with_chunk_size(16).is_ok());
    }

    #[test]
    fn append_splits_across_chunks() {
        let mut log = RecvLog::with_chunk_size(4).unwrap();
        assert_eq!(log.len(), 0);
        assert_eq!(log.chunk_count(), 1);

        log.append(b"four").unwrap();
        assert_eq!(log.len(), 4);
        // exact fill grows the tail eagerly
        assert_eq!(log.chunk_count(), 2);
        assert_eq!(log.chunk(0), b"four");

        log.append(b"eight___").unwrap();
        assert_eq!(log.len(), 12);
        assert_eq!(log.chunk_count(), 3);
        assert_eq!(log.chunk(0), b"four");
        assert_eq!(log.chunk(1), b"eigh");
        assert_eq!(log.chunk(2), b"t___");
        assert_eq!(occupancy_sum(&log), log.len());
    }

    #[test]
    fn one_large_append_spans_many_chunks() {
        let mut msg = vec![0u8; 1024];
        let mut rem = msg.len();
        let mut count = 0;
        while rem > 0 {
            let wsize = (8usize << count).min(rem);
            let start = msg.len() - rem;
            msg[start..start + wsize].fill(b'a' + count as u8);
            rem -= wsize;
            count += 1;
        }

        let mut log = RecvLog::with_chunk_size(8).unwrap();
        log.append(&msg).unwrap();
        assert_eq!(log.len(), 1024);
        assert_eq!(log.chunk_count(), 8);
        assert_eq!(log.copy_to_vec(), msg);

        // same bytes as many odd-sized appends
        let mut log = RecvLog::with_chunk_size(8).unwrap();
        let counts = [7usize, 18, 32, 62, 2, 384, 511, 8];
        let mut offset = 0;
        for c in counts {
            log.append(&msg[offset..offset + c]).unwrap();
            offset += c;
            assert_eq!(log.len(), offset);
            assert_eq!(occupancy_sum(&log), log.len());
        }
        assert_eq!(offset, 1024);
        assert_eq!(log.chunk_count(), 8);
        assert_eq!(log.copy_to_vec(), msg);
    }

    #[test]
    fn append_overflow_reported() {
        let mut log = RecvLog::with_chunk_size(1).unwrap();
        let cap = (1usize << MAX_CHUNKS) - 1;
        log.append(&vec![b'x'; cap]).unwrap();
        assert_eq!(log.len(), cap);
        assert_eq!(log.append(b"y").unwrap_err(), BufferError::Overflow);
        // nothing was lost
        assert_eq!(log.len(), cap);
    }

    #[test]
    fn getline_within_one_chunk() {
        let mut log = RecvLog::new();
        log.append(b"GET / HTTP/1.1\nrest").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(log.getline(&mut buf), GetLine::Line(14));
        assert_eq!(&buf[..14], b"GET / HTTP/1.1");
        assert_eq!(log.read_offset(), 15);
        // "rest" has no newline yet
        assert_eq!(log.getline(&mut buf), GetLine::NoNewline);
        assert_eq!(log.read_offset(), 15);
    }

    #[test]
    fn getline_across_chunk_boundaries() {
        let mut log = RecvLog::with_chunk_size(4).unwrap();
        log.append(b"hello cross-chunk world\nbye\n").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(log.getline(&mut buf), GetLine::Line(23));
        assert_eq!(&buf[..23], b"hello cross-chunk world");
        assert_eq!(log.getline(&mut buf), GetLine::Line(3));
        assert_eq!(&buf[..3], b"bye");
        assert_eq!(log.unread(), 0);
    }

    #[test]
    fn getline_empty_line() {
        let mut log = RecvLog::new();
        log.append(b"\nnext\n").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(log.getline(&mut buf), GetLine::Line(0));
        assert_eq!(log.getline(&mut buf), GetLine::Line(4));
    }

    #[test]
    fn getline_partial_rolls_back_one_byte() {
        let mut log = RecvLog::new();
        log.append(b"abcdefgh\n").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(log.getline(&mut buf), GetLine::Partial(4));
        assert_eq!(&buf, b"abcd");
        // cursor rolled back one byte: 'd' comes out again
        assert_eq!(log.read_offset(), 3);
        assert_eq!(log.getline(&mut buf), GetLine::Partial(4));
        assert_eq!(&buf, b"defg");
        assert_eq!(log.getline(&mut buf), GetLine::Line(2));
        assert_eq!(&buf[..2], b"gh");
        assert_eq!(log.unread(), 0);
    }

    #[test]
    fn getline_full_buffer_without_later_newline() {
        let mut log = RecvLog::new();
        log.append(b"abcdefgh").unwrap();
        let mut buf = [0u8; 4];
        // buffer fills, but the line is still incomplete: not a partial read
        assert_eq!(log.getline(&mut buf), GetLine::NoNewline);
        assert_eq!(log.read_offset(), 0);
    }

    #[test]
    fn getline_reproduces_stream_up_to_last_newline() {
        let mut log = RecvLog::with_chunk_size(2).unwrap();
        let text = b"alpha\nbeta\ngamma delta\nepsilon";
        log.append(text).unwrap();
        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        while let GetLine::Line(n) = log.getline(&mut buf) {
            out.extend_from_slice(&buf[..n]);
            out.push(b'\n');
        }
        assert_eq!(&out[..], &text[..23]);
    }

    #[test]
    fn seek_bounds() {
        let mut log = RecvLog::new();
        log.append(b"0123456789").unwrap();
        assert_eq!(log.seek(SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(log.seek(SeekFrom::Current(3)).unwrap(), 7);
        assert_eq!(log.seek(SeekFrom::End(-2)).unwrap(), 8);
        assert_eq!(log.seek(SeekFrom::Current(-9)).unwrap_err(), BufferError::SeekNegative);
        assert_eq!(log.seek(SeekFrom::Current(3)).unwrap_err(), BufferError::SeekOverflow);
        assert_eq!(log.seek(SeekFrom::Start(11)).unwrap_err(), BufferError::SeekOverflow);
        // failed seeks leave the cursor alone
        assert_eq!(log.read_offset(), 8);
    }

    #[test]
    fn consolidate_moves_cutoff() {
        let mut log = RecvLog::new();
        log.append(b"one\ntwo\n").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(log.getline(&mut buf), GetLine::Line(3));
        log.consolidate();
        assert_eq!(log.cutoff(), 4);
        assert_eq!(log.getline(&mut buf), GetLine::Line(3));
        assert_eq!(&buf[..3], b"two");
    }

    #[test]
    fn fill_from_distinguishes_wouldblock_and_eof() {
        let mut log = RecvLog::with_chunk_size(4).unwrap();
        let mut src = Scripted {
            steps: vec![Ok(b"hello ".to_vec()), Ok(b"world".to_vec())],
        };
        assert_eq!(log.fill_from(&mut src, 4096).unwrap(), Fill::WouldBlock(11));
        assert_eq!(log.copy_to_vec(), b"hello world");

        let mut src = Scripted { steps: vec![Ok(b"bye".to_vec()), Ok(Vec::new())] };
        assert_eq!(log.fill_from(&mut src, 4096).unwrap(), Fill::Eof(3));
        assert_eq!(log.copy_to_vec(), b"hello worldbye");
    }

    #[test]
    fn fill_from_respects_limit() {
        let mut log = RecvLog::with_chunk_size(4).unwrap();
        let mut src = Scripted { steps: vec![Ok(vec![b'z'; 100])] };
        assert_eq!(log.fill_from(&mut src, 10).unwrap(), Fill::Limit(10));
        assert_eq!(log.len(), 10);
    }

    #[test]
    fn fill_from_retries_interrupted() {
        let mut log = RecvLog::new();
        let mut src = Scripted {
            steps: vec![Err(io::ErrorKind::Interrupted.into()), Ok(b"ok".to_vec())],
        };
        assert_eq!(log.fill_from(&mut src, 4096).unwrap(), Fill::WouldBlock(2));
        assert_eq!(log.copy_to_vec(), b"ok");
    }

    #[test]
    fn write_to_preserves_content() {
        let mut log = RecvLog::with_chunk_size(4).unwrap();
        log.append(b"vectored write over several chunks").unwrap();
        let mut sink = Vec::new();
        log.write_to(&mut sink).unwrap();
        assert_eq!(sink, log.copy_to_vec());
    }

    #[test]
    fn clear_retains_allocations() {
        let mut log = RecvLog::with_chunk_size(4).unwrap();
        log.append(b"some request data").unwrap();
        let chunks = log.chunk_count();
        assert!(chunks > 1);
        log.clear();
        assert_eq!(log.len(), 0);
        assert_eq!(log.read_offset(), 0);
        assert_eq!(log.chunk_count(), 1);
        log.append(b"fresh").unwrap();
        assert_eq!(log.copy_to_vec(), b"fresh");
        // regrowth reuses the chunks retained by clear
        assert!(log.chunk_count() <= chunks);
    }
}
