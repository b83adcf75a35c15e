// Checkpoint framing. Two wire formats share the RLE codec: consolidated
// checkpoints (`GSCHKPT2`) frame every chunk with its own size and the
// source location that wrote it, which keeps struct drift debuggable;
// quick checkpoints (`GSCHKPT3`) concatenate everything and compress the
// lot in one pass. Both directions are error sticky: after the first
// failure every further operation is a no-op and `has_error` reports it.

use crate::EmuError;
use log::error;
use std::io::{Read, Write};
use std::panic::Location;

pub const MAGIC_V2: &[u8; 8] = b"GSCHKPT2";
pub const MAGIC_V3: &[u8; 8] = b"GSCHKPT3";

/// Chunks at least this large get an individual RLE pass in v2 streams.
const COMPRESS_THRESHOLD: usize = 64;

const ESC: u8 = 0x9b;

/// Runs of four or more equal bytes become `{ESC, count, value}`; the
/// escape byte itself is always encoded as a (possibly short) run.
pub fn rle_compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let value = data[i];
        let mut run = 1;
        while i + run < data.len() && data[i + run] == value && run < 255 {
            run += 1;
        }
        if run >= 4 || value == ESC {
            out.push(ESC);
            out.push(run as u8);
            out.push(value);
        } else {
            out.extend(std::iter::repeat(value).take(run));
        }
        i += run;
    }
    out
}

pub fn rle_decompress(data: &[u8], expected_len: usize) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = 0;
    while i < data.len() {
        if data[i] == ESC {
            if i + 2 >= data.len() {
                return None;
            }
            let count = data[i + 1] as usize;
            let value = data[i + 2];
            out.extend(std::iter::repeat(value).take(count));
            i += 3;
        } else {
            out.push(data[i]);
            i += 1;
        }
        if out.len() > expected_len {
            return None;
        }
    }
    if out.len() == expected_len {
        Some(out)
    } else {
        None
    }
}

/// Big-endian scratch buffer for a device's plain-data state.
pub struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    pub fn new() -> Self {
        StateWriter { buf: Vec::new() }
    }
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Counterpart of `StateWriter`; reads past the end stick at zero.
pub struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
    error: bool,
}

impl<'a> StateReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        StateReader { data, pos: 0, error: false }
    }
    fn take(&mut self, n: usize) -> &'a [u8] {
        if self.error || self.pos + n > self.data.len() {
            self.error = true;
            return &[];
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        slice
    }
    pub fn take_u8(&mut self) -> u8 {
        let s = self.take(1);
        if s.is_empty() {
            0
        } else {
            s[0]
        }
    }
    pub fn take_u16(&mut self) -> u16 {
        let s = self.take(2);
        if s.len() < 2 {
            0
        } else {
            u16::from_be_bytes([s[0], s[1]])
        }
    }
    pub fn take_u32(&mut self) -> u32 {
        let s = self.take(4);
        if s.len() < 4 {
            0
        } else {
            u32::from_be_bytes([s[0], s[1], s[2], s[3]])
        }
    }
    pub fn take_u64(&mut self) -> u64 {
        let s = self.take(8);
        if s.len() < 8 {
            0
        } else {
            u64::from_be_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]])
        }
    }
    pub fn take_bytes(&mut self, out: &mut [u8]) {
        let s = self.take(out.len());
        if s.len() == out.len() {
            out.copy_from_slice(s);
        }
    }
    pub fn take_vec(&mut self, n: usize) -> Vec<u8> {
        let mut v = vec![0; n];
        self.take_bytes(&mut v);
        v
    }
    pub fn has_error(&self) -> bool {
        self.error
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Disk payloads are omitted; the block stores on disk plus their
    /// rollback overlays carry the disk state.
    Quick,
    /// Self contained: every block of every image is in the stream.
    Consolidated,
}

pub struct ChunkWriter<W: Write> {
    sink: W,
    kind: CheckpointKind,
    quick_buf: Vec<u8>,
    error: bool,
}

impl<W: Write> ChunkWriter<W> {
    pub fn new(mut sink: W, kind: CheckpointKind) -> Self {
        let mut error = false;
        if kind == CheckpointKind::Consolidated {
            error = sink.write_all(MAGIC_V2).is_err();
        }
        ChunkWriter { sink, kind, quick_buf: Vec::new(), error }
    }

    /// Append one chunk. In consolidated streams the caller's source
    /// location rides along as frame metadata.
    #[track_caller]
    pub fn write_chunk(&mut self, payload: &[u8]) {
        if self.error {
            return;
        }
        match self.kind {
            CheckpointKind::Quick => self.quick_buf.extend_from_slice(payload),
            CheckpointKind::Consolidated => {
                let loc = Location::caller();
                let path = loc.file().as_bytes();
                let (stored, data) = if payload.len() >= COMPRESS_THRESHOLD {
                    let packed = rle_compress(payload);
                    (packed.len(), packed)
                } else {
                    (payload.len(), payload.to_vec())
                };
                let mut header = Vec::with_capacity(14 + path.len());
                header.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                header.extend_from_slice(&(path.len() as u16).to_be_bytes());
                header.extend_from_slice(path);
                header.extend_from_slice(&loc.line().to_be_bytes());
                header.extend_from_slice(&(stored as u32).to_be_bytes());
                if self.sink.write_all(&header).is_err() || self.sink.write_all(&data).is_err() {
                    self.error = true;
                }
            }
        }
    }

    pub fn finish(mut self) -> Result<(), EmuError> {
        if !self.error && self.kind == CheckpointKind::Quick {
            let packed = rle_compress(&self.quick_buf);
            let mut header = Vec::with_capacity(24);
            header.extend_from_slice(MAGIC_V3);
            header.extend_from_slice(&(self.quick_buf.len() as u64).to_be_bytes());
            header.extend_from_slice(&(packed.len() as u64).to_be_bytes());
            if self.sink.write_all(&header).is_err() || self.sink.write_all(&packed).is_err() {
                self.error = true;
            }
        }
        if self.error || self.sink.flush().is_err() {
            Err(EmuError::Checkpoint("write failed".into()))
        } else {
            Ok(())
        }
    }

    pub fn has_error(&self) -> bool {
        self.error
    }
}

enum ReaderSource<R: Read> {
    Framed(R),
    Buffer { data: Vec<u8>, pos: usize },
}

pub struct ChunkReader<R: Read> {
    source: ReaderSource<R>,
    kind: CheckpointKind,
    error: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn open(mut source: R) -> Result<Self, EmuError> {
        let mut magic = [0u8; 8];
        source
            .read_exact(&mut magic)
            .map_err(|e| EmuError::Checkpoint(format!("truncated magic: {}", e)))?;
        if &magic == MAGIC_V2 {
            return Ok(ChunkReader {
                source: ReaderSource::Framed(source),
                kind: CheckpointKind::Consolidated,
                error: false,
            });
        }
        if &magic != MAGIC_V3 {
            return Err(EmuError::Checkpoint("bad checkpoint magic".into()));
        }
        let mut sizes = [0u8; 16];
        source
            .read_exact(&mut sizes)
            .map_err(|e| EmuError::Checkpoint(format!("truncated header: {}", e)))?;
        let uncompressed =
            u64::from_be_bytes([sizes[0], sizes[1], sizes[2], sizes[3], sizes[4], sizes[5], sizes[6], sizes[7]])
                as usize;
        let compressed = u64::from_be_bytes([
            sizes[8], sizes[9], sizes[10], sizes[11], sizes[12], sizes[13], sizes[14], sizes[15],
        ]) as usize;
        let mut packed = vec![0; compressed];
        source
            .read_exact(&mut packed)
            .map_err(|e| EmuError::Checkpoint(format!("truncated payload: {}", e)))?;
        let data = rle_decompress(&packed, uncompressed)
            .ok_or_else(|| EmuError::Checkpoint("corrupt quick checkpoint payload".into()))?;
        Ok(ChunkReader {
            source: ReaderSource::Buffer { data, pos: 0 },
            kind: CheckpointKind::Quick,
            error: false,
        })
    }

    pub fn kind(&self) -> CheckpointKind {
        self.kind
    }

    /// Read the next chunk, which the caller expects to be exactly
    /// `expected_len` bytes. On any mismatch the stream goes sticky-error
    /// and zeroed bytes come back, so restore code can keep its shape.
    #[track_caller]
    pub fn read_chunk(&mut self, expected_len: usize) -> Vec<u8> {
        if self.error {
            return vec![0; expected_len];
        }
        match &mut self.source {
            ReaderSource::Buffer { data, pos } => {
                if *pos + expected_len > data.len() {
                    self.fail("quick checkpoint underrun", expected_len);
                    return vec![0; expected_len];
                }
                let out = data[*pos..*pos + expected_len].to_vec();
                *pos += expected_len;
                out
            }
            ReaderSource::Framed(r) => {
                let mut fixed = [0u8; 6];
                if r.read_exact(&mut fixed).is_err() {
                    self.fail("truncated chunk header", expected_len);
                    return vec![0; expected_len];
                }
                let size = u32::from_be_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]) as usize;
                let path_len = u16::from_be_bytes([fixed[4], fixed[5]]) as usize;
                let mut path = vec![0; path_len];
                let mut tail = [0u8; 8];
                if r.read_exact(&mut path).is_err() || r.read_exact(&mut tail).is_err() {
                    self.fail("truncated chunk header", expected_len);
                    return vec![0; expected_len];
                }
                let line = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
                let stored = u32::from_be_bytes([tail[4], tail[5], tail[6], tail[7]]) as usize;
                if size != expected_len {
                    error!(
                        "checkpoint chunk from {}:{} holds {} bytes, expected {}",
                        String::from_utf8_lossy(&path),
                        line,
                        size,
                        expected_len
                    );
                    self.error = true;
                    return vec![0; expected_len];
                }
                let mut data = vec![0; stored];
                if r.read_exact(&mut data).is_err() {
                    self.fail("truncated chunk payload", expected_len);
                    return vec![0; expected_len];
                }
                if stored == size {
                    data
                } else {
                    match rle_decompress(&data, size) {
                        Some(out) => out,
                        None => {
                            self.fail("corrupt chunk payload", expected_len);
                            vec![0; expected_len]
                        }
                    }
                }
            }
        }
    }

    #[track_caller]
    fn fail(&mut self, what: &str, expected_len: usize) {
        let loc = Location::caller();
        error!("{} (wanted {} bytes at {}:{})", what, expected_len, loc.file(), loc.line());
        self.error = true;
    }

    pub fn has_error(&self) -> bool {
        self.error
    }
}
