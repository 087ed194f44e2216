//! Prefix-compressed `(path, FileState)` record streams.
//!
//! Each record stores how many leading bytes it shares with the previous
//! key, the NUL-terminated tail, and the raw state. Written with
//! non-decreasing keys (the sorted containers guarantee this), decoding is
//! single-pass and byte-exact. The same encoding serves the persistent
//! snapshot files and the log blocks on the wire; `reset` forgets the
//! previous key at block boundaries.

use std::io::{self, Read, Write};

use crate::state::FileState;

pub struct RecordWriter<W: Write> {
    out: W,
    last_key: String,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W) -> Self {
        RecordWriter {
            out,
            last_key: String::new(),
        }
    }

    pub fn write(&mut self, key: &str, state: &FileState) -> io::Result<()> {
        let shared = common_prefix(self.last_key.as_bytes(), key.as_bytes());
        self.out.write_all(&(shared as u32).to_le_bytes())?;
        self.out.write_all(&key.as_bytes()[shared..])?;
        self.out.write_all(&[0])?;

        let mut buf = Vec::with_capacity(crate::state::STATE_WIRE_LEN);
        state.write_to(&mut buf);
        self.out.write_all(&buf)?;

        self.last_key.clear();
        self.last_key.push_str(key);
        Ok(())
    }

    /// Forget the previous key; the next record is written with a zero
    /// prefix. Used at block boundaries so blocks decode independently.
    pub fn reset(&mut self) {
        self.last_key.clear();
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

impl RecordWriter<Vec<u8>> {
    pub fn buffered_len(&self) -> usize {
        self.out.len()
    }

    /// Take the buffered block and reset the prefix state, so the next
    /// record starts a self-contained block.
    pub fn take_block(&mut self) -> Vec<u8> {
        self.reset();
        std::mem::take(&mut self.out)
    }
}

pub struct RecordReader<R: Read> {
    input: R,
    last_key: String,
}

impl<R: Read> RecordReader<R> {
    pub fn new(input: R) -> Self {
        RecordReader {
            input,
            last_key: String::new(),
        }
    }

    /// Read the next record. A short read at a record boundary is end of
    /// stream and yields `Ok(None)`.
    pub fn read(&mut self) -> io::Result<Option<(String, FileState)>> {
        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(&mut self.input, &mut len_buf)? {
            false => return Ok(None),
            true => {}
        }
        let shared = u32::from_le_bytes(len_buf) as usize;
        if shared > self.last_key.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "prefix length exceeds previous key",
            ));
        }

        let mut tail = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            self.input.read_exact(&mut byte)?;
            if byte[0] == 0 {
                break;
            }
            tail.push(byte[0]);
        }

        let state = FileState::read_from(&mut self.input)?;

        let mut key = String::with_capacity(shared + tail.len());
        key.push_str(&self.last_key[..shared]);
        key.push_str(&String::from_utf8_lossy(&tail));
        self.last_key.clear();
        self.last_key.push_str(&key);

        Ok(Some((key, state)))
    }

    pub fn reset(&mut self) {
        self.last_key.clear();
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Like `read_exact`, but a clean EOF before the first byte returns false.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated record header",
                ))
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
