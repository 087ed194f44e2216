//! Incremental delta application.
//!
//! Blocks arrive in order but may interleave with other traffic, so the
//! patcher keeps no more than one record header of lookahead and streams
//! literal bytes straight to the output file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::delta::{OP_COPY, OP_LITERAL};
use crate::{DeltaError, Result};

const COPY_RECORD_LEN: usize = 1 + 8 + 4;
const LITERAL_HEADER_LEN: usize = 1 + 4;

pub struct PatchJob {
    base: File,
    out: File,
    pending: Vec<u8>,
    literal_remaining: usize,
    written: u64,
}

impl PatchJob {
    pub fn new(base: File, out: File) -> Self {
        PatchJob {
            base,
            out,
            pending: Vec::new(),
            literal_remaining: 0,
            written: 0,
        }
    }

    /// Apply one wire block worth of delta data.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        // Coalesce any stashed partial header with the new block so records
        // are always parsed from one contiguous buffer.
        let owned;
        let mut buf: &[u8] = if self.pending.is_empty() {
            chunk
        } else {
            self.pending.extend_from_slice(chunk);
            owned = std::mem::take(&mut self.pending);
            &owned
        };

        loop {
            if self.literal_remaining > 0 {
                let take = self.literal_remaining.min(buf.len());
                self.out.write_all(&buf[..take])?;
                self.written += take as u64;
                self.literal_remaining -= take;
                buf = &buf[take..];
            }

            if buf.is_empty() {
                return Ok(());
            }

            match buf[0] {
                OP_COPY => {
                    if buf.len() < COPY_RECORD_LEN {
                        break;
                    }
                    let offset = u64::from_le_bytes(buf[1..9].try_into().unwrap());
                    let len = u32::from_le_bytes(buf[9..13].try_into().unwrap()) as usize;
                    self.copy_from_base(offset, len)?;
                    buf = &buf[COPY_RECORD_LEN..];
                }
                OP_LITERAL => {
                    if buf.len() < LITERAL_HEADER_LEN {
                        break;
                    }
                    self.literal_remaining =
                        u32::from_le_bytes(buf[1..5].try_into().unwrap()) as usize;
                    buf = &buf[LITERAL_HEADER_LEN..];
                }
                _ => return Err(DeltaError::Corrupt("unknown op tag")),
            }
        }

        // Partial record header: stash it for the next block.
        self.pending = buf.to_vec();
        Ok(())
    }

    /// All delta blocks received; flush and return bytes written.
    pub fn finish(mut self) -> Result<u64> {
        if self.literal_remaining > 0 || !self.pending.is_empty() {
            return Err(DeltaError::Corrupt("truncated delta stream"));
        }
        self.out.flush()?;
        Ok(self.written)
    }

    fn copy_from_base(&mut self, offset: u64, len: usize) -> Result<()> {
        self.base.seek(SeekFrom::Start(offset))?;
        let mut remaining = len;
        let mut buf = [0u8; 16 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len());
            let got = self.base.read(&mut buf[..want])?;
            if got == 0 {
                return Err(DeltaError::Corrupt("copy past end of base file"));
            }
            self.out.write_all(&buf[..got])?;
            self.written += got as u64;
            remaining -= got;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;

    fn temp_with(data: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(data).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    fn read_back(mut file: File) -> Vec<u8> {
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn applies_copy_and_literal_split_byte_by_byte() {
        let base = b"0123456789".to_vec();
        let out = tempfile::tempfile().unwrap();
        let mut patch = PatchJob::new(temp_with(&base), out.try_clone().unwrap());

        let mut stream = Vec::new();
        stream.push(OP_COPY);
        stream.extend_from_slice(&2u64.to_le_bytes());
        stream.extend_from_slice(&5u32.to_le_bytes());
        stream.push(OP_LITERAL);
        stream.extend_from_slice(&3u32.to_le_bytes());
        stream.extend_from_slice(b"abc");

        for byte in &stream {
            patch.feed(std::slice::from_ref(byte)).unwrap();
        }
        assert_eq!(patch.finish().unwrap(), 8);
        assert_eq!(read_back(out), b"23456abc");
    }

    #[test]
    fn copy_past_base_end_is_corrupt() {
        let out = tempfile::tempfile().unwrap();
        let mut patch = PatchJob::new(temp_with(b"short"), out);

        let mut stream = Vec::new();
        stream.push(OP_COPY);
        stream.extend_from_slice(&0u64.to_le_bytes());
        stream.extend_from_slice(&100u32.to_le_bytes());

        assert!(patch.feed(&stream).is_err());
    }

    #[test]
    fn truncated_stream_fails_on_finish() {
        let out = tempfile::tempfile().unwrap();
        let mut patch = PatchJob::new(temp_with(b"base"), out);

        let mut stream = Vec::new();
        stream.push(OP_LITERAL);
        stream.extend_from_slice(&10u32.to_le_bytes());
        stream.extend_from_slice(b"only4");
        patch.feed(&stream).unwrap();
        assert!(patch.finish().is_err());
    }
}
