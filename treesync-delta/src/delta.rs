//! Delta generation: walk the fresh copy with a rolling window, reuse
//! base-file blocks wherever the signature index matches, emit the rest as
//! literals.
//!
//! Records: tag `0` = `Copy{offset: u64le, len: u32le}` into the base
//! file, tag `1` = `Literal{len: u32le, bytes}`. Records never split
//! across emitted blocks, so the patcher can apply each block as it
//! arrives. Adjacent copies are merged before encoding.

use std::fs::File;
use std::io::Read;

use crate::hash::RollingHash;
use crate::signature::SignatureIndex;
use crate::{Drive, Result, MAX_BLOCK};

pub const OP_COPY: u8 = 0;
pub const OP_LITERAL: u8 = 1;

/// Largest single literal record. Keeps every record comfortably inside
/// one wire block.
const LIT_CHUNK: usize = 8 * 1024;

/// Soft fill target for one emitted block.
const BLOCK_SOFT_CAP: usize = MAX_BLOCK - LIT_CHUNK - 16;

pub struct DeltaJob {
    data: Vec<u8>,
    index: SignatureIndex,
    pos: usize,
    lit_start: usize,
    pending_copy: Option<(u64, u32)>,
    rolling: Option<RollingHash>,
    done: bool,
}

impl DeltaJob {
    /// Read the fresh file and prepare to diff it against `index`.
    pub fn new(mut fresh: File, index: SignatureIndex) -> Result<Self> {
        let mut data = Vec::new();
        fresh.read_to_end(&mut data)?;
        Ok(DeltaJob {
            data,
            index,
            pos: 0,
            lit_start: 0,
            pending_copy: None,
            rolling: None,
            done: false,
        })
    }

    /// Produce the next delta block, or report completion.
    pub fn drive(&mut self) -> Result<Drive> {
        if self.done {
            return Ok(Drive::Done);
        }

        let block_len = self.index.block_len;
        let mut out = Vec::with_capacity(MAX_BLOCK);

        loop {
            if out.len() >= BLOCK_SOFT_CAP {
                return Ok(Drive::Block(out));
            }

            // Drain literal backlog in bounded chunks.
            if self.pos - self.lit_start >= LIT_CHUNK {
                self.flush_copy(&mut out);
                self.emit_literal_chunk(&mut out);
                continue;
            }

            // Tail shorter than a block: everything left is literal.
            if self.pos + block_len > self.data.len() || self.index.is_empty() {
                self.pos = self.data.len();
                if self.lit_start < self.pos {
                    self.flush_copy(&mut out);
                    self.emit_literal_chunk(&mut out);
                    continue;
                }
                self.flush_copy(&mut out);
                self.done = true;
                return if out.is_empty() {
                    Ok(Drive::Done)
                } else {
                    Ok(Drive::Block(out))
                };
            }

            let window = &self.data[self.pos..self.pos + block_len];
            let weak = match self.rolling {
                Some(hash) => hash.value(),
                None => {
                    let hash = RollingHash::new(window);
                    self.rolling = Some(hash);
                    hash.value()
                }
            };

            if let Some(block_index) = self.index.lookup(weak, window) {
                let offset = (block_index * block_len) as u64;
                let mergeable = self.lit_start == self.pos
                    && matches!(self.pending_copy,
                        Some((base, len)) if base + len as u64 == offset);

                if mergeable {
                    if let Some((_, len)) = self.pending_copy.as_mut() {
                        *len += block_len as u32;
                    }
                } else {
                    self.flush_copy(&mut out);
                    while self.lit_start < self.pos {
                        self.emit_literal_chunk(&mut out);
                    }
                    self.pending_copy = Some((offset, block_len as u32));
                }

                self.pos += block_len;
                self.lit_start = self.pos;
                self.rolling = None;
            } else {
                if self.pos + 1 + block_len <= self.data.len() {
                    let outgoing = self.data[self.pos];
                    let incoming = self.data[self.pos + block_len];
                    if let Some(hash) = self.rolling.as_mut() {
                        hash.roll(outgoing, incoming);
                    }
                } else {
                    self.rolling = None;
                }
                self.pos += 1;
            }
        }
    }

    fn flush_copy(&mut self, out: &mut Vec<u8>) {
        if let Some((offset, len)) = self.pending_copy.take() {
            out.push(OP_COPY);
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
        }
    }

    fn emit_literal_chunk(&mut self, out: &mut Vec<u8>) {
        let len = (self.pos - self.lit_start).min(LIT_CHUNK);
        if len == 0 {
            return;
        }
        out.push(OP_LITERAL);
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out.extend_from_slice(&self.data[self.lit_start..self.lit_start + len]);
        self.lit_start += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{SignatureJob, SignatureParser};
    use crate::{DeltaJob, PatchJob, BLOCK_LEN};
    use std::io::{Seek, SeekFrom, Write};

    fn temp_with(data: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(data).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    fn index_of(base: &[u8]) -> SignatureIndex {
        let mut job = SignatureJob::new(temp_with(base));
        let mut parser = SignatureParser::new();
        loop {
            match job.drive().unwrap() {
                Drive::Block(block) => parser.feed(&block).unwrap(),
                Drive::Done => break,
            }
        }
        SignatureIndex::build(&parser.finish().unwrap())
    }

    fn run_roundtrip(base: &[u8], fresh: &[u8]) -> Vec<u8> {
        let mut job = DeltaJob::new(temp_with(fresh), index_of(base)).unwrap();

        let out_file = tempfile::tempfile().unwrap();
        let mut patch = PatchJob::new(temp_with(base), out_file.try_clone().unwrap());
        loop {
            match job.drive().unwrap() {
                Drive::Block(block) => patch.feed(&block).unwrap(),
                Drive::Done => break,
            }
        }
        patch.finish().unwrap();

        let mut rebuilt = Vec::new();
        let mut out_file = out_file;
        out_file.seek(SeekFrom::Start(0)).unwrap();
        out_file.read_to_end(&mut rebuilt).unwrap();
        rebuilt
    }

    #[test]
    fn identical_files_become_one_copy() {
        // Distinct block contents so every match lands on its own block.
        let data: Vec<u8> = (0..BLOCK_LEN * 8).map(|i| (i % 251) as u8).collect();
        let mut job = DeltaJob::new(temp_with(&data), index_of(&data)).unwrap();
        let mut blocks = Vec::new();
        while let Drive::Block(block) = job.drive().unwrap() {
            blocks.push(block);
        }
        // Merged adjacent copies: a single 13-byte record.
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 13);
        assert_eq!(blocks[0][0], OP_COPY);
    }

    #[test]
    fn small_edit_reuses_most_blocks() {
        let base: Vec<u8> = (0..BLOCK_LEN * 16).map(|i| (i % 251) as u8).collect();
        let mut fresh = base.clone();
        fresh[BLOCK_LEN * 4 + 17] ^= 0xff;

        assert_eq!(run_roundtrip(&base, &fresh), fresh);
    }

    #[test]
    fn disjoint_content_roundtrips_as_literals() {
        let base = vec![1u8; BLOCK_LEN * 2];
        let fresh: Vec<u8> = (0..BLOCK_LEN * 3 + 7).map(|i| (i % 13) as u8).collect();
        assert_eq!(run_roundtrip(&base, &fresh), fresh);
    }

    #[test]
    fn empty_base_and_empty_fresh() {
        let fresh = b"brand new content".repeat(500);
        assert_eq!(run_roundtrip(&[], &fresh), fresh);
        assert_eq!(run_roundtrip(&fresh, &[]), Vec::<u8>::new());
    }

    #[test]
    fn insertion_shifts_are_found() {
        let base: Vec<u8> = (0..BLOCK_LEN * 8).map(|i| (i % 199) as u8).collect();
        let mut fresh = Vec::with_capacity(base.len() + 3);
        fresh.extend_from_slice(&base[..100]);
        fresh.extend_from_slice(b"ins");
        fresh.extend_from_slice(&base[100..]);

        let rebuilt = run_roundtrip(&base, &fresh);
        assert_eq!(rebuilt, fresh);
    }
}
