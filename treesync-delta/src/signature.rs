//! Block signatures of the stale copy.
//!
//! Wire form: a 12-byte header `{block_len: u32le, file_size: u64le}`
//! followed by one `{weak: u32le, strong: [u8;16]}` record per block. The
//! producer reads the file incrementally and emits bounded chunks; the
//! consumer accumulates chunks (they may split records arbitrarily) and
//! finishes into a lookup index keyed by weak hash.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;

use crate::hash::{md4_digest, RollingHash};
use crate::{DeltaError, Drive, Result, BLOCK_LEN, MAX_BLOCK};

const SIG_HEADER_LEN: usize = 12;
const SIG_RECORD_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSig {
    pub weak: u32,
    pub strong: [u8; 16],
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub block_len: usize,
    pub file_size: u64,
    pub blocks: Vec<BlockSig>,
}

/// Produces the signature stream for one file.
pub struct SignatureJob {
    file: File,
    block_len: usize,
    emitted_header: bool,
    done: bool,
}

impl SignatureJob {
    pub fn new(file: File) -> Self {
        SignatureJob {
            file,
            block_len: BLOCK_LEN,
            emitted_header: false,
            done: false,
        }
    }

    /// Produce the next wire chunk, or report completion.
    pub fn drive(&mut self) -> Result<Drive> {
        if self.done {
            return Ok(Drive::Done);
        }

        let mut out = Vec::with_capacity(MAX_BLOCK);
        if !self.emitted_header {
            let size = self.file.metadata()?.len();
            out.extend_from_slice(&(self.block_len as u32).to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            self.emitted_header = true;
        }

        let mut block = vec![0u8; self.block_len];
        while out.len() + SIG_RECORD_LEN <= MAX_BLOCK {
            let filled = read_up_to(&mut self.file, &mut block)?;
            if filled == 0 {
                self.done = true;
                break;
            }
            let chunk = &block[..filled];
            out.extend_from_slice(&RollingHash::new(chunk).value().to_le_bytes());
            out.extend_from_slice(&md4_digest(chunk));
            if filled < self.block_len {
                self.done = true;
                break;
            }
        }

        if out.is_empty() {
            Ok(Drive::Done)
        } else {
            Ok(Drive::Block(out))
        }
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Accumulates signature chunks from the wire.
#[derive(Default)]
pub struct SignatureParser {
    pending: Vec<u8>,
    header: Option<(usize, u64)>,
    blocks: Vec<BlockSig>,
}

impl SignatureParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(chunk);

        if self.header.is_none() {
            if self.pending.len() < SIG_HEADER_LEN {
                return Ok(());
            }
            let block_len = u32::from_le_bytes(self.pending[0..4].try_into().unwrap()) as usize;
            let file_size = u64::from_le_bytes(self.pending[4..12].try_into().unwrap());
            if block_len == 0 || block_len > 1 << 24 {
                return Err(DeltaError::BadSignature("unreasonable block length"));
            }
            self.header = Some((block_len, file_size));
            self.pending.drain(..SIG_HEADER_LEN);
        }

        let complete = self.pending.len() / SIG_RECORD_LEN * SIG_RECORD_LEN;
        for record in self.pending[..complete].chunks_exact(SIG_RECORD_LEN) {
            let weak = u32::from_le_bytes(record[0..4].try_into().unwrap());
            let mut strong = [0u8; 16];
            strong.copy_from_slice(&record[4..20]);
            self.blocks.push(BlockSig { weak, strong });
        }
        self.pending.drain(..complete);
        Ok(())
    }

    pub fn finish(self) -> Result<Signature> {
        if !self.pending.is_empty() {
            return Err(DeltaError::BadSignature("trailing partial record"));
        }
        let (block_len, file_size) = self
            .header
            .ok_or(DeltaError::BadSignature("missing header"))?;
        Ok(Signature {
            block_len,
            file_size,
            blocks: self.blocks,
        })
    }
}

/// Weak-hash lookup table over a parsed signature.
pub struct SignatureIndex {
    pub block_len: usize,
    by_weak: HashMap<u32, Vec<(usize, [u8; 16])>>,
}

impl SignatureIndex {
    pub fn build(sig: &Signature) -> Self {
        let mut by_weak: HashMap<u32, Vec<(usize, [u8; 16])>> = HashMap::new();
        for (index, block) in sig.blocks.iter().enumerate() {
            by_weak
                .entry(block.weak)
                .or_default()
                .push((index, block.strong));
        }
        SignatureIndex {
            block_len: sig.block_len,
            by_weak,
        }
    }

    /// Find the base-file block index matching `weak` whose strong hash
    /// also matches the given data.
    pub fn lookup(&self, weak: u32, data: &[u8]) -> Option<usize> {
        let candidates = self.by_weak.get(&weak)?;
        let strong = md4_digest(data);
        candidates
            .iter()
            .find(|(_, s)| *s == strong)
            .map(|(index, _)| *index)
    }

    pub fn is_empty(&self) -> bool {
        self.by_weak.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sig_of(data: &[u8]) -> Signature {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(data).unwrap();
        use std::io::Seek;
        tmp.seek(std::io::SeekFrom::Start(0)).unwrap();

        let mut job = SignatureJob::new(tmp);
        let mut parser = SignatureParser::new();
        loop {
            match job.drive().unwrap() {
                Drive::Block(block) => parser.feed(&block).unwrap(),
                Drive::Done => break,
            }
        }
        parser.finish().unwrap()
    }

    #[test]
    fn signature_covers_every_block() {
        let data = vec![7u8; BLOCK_LEN * 3 + 100];
        let sig = sig_of(&data);
        assert_eq!(sig.block_len, BLOCK_LEN);
        assert_eq!(sig.file_size, data.len() as u64);
        assert_eq!(sig.blocks.len(), 4);
    }

    #[test]
    fn empty_file_has_empty_signature() {
        let sig = sig_of(&[]);
        assert_eq!(sig.file_size, 0);
        assert!(sig.blocks.is_empty());
        assert!(SignatureIndex::build(&sig).is_empty());
    }

    #[test]
    fn parser_tolerates_arbitrary_chunking() {
        let data: Vec<u8> = (0..BLOCK_LEN * 2).map(|i| (i % 256) as u8).collect();
        let whole = sig_of(&data);

        // Re-feed the encoded stream one byte at a time.
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&(BLOCK_LEN as u32).to_le_bytes());
        encoded.extend_from_slice(&(data.len() as u64).to_le_bytes());
        for block in &whole.blocks {
            encoded.extend_from_slice(&block.weak.to_le_bytes());
            encoded.extend_from_slice(&block.strong);
        }

        let mut parser = SignatureParser::new();
        for byte in &encoded {
            parser.feed(std::slice::from_ref(byte)).unwrap();
        }
        let reparsed = parser.finish().unwrap();
        assert_eq!(reparsed.blocks, whole.blocks);
    }

    #[test]
    fn index_resolves_weak_collisions_by_strong_hash() {
        let data = vec![1u8; BLOCK_LEN * 2];
        let sig = sig_of(&data);
        let index = SignatureIndex::build(&sig);

        let block = &data[..BLOCK_LEN];
        let weak = RollingHash::new(block).value();
        assert!(index.lookup(weak, block).is_some());
        assert!(index.lookup(weak, &vec![2u8; BLOCK_LEN]).is_none());
    }
}
