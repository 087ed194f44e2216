//! Frame header codec and the adaptive zlib payload compression.
//!
//! Every frame is `{type: u8, wp_id: u8, length: u16le}` followed by
//! `length` payload bytes. The high bit of `type` marks a compressed
//! payload of `original_len: u32le || zlib bytes`. The u16 length caps a
//! single payload below 64 KiB, which is why log and delta producers split
//! their output into [`crate::MAX_COPY_SIZE`] blocks.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::{ProtoError, Result, COMPRESS_THRESHOLD};

pub const COMPRESS_BIT: u8 = 0x80;
pub const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw type byte; may carry [`COMPRESS_BIT`].
    pub msg: u8,
    pub wp_id: u8,
    pub length: u16,
}

impl FrameHeader {
    pub fn new(msg: u8, wp_id: u8, length: u16) -> Self {
        FrameHeader { msg, wp_id, length }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let len = self.length.to_le_bytes();
        [self.msg, self.wp_id, len[0], len[1]]
    }

    pub fn from_bytes(raw: [u8; HEADER_LEN]) -> Self {
        FrameHeader {
            msg: raw[0],
            wp_id: raw[1],
            length: u16::from_le_bytes([raw[2], raw[3]]),
        }
    }

    pub fn is_compressed(self) -> bool {
        self.msg & COMPRESS_BIT != 0
    }

    pub fn message(self) -> u8 {
        self.msg & !COMPRESS_BIT
    }
}

/// Encode a full frame, compressing the payload when it is large enough,
/// the level is non-zero, and compression actually helps.
pub fn encode_frame(msg: u8, wp_id: u8, payload: &[u8], level: u32) -> Result<Vec<u8>> {
    debug_assert_eq!(msg & COMPRESS_BIT, 0);

    if level > 0 && payload.len() > COMPRESS_THRESHOLD {
        let mut compressed = Vec::with_capacity(payload.len() / 2 + 8);
        compressed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let mut encoder = ZlibEncoder::new(compressed, Compression::new(level));
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;

        if compressed.len() < payload.len() && compressed.len() <= u16::MAX as usize {
            let head = FrameHeader::new(msg | COMPRESS_BIT, wp_id, compressed.len() as u16);
            let mut frame = Vec::with_capacity(HEADER_LEN + compressed.len());
            frame.extend_from_slice(&head.to_bytes());
            frame.extend_from_slice(&compressed);
            return Ok(frame);
        }
    }

    if payload.len() > u16::MAX as usize {
        return Err(ProtoError::Oversize(payload.len()));
    }

    let head = FrameHeader::new(msg, wp_id, payload.len() as u16);
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&head.to_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Undo the compression bit on a received frame. Errors here are fatal to
/// the connection: a peer that sends broken zlib or lies about the
/// original size cannot be trusted to stay in sync.
pub fn decode_payload(head: FrameHeader, raw: Vec<u8>) -> Result<Vec<u8>> {
    if !head.is_compressed() {
        return Ok(raw);
    }

    if raw.len() < 4 {
        return Err(ProtoError::MalformedRecord);
    }
    let declared = u32::from_le_bytes(raw[..4].try_into().unwrap()) as usize;

    let mut decoder = ZlibDecoder::new(&raw[4..]);
    let mut output = Vec::with_capacity(declared);
    decoder
        .read_to_end(&mut output)
        .map_err(|e| ProtoError::Decompress(e.to_string()))?;

    if output.len() != declared {
        return Err(ProtoError::LengthMismatch {
            declared,
            actual: output.len(),
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let head = FrameHeader::new(b'K', 3, 0x0201);
        assert_eq!(head.to_bytes(), [b'K', 3, 0x01, 0x02]);
        assert_eq!(FrameHeader::from_bytes(head.to_bytes()), head);
    }

    #[test]
    fn small_payloads_stay_uncompressed() {
        let frame = encode_frame(b'M', 0, b"short", 9).unwrap();
        let head = FrameHeader::from_bytes(frame[..4].try_into().unwrap());
        assert!(!head.is_compressed());
        assert_eq!(&frame[4..], b"short");
    }

    #[test]
    fn large_payload_roundtrips_through_zlib() {
        let payload = vec![b'x'; 8192];
        let frame = encode_frame(b'M', 1, &payload, 6).unwrap();
        let head = FrameHeader::from_bytes(frame[..4].try_into().unwrap());
        assert!(head.is_compressed());
        assert!((frame.len() - 4) < payload.len());

        let decoded = decode_payload(head, frame[4..].to_vec()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn level_zero_disables_compression() {
        let payload = vec![b'x'; 8192];
        let frame = encode_frame(b'M', 1, &payload, 0).unwrap();
        let head = FrameHeader::from_bytes(frame[..4].try_into().unwrap());
        assert!(!head.is_compressed());
    }

    #[test]
    fn size_lie_is_rejected() {
        let payload = vec![b'x'; 4096];
        let frame = encode_frame(b'M', 0, &payload, 6).unwrap();
        let head = FrameHeader::from_bytes(frame[..4].try_into().unwrap());

        let mut body = frame[4..].to_vec();
        body[..4].copy_from_slice(&(payload.len() as u32 + 1).to_le_bytes());
        match decode_payload(head, body) {
            Err(ProtoError::LengthMismatch { .. }) => {}
            other => panic!("expected length mismatch, got {other:?}"),
        }
    }

    #[test]
    fn garbage_zlib_is_fatal() {
        let head = FrameHeader::new(b'M' | COMPRESS_BIT, 0, 8);
        let mut body = 100u32.to_le_bytes().to_vec();
        body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(
            decode_payload(head, body),
            Err(ProtoError::Decompress(_))
        ));
    }
}
