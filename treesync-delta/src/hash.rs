//! Weak rolling hash and strong block hash.

use md4::{Digest, Md4};

/// Adler-style 32-bit rolling checksum over a fixed-size window.
///
/// Cheap to slide one byte at a time; collisions are expected and resolved
/// by the strong hash.
#[derive(Debug, Clone, Copy)]
pub struct RollingHash {
    a: u32,
    b: u32,
    window: usize,
}

impl RollingHash {
    pub fn new(block: &[u8]) -> Self {
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        let len = block.len() as u32;
        for (i, &byte) in block.iter().enumerate() {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add((len - i as u32).wrapping_mul(byte as u32));
        }
        RollingHash {
            a: a & 0xffff,
            b: b & 0xffff,
            window: block.len(),
        }
    }

    /// Slide the window: drop `out` from the front, append `incoming`.
    pub fn roll(&mut self, out: u8, incoming: u8) {
        self.a = self
            .a
            .wrapping_sub(out as u32)
            .wrapping_add(incoming as u32)
            & 0xffff;
        self.b = self
            .b
            .wrapping_sub((self.window as u32).wrapping_mul(out as u32))
            .wrapping_add(self.a)
            & 0xffff;
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

/// Strong hash of a block (and of whole files in the state database).
pub fn md4_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md4::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_matches_recompute() {
        let data: Vec<u8> = (0..300).map(|i| (i * 7 % 251) as u8).collect();
        let window = 64;

        let mut rolling = RollingHash::new(&data[..window]);
        for start in 1..data.len() - window {
            rolling.roll(data[start - 1], data[start + window - 1]);
            let fresh = RollingHash::new(&data[start..start + window]);
            assert_eq!(rolling.value(), fresh.value(), "offset {start}");
        }
    }

    #[test]
    fn different_blocks_usually_differ() {
        let a = RollingHash::new(b"aaaaaaaaaaaaaaaa").value();
        let b = RollingHash::new(b"aaaaaaaaaaaaaaab").value();
        assert_ne!(a, b);
    }

    #[test]
    fn md4_is_stable() {
        // Reference vector from RFC 1320.
        assert_eq!(
            hex_string(&md4_digest(b"abc")),
            "a448017aaf21d8525fc10ae87aa6729d"
        );
    }

    fn hex_string(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
