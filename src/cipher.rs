//! Position-keyed XOR stream cipher protecting some audio payloads.
//!
//! Each 4-byte block of a stream is XORed with a key word derived from the seed plus the block's
//! index in the file. Because the key only depends on absolute position, any sub-range can be
//! decrypted on its own, and applying the cipher twice restores the original bytes.

const KEY_XOR: u32 = 0x9C5A_0B29;
const KEY_MUL: u32 = 81_861_667;

/// Derives the key word for a block seed.
#[must_use]
pub fn key(seed: u32) -> u32 {
    let [b0, b1, b2, b3] = seed.to_le_bytes();

    let mut k = (u32::from(b0) ^ KEY_XOR).wrapping_mul(KEY_MUL);
    for byte in [b1, b2, b3] {
        k = (k ^ u32::from(byte)).wrapping_mul(KEY_MUL);
    }
    k
}

/// Decrypts (or encrypts) `data` in place.
///
/// `file_offset` is the absolute position of `data[0]` within the protected stream.
pub fn decrypt(data: &mut [u8], seed: u32, file_offset: u64) {
    // only the low 32 bits of the block index take part in the key
    #[allow(clippy::cast_possible_truncation)]
    let mut block_seed = seed.wrapping_add((file_offset >> 2) as u32);
    let alignment = (file_offset & 3) as usize;

    let mut rest = data;

    // head: finish the partially covered first block
    if alignment != 0 && !rest.is_empty() {
        let key_bytes = key(block_seed).to_le_bytes();
        let count = (4 - alignment).min(rest.len());
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(count);

        for (byte, k) in head.iter_mut().zip(&key_bytes[alignment..]) {
            *byte ^= k;
        }

        rest = tail;
        block_seed = block_seed.wrapping_add(1);
    }

    // body: whole blocks
    let mut blocks = rest.chunks_exact_mut(4);
    for block in &mut blocks {
        let word = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) ^ key(block_seed);
        block.copy_from_slice(&word.to_le_bytes());
        block_seed = block_seed.wrapping_add(1);
    }

    // tail: leading bytes of the last block
    let tail = blocks.into_remainder();
    if !tail.is_empty() {
        let key_bytes = key(block_seed).to_le_bytes();
        for (byte, k) in tail.iter_mut().zip(key_bytes) {
            *byte ^= k;
        }
    }
}

/// A cipher bound to a single seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamCipher {
    seed: u32,
}

impl StreamCipher {
    /// Creates a cipher for the given content seed.
    #[must_use]
    pub fn new(seed: u32) -> Self {
        Self { seed }
    }

    /// Returns the seed of this cipher.
    #[must_use]
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Applies the cipher to `data`, which starts at `file_offset` in the stream.
    pub fn apply(&self, data: &mut [u8], file_offset: u64) {
        decrypt(data, self.seed, file_offset);
    }
}

#[cfg(test)]
mod test {
    use super::{decrypt, key, StreamCipher};

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 37 % 251) as u8).collect()
    }

    #[test]
    fn key_is_stable() {
        // first round alone: (0 ^ 0x9C5A0B29) * 81861667 mod 2^32, then three zero bytes
        let mut expected = 0x9C5A_0B29_u32.wrapping_mul(81_861_667);
        for _ in 0..3 {
            expected = expected.wrapping_mul(81_861_667);
        }
        assert_eq!(key(0), expected);
        assert_ne!(key(1), key(0));
        assert_ne!(key(0x0100), key(0));
    }

    #[test]
    fn applying_twice_restores_data() {
        let original = sample(103);

        for offset in [0_u64, 1, 2, 3, 4, 0x1_0000_0001] {
            let mut data = original.clone();
            decrypt(&mut data, 0xDEAD_BEEF, offset);
            assert_ne!(data, original);
            decrypt(&mut data, 0xDEAD_BEEF, offset);
            assert_eq!(data, original);
        }
    }

    #[test]
    fn sub_ranges_match_full_range() {
        let original = sample(64);
        let base = 0x1235_u64;

        let mut full = original.clone();
        decrypt(&mut full, 42, base);

        // decrypt in uneven, reordered pieces
        let mut pieces = original.clone();
        for (start, end) in [(33, 64), (0, 1), (5, 33), (1, 5)] {
            decrypt(&mut pieces[start..end], 42, base + start as u64);
        }

        assert_eq!(full, pieces);
    }

    #[test]
    fn short_unaligned_buffer() {
        let mut data = [0_u8; 2];
        decrypt(&mut data, 7, 1);

        let k = key(7).to_le_bytes();
        assert_eq!(data, [k[1], k[2]]);
    }

    #[test]
    fn tail_uses_next_block_key() {
        let mut data = [0_u8; 6];
        StreamCipher::new(9).apply(&mut data, 8);

        let first = key(9 + 2).to_le_bytes();
        let second = key(9 + 3).to_le_bytes();
        assert_eq!(data, [first[0], first[1], first[2], first[3], second[0], second[1]]);
    }

    #[test]
    fn empty_buffer_is_untouched() {
        let mut data: [u8; 0] = [];
        decrypt(&mut data, 1, 3);
        assert!(data.is_empty());
    }
}
