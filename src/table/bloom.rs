use bytes::Bytes;
use std::io::Cursor;

/// Probabilistic membership filter built per SSTable data block.
///
/// `add` collects key hashes while a block is being built; `hash` emits the
/// block's bitmap; `may_contain` probes an emitted bitmap. `reset` recycles
/// the instance for the next block.
pub trait Filter: Send + Sync {
    fn add(&mut self, key: &[u8]);
    fn hash(&self) -> Bytes;
    fn may_contain(&self, bitmap: &[u8], key: &[u8]) -> bool;
    fn reset(&mut self);
}

pub const DEFAULT_BLOOM_BITS: usize = 1024;

/// Bloom filter over MurmurHash3-32 with double hashing: `h2 = rotr(h1, 17)`
/// and probe `i` lands on bit `(h1 + i*h2) mod available_bits`.
///
/// Bitmap layout: `m/8` data bytes followed by one byte holding `k`, the
/// number of hash functions. The trailing byte is excluded from the
/// addressable bit range.
pub struct Bloom {
    bits: usize,
    hashes: Vec<u32>,
}

fn murmur32(key: &[u8]) -> u32 {
    // reading from an in-memory cursor cannot fail
    murmur3::murmur3_32(&mut Cursor::new(key), 0).unwrap()
}

impl Bloom {
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            hashes: Vec::new(),
        }
    }

    /// k = ln2 * m / n, clamped into [1, 30].
    fn optimal_k(&self) -> u8 {
        if self.hashes.is_empty() {
            return 1;
        }
        let k = (std::f64::consts::LN_2 * self.bits as f64 / self.hashes.len() as f64) as u32;
        k.clamp(1, 30) as u8
    }
}

impl Default for Bloom {
    fn default() -> Self {
        Self::new(DEFAULT_BLOOM_BITS)
    }
}

impl Filter for Bloom {
    fn add(&mut self, key: &[u8]) {
        self.hashes.push(murmur32(key));
    }

    fn hash(&self) -> Bytes {
        let nbytes = (self.bits + 7) / 8 + 1;
        let mut bitmap = vec![0u8; nbytes];
        let available_bits = (8 * (nbytes - 1)) as u32;
        let k = self.optimal_k();
        for &h1 in &self.hashes {
            let h2 = h1.rotate_right(17);
            let mut h = h1;
            for _ in 0..k {
                let bit = h % available_bits;
                bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
                h = h.wrapping_add(h2);
            }
        }
        *bitmap.last_mut().unwrap() = k;
        bitmap.into()
    }

    fn may_contain(&self, bitmap: &[u8], key: &[u8]) -> bool {
        if bitmap.is_empty() {
            // conservative: an absent filter never rules a key out
            return true;
        }
        let mut k = *bitmap.last().unwrap();
        if k == 0 || k > 30 {
            k = 8;
        }
        let available_bits = (8 * (bitmap.len() - 1)) as u32;
        if available_bits == 0 {
            return true;
        }
        let h1 = murmur32(key);
        let h2 = h1.rotate_right(17);
        let mut h = h1;
        for _ in 0..k {
            let bit = h % available_bits;
            if bitmap[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(h2);
        }
        true
    }

    fn reset(&mut self) {
        self.hashes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_basics() {
        let mut bloom = Bloom::new(1024);
        bloom.add(b"key1");
        bloom.add(b"key2");
        bloom.add(b"key3");
        let bitmap = bloom.hash();
        assert!(bloom.may_contain(&bitmap, b"key1"));
        assert!(bloom.may_contain(&bitmap, b"key2"));
        assert!(bloom.may_contain(&bitmap, b"key3"));
        // ln2 * 1024 / 3 ~= 236, clamped to 30 and stored in the last byte
        assert_eq!(*bitmap.last().unwrap(), 30);
    }

    #[test]
    fn test_absent_keys_mostly_rejected() {
        let mut bloom = Bloom::new(1024);
        for i in 0..32 {
            bloom.add(format!("present_{i}").as_bytes());
        }
        let bitmap = bloom.hash();
        let false_positives = (0..1000)
            .filter(|i| bloom.may_contain(&bitmap, format!("absent_{i}").as_bytes()))
            .count();
        // 1024 bits over 32 keys keeps the false-positive rate low
        assert!(false_positives < 100, "{false_positives} false positives");
    }

    #[test]
    fn test_empty_bitmap_is_conservative() {
        let bloom = Bloom::default();
        assert!(bloom.may_contain(&[], b"anything"));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut bloom = Bloom::new(1024);
        bloom.add(b"key1");
        bloom.reset();
        let bitmap = bloom.hash();
        // no hashes recorded: k falls back to 1, no data bits set
        assert!(bitmap[..bitmap.len() - 1].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bad_k_byte_falls_back_to_eight() {
        let mut bloom = Bloom::new(1024);
        bloom.add(b"key1");
        let mut bitmap = bloom.hash().to_vec();
        *bitmap.last_mut().unwrap() = 0;
        // fallback probing must not panic; the answer is merely probabilistic
        let _ = bloom.may_contain(&bitmap, b"key1");
        *bitmap.last_mut().unwrap() = 200;
        let _ = bloom.may_contain(&bitmap, b"key1");
    }
}
