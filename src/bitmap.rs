//! Fixed-size bitmaps used for segment allocation and mapping-page tracking
//!
//! Bits are stored LSB-first; byte `i / 8` bit `i % 8` holds bit `i` in the
//! on-disk encoding.

/// A fixed-length bitmap
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    bits: usize,
}

impl Bitmap {
    /// Create a bitmap with all `bits` cleared
    pub fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
            bits,
        }
    }

    /// Number of bits
    #[inline]
    pub fn len(&self) -> usize {
        self.bits
    }

    /// Check if the bitmap has no bits
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Bytes needed to encode `bits` bits
    #[inline]
    pub const fn byte_len(bits: usize) -> usize {
        bits.div_ceil(8)
    }

    /// Test bit `i`
    #[inline]
    pub fn test(&self, i: usize) -> bool {
        debug_assert!(i < self.bits);
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    /// Set bit `i`
    #[inline]
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.bits);
        self.words[i / 64] |= 1 << (i % 64);
    }

    /// Clear bit `i`
    #[inline]
    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < self.bits);
        self.words[i / 64] &= !(1 << (i % 64));
    }

    /// Set or clear bit `i`
    #[inline]
    pub fn assign(&mut self, i: usize, value: bool) {
        if value {
            self.set(i);
        } else {
            self.clear(i);
        }
    }

    /// Set bit `i`, returning its previous value
    #[inline]
    pub fn test_and_set(&mut self, i: usize) -> bool {
        let old = self.test(i);
        self.set(i);
        old
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Number of set bits
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Index of the first set bit at or after `from`
    pub fn find_next_set(&self, from: usize) -> Option<usize> {
        self.find_next(from, |w| w)
    }

    /// Index of the first clear bit at or after `from`
    pub fn find_next_zero(&self, from: usize) -> Option<usize> {
        self.find_next(from, |w| !w)
    }

    fn find_next(&self, from: usize, view: impl Fn(u64) -> u64) -> Option<usize> {
        if from >= self.bits {
            return None;
        }
        let mut word_idx = from / 64;
        let mut word = view(self.words[word_idx]) & (!0u64 << (from % 64));
        loop {
            if word != 0 {
                let i = word_idx * 64 + word.trailing_zeros() as usize;
                return (i < self.bits).then_some(i);
            }
            word_idx += 1;
            if word_idx >= self.words.len() {
                return None;
            }
            word = view(self.words[word_idx]);
        }
    }

    /// Iterate over set bit indices
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = self.find_next_set(0);
        std::iter::from_fn(move || {
            let cur = next?;
            next = self.find_next_set(cur + 1);
            Some(cur)
        })
    }

    /// Overwrite this bitmap with `other`
    pub fn copy_from(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.bits, other.bits);
        self.words.copy_from_slice(&other.words);
    }

    /// Encode into `Bitmap::byte_len(self.len())` bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::byte_len(self.bits));
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.truncate(Self::byte_len(self.bits));
        out
    }

    /// Decode `bits` bits from `bytes`; trailing bits past `bits` are ignored
    pub fn from_bytes(bits: usize, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::byte_len(bits) {
            return None;
        }
        let mut map = Self::new(bits);
        for (idx, word) in map.words.iter_mut().enumerate() {
            let mut buf = [0u8; 8];
            let start = idx * 8;
            let end = (start + 8).min(Self::byte_len(bits));
            buf[..end - start].copy_from_slice(&bytes[start..end]);
            *word = u64::from_le_bytes(buf);
        }
        let tail = bits % 64;
        if tail != 0 {
            if let Some(last) = map.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
        Some(map)
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("bits", &self.bits)
            .field("ones", &self.count_ones())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear() {
        let mut map = Bitmap::new(130);
        assert!(!map.test(129));
        map.set(129);
        assert!(map.test(129));
        assert!(!map.test_and_set(3));
        assert!(map.test_and_set(3));
        map.clear(3);
        assert!(!map.test(3));
        assert_eq!(map.count_ones(), 1);
    }

    #[test]
    fn test_find_next_zero_across_words() {
        let mut map = Bitmap::new(70);
        for i in 0..66 {
            map.set(i);
        }
        assert_eq!(map.find_next_zero(0), Some(66));
        assert_eq!(map.find_next_zero(68), Some(68));
        for i in 66..70 {
            map.set(i);
        }
        assert_eq!(map.find_next_zero(0), None);
    }

    #[test]
    fn test_find_next_set() {
        let mut map = Bitmap::new(200);
        map.set(5);
        map.set(150);
        assert_eq!(map.find_next_set(0), Some(5));
        assert_eq!(map.find_next_set(6), Some(150));
        assert_eq!(map.find_next_set(151), None);
        assert_eq!(map.iter_ones().collect::<Vec<_>>(), vec![5, 150]);
    }

    #[test]
    fn test_zero_search_respects_length() {
        let map = Bitmap::new(3);
        assert_eq!(map.find_next_zero(2), Some(2));
        assert_eq!(map.find_next_zero(3), None);
    }

    #[test]
    fn test_bytes_encoding() {
        let mut map = Bitmap::new(12);
        map.set(0);
        map.set(9);
        let bytes = map.to_bytes();
        assert_eq!(bytes, vec![0b0000_0001, 0b0000_0010]);
        let decoded = Bitmap::from_bytes(12, &bytes).unwrap();
        assert_eq!(decoded, map);
        assert!(Bitmap::from_bytes(12, &bytes[..1]).is_none());
    }

    #[test]
    fn test_from_bytes_masks_tail() {
        let decoded = Bitmap::from_bytes(4, &[0xFF]).unwrap();
        assert_eq!(decoded.count_ones(), 4);
    }
}
