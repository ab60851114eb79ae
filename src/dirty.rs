use byteorder::{ByteOrder, LittleEndian};

/// One bit per sector of the stable area, set for sectors modified since the last flush.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct DirtyVector {
    words: Vec<u64>,
    sectors: usize,
    count: usize,
}

impl DirtyVector {
    pub fn new(sectors: usize) -> Self {
        Self {
            words: vec![0; sectors.div_ceil(64)],
            sectors,
            count: 0,
        }
    }

    /// Number of sectors tracked.
    pub fn len(&self) -> usize {
        self.sectors
    }

    /// Number of dirty sectors.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_clean(&self) -> bool {
        self.count == 0
    }

    /// Track a different number of sectors. Bits past a shrunk end are dropped.
    pub fn resize(&mut self, sectors: usize) {
        if sectors < self.sectors {
            for s in sectors..self.sectors {
                if self.get(s) {
                    self.count -= 1;
                }
            }
            self.words.truncate(sectors.div_ceil(64));
            if sectors % 64 != 0 {
                if let Some(last) = self.words.last_mut() {
                    *last &= (1u64 << (sectors % 64)) - 1;
                }
            }
        } else {
            self.words.resize(sectors.div_ceil(64), 0);
        }
        self.sectors = sectors;
    }

    #[inline]
    pub fn get(&self, sector: usize) -> bool {
        sector < self.sectors && self.words[sector / 64] & (1 << (sector % 64)) != 0
    }

    /// How many sectors in the range are still clean.
    pub fn clear_in(&self, first: usize, count: usize) -> usize {
        (first..(first + count).min(self.sectors))
            .filter(|s| !self.get(*s))
            .count()
    }

    /// Whether every sector in the range is dirty.
    pub fn all_set(&self, first: usize, count: usize) -> bool {
        first + count <= self.sectors && self.clear_in(first, count) == 0
    }

    /// Set a range of sectors, returning how many were newly set.
    pub fn set(&mut self, first: usize, count: usize) -> usize {
        debug_assert!(first + count <= self.sectors);
        let mut newly = 0;
        for s in first..(first + count).min(self.sectors) {
            let word = &mut self.words[s / 64];
            let bit = 1u64 << (s % 64);
            if *word & bit == 0 {
                *word |= bit;
                newly += 1;
            }
        }
        self.count += newly;
        newly
    }

    #[cfg(test)]
    pub fn clear(&mut self, sector: usize) {
        if self.get(sector) {
            self.words[sector / 64] &= !(1u64 << (sector % 64));
            self.count -= 1;
        }
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
        self.count = 0;
    }

    /// Runs of consecutive dirty sectors, as `(first, count)`.
    pub fn runs(&self) -> Runs<'_> {
        Runs { vec: self, at: 0 }
    }

    /// Serialized size of a vector covering `sectors` sectors.
    pub fn byte_len(sectors: usize) -> usize {
        sectors.div_ceil(8)
    }

    /// Serialize as a little-endian bitmap: bit `i % 8` of byte `i / 8` is sector `i`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.words.len() * 8];
        for (chunk, word) in out.chunks_exact_mut(8).zip(self.words.iter()) {
            LittleEndian::write_u64(chunk, *word);
        }
        out.truncate(Self::byte_len(self.sectors));
        out
    }

    pub fn from_bytes(bytes: &[u8], sectors: usize) -> Self {
        let mut vec = Self::new(sectors);
        for s in 0..sectors.min(bytes.len() * 8) {
            if bytes[s / 8] & (1 << (s % 8)) != 0 {
                vec.words[s / 64] |= 1 << (s % 64);
                vec.count += 1;
            }
        }
        vec
    }
}

pub(crate) struct Runs<'a> {
    vec: &'a DirtyVector,
    at: usize,
}

impl Iterator for Runs<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        while self.at < self.vec.sectors && !self.vec.get(self.at) {
            // skip whole clean words at a time
            if self.at % 64 == 0 && self.vec.words[self.at / 64] == 0 {
                self.at += 64;
            } else {
                self.at += 1;
            }
        }
        if self.at >= self.vec.sectors {
            return None;
        }
        let first = self.at;
        while self.at < self.vec.sectors && self.vec.get(self.at) {
            self.at += 1;
        }
        Some((first, self.at - first))
    }
}
