//! 目标标签布隆过滤器 (GPU 端第一级筛选)
//!
//! 位数组以 u32 字存储。GPU 端查询必须使用完全相同的混合函数、盐值和
//! 探测公式，否则会出现假阴性。

use crate::error::{Error, Result};

/// 默认位数 2^27
pub const DEFAULT_BITS: u64 = 1 << 27;
/// 默认哈希次数
pub const DEFAULT_K: u32 = 4;

const SALT_1: u64 = 0x9e37_79b9_7f4a_7c15;
const SALT_2: u64 = 0xbf58_476d_1ce4_e5b9;

/// 64 位雪崩混合 (murmur3 fmix64)
#[inline]
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// 双重哈希的两个基值，h2 强制为奇数以保证覆盖全部位
#[inline]
pub fn hash_pair(tag: u64) -> (u64, u64) {
    (mix64(tag ^ SALT_1), mix64(tag ^ SALT_2) | 1)
}

#[derive(Debug, Clone)]
pub struct BloomIndex {
    pub bits: Vec<u32>,
    /// nbits - 1
    pub mask: u32,
    /// nwords - 1
    pub words_mask: u32,
    pub k: u32,
}

impl BloomIndex {
    /// 构建过滤器，`nbits` 必须是 2 的幂
    pub fn build(tags: &[u64], nbits: u64, k: u32) -> Result<Self> {
        if !nbits.is_power_of_two() || nbits < 32 || nbits > 1 << 32 {
            return Err(Error::BloomSizeNotPowerOfTwo(nbits));
        }
        let nwords = (nbits / 32) as usize;
        let mut index = Self {
            bits: vec![0u32; nwords],
            mask: (nbits - 1) as u32,
            words_mask: (nwords - 1) as u32,
            k,
        };
        for &tag in tags {
            index.insert(tag);
        }
        Ok(index)
    }

    fn probes(&self, tag: u64) -> impl Iterator<Item = (usize, u32)> + '_ {
        let (h1, h2) = hash_pair(tag);
        let mask = self.mask as u64;
        (0..self.k as u64).map(move |i| {
            let idx = h1.wrapping_add(i.wrapping_mul(h2)) & mask;
            ((idx >> 5) as usize, 1u32 << (idx & 31))
        })
    }

    pub fn insert(&mut self, tag: u64) {
        let probes: Vec<_> = self.probes(tag).collect();
        for (word, bit) in probes {
            self.bits[word] |= bit;
        }
    }

    /// 主机端查询，与 GPU 端公式一致
    pub fn contains(&self, tag: u64) -> bool {
        self.probes(tag)
            .all(|(word, bit)| self.bits[word] & bit != 0)
    }

    pub fn nbits(&self) -> u64 {
        self.mask as u64 + 1
    }

    /// 已置位的比例
    pub fn fill_ratio(&self) -> f64 {
        let set: u64 = self.bits.iter().map(|w| w.count_ones() as u64).sum();
        set as f64 / self.nbits() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let tags: Vec<u64> = (0..10_000u64).map(|i| mix64(i.wrapping_mul(7919))).collect();
        let bloom = BloomIndex::build(&tags, 1 << 20, DEFAULT_K).unwrap();
        for &t in &tags {
            assert!(bloom.contains(t), "tag {:x} missing", t);
        }
    }

    #[test]
    fn test_masks() {
        let bloom = BloomIndex::build(&[], 1 << 10, 4).unwrap();
        assert_eq!(bloom.mask, 1023);
        assert_eq!(bloom.words_mask, 31);
        assert_eq!(bloom.bits.len(), 32);
        assert_eq!(bloom.fill_ratio(), 0.0);
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(matches!(
            BloomIndex::build(&[1], 1000, 4),
            Err(Error::BloomSizeNotPowerOfTwo(1000))
        ));
        assert!(BloomIndex::build(&[1], 16, 4).is_err());
    }

    #[test]
    fn test_h2_is_odd() {
        for t in [0u64, 1, u64::MAX, 0xdead_beef] {
            assert_eq!(hash_pair(t).1 & 1, 1);
        }
    }

    #[test]
    fn test_single_tag_sets_at_most_k_bits() {
        let bloom = BloomIndex::build(&[42], 1 << 16, 4).unwrap();
        let set: u32 = bloom.bits.iter().map(|w| w.count_ones()).sum();
        assert!(set >= 1 && set <= 4);
        assert!(bloom.contains(42));
    }
}
