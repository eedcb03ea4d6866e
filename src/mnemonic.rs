//! BIP39 12 词助记词编码与通配模板展开
//!
//! 12 个 11 位索引 = 128 位熵 + 4 位校验和。GPU 端以 (high, low) 两个 u64
//! 表示熵，本模块负责两种表示之间的互转以及模板到候选词表的展开。

use bip39::Language;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// 助记词单词数
pub const WORD_COUNT: usize = 12;
/// 单个位置的候选槽位宽度 (GPU 端固定步长)
pub const SLOT_WIDTH: usize = 2048;
/// 通配符前缀
pub const PLACEHOLDER: char = '?';
/// 用于构造基准熵的哨兵单词
pub const SENTINEL_WORD: &str = "abandon";

/// BIP39 英文词表 (2048 个单词)
pub fn wordlist() -> &'static [&'static str; 2048] {
    Language::English.word_list()
}

/// 查找单词索引 (0-2047)
pub fn word_index(word: &str) -> Option<u16> {
    Language::English.find_word(word)
}

/// 单词 → 索引，遇到未知单词报错
pub fn words_to_indices(words: &[&str]) -> Result<Vec<u16>> {
    words
        .iter()
        .enumerate()
        .map(|(position, w)| {
            word_index(w).ok_or_else(|| Error::UnknownWord {
                position: position + 1,
                word: (*w).to_string(),
            })
        })
        .collect()
}

/// 索引 → 空格分隔的助记词
pub fn indices_to_phrase(indices: &[u16]) -> String {
    let list = wordlist();
    indices
        .iter()
        .map(|&idx| list.get(idx as usize).copied().unwrap_or("unknown"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// 将 12 个 11 位索引拼接为 132 位，丢弃末尾 4 位校验和，返回 (high, low)
///
/// 与文本二进制拼接等价：任何超过 11 位的索引都会让总位数偏离 132；
/// 数量不是 12 时同样返回 `InvalidLength`。
pub fn pack_indices_to_entropy_pair(indices: &[u16]) -> Result<(u64, u64)> {
    let bits: usize = indices
        .iter()
        .map(|&idx| (16 - idx.leading_zeros() as usize).max(11))
        .sum();
    if indices.len() != WORD_COUNT || bits != WORD_COUNT * 11 {
        return Err(Error::InvalidLength(bits));
    }

    let mut acc: u128 = 0;
    for &idx in &indices[..WORD_COUNT - 1] {
        acc = (acc << 11) | idx as u128;
    }
    // 最后一个词: 高 7 位属于熵，低 4 位是校验和
    let last = indices[WORD_COUNT - 1] as u128;
    let entropy = (acc << 7) | (last >> 4);

    Ok(((entropy >> 64) as u64, entropy as u64))
}

/// 计算 128 位熵的 4 位校验和 (SHA-256 首字节高 4 位)
pub fn checksum(entropy: u128) -> u8 {
    let hash = Sha256::digest(entropy.to_be_bytes());
    hash[0] >> 4
}

/// `pack_indices_to_entropy_pair` 的逆运算，校验和重新计算
pub fn entropy_pair_to_indices(high: u64, low: u64) -> [u16; WORD_COUNT] {
    let entropy = ((high as u128) << 64) | low as u128;
    let cs = checksum(entropy) as u128;

    let mut indices = [0u16; WORD_COUNT];
    for (i, slot) in indices.iter_mut().enumerate().take(WORD_COUNT - 1) {
        let shift = 11 * (WORD_COUNT - 1 - i) - 4;
        *slot = ((entropy >> shift) & 0x7FF) as u16;
    }
    indices[WORD_COUNT - 1] = (((entropy & 0x7F) << 4) | cs) as u16;
    indices
}

pub fn entropy_pair_to_phrase(high: u64, low: u64) -> String {
    indices_to_phrase(&entropy_pair_to_indices(high, low))
}

/// 模板中的单个位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// 固定单词 (已转小写)
    Word(String),
    /// 通配符，可带字母前缀 (`?`、`?ab`)
    Wildcard(String),
}

impl Token {
    fn parse(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        match lower.strip_prefix(PLACEHOLDER) {
            Some(prefix) if prefix.chars().all(|c| c.is_ascii_alphabetic()) => {
                Token::Wildcard(prefix.to_string())
            }
            _ => Token::Word(lower),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Token::Wildcard(_))
    }
}

/// 12 个位置的助记词模板
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedTemplate {
    pub tokens: Vec<Token>,
}

impl SeedTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let tokens: Vec<Token> = template.split_whitespace().map(Token::parse).collect();
        if tokens.len() != WORD_COUNT {
            return Err(Error::WrongTokenCount(tokens.len()));
        }
        Ok(Self { tokens })
    }

    /// 通配位置 (0 起)
    pub fn wildcard_positions(&self) -> Vec<usize> {
        self.tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_wildcard())
            .map(|(i, _)| i)
            .collect()
    }

    /// (通配符数量, 最后一个位置是否为通配符)
    pub fn count_placeholders(&self) -> (usize, bool) {
        let n = self.tokens.iter().filter(|t| t.is_wildcard()).count();
        let last = self.tokens.last().is_some_and(Token::is_wildcard);
        (n, last)
    }

    /// 通配符只出现在尾部，此时末位可以靠校验和推导而不必组合遍历
    ///
    /// 首位即为通配符时返回 false。
    pub fn is_checksum_only_tail(&self) -> bool {
        match self.tokens.iter().position(Token::is_wildcard) {
            None => true,
            Some(0) => false,
            Some(first) => self.tokens[first..].iter().all(Token::is_wildcard),
        }
    }

    /// 通配位置替换为哨兵单词，得到可以计算基准熵的固定助记词
    pub fn replace_placeholder_with_sentinel(&self) -> Vec<String> {
        self.tokens
            .iter()
            .map(|t| match t {
                Token::Word(w) => w.clone(),
                Token::Wildcard(_) => SENTINEL_WORD.to_string(),
            })
            .collect()
    }

    /// 基准熵对 (通配位置取哨兵单词)
    pub fn baseline_entropy_pair(&self) -> Result<(u64, u64)> {
        let words = self.replace_placeholder_with_sentinel();
        let refs: Vec<&str> = words.iter().map(String::as_str).collect();
        pack_indices_to_entropy_pair(&words_to_indices(&refs)?)
    }

    /// 只显示原本为通配的位置，形如 `3:word 12:word`
    pub fn redact(&self, indices: &[u16]) -> String {
        let list = wordlist();
        let parts: Vec<String> = self
            .wildcard_positions()
            .into_iter()
            .filter_map(|pos| {
                let idx = *indices.get(pos)? as usize;
                Some(format!("{}:{}", pos + 1, list.get(idx)?))
            })
            .collect();
        if parts.is_empty() {
            String::from("<no-missing-words?>")
        } else {
            parts.join(" ")
        }
    }
}

impl std::str::FromStr for SeedTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// GPU 端使用的候选词数组
///
/// `words` 为 12 × 2048 的定宽数组，存储 1 起的索引 (0 保留为未使用)，
/// 不足 2048 的列表循环重复填满；`lens` 为每个位置的真实候选数。
#[derive(Debug, Clone)]
pub struct CandidateSpace {
    pub words: Vec<u32>,
    pub lens: [u32; WORD_COUNT],
}

impl CandidateSpace {
    /// 位置 `pos` 的 2048 个槽位
    pub fn slots(&self, pos: usize) -> &[u32] {
        &self.words[pos * SLOT_WIDTH..(pos + 1) * SLOT_WIDTH]
    }

    /// 位置 `pos` 的真实候选 (0 起索引)
    pub fn candidates(&self, pos: usize) -> Vec<u16> {
        self.slots(pos)[..self.lens[pos] as usize]
            .iter()
            .map(|&w| (w - 1) as u16)
            .collect()
    }
}

/// 循环重复候选列表直到填满 `width`
pub fn pad_cyclic(candidates: &[u16], width: usize) -> Vec<u16> {
    candidates.iter().copied().cycle().take(width).collect()
}

/// 展开模板，返回候选空间以及是否需要组合遍历
pub fn expand_template(template: &SeedTemplate) -> Result<(CandidateSpace, bool)> {
    let list = wordlist();
    let mut words = vec![0u32; WORD_COUNT * SLOT_WIDTH];
    let mut lens = [0u32; WORD_COUNT];
    let mut combinational = false;

    for (pos, token) in template.tokens.iter().enumerate() {
        let candidates: Vec<u16> = match token {
            Token::Wildcard(prefix) if prefix.is_empty() => (0..SLOT_WIDTH as u16).collect(),
            Token::Wildcard(prefix) => {
                let matched: Vec<u16> = list
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| w.starts_with(prefix.as_str()))
                    .map(|(i, _)| i as u16)
                    .collect();
                if matched.is_empty() {
                    (0..SLOT_WIDTH as u16).collect()
                } else {
                    combinational = true;
                    matched
                }
            }
            Token::Word(w) => vec![word_index(w).ok_or_else(|| Error::UnknownWord {
                position: pos + 1,
                word: w.clone(),
            })?],
        };

        lens[pos] = candidates.len() as u32;
        let base = pos * SLOT_WIDTH;
        for (slot, idx) in words[base..base + SLOT_WIDTH]
            .iter_mut()
            .zip(pad_cyclic(&candidates, SLOT_WIDTH))
        {
            *slot = idx as u32 + 1;
        }
    }

    if !template.is_checksum_only_tail() {
        combinational = true;
    }

    Ok((CandidateSpace { words, lens }, combinational))
}
