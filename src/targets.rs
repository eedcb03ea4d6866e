//! 目标地址加载
//!
//! 每行取第一个空白分隔的字段作为 bech32 地址，解码出见证程序，
//! 取前 8 字节 (小端) 作为 64 位标签。结果去重并升序排列，
//! 供 GPU 端布隆过滤后做精确二分查找。

use bech32::FromBase32;
use flate2::read::GzDecoder;
use log::{debug, info};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::Result;

/// 地址过滤条件
#[derive(Debug, Clone)]
pub struct TargetFilter {
    /// 接受的人类可读部分 (小写)
    pub hrps: Vec<String>,
    /// 只接受该见证版本，None 表示不限
    pub version: Option<u8>,
}

impl Default for TargetFilter {
    fn default() -> Self {
        Self {
            hrps: vec![String::from("bc")],
            version: Some(0),
        }
    }
}

/// 加载统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// 非空行数
    pub lines_read: usize,
    /// 通过过滤的行数 (去重前)
    pub tags_produced: usize,
    /// 去重后的标签数
    pub unique: usize,
}

/// 升序去重的目标标签
#[derive(Debug, Clone, Default)]
pub struct TargetTagSet {
    pub tags: Vec<u64>,
}

impl TargetTagSet {
    pub fn from_tags(mut tags: Vec<u64>) -> Self {
        tags.sort_unstable();
        tags.dedup();
        Self { tags }
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// 精确查找
    pub fn contains(&self, tag: u64) -> bool {
        self.tags.binary_search(&tag).is_ok()
    }
}

/// 解码 bech32 地址，返回 (hrp, 见证版本, 见证程序)
pub fn decode_address(addr: &str) -> Option<(String, u8, Vec<u8>)> {
    let (hrp, data, _variant) = bech32::decode(addr).ok()?;
    let (version, program) = data.split_first()?;
    let version = version.to_u8();
    if version > 16 {
        return None;
    }
    let program = Vec::<u8>::from_base32(program).ok()?;
    Some((hrp.to_lowercase(), version, program))
}

/// 见证程序前 8 字节的小端整数
pub fn program_tag(program: &[u8]) -> Option<u64> {
    let head: [u8; 8] = program.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(head))
}

/// 解析一行，不符合条件时返回 None
fn parse_line(line: &str, filter: &TargetFilter) -> Option<u64> {
    let addr = line.split_whitespace().next()?;
    let lower = addr.to_lowercase();
    if !filter
        .hrps
        .iter()
        .any(|hrp| lower.starts_with(&format!("{}1", hrp)))
    {
        return None;
    }
    let (hrp, version, program) = decode_address(addr)?;
    if !filter.hrps.iter().any(|h| *h == hrp) {
        return None;
    }
    if filter.version.is_some_and(|v| v != version) {
        return None;
    }
    program_tag(&program)
}

/// 从任意文本流解析标签
pub fn read_tags<R: BufRead>(reader: R, filter: &TargetFilter) -> Result<(TargetTagSet, LoadStats)> {
    let mut stats = LoadStats::default();
    let mut tags = Vec::new();

    for line in reader.split(b'\n') {
        let line = line?;
        // 非 UTF-8 字节直接忽略
        let line = String::from_utf8_lossy(&line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.lines_read += 1;
        match parse_line(line, filter) {
            Some(tag) => {
                tags.push(tag);
                stats.tags_produced += 1;
            }
            None => debug!("skipped target line: {}", line),
        }
    }

    let set = TargetTagSet::from_tags(tags);
    stats.unique = set.len();
    Ok((set, stats))
}

/// 加载目标文件，`.gz` 结尾的文件自动解压
pub fn load_targets(path: &Path, filter: &TargetFilter) -> Result<(TargetTagSet, LoadStats)> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let (set, stats) = read_tags(BufReader::new(reader), filter)?;
    info!(
        "Loaded targets from {}: {} lines, {} tags, {} unique",
        path.display(),
        stats.lines_read,
        stats.tags_produced,
        stats.unique
    );
    Ok((set, stats))
}
