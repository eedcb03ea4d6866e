//! 启动校验与编码阶段的错误类型

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// 打包后的位数不是 132 (12 个 11 位索引)
    #[error("invalid length: expected 132 bits (12 words), got {0}")]
    InvalidLength(usize),

    #[error("unknown word at position {position}: '{word}'")]
    UnknownWord { position: usize, word: String },

    #[error("seed template must have exactly 12 words, got {0}")]
    WrongTokenCount(usize),

    #[error("bloom filter size must be a power of two (>= 32 bits), got {0}")]
    BloomSizeNotPowerOfTwo(u64),

    #[error("window width must be at least 1, got {0}")]
    InvalidWindow(u32),

    #[error("search space is empty")]
    EmptySpace,

    #[error("search space does not fit in 128 bits")]
    SpaceTooLarge,

    /// 内核的 `low` 参数只有 64 位
    #[error("index {0} does not fit the 64-bit kernel counter")]
    IndexOverflow(u128),

    #[error("no GPU devices to partition across")]
    NoDevices,

    /// 主机与设备派生出的地址不一致，数据或内核已损坏
    #[error("address mismatch on {device}: kernel={kernel} host={host}")]
    AddressMismatch {
        device: String,
        kernel: String,
        host: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
