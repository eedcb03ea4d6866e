//! 测试公共模块
//!
//! 提供测试用的公共函数和工具

#![allow(dead_code)]

use bech32::{ToBase32, Variant, u5};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ABOUT: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// BIP173 P2WPKH 测试向量 (见证程序 751e76e8...)
pub const P2WPKH: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
/// BIP173 P2WSH 测试向量 (见证程序 1863143c...)
pub const P2WSH: &str = "bc1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qccfmv3";

/// 由 20 字节见证程序构造 v0 bech32 地址
pub fn p2wpkh_address(program: &[u8; 20]) -> String {
    let mut data = vec![u5::try_from_u8(0).unwrap()];
    data.extend(program.to_base32());
    bech32::encode("bc", data, Variant::Bech32).unwrap()
}

/// 在目录中写入文件
pub fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(content).unwrap();
    path
}

/// k·G 的 (x, y) 大端字节 (使用 secp256k1 crate 计算)
pub fn scalar_mul_g(k: u64) -> ([u8; 32], [u8; 32]) {
    let mut scalar = [0u8; 32];
    scalar[24..].copy_from_slice(&k.to_be_bytes());
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&scalar).unwrap();
    let pk = PublicKey::from_secret_key(&secp, &sk).serialize_uncompressed();
    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    x.copy_from_slice(&pk[1..33]);
    y.copy_from_slice(&pk[33..65]);
    (x, y)
}

/// 小端 u32 字 (最低有效字在前) → 大端字节
pub fn words_to_be_bytes(words: &[u32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, w) in words.iter().enumerate() {
        let pos = 32 - (i + 1) * 4;
        out[pos..pos + 4].copy_from_slice(&w.to_be_bytes());
    }
    out
}

/// 大端 256 位减法 a - b (a >= b)
pub fn sub_be(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let mut d = a[i] as i16 - b[i] as i16 - borrow;
        if d < 0 {
            d += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out[i] = d as u8;
    }
    out
}

/// secp256k1 域素数 P
pub fn field_p() -> [u8; 32] {
    let mut p = [0u8; 32];
    hex::decode_to_slice(
        "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFC2F",
        &mut p,
    )
    .unwrap();
    p
}
