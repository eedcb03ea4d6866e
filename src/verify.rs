//! 主机端地址重新派生 (校验 GPU 样本)
//!
//! BIP39: PBKDF2("mnemonic" + 密码) → m/84'/0'/0'/0/0
//! Electrum v2: PBKDF2("electrum" + 密码) → m/0'/0/0
//! 两者都输出 P2WPKH bech32 主网地址 (`bc1q...`)。

use bech32::{ToBase32, Variant, u5};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use ripemd::Ripemd160;
use secp256k1::{PublicKey, Scalar, SecretKey};
use sha2::{Digest, Sha256, Sha512};

use crate::config::{SeedMode, VerifySample};
use crate::error::Error;

/// 硬化派生标志位
pub const HARDENED: u32 = 0x8000_0000;
/// BIP84 第一个收款地址
pub const BIP84_PATH: [u32; 5] = [84 | HARDENED, HARDENED, HARDENED, 0, 0];
/// Electrum segwit 钱包第一个收款地址
pub const ELECTRUM_PATH: [u32; 3] = [HARDENED, 0, 0];

const PBKDF2_ROUNDS: u32 = 2048;

/// 小写并压缩空白
fn normalize(mnemonic: &str) -> String {
    mnemonic
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// 助记词 → 64 字节种子
///
/// Electrum 模式不要求 BIP39 校验和有效。
pub fn seed_bytes(mnemonic: &str, passphrase: &str, mode: SeedMode) -> anyhow::Result<[u8; 64]> {
    let phrase = normalize(mnemonic);
    match mode {
        SeedMode::Bip39 => {
            let m = bip39::Mnemonic::parse_in(bip39::Language::English, &phrase)
                .map_err(|e| anyhow::anyhow!("invalid mnemonic: {}", e))?;
            Ok(m.to_seed(passphrase))
        }
        SeedMode::Electrum => {
            let salt = format!("electrum{}", passphrase);
            let mut seed = [0u8; 64];
            pbkdf2_hmac::<Sha512>(phrase.as_bytes(), salt.as_bytes(), PBKDF2_ROUNDS, &mut seed);
            Ok(seed)
        }
    }
}

/// 按路径派生私钥 (BIP32)
pub fn derive_private_key(seed: &[u8], path: &[u32]) -> anyhow::Result<SecretKey> {
    let mut mac = Hmac::<Sha512>::new_from_slice(b"Bitcoin seed")
        .map_err(|e| anyhow::anyhow!("HMAC 初始化失败: {}", e))?;
    mac.update(seed);
    let master = mac.finalize().into_bytes();

    let mut key = SecretKey::from_slice(&master[..32])?;
    let mut chain = [0u8; 32];
    chain.copy_from_slice(&master[32..]);

    for &index in path {
        let mut mac = Hmac::<Sha512>::new_from_slice(&chain)
            .map_err(|e| anyhow::anyhow!("HMAC 初始化失败: {}", e))?;
        if index & HARDENED != 0 {
            mac.update(&[0u8]);
            mac.update(&key.secret_bytes());
        } else {
            mac.update(&PublicKey::from_secret_key_global(&key).serialize());
        }
        mac.update(&index.to_be_bytes());
        let out = mac.finalize().into_bytes();

        let mut tweak = [0u8; 32];
        tweak.copy_from_slice(&out[..32]);
        let tweak = Scalar::from_be_bytes(tweak)
            .map_err(|_| anyhow::anyhow!("derived tweak out of range at index {:#x}", index))?;
        key = key.add_tweak(&tweak)?;
        chain.copy_from_slice(&out[32..]);
    }
    Ok(key)
}

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(sha));
    out
}

/// 见证版本 0 的 bech32 地址
pub fn p2wpkh_address(pubkey_hash: &[u8; 20]) -> anyhow::Result<String> {
    let mut data = vec![u5::try_from_u8(0)?];
    data.extend(pubkey_hash.to_base32());
    Ok(bech32::encode("bc", data, Variant::Bech32)?)
}

/// 助记词 → 第一个收款地址
pub fn derive_address(mnemonic: &str, passphrase: &str, mode: SeedMode) -> anyhow::Result<String> {
    let seed = seed_bytes(mnemonic, passphrase, mode)?;
    let path: &[u32] = match mode {
        SeedMode::Bip39 => &BIP84_PATH,
        SeedMode::Electrum => &ELECTRUM_PATH,
    };
    let key = derive_private_key(&seed, path)?;
    let pubkey = PublicKey::from_secret_key_global(&key);
    p2wpkh_address(&hash160(&pubkey.serialize()))
}

/// 比对 GPU 样本与主机派生结果，不一致时返回 `AddressMismatch`
pub fn check_sample(
    sample: &VerifySample,
    passphrase: &str,
    mode: SeedMode,
    device: &str,
) -> anyhow::Result<String> {
    let mnemonic = sample.mnemonic();
    let kernel = sample.address();
    let host = derive_address(&mnemonic, passphrase, mode)?;
    if host != kernel {
        return Err(Error::AddressMismatch {
            device: device.to_string(),
            kernel,
            host,
        }
        .into());
    }
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ABOUT: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_bip84_first_address() {
        // BIP84 测试向量
        assert_eq!(
            derive_address(ABOUT, "", SeedMode::Bip39).unwrap(),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );
    }

    #[test]
    fn test_bip84_master_seed() {
        let seed = seed_bytes(ABOUT, "", SeedMode::Bip39).unwrap();
        assert_eq!(
            hex::encode(&seed[..16]),
            "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc19a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e4"[..32]
        );
    }

    #[test]
    fn test_electrum_seed_differs() {
        let bip = seed_bytes(ABOUT, "", SeedMode::Bip39).unwrap();
        let ele = seed_bytes(ABOUT, "", SeedMode::Electrum).unwrap();
        assert_ne!(bip, ele);
        // Electrum 不校验 BIP39 校验和
        assert!(seed_bytes("zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo", "", SeedMode::Electrum).is_ok());
        assert!(seed_bytes("zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo", "", SeedMode::Bip39).is_err());
    }

    #[test]
    fn test_normalize_whitespace_and_case() {
        let messy = "  ABANDON abandon\tabandon abandon abandon abandon abandon abandon abandon abandon abandon About ";
        assert_eq!(
            derive_address(messy, "", SeedMode::Bip39).unwrap(),
            derive_address(ABOUT, "", SeedMode::Bip39).unwrap()
        );
    }

    #[test]
    fn test_hash160_p2wpkh_vector() {
        // BIP173: 0279BE66...F81798 → bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4
        let pubkey = hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798").unwrap();
        let h = hash160(&pubkey);
        assert_eq!(hex::encode(h), "751e76e8199196d454941c45d1b3a323f1433bd6");
        assert_eq!(p2wpkh_address(&h).unwrap(), "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4");
    }

    #[test]
    fn test_check_sample_mismatch() {
        let mut sample = VerifySample::default();
        sample.mnemo[..ABOUT.len()].copy_from_slice(ABOUT.as_bytes());
        let good = b"bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
        sample.address[..good.len()].copy_from_slice(good);
        assert!(check_sample(&sample, "", SeedMode::Bip39, "GPU#0").is_ok());

        sample.address[5] = b'x';
        let err = check_sample(&sample, "", SeedMode::Bip39, "GPU#0").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::AddressMismatch { .. })
        ));
    }
}
