//! secp256k1 窗口标量乘预计算表
//!
//! 表项 i = (2i+1)·G 的仿射坐标 (x, y, P−y)，每个坐标 8 个小端 u32 字，
//! 最低有效字在前，每项共 24 个字。GPU 端用它做窗口化 NAF 标量乘。

use k256::{FieldBytes, FieldElement};

use crate::error::{Error, Result};

/// 每个表项的 u32 字数
pub const ENTRY_WORDS: usize = 24;

/// P - 2，Fermat 求逆的指数
const FIELD_P_MINUS_2: [u8; 32] = hex_bytes(
    b"FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFC2D",
);
pub const GX: [u8; 32] = hex_bytes(
    b"79BE667EF9DCBBAC55A06295CE870B07029BFCDB2DCE28D959F2815B16F81798",
);
pub const GY: [u8; 32] = hex_bytes(
    b"483ADA7726A3C4655DA4FBFC0E1108A8FD17B448A68554199C47D08FFB10D4B8",
);

const fn hex_bytes(s: &[u8; 64]) -> [u8; 32] {
    const fn nibble(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => panic!("invalid hex digit"),
        }
    }
    let mut out = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        out[i] = (nibble(s[2 * i]) << 4) | nibble(s[2 * i + 1]);
        i += 1;
    }
    out
}

fn fe(bytes: &[u8; 32]) -> FieldElement {
    // 常量均小于 P，from_bytes 不会失败
    Option::<FieldElement>::from(FieldElement::from_bytes(&FieldBytes::from(*bytes)))
        .unwrap_or(FieldElement::ZERO)
}

// 每一步都归一化，避免量级 (magnitude) 累积
fn add(a: &FieldElement, b: &FieldElement) -> FieldElement {
    (a.normalize() + b.normalize()).normalize()
}

fn sub(a: &FieldElement, b: &FieldElement) -> FieldElement {
    (a.normalize() + b.normalize().negate(1)).normalize()
}

fn mul(a: &FieldElement, b: &FieldElement) -> FieldElement {
    (a.normalize() * b.normalize()).normalize()
}

/// (P - a) mod P
fn neg(a: &FieldElement) -> FieldElement {
    a.normalize().negate(1).normalize()
}

fn to_be_bytes(a: &FieldElement) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&a.normalize().to_bytes());
    out
}

fn is_zero(a: &FieldElement) -> bool {
    to_be_bytes(a).iter().all(|&b| b == 0)
}

fn eq(a: &FieldElement, b: &FieldElement) -> bool {
    to_be_bytes(a) == to_be_bytes(b)
}

/// 模逆: a^(P-2) mod P
pub fn mod_inverse(a: &FieldElement) -> FieldElement {
    let mut result = fe(&{
        let mut one = [0u8; 32];
        one[31] = 1;
        one
    });
    for byte in FIELD_P_MINUS_2 {
        for bit in (0..8).rev() {
            result = mul(&result, &result);
            if (byte >> bit) & 1 == 1 {
                result = mul(&result, a);
            }
        }
    }
    result
}

/// 仿射坐标点，None 为无穷远点
#[derive(Debug, Clone, Copy)]
pub struct AffinePoint {
    pub x: FieldElement,
    pub y: FieldElement,
}

impl AffinePoint {
    pub fn generator() -> Self {
        Self {
            x: fe(&GX),
            y: fe(&GY),
        }
    }

    pub fn x_bytes(&self) -> [u8; 32] {
        to_be_bytes(&self.x)
    }

    pub fn y_bytes(&self) -> [u8; 32] {
        to_be_bytes(&self.y)
    }
}

pub fn point_double(p: Option<AffinePoint>) -> Option<AffinePoint> {
    let p = p?;
    if is_zero(&p.y) {
        return None;
    }
    let two_y = add(&p.y, &p.y);
    let x_sq = mul(&p.x, &p.x);
    let three_x_sq = add(&add(&x_sq, &x_sq), &x_sq);
    let lam = mul(&three_x_sq, &mod_inverse(&two_y));
    let x3 = sub(&sub(&mul(&lam, &lam), &p.x), &p.x);
    let y3 = sub(&mul(&lam, &sub(&p.x, &x3)), &p.y);
    Some(AffinePoint { x: x3, y: y3 })
}

pub fn point_add(p1: Option<AffinePoint>, p2: Option<AffinePoint>) -> Option<AffinePoint> {
    let (a, b) = match (p1, p2) {
        (None, q) | (q, None) => return q,
        (Some(a), Some(b)) => (a, b),
    };
    if eq(&a.x, &b.x) {
        if is_zero(&add(&a.y, &b.y)) {
            return None;
        }
        if eq(&a.y, &b.y) {
            return point_double(Some(a));
        }
    }
    let dx = sub(&b.x, &a.x);
    let dy = sub(&b.y, &a.y);
    let lam = mul(&dy, &mod_inverse(&dx));
    let x3 = sub(&sub(&mul(&lam, &lam), &a.x), &b.x);
    let y3 = sub(&mul(&lam, &sub(&a.x, &x3)), &a.y);
    Some(AffinePoint { x: x3, y: y3 })
}

/// 大端 32 字节 → 8 个小端 u32 字 (最低有效字在前)
pub fn to_u32_le_words(bytes: &[u8; 32]) -> [u32; 8] {
    let mut words = [0u32; 8];
    for (i, word) in words.iter_mut().enumerate() {
        let end = 32 - 4 * i;
        *word = u32::from_be_bytes([
            bytes[end - 4],
            bytes[end - 3],
            bytes[end - 2],
            bytes[end - 1],
        ]);
    }
    words
}

/// 预计算表
#[derive(Debug, Clone)]
pub struct EcTable {
    pub window: u32,
    pub words: Vec<u32>,
}

impl EcTable {
    pub fn len(&self) -> usize {
        self.words.len() / ENTRY_WORDS
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// 第 i 项的 (x, y, -y)
    pub fn entry(&self, i: usize) -> ([u32; 8], [u32; 8], [u32; 8]) {
        let base = i * ENTRY_WORDS;
        let mut out = [[0u32; 8]; 3];
        for (k, coord) in out.iter_mut().enumerate() {
            coord.copy_from_slice(&self.words[base + 8 * k..base + 8 * (k + 1)]);
        }
        (out[0], out[1], out[2])
    }
}

/// 构建窗口宽度为 `w` 的奇数倍点表，共 2^(w-1) 项
pub fn build_table(w: u32) -> Result<EcTable> {
    if w == 0 || w > 24 {
        return Err(Error::InvalidWindow(w));
    }
    let num_points = 1usize << (w - 1);
    let g = Some(AffinePoint::generator());
    let two_g = point_double(g);

    let mut words = Vec::with_capacity(num_points * ENTRY_WORDS);
    let mut cur = g;
    for _ in 0..num_points {
        // 奇数倍点不会是无穷远点 (n 为奇数且远大于表长)
        let Some(point) = cur else { break };
        words.extend_from_slice(&to_u32_le_words(&point.x_bytes()));
        words.extend_from_slice(&to_u32_le_words(&point.y_bytes()));
        words.extend_from_slice(&to_u32_le_words(&to_be_bytes(&neg(&point.y))));
        cur = point_add(cur, two_g);
    }

    Ok(EcTable { window: w, words })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_size() {
        assert_eq!(build_table(1).unwrap().len(), 1);
        assert_eq!(build_table(2).unwrap().words.len(), 2 * ENTRY_WORDS);
        assert_eq!(build_table(4).unwrap().len(), 8);
        assert!(matches!(build_table(0), Err(Error::InvalidWindow(0))));
    }

    #[test]
    fn test_first_entry_is_generator() {
        let table = build_table(2).unwrap();
        let (x, y, _) = table.entry(0);
        assert_eq!(x, to_u32_le_words(&GX));
        assert_eq!(y, to_u32_le_words(&GY));
        assert_eq!(x[0], 0x16F81798);
        assert_eq!(x[7], 0x79BE667E);
    }

    #[test]
    fn test_mod_inverse() {
        let g = AffinePoint::generator();
        let inv = mod_inverse(&g.x);
        let one = mul(&g.x, &inv);
        let mut expected = [0u8; 32];
        expected[31] = 1;
        assert_eq!(to_be_bytes(&one), expected);
    }

    #[test]
    fn test_double_equals_add_to_self() {
        let g = Some(AffinePoint::generator());
        let d = point_double(g).unwrap();
        let a = point_add(g, g).unwrap();
        assert_eq!(d.x_bytes(), a.x_bytes());
        assert_eq!(d.y_bytes(), a.y_bytes());
    }

    #[test]
    fn test_add_inverse_is_infinity() {
        let g = AffinePoint::generator();
        let minus_g = AffinePoint {
            x: g.x,
            y: neg(&g.y),
        };
        assert!(point_add(Some(g), Some(minus_g)).is_none());
    }
}
