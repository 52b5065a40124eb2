//! CRC-64 checksums for end-to-end object verification
//!
//! Object stores publish a 64-bit CRC over the ECMA-182 polynomial in its
//! reflected form, with an all-ones initial value and final xor (the
//! CRC-64/XZ parameter set). Parts are hashed independently by upload workers
//! and later folded together in part order with [`crc64_combine`], so the
//! whole-object value never requires a second pass over the data.

use crc::{Crc, Digest, CRC_64_XZ};

/// Shared CRC-64 engine (table built at compile time)
pub static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Reflected ECMA-182 polynomial
const POLY_REFLECTED: u64 = 0xC96C_5795_D787_0F42;

/// CRC-64 of a complete buffer
pub fn crc64(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

/// Streaming CRC-64 over a byte sequence delivered in pieces
#[derive(Clone)]
pub struct Crc64Hasher {
    digest: Digest<'static, u64>,
    len: u64,
}

impl Crc64Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
            len: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.len += data.len() as u64;
    }

    /// Checksum of everything seen so far
    pub fn value(&self) -> u64 {
        self.digest.clone().finalize()
    }

    /// Number of bytes hashed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for Crc64Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Crc64Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crc64Hasher")
            .field("value", &self.value())
            .field("len", &self.len)
            .finish()
    }
}

/// Folds independently computed CRC-64 values into a whole-object value.
///
/// Values must be pushed in object order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumAccumulator {
    crc: u64,
    len: u64,
}

impl ChecksumAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment of `len` bytes whose CRC-64 is `crc`
    pub fn push(&mut self, crc: u64, len: u64) {
        self.crc = crc64_combine(self.crc, crc, len);
        self.len += len;
    }

    pub fn value(&self) -> u64 {
        self.crc
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// CRC-64 of `A || B` given `crc(A)`, `crc(B)` and `len(B)`.
///
/// Applies `len2` zero bytes to `crc1` through repeated squaring of the
/// GF(2) shift operator, then xors in `crc2`.
pub fn crc64_combine(mut crc1: u64, crc2: u64, mut len2: u64) -> u64 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u64; 64];
    let mut odd = [0u64; 64];

    // Operator for one zero bit
    odd[0] = POLY_REFLECTED;
    let mut row = 1u64;
    for slot in odd.iter_mut().skip(1) {
        *slot = row;
        row <<= 1;
    }

    // Two zero bits, then four
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    // First squaring below yields the one-byte operator
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

fn gf2_matrix_times(mat: &[u64; 64], mut vec: u64) -> u64 {
    let mut sum = 0u64;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u64; 64], mat: &[u64; 64]) {
    for (n, slot) in square.iter_mut().enumerate() {
        *slot = gf2_matrix_times(mat, mat[n]);
    }
}
