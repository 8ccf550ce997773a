//! Parity coders for stripe redundancy.
//!
//! A stripe holds `k` data blocks and `m` parity blocks. The coders here
//! produce the parity lanes and rebuild lost lanes, for `m = 0` (none),
//! `m = 1` (XOR), `m = 2` (dual parity), and general `m`
//! (Reed–Solomon).
//!
//! # Arithmetic
//!
//! Reed–Solomon runs over GF(2^8) with the reduction polynomial
//! `0x11d` and a **systematic Vandermonde** generator: parity row `i`
//! applies coefficient `(j+1)^i` to data lane `j`. Row 0 is all ones,
//! so the first parity lane is byte-identical to plain XOR parity — a
//! single-parity RS stripe and an XOR stripe are the same bytes on
//! disk.
//!
//! Dual parity (`m = 2`) is the two-row instantiation of the same
//! code: lane 0 is the XOR lane, lane 1 carries the independent
//! Vandermonde equation that makes two lost data lanes recoverable
//! (two copies of the XOR lane could not).
//!
//! # Reconstruction
//!
//! With `e ≤ m` erased lanes, decoding picks `k` surviving rows of the
//! `(k+m)×k` generator, inverts that square system over GF(2^8), and
//! re-derives the erased data lanes byte-parallel; erased parity lanes
//! are then re-encoded. More than `m` erasures is reported as
//! unrecoverable.

use std::sync::OnceLock;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced by parity encoding / reconstruction.
#[derive(Debug, Error)]
pub enum ParityError {
    /// More lanes are lost than the parity can rebuild.
    #[error("unrecoverable: {erasures} erasures with m={parity_lanes}")]
    TooManyErasures {
        /// Number of erased lanes.
        erasures: usize,
        /// Parity lanes available.
        parity_lanes: usize,
    },

    /// Lane buffers disagree on length.
    #[error("lane length mismatch")]
    LaneLengthMismatch,

    /// Lane counts do not match the coder's geometry.
    #[error("lane count mismatch: {0}")]
    Geometry(&'static str),

    /// The survivor matrix was singular (cannot happen for m ≤ 2 with
    /// distinct lanes; surfaced rather than panicking for larger m).
    #[error("survivor matrix not invertible")]
    SingularMatrix,
}

// ------------------------------------------------------------------------------------------------
// GF(2^8) tables — polynomial 0x11d, generator 2
// ------------------------------------------------------------------------------------------------

struct GfTables {
    /// `exp[i] = 2^i`, doubled to 512 entries so products skip a modulo.
    exp: [u8; 512],
    /// `log[x]` for x ≠ 0.
    log: [u8; 256],
}

fn tables() -> &'static GfTables {
    static TABLES: OnceLock<GfTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= 0x11d;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        GfTables { exp, log }
    })
}

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

#[inline]
fn gf_inv(a: u8) -> Option<u8> {
    if a == 0 {
        return None;
    }
    let t = tables();
    Some(t.exp[255 - t.log[a as usize] as usize])
}

/// `base^exp` in GF(2^8).
#[inline]
fn gf_pow(base: u8, exp: usize) -> u8 {
    if exp == 0 {
        return 1;
    }
    if base == 0 {
        return 0;
    }
    let t = tables();
    let log = t.log[base as usize] as usize;
    t.exp[(log * exp) % 255]
}

/// XORs `src` into `dst` byte-parallel over `u64` words.
#[inline]
fn xor_into(dst: &mut [u8], src: &[u8]) {
    let (dst_words, dst_tail) = dst.split_at_mut(src.len() / 8 * 8);
    let (src_words, src_tail) = src.split_at(src.len() / 8 * 8);
    for (d, s) in dst_words.chunks_exact_mut(8).zip(src_words.chunks_exact(8)) {
        let x = u64::from_ne_bytes([d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]])
            ^ u64::from_ne_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]);
        d.copy_from_slice(&x.to_ne_bytes());
    }
    for (d, s) in dst_tail.iter_mut().zip(src_tail) {
        *d ^= s;
    }
}

/// Multiply-accumulate: `dst ^= coeff * src`, element-wise in GF(2^8).
#[inline]
fn mul_acc(dst: &mut [u8], src: &[u8], coeff: u8) {
    match coeff {
        0 => {}
        1 => xor_into(dst, src),
        _ => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= gf_mul(coeff, *s);
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// ParityKind — configuration-level selector
// ------------------------------------------------------------------------------------------------

/// Parity scheme for a stripe set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityKind {
    /// No redundancy (m = 0).
    None,

    /// Single XOR parity lane (m = 1).
    Xor,

    /// Dual parity (m = 2): XOR lane plus one Vandermonde lane.
    DualXor,

    /// Reed–Solomon with the given number of parity lanes.
    Rs(u8),
}

impl ParityKind {
    /// Number of parity lanes (`m`) for this scheme.
    pub fn parity_lanes(&self) -> usize {
        match self {
            ParityKind::None => 0,
            ParityKind::Xor => 1,
            ParityKind::DualXor => 2,
            ParityKind::Rs(m) => *m as usize,
        }
    }

    /// Builds the coder for `k` data lanes.
    pub fn coder(&self, k: usize) -> ParityCoder {
        ParityCoder {
            k,
            m: self.parity_lanes(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// ParityCoder
// ------------------------------------------------------------------------------------------------

/// Encoder/decoder for one stripe geometry (`k` data + `m` parity lanes).
///
/// All schemes share the systematic Vandermonde code; `m = 1`
/// degenerates to XOR (row 0 is all ones) and takes the byte-parallel
/// fast path.
#[derive(Debug, Clone)]
pub struct ParityCoder {
    k: usize,
    m: usize,
}

impl ParityCoder {
    /// Data lanes per stripe.
    pub fn data_lanes(&self) -> usize {
        self.k
    }

    /// Parity lanes per stripe.
    pub fn parity_lanes(&self) -> usize {
        self.m
    }

    /// Generator coefficient for parity row `row`, data lane `lane`:
    /// `(lane+1)^row`. Row 0 is all ones (XOR).
    #[inline]
    fn coeff(row: usize, lane: usize) -> u8 {
        gf_pow((lane + 1) as u8, row)
    }

    /// Computes all parity lanes from `data` into `parity_out`.
    ///
    /// Every slice must have the same length; `parity_out` buffers are
    /// overwritten.
    pub fn encode_into(&self, data: &[&[u8]], parity_out: &mut [Vec<u8>]) -> Result<(), ParityError> {
        if data.len() != self.k {
            return Err(ParityError::Geometry("data lane count"));
        }
        if parity_out.len() != self.m {
            return Err(ParityError::Geometry("parity lane count"));
        }
        if self.m == 0 {
            return Ok(());
        }
        let len = data.first().map(|lane| lane.len()).unwrap_or(0);
        if data.iter().any(|lane| lane.len() != len) {
            return Err(ParityError::LaneLengthMismatch);
        }

        for (row, out) in parity_out.iter_mut().enumerate() {
            out.clear();
            out.resize(len, 0);
            for (lane, src) in data.iter().enumerate() {
                mul_acc(out, src, Self::coeff(row, lane));
            }
        }
        Ok(())
    }

    /// Checks that `parity` matches `data`.
    pub fn verify(&self, data: &[&[u8]], parity: &[&[u8]]) -> Result<bool, ParityError> {
        let mut expected: Vec<Vec<u8>> = vec![Vec::new(); self.m];
        self.encode_into(data, &mut expected)?;
        if parity.len() != self.m {
            return Err(ParityError::Geometry("parity lane count"));
        }
        Ok(expected
            .iter()
            .zip(parity)
            .all(|(computed, stored)| computed.as_slice() == *stored))
    }

    /// Rebuilds erased lanes in place.
    ///
    /// `data` has `k` entries and `parity` has `m`; `None` marks an
    /// erased lane. `block_len` is the common lane length. Returns the
    /// number of lanes rebuilt. Fails when erasures exceed `m`.
    pub fn reconstruct(
        &self,
        data: &mut [Option<Vec<u8>>],
        parity: &mut [Option<Vec<u8>>],
        block_len: usize,
    ) -> Result<usize, ParityError> {
        if data.len() != self.k {
            return Err(ParityError::Geometry("data lane count"));
        }
        if parity.len() != self.m {
            return Err(ParityError::Geometry("parity lane count"));
        }
        let lost_data: Vec<usize> = (0..self.k).filter(|&i| data[i].is_none()).collect();
        let lost_parity: Vec<usize> = (0..self.m).filter(|&i| parity[i].is_none()).collect();
        let erasures = lost_data.len() + lost_parity.len();
        if erasures == 0 {
            return Ok(0);
        }
        if erasures > self.m {
            return Err(ParityError::TooManyErasures {
                erasures,
                parity_lanes: self.m,
            });
        }
        for lane in data.iter().flatten() {
            if lane.len() != block_len {
                return Err(ParityError::LaneLengthMismatch);
            }
        }
        for lane in parity.iter().flatten() {
            if lane.len() != block_len {
                return Err(ParityError::LaneLengthMismatch);
            }
        }

        if !lost_data.is_empty() {
            self.rebuild_data(data, parity, &lost_data, block_len)?;
        }

        // Re-encode any erased parity lanes from the (now complete) data.
        if !lost_parity.is_empty() {
            let data_refs: Vec<&[u8]> = data
                .iter()
                .map(|lane| lane.as_deref().unwrap_or(&[]))
                .collect();
            let mut full: Vec<Vec<u8>> = vec![Vec::new(); self.m];
            self.encode_into(&data_refs, &mut full)?;
            for (row, rebuilt) in full.into_iter().enumerate() {
                if parity[row].is_none() {
                    parity[row] = Some(rebuilt);
                }
            }
        }

        Ok(erasures)
    }

    /// Solves for the erased data lanes from `k` surviving rows of the
    /// systematic generator.
    fn rebuild_data(
        &self,
        data: &mut [Option<Vec<u8>>],
        parity: &[Option<Vec<u8>>],
        lost_data: &[usize],
        block_len: usize,
    ) -> Result<(), ParityError> {
        // Survivor rows: identity rows for present data lanes, then
        // parity rows until we have k equations.
        let mut rows: Vec<(Vec<u8>, usize, bool)> = Vec::with_capacity(self.k);
        for lane in 0..self.k {
            if data[lane].is_some() {
                let mut row = vec![0u8; self.k];
                row[lane] = 1;
                rows.push((row, lane, true));
            }
        }
        for p_row in 0..self.m {
            if rows.len() == self.k {
                break;
            }
            if parity[p_row].is_some() {
                let row = (0..self.k).map(|lane| Self::coeff(p_row, lane)).collect();
                rows.push((row, p_row, false));
            }
        }
        if rows.len() < self.k {
            return Err(ParityError::TooManyErasures {
                erasures: lost_data.len(),
                parity_lanes: self.m,
            });
        }

        // Invert the k×k survivor matrix by Gauss–Jordan over GF(2^8).
        let k = self.k;
        let mut matrix: Vec<Vec<u8>> = rows.iter().map(|(row, _, _)| row.clone()).collect();
        let mut inverse: Vec<Vec<u8>> = (0..k)
            .map(|i| {
                let mut row = vec![0u8; k];
                row[i] = 1;
                row
            })
            .collect();

        for col in 0..k {
            // Pivot.
            let pivot = (col..k)
                .find(|&r| matrix[r][col] != 0)
                .ok_or(ParityError::SingularMatrix)?;
            matrix.swap(col, pivot);
            inverse.swap(col, pivot);

            let inv_pivot = gf_inv(matrix[col][col]).ok_or(ParityError::SingularMatrix)?;
            for j in 0..k {
                matrix[col][j] = gf_mul(matrix[col][j], inv_pivot);
                inverse[col][j] = gf_mul(inverse[col][j], inv_pivot);
            }
            for r in 0..k {
                if r == col || matrix[r][col] == 0 {
                    continue;
                }
                let factor = matrix[r][col];
                for j in 0..k {
                    matrix[r][j] ^= gf_mul(factor, matrix[col][j]);
                    inverse[r][j] ^= gf_mul(factor, inverse[col][j]);
                }
            }
        }

        // d = inverse * s, computed only for the lost lanes.
        for &lane in lost_data {
            let mut rebuilt = vec![0u8; block_len];
            for (idx, (_, source, is_data)) in rows.iter().enumerate() {
                let coeff = inverse[lane][idx];
                if coeff == 0 {
                    continue;
                }
                let survivor: &[u8] = if *is_data {
                    data[*source].as_deref().ok_or(ParityError::SingularMatrix)?
                } else {
                    parity[*source].as_deref().ok_or(ParityError::SingularMatrix)?
                };
                mul_acc(&mut rebuilt, survivor, coeff);
            }
            data[lane] = Some(rebuilt);
        }
        Ok(())
    }
}
