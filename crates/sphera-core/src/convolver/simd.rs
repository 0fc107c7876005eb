//! Complex multiply-accumulate inner loop
//!
//! `accumulate` computes `acc[k] += input[k] * ir[k]` over whole spectra.
//! With 84 inputs × N outputs × P partitions this loop dominates the
//! convolver's cost, so aarch64 gets a NEON specialization (4 complexes per
//! iteration); everything else takes the scalar path.

use num_complex::Complex32;

/// `acc[k] += input[k] * ir[k]` for all `k`
#[inline]
pub fn accumulate(input: &[Complex32], ir: &[Complex32], acc: &mut [Complex32]) {
    debug_assert_eq!(input.len(), acc.len());
    debug_assert_eq!(ir.len(), acc.len());

    #[cfg(target_arch = "aarch64")]
    {
        // Safety: neon is baseline on aarch64
        unsafe { accumulate_neon(input, ir, acc) };
        return;
    }

    #[cfg(not(target_arch = "aarch64"))]
    accumulate_scalar(input, ir, acc);
}

#[allow(dead_code)]
#[inline]
fn accumulate_scalar(input: &[Complex32], ir: &[Complex32], acc: &mut [Complex32]) {
    for ((a, i), r) in acc.iter_mut().zip(input.iter()).zip(ir.iter()) {
        *a += i * r;
    }
}

/// Interleaved complex MLA on q registers, two complexes per vector and two
/// vectors per iteration.
///
/// For x = a+bi, y = c+di laid out `[a, b]`, `[c, d]`:
///   re += a*c - b*d
///   im += a*d + b*c
/// which vectorizes as
///   acc += x        * dup_even(y)      -> [a*c, b*c]
///   acc += rev64(x) * sign * dup_odd(y) -> [-b*d, a*d]
#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn accumulate_neon(input: &[Complex32], ir: &[Complex32], acc: &mut [Complex32]) {
    use std::arch::aarch64::*;

    let len = acc.len();
    let simd_len = len & !3; // 4 complexes (two q registers) per iteration

    let input_ptr = input.as_ptr() as *const f32;
    let ir_ptr = ir.as_ptr() as *const f32;
    let acc_ptr = acc.as_mut_ptr() as *mut f32;

    const SIGN: [f32; 4] = [-1.0, 1.0, -1.0, 1.0];
    let sign = vld1q_f32(SIGN.as_ptr());

    let mut k = 0usize;
    while k < simd_len {
        let base = k * 2;

        let x0 = vld1q_f32(input_ptr.add(base));
        let x1 = vld1q_f32(input_ptr.add(base + 4));
        let y0 = vld1q_f32(ir_ptr.add(base));
        let y1 = vld1q_f32(ir_ptr.add(base + 4));
        let mut a0 = vld1q_f32(acc_ptr.add(base));
        let mut a1 = vld1q_f32(acc_ptr.add(base + 4));

        a0 = vfmaq_f32(a0, x0, vtrn1q_f32(y0, y0));
        a1 = vfmaq_f32(a1, x1, vtrn1q_f32(y1, y1));
        a0 = vfmaq_f32(a0, vmulq_f32(vrev64q_f32(x0), sign), vtrn2q_f32(y0, y0));
        a1 = vfmaq_f32(a1, vmulq_f32(vrev64q_f32(x1), sign), vtrn2q_f32(y1, y1));

        vst1q_f32(acc_ptr.add(base), a0);
        vst1q_f32(acc_ptr.add(base + 4), a1);

        k += 4;
    }

    if k < len {
        accumulate_scalar(&input[k..], &ir[k..], &mut acc[k..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_reference() {
        // Odd length exercises the remainder path on aarch64
        let n = 37;
        let input: Vec<Complex32> = (0..n)
            .map(|i| Complex32::new((i as f32 * 0.7).sin(), (i as f32 * 1.3).cos()))
            .collect();
        let ir: Vec<Complex32> = (0..n)
            .map(|i| Complex32::new((i as f32 * 0.2).cos(), (i as f32 * 0.9).sin()))
            .collect();
        let mut acc: Vec<Complex32> = (0..n)
            .map(|i| Complex32::new(i as f32 * 0.01, -(i as f32) * 0.02))
            .collect();

        let mut expected = acc.clone();
        for i in 0..n {
            expected[i] += input[i] * ir[i];
        }

        accumulate(&input, &ir, &mut acc);

        for i in 0..n {
            assert!(
                (acc[i] - expected[i]).norm() < 1e-5,
                "mismatch at {}: {:?} vs {:?}",
                i,
                acc[i],
                expected[i]
            );
        }
    }

    #[test]
    fn test_accumulates_over_calls() {
        let input = vec![Complex32::new(1.0, 1.0); 8];
        let ir = vec![Complex32::new(0.5, 0.0); 8];
        let mut acc = vec![Complex32::new(0.0, 0.0); 8];

        accumulate(&input, &ir, &mut acc);
        accumulate(&input, &ir, &mut acc);

        for a in &acc {
            assert!((*a - Complex32::new(1.0, 1.0)).norm() < 1e-6);
        }
    }
}
