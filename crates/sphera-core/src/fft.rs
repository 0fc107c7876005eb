//! Iterative radix-2 complex FFT with cached plans
//!
//! The matrix convolver transforms one block per input channel per audio
//! block, always at the same size, so the bit-reversal permutation and the
//! per-stage twiddle tables are computed once per size and shared
//! process-wide. Plans are immutable after construction; the cache is the
//! only process-wide state in the engine.
//!
//! The forward pass uses the stored twiddles; the inverse conjugates them
//! and divides by N at the end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use num_complex::Complex32;
use thiserror::Error;

/// Errors from plan construction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FftError {
    #[error("FFT size {0} is not a power of two")]
    NotPowerOfTwo(usize),

    #[error("FFT size {0} is too small (minimum 2)")]
    TooSmall(usize),
}

/// Check for a power of two
#[inline]
pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Precomputed transform of one size: bit-reversal permutation plus one
/// forward twiddle table of length `len / 2` per butterfly stage.
#[derive(Debug, PartialEq)]
pub struct FftPlan {
    size: usize,
    bit_reverse: Vec<u32>,
    /// stage_twiddles[s] holds the twiddles for butterfly length 2^(s+1)
    stage_twiddles: Vec<Vec<Complex32>>,
}

impl FftPlan {
    fn build(size: usize) -> Self {
        // Bit-reversal permutation, built incrementally
        let mut bit_reverse = vec![0u32; size];
        let mut j = 0usize;
        for i in 1..size {
            let mut bit = size >> 1;
            while j & bit != 0 {
                j ^= bit;
                bit >>= 1;
            }
            j ^= bit;
            bit_reverse[i] = j as u32;
        }

        let mut stage_twiddles = Vec::new();
        let mut len = 2usize;
        while len <= size {
            let half = len / 2;
            let step = -2.0 * std::f64::consts::PI / len as f64;
            let twiddles = (0..half)
                .map(|k| {
                    let angle = step * k as f64;
                    Complex32::new(angle.cos() as f32, angle.sin() as f32)
                })
                .collect();
            stage_twiddles.push(twiddles);
            len <<= 1;
        }

        Self {
            size,
            bit_reverse,
            stage_twiddles,
        }
    }

    /// Transform size this plan was built for
    pub fn size(&self) -> usize {
        self.size
    }

    /// In-place forward transform. `data.len()` must equal the plan size.
    pub fn forward(&self, data: &mut [Complex32]) {
        self.transform(data, false);
    }

    /// In-place inverse transform, including the 1/N scale.
    pub fn inverse(&self, data: &mut [Complex32]) {
        self.transform(data, true);
    }

    fn transform(&self, data: &mut [Complex32], inverse: bool) {
        assert_eq!(data.len(), self.size, "buffer length must match plan size");

        for i in 1..self.size {
            let j = self.bit_reverse[i] as usize;
            if i < j {
                data.swap(i, j);
            }
        }

        let mut len = 2usize;
        let mut stage = 0usize;
        while len <= self.size {
            let half = len / 2;
            let twiddles = &self.stage_twiddles[stage];

            let mut base = 0usize;
            while base < self.size {
                for k in 0..half {
                    let w = if inverse {
                        twiddles[k].conj()
                    } else {
                        twiddles[k]
                    };
                    let u = data[base + k];
                    let v = data[base + k + half] * w;
                    data[base + k] = u + v;
                    data[base + k + half] = u - v;
                }
                base += len;
            }

            len <<= 1;
            stage += 1;
        }

        if inverse {
            let scale = 1.0 / self.size as f32;
            for value in data.iter_mut() {
                *value *= scale;
            }
        }
    }
}

/// Fetch the shared plan for `size`, building it on first use.
pub fn plan(size: usize) -> Result<Arc<FftPlan>, FftError> {
    if size < 2 {
        return Err(FftError::TooSmall(size));
    }
    if !is_power_of_two(size) {
        return Err(FftError::NotPowerOfTwo(size));
    }

    static PLANS: OnceLock<Mutex<HashMap<usize, Arc<FftPlan>>>> = OnceLock::new();
    let cache = PLANS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut cache = cache.lock().expect("FFT plan cache poisoned");
    Ok(cache
        .entry(size)
        .or_insert_with(|| Arc::new(FftPlan::build(size)))
        .clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-4;

    fn close(a: Complex32, b: Complex32) -> bool {
        (a - b).norm() < EPS
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert_eq!(plan(0), Err(FftError::TooSmall(0)));
        assert_eq!(plan(1), Err(FftError::TooSmall(1)));
        assert_eq!(plan(12), Err(FftError::NotPowerOfTwo(12)));
        assert!(plan(1024).is_ok());
    }

    #[test]
    fn test_plans_are_shared() {
        let a = plan(256).unwrap();
        let b = plan(256).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_impulse_has_flat_spectrum() {
        let plan = plan(64).unwrap();
        let mut data = vec![Complex32::new(0.0, 0.0); 64];
        data[0] = Complex32::new(1.0, 0.0);

        plan.forward(&mut data);
        for bin in &data {
            assert!(close(*bin, Complex32::new(1.0, 0.0)));
        }
    }

    #[test]
    fn test_sine_concentrates_in_one_bin() {
        let n = 128;
        let plan = plan(n).unwrap();
        let freq_bin = 5;
        let mut data: Vec<Complex32> = (0..n)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * freq_bin as f32 * i as f32 / n as f32;
                Complex32::new(phase.cos(), 0.0)
            })
            .collect();

        plan.forward(&mut data);

        // A real cosine splits between bin k and bin N-k, each of height N/2
        assert!((data[freq_bin].re - n as f32 / 2.0).abs() < 1e-2);
        assert!((data[n - freq_bin].re - n as f32 / 2.0).abs() < 1e-2);
        for (i, bin) in data.iter().enumerate() {
            if i != freq_bin && i != n - freq_bin {
                assert!(bin.norm() < 1e-2, "unexpected energy in bin {}", i);
            }
        }
    }

    #[test]
    fn test_forward_inverse_roundtrip() {
        let plan = plan(512).unwrap();
        let original: Vec<Complex32> = (0..512)
            .map(|i| Complex32::new(((i * 37) % 91) as f32 / 91.0 - 0.5, 0.0))
            .collect();

        let mut data = original.clone();
        plan.forward(&mut data);
        plan.inverse(&mut data);

        for (a, b) in data.iter().zip(original.iter()) {
            assert!(close(*a, *b));
        }
    }

    #[test]
    fn test_linearity() {
        let plan = plan(64).unwrap();
        let a: Vec<Complex32> = (0..64)
            .map(|i| Complex32::new((i as f32 * 0.3).sin(), 0.0))
            .collect();
        let b: Vec<Complex32> = (0..64)
            .map(|i| Complex32::new((i as f32 * 1.7).cos(), 0.0))
            .collect();

        let mut sum: Vec<Complex32> = a.iter().zip(b.iter()).map(|(x, y)| x + y).collect();
        let mut fa = a.clone();
        let mut fb = b.clone();
        plan.forward(&mut sum);
        plan.forward(&mut fa);
        plan.forward(&mut fb);

        for i in 0..64 {
            assert!(close(sum[i], fa[i] + fb[i]));
        }
    }
}
