//! 84-input matrix convolution
//!
//! Uniform partitioned overlap-save convolution of the 84-channel array
//! signal against a preset impulse-response matrix. Each input channel keeps
//! a ring of frequency-domain history blocks; each output accumulates the
//! complex products of history against the pre-transformed IR partitions,
//! then one inverse FFT per output yields the time-domain block plus the
//! overlap tail carried into the next block.
//!
//! Latencies and costs are fixed at configure time: `process` does no
//! allocation and runs on the pre-render path as well as the realtime
//! worker thread.

mod ir;
mod ir_loader;
mod simd;

pub use ir::MatrixImpulseResponse;
pub use ir_loader::{BlobSource, DirBlobSource, IrError, IrLoader, IrPreset};

use num_complex::Complex32;
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;

use crate::fft::{self, FftPlan};
use crate::types::CHANNEL_COUNT;

/// Errors from convolver configuration
#[derive(Error, Debug)]
pub enum ConvolverError {
    #[error("impulse response matrix is not valid")]
    InvalidImpulseResponse,

    #[error("block size {0} is not a power of two")]
    BadBlockSize(usize),
}

/// Uniform partitioned overlap-save matrix convolver
pub struct MatrixConvolver {
    ir: Option<MatrixImpulseResponse>,
    plan: Option<Arc<FftPlan>>,
    block_size: usize,
    fft_size: usize,
    num_partitions: usize,
    num_outputs: usize,
    single_partition: bool,

    /// Pre-transformed IR spectra, `[in][partition][out]` × fft_size bins.
    /// That ordering keeps the inner accumulation walking contiguous memory
    /// while one history spectrum is hot.
    ir_spectra: Vec<Complex32>,
    /// Frequency-domain input history, `[in][partition]` × fft_size bins
    history: Vec<Complex32>,
    history_write_pos: usize,
    /// Per-output frequency accumulators, `[out]` × fft_size bins
    accumulators: Vec<Complex32>,
    /// Per-output overlap tails, `[out]` × block_size samples
    overlap: Vec<f32>,

    output_gain: f32,
    ready: bool,
    fallback_warned: bool,
}

impl MatrixConvolver {
    pub fn new() -> Self {
        Self {
            ir: None,
            plan: None,
            block_size: 0,
            fft_size: 0,
            num_partitions: 0,
            num_outputs: 0,
            single_partition: false,
            ir_spectra: Vec::new(),
            history: Vec::new(),
            history_write_pos: 0,
            accumulators: Vec::new(),
            overlap: Vec::new(),
            output_gain: 1.0,
            ready: false,
            fallback_warned: false,
        }
    }

    /// Configure for an IR matrix and processing block size.
    ///
    /// Pre-transforms every IR partition to the frequency domain (done in
    /// parallel, this is the expensive part of preset switching) and
    /// allocates all processing state. Any previous configuration is
    /// discarded; on error the convolver is left deconfigured.
    pub fn configure(
        &mut self,
        ir: MatrixImpulseResponse,
        block_size: usize,
    ) -> Result<(), ConvolverError> {
        self.deconfigure();

        if !ir.is_valid() {
            return Err(ConvolverError::InvalidImpulseResponse);
        }
        if block_size == 0 || !fft::is_power_of_two(block_size) {
            log::error!("Matrix convolver requires a power-of-two block size, got {}", block_size);
            return Err(ConvolverError::BadBlockSize(block_size));
        }

        let fft_size = block_size * 2;
        let num_partitions = ir.ir_length.div_ceil(block_size);
        let num_inputs = ir.num_input_channels;
        let num_outputs = ir.num_output_channels;

        let plan = fft::plan(fft_size).expect("fft_size is a power of two >= 4");

        let mut ir_spectra =
            vec![Complex32::default(); num_inputs * num_partitions * num_outputs * fft_size];

        // One spectrum per (in, partition, out); each is independent
        ir_spectra
            .par_chunks_mut(fft_size)
            .enumerate()
            .for_each(|(index, spectrum)| {
                let out_channel = index % num_outputs;
                let partition = (index / num_outputs) % num_partitions;
                let in_channel = index / (num_outputs * num_partitions);

                let source = ir.ir(out_channel, in_channel);
                let start = partition * block_size;
                let end = (start + block_size).min(source.len());
                for (bin, &coefficient) in spectrum.iter_mut().zip(&source[start..end]) {
                    *bin = Complex32::new(coefficient, 0.0);
                }
                plan.forward(spectrum);
            });

        self.history = vec![Complex32::default(); num_inputs * num_partitions * fft_size];
        self.accumulators = vec![Complex32::default(); num_outputs * fft_size];
        self.overlap = vec![0.0; num_outputs * block_size];
        self.ir_spectra = ir_spectra;
        self.history_write_pos = 0;
        self.block_size = block_size;
        self.fft_size = fft_size;
        self.num_partitions = num_partitions;
        self.num_outputs = num_outputs;
        self.single_partition = num_partitions == 1;
        self.plan = Some(plan);
        self.ready = true;

        log::debug!(
            "Matrix convolver configured: rate={}Hz, ir_length={}, partitions={}, fft_size={}, outputs={}",
            ir.sample_rate,
            ir.ir_length,
            num_partitions,
            fft_size,
            num_outputs
        );

        self.ir = Some(ir);
        self.reset();
        Ok(())
    }

    /// Drop all processing state and return to the unconfigured fallback.
    pub fn deconfigure(&mut self) {
        self.ir = None;
        self.plan = None;
        self.ir_spectra.clear();
        self.history.clear();
        self.accumulators.clear();
        self.overlap.clear();
        self.block_size = 0;
        self.fft_size = 0;
        self.num_partitions = 0;
        self.num_outputs = 0;
        self.history_write_pos = 0;
        self.ready = false;
    }

    /// Zero history blocks and overlap tails without freeing anything.
    pub fn reset(&mut self) {
        self.history.fill(Complex32::default());
        self.overlap.fill(0.0);
        self.history_write_pos = 0;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Output channel count, 0 when unconfigured
    pub fn output_channels(&self) -> usize {
        self.num_outputs
    }

    /// Runtime output gain applied when emitting time-domain samples
    pub fn set_output_gain(&mut self, gain: f32) {
        self.output_gain = gain;
    }

    pub fn output_gain(&self) -> f32 {
        self.output_gain
    }

    /// Convolve one block.
    ///
    /// `input` is interleaved 84-channel audio of exactly `num_frames`
    /// frames; `output` receives `num_frames` interleaved frames across the
    /// configured output channels. If the convolver is not ready or
    /// `num_frames` differs from the configured block size, input channel 0
    /// is copied to every output instead (audible passthrough) and a single
    /// warning is logged.
    pub fn process(&mut self, input: &[f32], output: &mut [f32], num_frames: usize) {
        if !self.ready || num_frames != self.block_size {
            if !self.fallback_warned {
                log::warn!(
                    "Matrix convolver fallback engaged (ready={}, frames={}, block={})",
                    self.ready,
                    num_frames,
                    self.block_size
                );
                self.fallback_warned = true;
            }
            self.fallback_passthrough(input, output, num_frames);
            return;
        }

        let num_inputs = CHANNEL_COUNT;
        let fft_size = self.fft_size;
        let block_size = self.block_size;
        let num_outputs = self.num_outputs;
        let num_partitions = self.num_partitions;
        let plan = self.plan.as_ref().expect("ready implies plan");

        self.accumulators.fill(Complex32::default());

        for in_channel in 0..num_inputs {
            let history_base = in_channel * num_partitions * fft_size;
            let slot = self.history_write_pos;

            // Deinterleave this channel into the newest history slot, zero
            // the high half, transform in place
            {
                let spectrum =
                    &mut self.history[history_base + slot * fft_size..history_base + (slot + 1) * fft_size];
                for frame in 0..block_size {
                    spectrum[frame] = Complex32::new(input[frame * num_inputs + in_channel], 0.0);
                }
                spectrum[block_size..].fill(Complex32::default());
                plan.forward(spectrum);
            }

            let ir_base = in_channel * num_partitions * num_outputs * fft_size;
            if self.single_partition {
                let spectrum = &self.history[history_base..history_base + fft_size];
                for out_channel in 0..num_outputs {
                    let ir_start = ir_base + out_channel * fft_size;
                    simd::accumulate(
                        spectrum,
                        &self.ir_spectra[ir_start..ir_start + fft_size],
                        &mut self.accumulators[out_channel * fft_size..(out_channel + 1) * fft_size],
                    );
                }
            } else {
                for partition in 0..num_partitions {
                    let history_index =
                        (slot + num_partitions - partition) % num_partitions;
                    let spectrum = &self.history
                        [history_base + history_index * fft_size..history_base + (history_index + 1) * fft_size];
                    let partition_base = ir_base + partition * num_outputs * fft_size;
                    for out_channel in 0..num_outputs {
                        let ir_start = partition_base + out_channel * fft_size;
                        simd::accumulate(
                            spectrum,
                            &self.ir_spectra[ir_start..ir_start + fft_size],
                            &mut self.accumulators
                                [out_channel * fft_size..(out_channel + 1) * fft_size],
                        );
                    }
                }
            }
        }

        if !self.single_partition {
            self.history_write_pos = (self.history_write_pos + 1) % num_partitions;
        }

        // Back to the time domain, add the retained tails, emit interleaved
        let gain = self.output_gain;
        for out_channel in 0..num_outputs {
            let accumulator =
                &mut self.accumulators[out_channel * fft_size..(out_channel + 1) * fft_size];
            plan.inverse(accumulator);

            let overlap = &mut self.overlap[out_channel * block_size..(out_channel + 1) * block_size];
            for frame in 0..block_size {
                let sample = (accumulator[frame].re + overlap[frame]) * gain;
                output[frame * num_outputs + out_channel] = sample;
            }
            for frame in 0..block_size {
                overlap[frame] = accumulator[frame + block_size].re;
            }
        }
    }

    fn fallback_passthrough(&self, input: &[f32], output: &mut [f32], num_frames: usize) {
        if num_frames == 0 || output.is_empty() {
            return;
        }
        let num_inputs = self
            .ir
            .as_ref()
            .map(|ir| ir.num_input_channels)
            .unwrap_or(CHANNEL_COUNT);
        let num_outputs = output.len() / num_frames;

        for frame in 0..num_frames {
            let sample = input.get(frame * num_inputs).copied().unwrap_or(0.0);
            for out_channel in 0..num_outputs {
                output[frame * num_outputs + out_channel] = sample;
            }
        }
    }
}

impl Default for MatrixConvolver {
    fn default() -> Self {
        Self::new()
    }
}
