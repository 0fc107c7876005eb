//! Realtime convolution worker
//!
//! Renders convolved stereo ahead of the audio callback: one source block
//! is read under the file mutex, convolved, folded to stereo, gain-scaled
//! and pushed into the SPSC ring as one atomic block. The callback only
//! ever touches the ring, so a convolution spike shows up as ring depth,
//! not as an audio-thread stall.
//!
//! Every worker run gets its own fresh ring; the producer end lives and
//! dies with the worker thread, the consumer end reaches the audio
//! callback through the engine's consumer mailbox.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::ring::RingProducer;

use super::PlaybackShared;

const RING_FULL_BACKOFF: Duration = Duration::from_millis(1);

/// Handle of a running worker
pub(super) struct WorkerHandle {
    pub thread: JoinHandle<()>,
}

/// Spawn the worker over its ring producer. `block_frames` is the engine
/// block size.
pub(super) fn spawn(
    shared: Arc<PlaybackShared>,
    producer: RingProducer,
    block_frames: usize,
) -> WorkerHandle {
    let thread = std::thread::Builder::new()
        .name("rt-convolver".to_string())
        .spawn(move || worker_loop(shared, producer, block_frames))
        .expect("failed to spawn rt-convolver thread");
    WorkerHandle { thread }
}

fn worker_loop(shared: Arc<PlaybackShared>, mut producer: RingProducer, block_frames: usize) {
    log::debug!("Realtime convolution worker started");

    let block_bytes = block_frames * 2 * std::mem::size_of::<f32>();
    let mut stereo = vec![0.0f32; block_frames * 2];
    let mut blocks_produced: usize = 0;

    loop {
        if shared.worker_stop.load(Ordering::Acquire) {
            break;
        }
        if producer.available_write() < block_bytes {
            std::thread::sleep(RING_FULL_BACKOFF);
            continue;
        }

        let mut finished = false;
        {
            let mut source = shared.source.lock().unwrap();
            let loop_enabled = shared.loop_enabled.load(Ordering::Relaxed);

            let mut frames = source.read_source_block(block_frames);
            if frames == 0 && loop_enabled {
                source.seek_start();
                frames = source.read_source_block(block_frames);
            }

            if frames == 0 {
                // True end of file: one silence block, then exit
                stereo.fill(0.0);
                finished = true;
            } else {
                source.zero_pad_input(frames, block_frames);
                source.convolve_block(block_frames);

                let gain = f32::from_bits(shared.gain_linear.load(Ordering::Relaxed));
                source.fold_to_stereo(&mut stereo, block_frames, gain);
            }
        }

        let written = producer.write(bytemuck::cast_slice(&stereo));
        debug_assert_eq!(written, block_bytes);

        blocks_produced += 1;
        if blocks_produced == super::REALTIME_PRIMING_CHUNKS || finished {
            shared.signal_worker_primed();
        }

        if finished {
            shared.playback_completed.store(true, Ordering::Release);
            log::debug!("Realtime worker reached end of file");
            break;
        }
    }

    // A stop before priming completed must not leave play() waiting
    shared.signal_worker_primed();
    shared.worker_running.store(false, Ordering::Release);
    log::debug!("Realtime convolution worker finished ({} blocks)", blocks_produced);
}
