use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::bitstream::{NAL_TYPE_IDR, annexb_nal_units, nal_type};
use crate::pipeline::{
    BoundedQueueRx, BoundedQueueTx, InFlightCredits, QueueRecvError, QueueStats, bounded_queue,
};
use crate::{DecodeError, DeviceCodec, Dimensions, HardwareDevice, Picture, Result, Timestamp90k};

const WORKER_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub input_capacity: usize,
    /// Output buffers shared by ready and handed-out pictures.
    pub output_buffers: usize,
    pub frame_duration: Duration,
    pub decode_latency: Duration,
    pub dims: Option<Dimensions>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            input_capacity: 4,
            output_buffers: 12,
            frame_duration: Duration::from_micros(33_367),
            decode_latency: Duration::ZERO,
            dims: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub decoded: usize,
    pub dropped: usize,
    pub input: QueueStats,
    pub ready: QueueStats,
}

#[derive(Debug)]
enum DeviceTask {
    Input {
        generation: u64,
        data: Vec<u8>,
        dts: Option<Timestamp90k>,
        pts: Option<Timestamp90k>,
    },
    Shutdown,
}

#[derive(Debug)]
struct DecodedPicture {
    generation: u64,
    picture: Picture,
}

#[derive(Debug)]
struct SharedState {
    generation: AtomicU64,
    /// Held while a picture is checked against the current generation and
    /// queued, and while `reset` bumps the generation and drains the output.
    output_gate: Mutex<()>,
    drop_mode: AtomicBool,
    shutdown: AtomicBool,
    credits: InFlightCredits,
    decoded: AtomicUsize,
    dropped: AtomicUsize,
}

#[derive(Debug)]
struct Running {
    codec: DeviceCodec,
    in_tx: BoundedQueueTx<DeviceTask>,
    out_rx: BoundedQueueRx<DecodedPicture>,
    shared: Arc<SharedState>,
    worker: Option<JoinHandle<()>>,
    /// Pictures handed to the consumer and not yet recycled.
    busy: usize,
}

/// In-process stand-in for a hardware decoder: a worker thread pulls access
/// units from a bounded input queue and turns each into a picture carrying
/// the submitted bitstream.
#[derive(Debug, Default)]
pub struct LoopbackDevice {
    config: LoopbackConfig,
    running: Option<Running>,
}

impl LoopbackDevice {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.running.is_some()
    }

    pub fn codec(&self) -> Option<DeviceCodec> {
        self.running.as_ref().map(|running| running.codec)
    }

    pub fn stats(&self) -> LoopbackStats {
        match &self.running {
            Some(running) => LoopbackStats {
                decoded: running.shared.decoded.load(Ordering::Relaxed),
                dropped: running.shared.dropped.load(Ordering::Relaxed),
                input: running.in_tx.stats(),
                ready: running.out_rx.stats(),
            },
            None => LoopbackStats::default(),
        }
    }

    fn shutdown(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        running.shared.shutdown.store(true, Ordering::Release);
        let _ = running.in_tx.try_send(DeviceTask::Shutdown);
        if let Some(worker) = running.worker.take() {
            let _ = worker.join();
        }
        debug!(codec = %running.codec, "loopback decoder closed");
    }
}

impl HardwareDevice for LoopbackDevice {
    fn open_decoder(&mut self, codec: DeviceCodec, _codec_config: &[u8]) -> Result<()> {
        if self.running.is_some() {
            return Err(DecodeError::DeviceOpen("decoder already open".to_string()));
        }

        let (in_tx, in_rx) = bounded_queue(self.config.input_capacity);
        let (out_tx, out_rx) = bounded_queue(self.config.output_buffers);
        let shared = Arc::new(SharedState {
            generation: AtomicU64::new(0),
            output_gate: Mutex::new(()),
            drop_mode: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            credits: InFlightCredits::new(self.config.output_buffers),
            decoded: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let config = self.config.clone();
        let worker = thread::Builder::new()
            .name("loopback-decoder".to_string())
            .spawn(move || run_decoder(codec, config, in_rx, out_tx, worker_shared))
            .map_err(|err| DecodeError::DeviceOpen(format!("worker spawn failed: {err}")))?;

        debug!(%codec, "loopback decoder opened");
        self.running = Some(Running {
            codec,
            in_tx,
            out_rx,
            shared,
            worker: Some(worker),
            busy: 0,
        });
        Ok(())
    }

    fn close_decoder(&mut self) {
        self.shutdown();
    }

    fn add_input(
        &mut self,
        data: &[u8],
        dts: Option<Timestamp90k>,
        pts: Option<Timestamp90k>,
    ) -> bool {
        let Some(running) = self.running.as_ref() else {
            return false;
        };
        let task = DeviceTask::Input {
            generation: running.shared.generation.load(Ordering::Acquire),
            data: data.to_vec(),
            dts,
            pts,
        };
        running.in_tx.try_send(task).is_ok()
    }

    fn input_count(&self) -> u32 {
        self.running
            .as_ref()
            .map_or(0, |running| saturating_u32(running.in_tx.depth()))
    }

    fn ready_count(&self) -> u32 {
        self.running
            .as_ref()
            .map_or(0, |running| saturating_u32(running.out_rx.depth()))
    }

    fn flush_completed(&mut self) {
        if let Some(running) = self.running.as_mut() {
            running.shared.credits.release(running.busy);
            running.busy = 0;
        }
    }

    fn fetch_picture(&mut self) -> Option<Picture> {
        let running = self.running.as_mut()?;
        let generation = running.shared.generation.load(Ordering::Acquire);
        loop {
            let decoded = running.out_rx.try_recv().ok()?;
            if decoded.generation == generation {
                running.busy += 1;
                return Some(decoded.picture);
            }
            running.shared.credits.release(1);
        }
    }

    fn reset(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        let stale = {
            let _gate = lock_output(&running.shared);
            running.shared.generation.fetch_add(1, Ordering::AcqRel);
            running.out_rx.drain()
        };
        running.shared.credits.release(stale.len());
        debug!(discarded = stale.len(), "loopback decoder reset");
    }

    fn set_drop_mode(&mut self, drop: bool) {
        if let Some(running) = self.running.as_ref() {
            running.shared.drop_mode.store(drop, Ordering::Release);
        }
    }

    fn wait_for_input_capacity(&mut self, timeout: Duration) {
        let Some(running) = self.running.as_ref() else {
            return;
        };
        // Returns once the worker has taken an input or produced a picture.
        let entry_input = running.in_tx.depth();
        let entry_ready = running.out_rx.depth();
        let deadline = Instant::now() + timeout;
        loop {
            if running.in_tx.depth() < entry_input || running.out_rx.depth() > entry_ready {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(WORKER_POLL.min(deadline - now));
        }
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_output(shared: &SharedState) -> MutexGuard<'_, ()> {
    shared
        .output_gate
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn saturating_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn run_decoder(
    codec: DeviceCodec,
    config: LoopbackConfig,
    in_rx: BoundedQueueRx<DeviceTask>,
    out_tx: BoundedQueueTx<DecodedPicture>,
    shared: Arc<SharedState>,
) {
    while !shared.shutdown.load(Ordering::Acquire) {
        let task = match in_rx.recv_timeout(WORKER_POLL) {
            Ok(task) => task,
            Err(QueueRecvError::Timeout) | Err(QueueRecvError::Empty) => continue,
            Err(QueueRecvError::Disconnected) => break,
        };
        let DeviceTask::Input {
            generation,
            data,
            dts,
            pts,
        } = task
        else {
            break;
        };
        if generation != shared.generation.load(Ordering::Acquire) {
            continue;
        }

        if !config.decode_latency.is_zero() {
            thread::sleep(config.decode_latency);
        }

        let is_keyframe = match codec {
            DeviceCodec::H264 => annexb_nal_units(&data)
                .iter()
                .any(|nal| nal_type(nal) == Some(NAL_TYPE_IDR)),
            _ => true,
        };
        if shared.drop_mode.load(Ordering::Acquire) && !is_keyframe {
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if !wait_for_output_buffer(&shared, generation) {
            continue;
        }

        let picture = Picture {
            dims: config.dims,
            pts,
            dts,
            duration: config.frame_duration,
            is_keyframe,
            data,
        };
        let queued = {
            let _gate = lock_output(&shared);
            generation == shared.generation.load(Ordering::Acquire)
                && out_tx
                    .try_send(DecodedPicture {
                        generation,
                        picture,
                    })
                    .is_ok()
        };
        if !queued {
            shared.credits.release(1);
            continue;
        }
        let decoded = shared.decoded.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(decoded, is_keyframe, "loopback picture ready");
    }
}

/// Blocks until an output buffer is free. Returns `false` when the picture
/// went stale or the device is shutting down meanwhile.
fn wait_for_output_buffer(shared: &SharedState, generation: u64) -> bool {
    loop {
        if shared.credits.try_acquire() {
            return true;
        }
        if shared.shutdown.load(Ordering::Acquire)
            || generation != shared.generation.load(Ordering::Acquire)
        {
            return false;
        }
        thread::sleep(WORKER_POLL);
    }
}
