//! Fixed-capacity capture buffer fed by a dedicated capture thread
//!
//! The capture thread appends frames at `recorded`; the sender drains
//! `[consumed, recorded)`. Both sides share one mutex held only for the
//! append or copy-and-advance, never across a device read.
//!
//! # Memory Budget
//!
//! PCM16 mono at 16 kHz is 32,000 bytes per second; the default 35 second
//! capacity is 1.12 MB, allocated once at open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use super::{AudioDevice, AudioError, AudioSource};
use crate::streaming::ErrorCode;

const BYTES_PER_SAMPLE: usize = 2;

/// Duration of one device read
const FRAME_MS: usize = 20;

/// Pause score above which the speaker is considered to have paused
pub const PAUSE_THRESHOLD: f64 = 7.0;

/// Lifecycle of a capture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Opened, not yet recording
    Ready,
    Recording,
    Stopped,
    /// Failed; the buffer must be rebuilt
    Error,
}

/// Errors from the capture buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    DeviceInitFailed(AudioError),
    IllegalState(CaptureState),
    BufferOverflow {
        recorded: usize,
        frame: usize,
        capacity: usize,
    },
    EmptyFrame,
    DeviceReadFailed(AudioError),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::DeviceInitFailed(e) => write!(f, "Audio device init failed: {}", e),
            CaptureError::IllegalState(state) => {
                write!(f, "Capture buffer in illegal state: {:?}", state)
            }
            CaptureError::BufferOverflow {
                recorded,
                frame,
                capacity,
            } => write!(
                f,
                "Capture buffer overflow: {} + {} bytes exceeds {}",
                recorded, frame, capacity
            ),
            CaptureError::EmptyFrame => write!(f, "Audio device returned an empty frame"),
            CaptureError::DeviceReadFailed(e) => write!(f, "Audio read failed: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

impl CaptureError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CaptureError::BufferOverflow { .. } => ErrorCode::BufferOverflow,
            _ => ErrorCode::DeviceInitFailed,
        }
    }
}

struct Inner {
    data: Vec<u8>,
    recorded: usize,
    consumed: usize,
    state: CaptureState,
    avg_energy: f64,
    failure: Option<CaptureError>,
}

impl Inner {
    /// Sum of squared samples over the last `span` bytes before `recorded`
    fn sum_of_squares(&self, span: usize) -> (i64, usize) {
        let end = self.recorded - self.recorded % BYTES_PER_SAMPLE;
        let mut begin = end.saturating_sub(span);
        if begin % BYTES_PER_SAMPLE != 0 {
            begin += 1;
        }

        let sum = self.data[begin..end]
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| {
                let s = i16::from_le_bytes([b[0], b[1]]) as i64;
                s * s
            })
            .sum();
        (sum, (end - begin) / BYTES_PER_SAMPLE)
    }
}

type FailureHook = Box<dyn Fn(ErrorCode) + Send>;

struct Shared {
    inner: Mutex<Inner>,
    running: AtomicBool,
    on_failure: Mutex<Option<FailureHook>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one frame. Rejected frames move the buffer to `Error`, except
    /// frames arriving after a stop, which are dropped.
    fn append(&self, frame: &[u8]) -> Result<(), CaptureError> {
        let mut inner = self.lock();

        if inner.state != CaptureState::Recording {
            return Err(CaptureError::IllegalState(inner.state));
        }

        let err = if frame.is_empty() {
            CaptureError::EmptyFrame
        } else if inner.recorded + frame.len() > inner.data.len() {
            CaptureError::BufferOverflow {
                recorded: inner.recorded,
                frame: frame.len(),
                capacity: inner.data.len(),
            }
        } else {
            let start = inner.recorded;
            inner.data[start..start + frame.len()].copy_from_slice(frame);
            inner.recorded += frame.len();
            return Ok(());
        };

        Self::fail_locked(&mut inner, &self.running, err.clone());
        drop(inner);
        self.notify_failure(&err);
        Err(err)
    }

    fn fail(&self, err: CaptureError) {
        let mut inner = self.lock();
        Self::fail_locked(&mut inner, &self.running, err.clone());
        drop(inner);
        self.notify_failure(&err);
    }

    fn notify_failure(&self, err: &CaptureError) {
        let hook = self.on_failure.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hook) = hook.as_ref() {
            hook(err.code());
        }
    }

    /// Called by the capture thread once its last frame is in
    fn finish_stop(&self) {
        let mut inner = self.lock();
        if inner.state == CaptureState::Recording {
            inner.state = CaptureState::Stopped;
            log::info!(
                "Capture: stopped ({} bytes recorded, {} consumed)",
                inner.recorded,
                inner.consumed
            );
        }
    }

    fn fail_locked(inner: &mut Inner, running: &AtomicBool, err: CaptureError) {
        log::error!("Capture: {}", err);
        inner.state = CaptureState::Error;
        inner.failure = Some(err);
        running.store(false, Ordering::SeqCst);
    }
}

/// Capture buffer with its own capture thread
pub struct AudioCaptureBuffer {
    shared: Arc<Shared>,
    sample_rate: u32,
    source: Mutex<Option<Box<dyn AudioSource>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioCaptureBuffer {
    /// Open the device and allocate room for `max_secs` seconds of audio
    pub fn open(
        device: &dyn AudioDevice,
        sample_rate: u32,
        max_secs: u32,
    ) -> Result<Self, CaptureError> {
        let source = device
            .open(sample_rate)
            .map_err(CaptureError::DeviceInitFailed)?;
        let capacity = bytes_per_second(sample_rate) * max_secs as usize;

        log::info!(
            "Capture: opened at {} Hz, capacity {} bytes ({}s)",
            sample_rate,
            capacity,
            max_secs
        );

        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    data: vec![0u8; capacity],
                    recorded: 0,
                    consumed: 0,
                    state: CaptureState::Ready,
                    avg_energy: 0.0,
                    failure: None,
                }),
                running: AtomicBool::new(false),
                on_failure: Mutex::new(None),
            }),
            sample_rate,
            source: Mutex::new(Some(source)),
            worker: Mutex::new(None),
        })
    }

    /// Report capture failures as they happen, from the thread that hit them
    pub fn on_failure(&self, hook: impl Fn(ErrorCode) + Send + 'static) {
        *self
            .shared
            .on_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    /// Transition `Ready → Recording` and spawn the capture thread
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut inner = self.shared.lock();
        let source = self.source.lock().unwrap_or_else(|e| e.into_inner()).take();

        let source = match (inner.state, source) {
            (CaptureState::Ready, Some(source)) => source,
            (state, source) => {
                if let Some(source) = source {
                    *self.source.lock().unwrap_or_else(|e| e.into_inner()) = Some(source);
                }
                return Err(CaptureError::IllegalState(state));
            }
        };

        inner.state = CaptureState::Recording;
        self.shared.running.store(true, Ordering::SeqCst);
        drop(inner);

        let shared = self.shared.clone();
        let frame_bytes = frame_bytes(self.sample_rate);
        let spawned = std::thread::Builder::new()
            .name("asr-capture".to_string())
            .spawn(move || capture_loop(shared, source, frame_bytes));

        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                log::info!("Capture: recording started");
                Ok(())
            }
            Err(e) => {
                let err = CaptureError::DeviceInitFailed(AudioError::StreamCreationFailed(
                    e.to_string(),
                ));
                self.shared.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Copy out everything recorded since the previous take
    pub fn take_since_last_consume(&self) -> Vec<u8> {
        let mut inner = self.shared.lock();
        let bytes = inner.data[inner.consumed..inner.recorded].to_vec();
        inner.consumed = inner.recorded;
        bytes
    }

    /// Copy out everything unconsumed and reset both counters to zero
    pub fn take_and_truncate(&self) -> Vec<u8> {
        let mut inner = self.shared.lock();
        let bytes = inner.data[inner.consumed..inner.recorded].to_vec();
        inner.recorded = 0;
        inner.consumed = 0;
        bytes
    }

    pub fn state(&self) -> CaptureState {
        self.shared.lock().state
    }

    /// The error that moved the buffer to `Error`, if any
    pub fn failure(&self) -> Option<CaptureError> {
        self.shared.lock().failure.clone()
    }

    pub fn recorded_len(&self) -> usize {
        self.shared.lock().recorded
    }

    pub fn consumed_len(&self) -> usize {
        self.shared.lock().consumed
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().data.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Input level over the most recent second, in dB (0 for silence)
    pub fn energy_db(&self) -> f32 {
        let inner = self.shared.lock();
        let (sum, samples) = inner.sum_of_squares(bytes_per_second(self.sample_rate));
        if samples == 0 {
            return 0.0;
        }

        let rms = (sum as f64 / samples as f64).sqrt();
        if rms > 1.0 {
            (10.0 * rms.log10()) as f32
        } else {
            0.0
        }
    }

    /// Ratio of the running energy average to the latest one-second energy
    ///
    /// Updates the running average, so successive calls track the level over
    /// time. Large values mean the input has gone quiet relative to before.
    pub fn pause_score(&self) -> f64 {
        let mut inner = self.shared.lock();
        let (sum, _) = inner.sum_of_squares(bytes_per_second(self.sample_rate));
        if sum == 0 {
            return 0.0;
        }

        let sample = sum as f64;
        let score = inner.avg_energy / sample;
        inner.avg_energy = (2.0 * inner.avg_energy + sample) / 3.0;
        score
    }

    pub fn is_pausing(&self) -> bool {
        let score = self.pause_score();
        log::debug!("Capture: pause score {:.2}", score);
        score > PAUSE_THRESHOLD
    }

    /// Request a stop. Idempotent.
    ///
    /// The capture thread finishes its current read, appends that frame and
    /// only then moves the buffer to `Stopped` and releases the device, so
    /// once `Stopped` is observed no audio is still in flight.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            log::debug!("Capture: stop requested");
        }
    }

    /// Stop and release the device. The buffer cannot be started again.
    pub fn release(&self) {
        self.stop();

        if let Some(mut source) = self.source.lock().unwrap_or_else(|e| e.into_inner()).take() {
            source.release();
        }

        // The capture thread exits after its current read; don't block on it.
        if self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            log::debug!("Capture: released");
        }
    }
}

impl Drop for AudioCaptureBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

fn bytes_per_second(sample_rate: u32) -> usize {
    sample_rate as usize * BYTES_PER_SAMPLE
}

fn frame_bytes(sample_rate: u32) -> usize {
    ((sample_rate as usize * FRAME_MS / 1000) * BYTES_PER_SAMPLE).max(BYTES_PER_SAMPLE)
}

fn capture_loop(shared: Arc<Shared>, mut source: Box<dyn AudioSource>, frame_bytes: usize) {
    let mut frame = vec![0u8; frame_bytes];

    loop {
        let result = source.read(&mut frame);
        let stopping = !shared.running.load(Ordering::SeqCst);

        match result {
            Ok(0) if stopping => {}
            // A frame read across a stop still belongs to the recording
            Ok(n) => {
                if shared.append(&frame[..n]).is_err() {
                    break;
                }
            }
            Err(e) if stopping => {
                log::debug!("Capture: read after stop failed: {}", e);
            }
            Err(e) => {
                shared.fail(CaptureError::DeviceReadFailed(e));
                break;
            }
        }

        if stopping {
            break;
        }
    }

    shared.finish_stop();
    source.release();
    log::debug!("Capture: loop exited");
}
