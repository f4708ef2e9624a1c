//! Default microphone via CPAL
//!
//! A CPAL `Stream` is not `Send`, so each opened source gets its own audio
//! thread that builds the stream, reports the outcome, and keeps the stream
//! alive until released. The stream callback mixes down to mono, converts to
//! i16 and resamples to the requested rate before handing chunks to the
//! reader over a channel.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfig};

use super::{AudioDevice, AudioError, AudioSource};

/// Longest wait for a chunk before a read gives up
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// The system default input device
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevice;

impl CpalDevice {
    pub fn new() -> Self {
        Self
    }
}

impl AudioDevice for CpalDevice {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioSource>, AudioError> {
        let (init_tx, init_rx) = mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (samples_tx, samples_rx) = mpsc::channel::<Vec<i16>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("asr-audio".to_string())
            .spawn(move || {
                let stream = match build_stream(sample_rate, samples_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = init_tx.send(Err(AudioError::StreamCreationFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = init_tx.send(Ok(()));

                // Returns once the source drops its stop sender
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Audio: stream closed");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalSource {
                samples: samples_rx,
                pending: VecDeque::new(),
                stop: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(AudioError::StreamCreationFailed(
                "audio thread exited during setup".to_string(),
            )),
        }
    }
}

/// A running CPAL input stream
pub struct CpalSource {
    samples: Receiver<Vec<i16>>,
    pending: VecDeque<u8>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioSource for CpalSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        while self.pending.is_empty() {
            match self.samples.recv_timeout(READ_TIMEOUT) {
                Ok(chunk) => self
                    .pending
                    .extend(chunk.iter().flat_map(|s| s.to_le_bytes())),
                Err(RecvTimeoutError::Timeout) => return Err(AudioError::ReadTimeout),
                Err(RecvTimeoutError::Disconnected) => return Err(AudioError::StreamClosed),
            }
        }

        // Whole samples only
        let n = buf.len().min(self.pending.len()) & !1;
        for (dst, byte) in buf[..n].iter_mut().zip(self.pending.drain(..n)) {
            *dst = byte;
        }
        Ok(n)
    }

    fn release(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Audio: audio thread panicked");
            }
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn build_stream(target_rate: u32, tx: Sender<Vec<i16>>) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Audio: using input device {:?}", device.name());

    let supported = choose_config(&device, target_rate)?;
    let device_rate = supported.sample_rate().0;
    if device_rate % target_rate != 0 {
        return Err(AudioError::UnsupportedSampleRate {
            device: device_rate,
            requested: target_rate,
        });
    }

    log::info!(
        "Audio: {} Hz, {} channels, {:?} (delivering {} Hz mono)",
        device_rate,
        supported.channels(),
        supported.sample_format(),
        target_rate
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, target_rate, tx),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, target_rate, tx),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, target_rate, tx),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

/// Prefer a config that runs at the target rate directly, fewest channels
/// first; otherwise fall back to the device default.
fn choose_config(device: &Device, target_rate: u32) -> Result<SupportedStreamConfig, AudioError> {
    let rate = SampleRate(target_rate);

    if let Ok(configs) = device.supported_input_configs() {
        let mut matching: Vec<_> = configs
            .filter(|c| c.min_sample_rate() <= rate && rate <= c.max_sample_rate())
            .filter(|c| {
                matches!(
                    c.sample_format(),
                    SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
                )
            })
            .collect();
        matching.sort_by_key(|c| c.channels());

        if let Some(range) = matching.into_iter().next() {
            return Ok(range.with_sample_rate(rate));
        }
    }

    device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    target_rate: u32,
    tx: Sender<Vec<i16>>,
) -> Result<Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let device_rate = config.sample_rate.0;
    let err_fn = |err: cpal::StreamError| log::error!("Audio: stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<i16> = data
                    .chunks(channels)
                    .map(|frame| {
                        let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
                        float_to_i16(sum / frame.len() as f32)
                    })
                    .collect();
                // Receiver gone means the source was released
                let _ = tx.send(downsample(&mono, device_rate, target_rate));
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

fn float_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Downsample by averaging groups of `source_rate / target_rate` samples
///
/// Only integer ratios are supported; other ratios return the input
/// unchanged.
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if target_rate == 0 || source_rate == 0 || source_rate == target_rate {
        return samples.to_vec();
    }

    if source_rate % target_rate != 0 {
        return samples.to_vec();
    }

    let ratio = (source_rate / target_rate) as usize;

    samples
        .chunks(ratio)
        .map(|chunk| {
            let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
            (sum / chunk.len() as i64) as i16
        })
        .collect()
}
