//! Periodic audio sender
//!
//! Every tick drains whatever the capture thread has recorded since the last
//! tick and queues it on the connection as one binary frame. Once capture
//! stops, the remainder is flushed and the session loop is told the
//! end-of-stream marker is due; the marker itself is sent by the session loop
//! so it is recorded in session state before it goes out.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{Connection, ErrorCode};
use crate::audio::{AudioCaptureBuffer, CaptureState};

/// Timer schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SendTiming {
    /// Delay before the first tick
    pub initial_delay: Duration,
    /// Delay between ticks
    pub interval: Duration,
}

impl Default for SendTiming {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            interval: Duration::from_millis(200),
        }
    }
}

/// What the timer reports back to the session loop
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SenderEvent {
    /// A non-empty audio frame was queued
    AudioSent { bytes: usize, level_db: f32 },
    /// The input went quiet (only reported when stop-on-pause is enabled)
    PauseDetected,
    /// Capture stopped and all audio has been queued
    EndOfStreamDue,
    /// Capture failed; no end-of-stream marker will follow
    CaptureFailed(ErrorCode),
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SendOptions {
    /// Reset the capture buffer on every take (unlimited-duration sessions)
    pub truncate: bool,
    pub stop_on_pause: bool,
}

enum Tick {
    Continue,
    Done,
}

/// Spawn the send timer. It runs until capture stops or fails, the
/// connection refuses a frame, or `cancel` fires.
pub(crate) fn spawn_send_timer<F>(
    capture: Arc<AudioCaptureBuffer>,
    connection: Arc<Connection>,
    timing: SendTiming,
    options: SendOptions,
    cancel: CancellationToken,
    report: F,
) -> JoinHandle<()>
where
    F: Fn(SenderEvent) + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = sleep(timing.initial_delay) => {}
        }

        let mut state = TimerState::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match tick(&capture, &connection, options, &mut state, &report) {
                Tick::Continue => {}
                Tick::Done => break,
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(timing.interval) => {}
            }
        }

        log::debug!(
            "Sender: timer exiting ({} frames, {} bytes)",
            state.frames,
            state.bytes
        );
    })
}

#[derive(Default)]
struct TimerState {
    frames: u64,
    bytes: usize,
    pause_reported: bool,
}

fn tick<F: Fn(SenderEvent)>(
    capture: &AudioCaptureBuffer,
    connection: &Connection,
    options: SendOptions,
    state: &mut TimerState,
    report: &F,
) -> Tick {
    match capture.state() {
        CaptureState::Ready => Tick::Continue,
        CaptureState::Recording => {
            if !send_pending(capture, connection, options, state, report) {
                return Tick::Done;
            }
            if options.stop_on_pause && !state.pause_reported && capture.is_pausing() {
                log::info!("Sender: pause detected");
                state.pause_reported = true;
                report(SenderEvent::PauseDetected);
            }
            Tick::Continue
        }
        CaptureState::Stopped => {
            if send_pending(capture, connection, options, state, report) {
                log::info!("Sender: capture stopped, end of stream due");
                report(SenderEvent::EndOfStreamDue);
            }
            Tick::Done
        }
        CaptureState::Error => {
            let code = capture
                .failure()
                .map(|e| e.code())
                .unwrap_or(ErrorCode::DeviceInitFailed);
            report(SenderEvent::CaptureFailed(code));
            Tick::Done
        }
    }
}

/// Queue unconsumed audio. Returns false if the connection is gone.
fn send_pending<F: Fn(SenderEvent)>(
    capture: &AudioCaptureBuffer,
    connection: &Connection,
    options: SendOptions,
    state: &mut TimerState,
    report: &F,
) -> bool {
    let level_db = capture.energy_db();
    let bytes = if options.truncate {
        capture.take_and_truncate()
    } else {
        capture.take_since_last_consume()
    };

    if bytes.is_empty() {
        return true;
    }

    let len = bytes.len();
    if connection.send_binary(bytes).is_err() {
        log::debug!("Sender: connection closed, dropping {} bytes", len);
        return false;
    }

    state.frames += 1;
    state.bytes += len;
    if state.frames % 25 == 0 {
        log::debug!("Sender: sent {} frames ({} bytes)", state.frames, state.bytes);
    }

    report(SenderEvent::AudioSent {
        bytes: len,
        level_db,
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioDevice, AudioError, AudioSource};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Reads `frames` frames of a constant tone, then fails
    struct ToneSource {
        frames: usize,
    }

    impl AudioSource for ToneSource {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
            if self.frames == 0 {
                return Err(AudioError::StreamClosed);
            }
            self.frames -= 1;
            std::thread::sleep(Duration::from_millis(5));
            for pair in buf.chunks_exact_mut(2) {
                pair.copy_from_slice(&500i16.to_le_bytes());
            }
            Ok(buf.len())
        }

        fn release(&mut self) {}
    }

    struct ToneDevice {
        frames: usize,
    }

    impl AudioDevice for ToneDevice {
        fn open(&self, _sample_rate: u32) -> Result<Box<dyn AudioSource>, AudioError> {
            Ok(Box::new(ToneSource {
                frames: self.frames,
            }))
        }
    }

    fn fast_timing() -> SendTiming {
        SendTiming {
            initial_delay: Duration::from_millis(1),
            interval: Duration::from_millis(10),
        }
    }

    fn collector() -> (
        impl Fn(SenderEvent) + Send + 'static,
        mpsc::UnboundedReceiver<SenderEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |event| {
                let _ = tx.send(event);
            },
            rx,
        )
    }

    /// A connection stuck in the handshake: frames queue up but are never
    /// delivered. The listener must outlive the test.
    async fn unconnected() -> (Arc<Connection>, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn, _events) =
            Connection::open(format!("ws://{}/asr", addr), Duration::from_secs(30));
        (Arc::new(conn), listener)
    }

    fn tone_capture(frames: usize) -> Arc<AudioCaptureBuffer> {
        tone_capture_secs(frames, 5)
    }

    fn tone_capture_secs(frames: usize, max_secs: u32) -> Arc<AudioCaptureBuffer> {
        Arc::new(AudioCaptureBuffer::open(&ToneDevice { frames }, 16000, max_secs).unwrap())
    }

    async fn wait_stopped(capture: &AudioCaptureBuffer) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while capture.state() != CaptureState::Stopped {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("capture should stop");
    }

    #[tokio::test]
    async fn test_stopped_capture_flushes_then_reports_end_of_stream() {
        let capture = tone_capture(1000);
        capture.start().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        capture.stop();
        wait_stopped(&capture).await;
        let recorded = capture.recorded_len();

        let (connection, _listener) = unconnected().await;
        let (report, mut events) = collector();
        let handle = spawn_send_timer(
            capture.clone(),
            connection,
            fast_timing(),
            SendOptions::default(),
            CancellationToken::new(),
            report,
        );
        handle.await.unwrap();

        match events.recv().await {
            Some(SenderEvent::AudioSent { bytes, level_db }) => {
                assert_eq!(bytes, recorded);
                assert!(level_db > 0.0);
            }
            other => panic!("expected audio, got {:?}", other),
        }
        assert_eq!(events.recv().await, Some(SenderEvent::EndOfStreamDue));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_capture_failure_is_reported() {
        let capture = tone_capture(0);
        capture.start().unwrap();

        let (connection, _listener) = unconnected().await;
        let (report, mut events) = collector();
        let handle = spawn_send_timer(
            capture,
            connection,
            fast_timing(),
            SendOptions::default(),
            CancellationToken::new(),
            report,
        );
        handle.await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(SenderEvent::CaptureFailed(ErrorCode::DeviceInitFailed))
        );
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_cancel_stops_timer() {
        let capture = tone_capture(1000);
        capture.start().unwrap();

        let cancel = CancellationToken::new();
        let (connection, _listener) = unconnected().await;
        let (report, _events) = collector();
        let handle = spawn_send_timer(
            capture.clone(),
            connection,
            fast_timing(),
            SendOptions::default(),
            cancel.clone(),
            report,
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("timer should exit after cancel")
            .unwrap();
        capture.release();
    }

    #[tokio::test]
    async fn test_truncating_take_outlasts_capacity() {
        // One second of room; the tone fills it in about a quarter second
        let capture = tone_capture_secs(100_000, 1);
        capture.start().unwrap();

        let (connection, _listener) = unconnected().await;
        let (report, mut events) = collector();
        let handle = spawn_send_timer(
            capture.clone(),
            connection,
            fast_timing(),
            SendOptions {
                truncate: true,
                stop_on_pause: false,
            },
            CancellationToken::new(),
            report,
        );

        sleep(Duration::from_millis(600)).await;
        assert_eq!(capture.state(), CaptureState::Recording);
        capture.stop();
        handle.await.unwrap();

        assert_eq!(capture.state(), CaptureState::Stopped);
        assert_eq!(capture.recorded_len(), 0);

        let mut sent = 0;
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            match &event {
                SenderEvent::AudioSent { bytes, .. } => sent += bytes,
                SenderEvent::CaptureFailed(code) => panic!("capture failed: {:?}", code),
                _ => {}
            }
            last = Some(event);
        }
        assert!(sent > capture.capacity());
        assert_eq!(last, Some(SenderEvent::EndOfStreamDue));
    }
}
