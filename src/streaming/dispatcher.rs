//! Ordered delivery of recognition events to the consumer
//!
//! Events are posted from the session loop and drained by exactly one worker
//! task, so the listener never sees two events out of order and is never
//! called from two contexts at once.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ErrorCode;

/// Engine → consumer notifications
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// The engine is configured and about to record
    Ready,
    /// Audio capture started
    BeginningOfSpeech,
    /// Interim hypotheses (best first). `semi_final` marks a server-final
    /// result delivered in unlimited-duration mode.
    PartialHypotheses {
        hypotheses: Vec<String>,
        semi_final: bool,
    },
    /// Terminal hypotheses (best first); empty on cancel or a clean close
    FinalHypotheses { hypotheses: Vec<String> },
    /// Local capture stopped
    EndOfSpeech,
    /// The session failed and has been torn down
    Error(ErrorCode),
    /// Input level of the most recent second, in dB
    VolumeLevel(f32),
}

impl RecognitionEvent {
    /// Best hypothesis of a partial or final event
    pub fn text(&self) -> Option<&str> {
        match self {
            RecognitionEvent::PartialHypotheses { hypotheses, .. }
            | RecognitionEvent::FinalHypotheses { hypotheses } => {
                hypotheses.first().map(String::as_str)
            }
            _ => None,
        }
    }

    /// Whether this event ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecognitionEvent::FinalHypotheses { .. } | RecognitionEvent::Error(_)
        )
    }
}

/// Consumer capability injected into the engine
pub trait SessionListener: Send + Sync + 'static {
    fn on_event(&self, event: RecognitionEvent);
}

impl SessionListener for mpsc::UnboundedSender<RecognitionEvent> {
    fn on_event(&self, event: RecognitionEvent) {
        if self.send(event).is_err() {
            log::debug!("Dispatcher: listener channel closed");
        }
    }
}

impl<F> SessionListener for F
where
    F: Fn(RecognitionEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: RecognitionEvent) {
        self(event)
    }
}

/// Single-consumer event queue in front of a [`SessionListener`]
pub struct ResultDispatcher {
    tx: Mutex<Option<mpsc::UnboundedSender<RecognitionEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ResultDispatcher {
    /// Spawn the delivery worker on the current tokio runtime
    pub fn spawn(listener: impl SessionListener) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RecognitionEvent>();

        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                log::debug!("Dispatcher: delivering {:?}", event);
                listener.on_event(event);
            }
            log::debug!("Dispatcher: worker exiting");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue an event for delivery. Events posted after shutdown are dropped.
    pub fn post(&self, event: RecognitionEvent) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    log::warn!("Dispatcher: worker gone, event dropped");
                }
            }
            None => log::debug!("Dispatcher: shut down, dropping {:?}", event),
        }
    }

    /// Stop accepting events and wait for queued ones to be delivered
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::warn!("Dispatcher: worker ended abnormally: {}", e);
            }
        }
    }
}
