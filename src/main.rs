use asr_stream::{AsrConfig, CpalDevice, RecognitionEvent, StreamingSession};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    // Both rustls backends are compiled in; pick one before the first wss:// connect
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    if let Err(e) = run().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AsrConfig::load()?;
    config.validate()?;

    let (tx, mut events) = mpsc::unbounded_channel();
    let engine = StreamingSession::new(config, CpalDevice::new(), tx);
    engine.start_listening()?;
    log::info!("Listening, press Ctrl-C to stop");

    let mut stop_requested = false;
    loop {
        tokio::select! {
            ctrl_c = tokio::signal::ctrl_c(), if !stop_requested => {
                ctrl_c?;
                log::info!("Stopping");
                stop_requested = true;
                engine.stop_listening()?;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    RecognitionEvent::PartialHypotheses { .. } => {
                        if let Some(text) = event.text() {
                            eprintln!("… {}", text);
                        }
                    }
                    RecognitionEvent::FinalHypotheses { .. } => {
                        println!("{}", event.text().unwrap_or_default());
                    }
                    RecognitionEvent::Error(code) => log::error!("Recognition failed: {}", code),
                    RecognitionEvent::VolumeLevel(db) => log::debug!("Level {:.1} dB", db),
                    other => log::info!("{:?}", other),
                }
                if event.is_terminal() {
                    break;
                }
            }
        }
    }

    engine.destroy().await;
    Ok(())
}
