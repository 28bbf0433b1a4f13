use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::broadcast;
use tracing::warn;

use source_pulse::config::EngineConfig;
use source_pulse::engine::{EngineEvent, ProgressEngine};
use source_pulse::history::client::{trigger_batch, HttpHistoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing; logs go to a daily-rolling file when a log
    // directory is configured, stderr otherwise.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _appender_guard = match std::env::var("SOURCE_PULSE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "source-pulse.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = EngineConfig::from_env()?;
    let credential = std::env::var("SOURCE_PULSE_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
        .map(SecretString::from);

    eprintln!("📡 Source Pulse v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: {}", config.api_base_url);
    eprintln!("   Channel: {}", config.channel.ws_base_url);

    // Trigger a batch; its group id is all we need to open the channel.
    let client = reqwest::Client::new();
    let trigger_url = format!("{}/batches", config.api_base_url);
    let group_id = trigger_batch(&client, &trigger_url).await?;
    eprintln!("   Task group: {group_id}\n");

    let store = Arc::new(HttpHistoryStore::new(config.api_base_url.clone()));
    let engine = ProgressEngine::start(config, group_id, credential, store, Vec::new()).await?;

    let mut events = engine.subscribe();
    loop {
        match events.recv().await {
            Ok(EngineEvent::TaskUpdated { record }) => {
                eprintln!(
                    "   [{}] {} — {} {}%{}",
                    record.source_id,
                    record.source_name,
                    record.step,
                    record.progress,
                    record
                        .items_saved
                        .map(|n| format!(" ({n} saved)"))
                        .unwrap_or_default(),
                );
            }
            Ok(EngineEvent::GroupCompleted { status }) => {
                eprintln!("\n   Batch completed: {status}");
            }
            Ok(EngineEvent::HistoryRefreshed { date }) => match engine.view_for_date(date).await {
                Ok(entries) => {
                    eprintln!("\n   Today ({date}):");
                    for entry in &entries {
                        eprintln!(
                            "   - {} — {} saved",
                            entry.source_name(),
                            entry.saved_count()
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Could not build merged view"),
            },
            Ok(EngineEvent::ChannelClosed) => break,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event consumer lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    engine.shutdown().await;
    Ok(())
}
