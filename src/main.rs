use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use repo2gpt_core::tokens::{HeuristicTokenizer, Tokenizer};
use repo2gpt_engine::fetch::DefaultFetcher;
use repo2gpt_engine::summarize::SummarizerRegistry;
use repo2gpt_engine::{JobRunner, RunnerConfig};
use repo2gpt_server::{AppState, ServerConfig};
use repo2gpt_settings::Settings;
use repo2gpt_store::JobStore;
use repo2gpt_telemetry::{init_telemetry, parse_level, TelemetryConfig};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = repo2gpt_settings::load_settings().context("failed to load settings")?;

    let data_dir = PathBuf::from(&settings.storage.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.telemetry.log_level),
        log_to_sqlite: settings.telemetry.log_to_sqlite,
        log_db_path: data_dir.join(&settings.telemetry.log_database_file),
    });
    tracing::info!(data_dir = %data_dir.display(), "starting repo2gpt");

    let db_path = settings.storage.database_path();
    let store = Arc::new(
        JobStore::open(&db_path, settings.runner.event_channel_capacity)
            .with_context(|| format!("failed to open job store at {}", db_path.display()))?,
    );
    let recovered = store.recover_interrupted()?;
    if !recovered.is_empty() {
        tracing::warn!(count = recovered.len(), "failed jobs interrupted by the previous shutdown");
    }

    let runner = Arc::new(JobRunner::new(
        Arc::clone(&store),
        Arc::new(DefaultFetcher::new(settings.server.allow_local_sources)?),
        Arc::new(SummarizerRegistry::with_defaults()),
        tokenizer(&settings),
        RunnerConfig {
            workers: settings.runner.workers,
            poll_interval: Duration::from_millis(settings.runner.poll_interval_ms),
            fetch_timeout: Duration::from_secs(settings.runner.fetch_timeout_secs),
            default_chunk_token_limit: settings.defaults.chunk_token_limit,
            default_max_file_bytes: settings.defaults.max_file_bytes,
            workspace_dir: settings.storage.workspace_dir(),
        },
    ));
    runner.start();

    let server_config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        api_key: settings.server.api_key.clone(),
        heartbeat_interval: Duration::from_millis(settings.server.heartbeat_interval_ms),
        max_upload_bytes: usize::try_from(settings.server.max_upload_bytes).unwrap_or(usize::MAX),
    };
    let state = AppState::new(&server_config, Arc::clone(&runner), telemetry.logs());
    let server = repo2gpt_server::start(&server_config, state)
        .await
        .context("failed to start HTTP server")?;
    tracing::info!(port = server.port, "repo2gpt ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    // Close streams first so in-flight jobs can be marked interrupted and
    // the store flushed before the process exits.
    server.begin_shutdown();
    runner.shutdown().await;
    server.shutdown(SHUTDOWN_GRACE).await;
    store.close()?;
    Ok(())
}

#[cfg(feature = "hf-tokenizer")]
fn tokenizer(settings: &Settings) -> Arc<dyn Tokenizer> {
    if let Some(path) = &settings.defaults.tokenizer_file {
        match repo2gpt_engine::hf_tokenizer::HfTokenizer::from_file(path) {
            Ok(t) => return Arc::new(t),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "tokenizer unavailable, estimating"),
        }
    }
    Arc::new(HeuristicTokenizer)
}

#[cfg(not(feature = "hf-tokenizer"))]
fn tokenizer(settings: &Settings) -> Arc<dyn Tokenizer> {
    if settings.defaults.tokenizer_file.is_some() {
        tracing::warn!("tokenizerFile is set but this build lacks the hf-tokenizer feature");
    }
    Arc::new(HeuristicTokenizer)
}
