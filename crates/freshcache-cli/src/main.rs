//! freshcache - command-line client for the cache-consistency layer.
//!
//! `listen` follows the real-time channel and logs the invalidations it
//! causes; `send` runs one write through the retry executor; `config`
//! prints the resolved configuration.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::Method;
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use freshcache_core::notifications::TracingSink;
use freshcache_core::realtime::{
    default_refetch_keys, spawn_background_refetch, EventKind, InboundEvent, WsTransport,
};
use freshcache_core::{
    ApiClient, CacheEvent, Config, QueryKey, RealTimeChannel, RetryExecutor, RetryPolicy,
    SessionData,
};

const ENV_TOKEN: &str = "FRESHCACHE_TOKEN";
const ENV_USER_ID: &str = "FRESHCACHE_USER_ID";
const ENV_LOG_DIR: &str = "FRESHCACHE_LOG_DIR";

const USAGE: &str = "\
Usage:
  freshcache listen                       follow the real-time channel
  freshcache send <METHOD> <PATH> [JSON]  run one write with retries
  freshcache config                       print the resolved configuration";

/// Initialize the tracing subscriber for logging.
/// Use RUST_LOG to control the level; FRESHCACHE_LOG_DIR adds a daily log file.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "freshcache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = Config::load()?;
    config.apply_env_overrides();

    match args.first().map(String::as_str) {
        Some("listen") => listen(config).await,
        Some("send") => send(config, &args[1..]).await,
        Some("config") => show_config(&config),
        _ => {
            eprintln!("{}", USAGE);
            Ok(())
        }
    }
}

fn session_from_env() -> Result<Option<SessionData>> {
    let Ok(token) = std::env::var(ENV_TOKEN) else {
        return Ok(None);
    };
    let user_id = std::env::var(ENV_USER_ID)
        .with_context(|| format!("{} is required when {} is set", ENV_USER_ID, ENV_TOKEN))?
        .parse::<i64>()
        .with_context(|| format!("{} must be a number", ENV_USER_ID))?;
    Ok(Some(SessionData::new(token, user_id)))
}

async fn listen(config: Config) -> Result<()> {
    config.validate()?;
    let session = session_from_env()?
        .ok_or_else(|| anyhow::anyhow!("Set {} and {} to listen", ENV_TOKEN, ENV_USER_ID))?;
    let Some(url) = config.realtime.url.clone() else {
        bail!("No real-time URL configured (set FRESHCACHE_WS_URL)");
    };

    let cache = config.cache.build_store();
    cache.subscribe(QueryKey::default(), |event| {
        if let CacheEvent::Invalidated(key) = event {
            println!("invalidated {}", key);
        }
    });

    let channel = RealTimeChannel::builder(
        config.realtime.clone(),
        Arc::new(WsTransport::new(url.clone())),
        cache.clone(),
    )
    .sink(Arc::new(TracingSink))
    .session(session)
    .build();

    channel.on(EventKind::DataUpdate, |event| {
        if let InboundEvent::DataUpdate(update) = event {
            println!("{} {} {}", update.entity, update.action, update.id);
        }
    });

    let mut state = channel.subscribe_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            info!(state = ?current, "Channel state");
        }
    });

    if !channel.connect() {
        bail!("Real-time channel is disabled (set FRESHCACHE_REALTIME=1)");
    }
    let refetch = spawn_background_refetch(
        cache.clone(),
        default_refetch_keys(),
        config.realtime.refetch_interval(),
    );
    info!(url = %url, "Listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    refetch.cancel();
    channel.disconnect().await;
    info!("Stopped");
    Ok(())
}

async fn send(config: Config, args: &[String]) -> Result<()> {
    config.validate()?;
    let (method, path) = match args {
        [method, path, ..] => (method, path),
        _ => bail!("{}", USAGE),
    };
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;
    let body: Option<Value> = args
        .get(2)
        .map(|raw| serde_json::from_str::<Value>(raw).context("Request body is not valid JSON"))
        .transpose()?;

    let base_url = config
        .api_base_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No API URL configured (set FRESHCACHE_API_URL)"))?;
    let mut client = ApiClient::new(base_url)?;
    if let Some(session) = session_from_env()? {
        client = client.with_token(session.token);
    }

    let max_retries = config.retry.max_retries;
    let policy = RetryPolicy::new(config.retry.clone()).on_retry(move |attempt, error| {
        eprintln!("Retrying… attempt {} of {} ({})", attempt, max_retries, error);
    });
    let executor = RetryExecutor::new(policy);

    let response = executor
        .execute(|| client.send_json(method.clone(), path, body.as_ref()))
        .await?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    println!("# {}", Config::config_path()?.display());
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
