//! `analytics-relay`: forwards track commands read from stdin to the ingest RPC.
//!
//! Each stdin line is a JSON object such as
//! `{"kind":"click","owner_code":"AB12CD","share_code":"public","click_target":"contact.phone"}`.
//! End of input (or a read error) disposes the batcher; Ctrl-C hands the queue
//! to the keepalive path first.

mod command;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use services::services::{
    analytics_batcher::{AnalyticsBatcher, FlushOutcome},
    config::{BatcherConfig, IngestConfig},
    host::{PageLifecycle, StaticClientEnvironment, SystemClock},
    ingest_client::RpcIngestClient,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::RelayCommand;

#[derive(Debug, Parser)]
#[command(
    name = "analytics-relay",
    version,
    about = "Batch analytics track commands from stdin and deliver them to the ingest RPC"
)]
struct Args {
    /// Backend base URL
    #[arg(long, env = "ANALYTICS_BASE_URL", default_value = "")]
    base_url: String,

    /// Backend API key
    #[arg(long, env = "ANALYTICS_API_KEY", default_value = "", hide_env_values = true)]
    api_key: String,

    #[arg(long, default_value_t = 10)]
    flush_interval_secs: u64,

    #[arg(long, default_value_t = 20)]
    max_batch_size: usize,

    /// Request timeout; the HTTP client default applies when unset
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    #[arg(long, default_value = concat!("analytics-relay/", env!("CARGO_PKG_VERSION")))]
    user_agent: String,

    #[arg(long, default_value = "")]
    referrer: String,

    /// How long to wait for keepalive requests before exiting
    #[arg(long, default_value_t = 2000)]
    drain_grace_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    utils::log::init("info");
    let args = Args::parse();

    let mut ingest_config = IngestConfig::new(args.base_url, args.api_key);
    if let Some(secs) = args.request_timeout_secs {
        ingest_config = ingest_config.with_request_timeout(Duration::from_secs(secs));
    }
    let client = Arc::new(RpcIngestClient::new(&ingest_config).context("invalid ingest config")?);

    let batcher = AnalyticsBatcher::new(
        BatcherConfig::default()
            .with_flush_interval(Duration::from_secs(args.flush_interval_secs))
            .with_max_batch_size(args.max_batch_size),
        client.clone(),
        Arc::new(SystemClock),
        Arc::new(StaticClientEnvironment::new(args.user_agent, args.referrer)),
    )
    .context("invalid batcher config")?;

    let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
    batcher.start(lifecycle_rx);

    let default_session = Uuid::new_v4().to_string();
    debug!(session_id = %default_session, "Relay session started");

    let input = relay_input(
        BufReader::new(tokio::io::stdin()),
        &batcher,
        &lifecycle_tx,
        &default_session,
    );

    tokio::select! {
        () = input => {}
        _ = tokio::signal::ctrl_c() => {
            let handed_off = batcher.flush_on_unload();
            info!(events = handed_off, "Interrupted, queue handed to keepalive");
        }
    }

    match batcher.dispose().await {
        FlushOutcome::Delivered { events } => info!(events, "Final analytics batch delivered"),
        FlushOutcome::Failed { events, error } => {
            warn!(events, error = %error, "Final analytics batch failed")
        }
        FlushOutcome::Skipped(reason) => debug!(?reason, "Nothing left to flush"),
    }

    client
        .drain(Duration::from_millis(args.drain_grace_ms))
        .await;

    let stats = batcher.stats();
    info!(
        enqueued = stats.enqueued,
        delivered = stats.delivered,
        failed = stats.failed,
        handed_off = stats.handed_off,
        "Relay finished"
    );
    Ok(())
}

/// Feed input lines to the batcher until end of input or a read error.
///
/// Lines that are not valid UTF-8 are skipped like malformed JSON.
async fn relay_input<R>(
    mut input: R,
    batcher: &AnalyticsBatcher,
    lifecycle: &mpsc::UnboundedSender<PageLifecycle>,
    default_session: &str,
) where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match input.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                info!("Input closed");
                return;
            }
            Ok(_) => match std::str::from_utf8(&buf) {
                Ok(line) => relay_line(batcher, lifecycle, default_session, line),
                Err(e) => warn!(error = %e, "Skipping input line that is not valid UTF-8"),
            },
            Err(e) => {
                warn!(error = %e, "Failed to read input, shutting down");
                return;
            }
        }
    }
}

fn relay_line(
    batcher: &AnalyticsBatcher,
    lifecycle: &mpsc::UnboundedSender<PageLifecycle>,
    default_session: &str,
    line: &str,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let command = match RelayCommand::parse(line) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "Skipping malformed input line");
            return;
        }
    };

    if let Some(signal) = command.lifecycle() {
        if lifecycle.send(signal).is_err() {
            debug!(?signal, "Batcher no longer listening for lifecycle signals");
        }
        return;
    }

    match command {
        RelayCommand::Session { scope, visitor_id } => {
            batcher.track_session(&scope.into_scope(default_session), visitor_id.as_deref())
        }
        RelayCommand::PageView { scope, page_type } => {
            batcher.track_page_view(&scope.into_scope(default_session), &page_type)
        }
        RelayCommand::Click {
            scope,
            click_target,
        } => batcher.track_click(&scope.into_scope(default_session), &click_target),
        RelayCommand::Visible | RelayCommand::Hidden | RelayCommand::Unload => {}
    }
}
