//! # fm-runner
//!
//! Keeps a set of candle charts live from a JSON configuration file.
//!
//! Each configured chart is seeded from REST history, then subscribed to
//! candle (and optionally trade) updates through one shared broker and
//! connection multiplexer. A wall-clock watchdog puts every chart into resume
//! mode after the process was suspended.
//!
//! # Usage
//!
//! ```bash
//! fm-runner config.json --log-level info
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use fm_core::config::{AppConfig, ChartConfig};
use fm_core::logging::{LogFormat, init_logging};
use fm_core::sequence::SequenceConfig;
use fm_core::time_util;
use fm_core::types::ValidationMode;
use fm_core::ws::{ConnectionMultiplexer, MuxConfig, TungsteniteConnector};
use fm_md::{
    BrokerConfig, CandleChart, FeedEvent, FeedStatus, HistoryClient, SubscribeRequest,
    SubscriberHandle, SubscriptionBroker, TradeBars,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Live candle/trade chart runner.
#[derive(Parser)]
#[command(name = "fm-runner", about = "Live candle/trade chart runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,
}

/// Per-chart settings resolved from the config.
#[derive(Clone)]
struct ChartSettings {
    max_bars: usize,
    history_limit: u32,
    sequence: SequenceConfig,
    validation: ValidationMode,
    /// How long to wait before reviving a connection that gave up.
    revive_after: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = fm_core::config::load_config(&cli.config)?;

    // 2. Initialize logging
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    let format = if config.log_json() { LogFormat::Json } else { LogFormat::Pretty };
    init_logging(&cli.log_level, log_dir.as_deref(), &config.module_name(), format);

    info!(
        "fm-runner starting: config={}, log_level={}, {} chart(s)",
        cli.config.display(),
        cli.log_level,
        config.charts.len()
    );

    // 3. Multiplexer and broker
    let reconnect = config.effective_reconnect();
    let mux_config = MuxConfig {
        reconnect,
        ping_interval: config.effective_ping_interval(),
        ..MuxConfig::default()
    };
    let mux = ConnectionMultiplexer::new(Arc::new(TungsteniteConnector::new()), mux_config);
    let broker_config = BrokerConfig::from_app_config(&config);
    let broker = Arc::new(SubscriptionBroker::new(mux.clone(), broker_config));

    // 4. Suspension watchdog
    let (resume_tx, resume_rx) = watch::channel(0u64);
    let watchdog = tokio::spawn(watch_suspension(config.effective_suspend_threshold(), resume_tx));

    // 5. One task per chart
    let settings = ChartSettings {
        max_bars: config.effective_max_bars(),
        history_limit: config.effective_history_limit(),
        sequence: config.effective_sequence(),
        validation: config.validation_mode(),
        revive_after: reconnect.window,
    };
    let mut tasks: Vec<(String, JoinHandle<Result<()>>)> = Vec::new();
    for chart in &config.charts {
        let label = format!("{}:{}:{}", chart.env, chart.market, chart.resolution);
        let task = tokio::spawn(run_chart(
            broker.clone(),
            mux.clone(),
            history_client(&config, chart),
            config.endpoint(chart.env)?.ws_url.clone(),
            chart.clone(),
            settings.clone(),
            resume_rx.clone(),
        ));
        tasks.push((label, task));
    }

    info!("{} chart(s) running, press Ctrl+C to stop", tasks.len());

    // 6. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // 7. Tear down feeds, then sockets; chart streams end on their own
    broker.shutdown().await;
    mux.shutdown().await;
    for (label, task) in tasks {
        match task.await {
            Ok(Ok(())) => debug!("[chart {label}] stopped"),
            Ok(Err(e)) => error!("[chart {label}] failed: {e}"),
            Err(e) => error!("[chart {label}] task panicked: {e}"),
        }
    }
    watchdog.abort();

    info!("all charts stopped");
    Ok(())
}

fn history_client(config: &AppConfig, chart: &ChartConfig) -> Option<HistoryClient> {
    let rest = config.endpoint(chart.env).ok()?.rest_url.clone()?;
    Some(HistoryClient::new(rest, config.validation_mode()))
}

/// Tick once a second; a wall-clock gap larger than the tick plus
/// `threshold` means the process was suspended.
async fn watch_suspension(threshold: Duration, resume_tx: watch::Sender<u64>) {
    let tick = Duration::from_secs(1);
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = time_util::now_ms();
    loop {
        interval.tick().await;
        let now = time_util::now_ms();
        let gap = now.saturating_sub(last);
        last = now;
        if gap > (tick + threshold).as_millis() as u64 {
            warn!("[watchdog] wall clock jumped {gap}ms, resuming charts");
            resume_tx.send_modify(|n| *n += 1);
        }
    }
}

/// Next event of an optional stream; pending forever when absent.
async fn next_event(handle: &mut Option<SubscriberHandle>) -> Option<FeedEvent> {
    match handle {
        Some(h) => h.recv().await,
        None => std::future::pending().await,
    }
}

async fn revive_timer(at: Option<Instant>) {
    tokio::time::sleep_until(at.unwrap_or_else(Instant::now)).await
}

async fn run_chart(
    broker: Arc<SubscriptionBroker>,
    mux: ConnectionMultiplexer,
    history: Option<HistoryClient>,
    ws_url: String,
    chart: ChartConfig,
    settings: ChartSettings,
    mut resume: watch::Receiver<u64>,
) -> Result<()> {
    let label = format!("{}:{}:{}", chart.env, chart.market, chart.resolution);
    let mut candles = CandleChart::new(
        &chart.market,
        chart.resolution,
        settings.max_bars,
        settings.sequence,
    );

    if let Some(client) = &history {
        let fetched = client
            .fetch_candles(&chart.market, chart.resolution, settings.history_limit, None)
            .await;
        match fetched {
            Ok(bars) => candles.seed(bars),
            Err(e) => warn!("[chart {label}] history unavailable, starting empty: {e}"),
        }
    }
    info!("[chart {label}] seeded with {} bars", candles.len());

    let candle_request = SubscribeRequest::candles(chart.env, &chart.market, chart.resolution);
    let mut candle_sub = broker.subscribe(candle_request).await?;
    let mut trade_sub = if chart.trades {
        Some(broker.subscribe(SubscribeRequest::trades(chart.env, &chart.market)).await?)
    } else {
        None
    };
    let mut trade_bars = TradeBars::new(
        &chart.market,
        chart.resolution,
        settings.max_bars,
        settings.sequence,
    )
    .with_validation(settings.validation);
    let mut revive_at: Option<Instant> = None;

    loop {
        tokio::select! {
            event = candle_sub.recv() => match event {
                Some(FeedEvent::Candle(update)) => {
                    let opened =
                        candles.last_bar().map(|b| b.start()) != Some(update.candle.start());
                    if candles.apply(&update) {
                        if let Some(bar) = candles.last_bar().filter(|_| opened) {
                            let ohlc = bar.fill();
                            info!(
                                "[chart {label}] bar {} o={} h={} l={} c={}",
                                bar.start(),
                                ohlc.open,
                                ohlc.high,
                                ohlc.low,
                                ohlc.close
                            );
                        }
                    } else {
                        debug!("[chart {label}] skipped update slot={:?}", update.slot);
                    }
                }
                Some(FeedEvent::Status(status)) => {
                    if on_status(&label, &status) {
                        revive_at = Some(Instant::now() + settings.revive_after);
                    }
                    if status == FeedStatus::Resubscribed {
                        candles.on_resubscribed();
                    }
                }
                Some(FeedEvent::Trades(_)) => {}
                None => break,
            },
            event = next_event(&mut trade_sub) => match event {
                Some(FeedEvent::Trades(batch)) => {
                    let applied = trade_bars.apply(&batch);
                    debug!("[chart {label}] {applied}/{} trades applied", batch.trades.len());
                }
                Some(FeedEvent::Status(FeedStatus::Resubscribed)) => trade_bars.on_resubscribed(),
                Some(_) => {}
                None => trade_sub = None,
            },
            changed = resume.changed() => {
                if changed.is_err() {
                    break;
                }
                candles.notify_resume();
                trade_bars.notify_resume();
            }
            _ = revive_timer(revive_at), if revive_at.is_some() => {
                revive_at = None;
                info!("[chart {label}] reviving {ws_url}");
                mux.ensure_live(&ws_url).await;
            }
        }
    }

    info!("[chart {label}] stream ended with {} bars", candles.len());
    Ok(())
}

/// Log a status change. Returns `true` if the feed gave up and needs a
/// revive.
fn on_status(label: &str, status: &FeedStatus) -> bool {
    match status {
        FeedStatus::Reconnecting { attempt, delay } => {
            warn!("[chart {label}] reconnecting (attempt {attempt}) in {delay:?}");
            false
        }
        FeedStatus::Resubscribed => {
            info!("[chart {label}] resubscribed");
            false
        }
        FeedStatus::Error(e) => {
            warn!("[chart {label}] feed error: {e}");
            false
        }
        FeedStatus::Unavailable(e) => {
            error!("[chart {label}] feed unavailable: {e}");
            true
        }
        FeedStatus::Closed => {
            info!("[chart {label}] connection closed");
            false
        }
    }
}
