use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use parity_sniper::clock::Clock;
use parity_sniper::config::Config;
use parity_sniper::engine::runner::{build_core, run_core, ResolutionEvent};
use parity_sniper::exec::venue::{SimVenue, VenueClient};
use parity_sniper::types::{MarketRecord, PriceTick};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration rejected");
        return ExitCode::from(1);
    }
    if !config.dry_run {
        // The live venue adapter (REST + order signing) is a separate crate;
        // this binary ships with the paper venue only.
        error!("no live venue adapter linked; set DRY_RUN=1 for paper trading");
        return ExitCode::from(1);
    }

    info!(
        bankroll = config.bankroll,
        journal_dir = %config.journal_dir,
        "expiration sniper starting (paper venue)"
    );
    info!(
        time_to_eligibility_sec = config.time_to_eligibility_sec,
        max_buy_price = config.max_buy_price,
        min_edge = config.min_edge,
        max_orders_per_minute = config.max_orders_per_minute,
        sweep_ms = config.transition_sweep_interval_ms,
        "strategy window"
    );

    let clock = Clock::system();
    let venue = Arc::new(SimVenue::new(config.bankroll));
    match venue.usdc_balance() {
        Ok(balance) => info!(balance, "venue balance"),
        Err(e) => error!(error = %e, "venue balance query failed"),
    }
    let core = match build_core(config, clock.clone(), venue) {
        Ok(core) => core,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(2);
        }
    };

    let (market_tx, market_rx) = mpsc::channel::<MarketRecord>(256);
    let (tick_tx, tick_rx) = mpsc::channel::<PriceTick>(4096);
    // Dry-run resolutions are synthesized by the sweeper; the live
    // settlement feed would publish into this channel.
    let (_resolution_tx, resolution_rx) = mpsc::channel::<ResolutionEvent>(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let clock = clock.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            sim_feed(clock, market_tx, tick_tx, shutdown).await;
        });
    }

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    match run_core(core.clone(), market_rx, tick_rx, resolution_rx, shutdown_rx).await {
        Err(e) => {
            error!(error = %e, "fatal runtime error");
            ExitCode::from(2)
        }
        Ok(()) => {
            if let Some((kind, reason)) = core.gate.active_kill() {
                let active_ms = core
                    .gate
                    .halted_since_ms()
                    .map(|since| core.clock.now_ms() - since)
                    .unwrap_or(0);
                if active_ms >= core.config.done_retention_sec * 1000 {
                    error!(kind = %kind, reason = %reason, "kill switch never cleared");
                    return ExitCode::from(3);
                }
            }
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
    }
}

/// Paper market generator: a fresh 90-second market every 30 seconds, ticked
/// every 250ms with an ask that decays toward parity as expiry approaches.
/// The wobble is a deterministic hash of the tick index, so paper runs are
/// reproducible.
async fn sim_feed(
    clock: Clock,
    market_tx: mpsc::Sender<MarketRecord>,
    tick_tx: mpsc::Sender<PriceTick>,
    shutdown: watch::Receiver<bool>,
) {
    const MARKET_EVERY_MS: i64 = 30_000;
    const MARKET_WINDOW_MS: i64 = 90_000;

    let mut open_markets: Vec<(String, i64, i64)> = Vec::new(); // (token, start_ms, end_ms)
    let mut next_market_at = clock.now_ms();
    let mut serial: u64 = 0;
    let mut tick_index: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_millis(250));

    loop {
        if *shutdown.borrow() {
            return;
        }
        interval.tick().await;
        let now_ms = clock.now_ms();

        if now_ms >= next_market_at {
            serial += 1;
            let token_id = format!("paper-{}-{}", now_ms / 1000, serial);
            let record = MarketRecord {
                token_id: token_id.clone(),
                condition_id: format!("cond-{}", serial),
                question: format!("Paper market #{} settles to 1?", serial),
                end_ms: now_ms + MARKET_WINDOW_MS,
                negative_risk: false,
            };
            open_markets.push((token_id, now_ms, record.end_ms));
            if market_tx.send(record).await.is_err() {
                return;
            }
            next_market_at = now_ms + MARKET_EVERY_MS;
        }

        open_markets.retain(|(_, _, end_ms)| now_ms < end_ms + 10_000);

        for (token_id, start_ms, end_ms) in &open_markets {
            if now_ms >= *end_ms {
                continue;
            }
            tick_index += 1;
            let total = (*end_ms - *start_ms).max(1) as f64;
            let remaining = (*end_ms - now_ms) as f64;
            // 0.90 at open, drifting toward 0.98 near expiry.
            let base = 0.98 - 0.08 * (remaining / total);
            let wobble = ((tick_index.wrapping_mul(7919)) % 13) as f64 * 0.001;
            let ask = (base + wobble).clamp(0.02, 0.989);
            let bid = (ask - 0.01).max(0.01);
            let tick = PriceTick {
                token_id: token_id.clone(),
                bid,
                ask,
                server_ts_ms: now_ms,
            };
            if tick_tx.send(tick).await.is_err() {
                return;
            }
        }
    }
}
