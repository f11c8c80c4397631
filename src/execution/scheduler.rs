use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info};
use crate::execution::orchestrator::ExecutionOrchestrator;

/// Runs a dispatch cycle every `every`. A late tick is skipped, not bunched up.
pub async fn run_dispatch_loop(orchestrator: Arc<ExecutionOrchestrator>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if let Err(e) = orchestrator.run_cycle(Utc::now()).await {
            error!("Cycle failed: {:#}", e);
        }
    }
}

/// Runs the daily close at `hour_utc`. Also runs once at start-up if today's slot
/// has already passed, since a close missed while the process was down is safe to re-run.
pub async fn run_daily_loop(orchestrator: Arc<ExecutionOrchestrator>, hour_utc: u32) {
    if Utc::now().hour() >= hour_utc {
        daily_close(&orchestrator).await;
    }

    loop {
        let wait = duration_until_next(Utc::now(), hour_utc);
        info!("📅 Next daily close in {}m", wait.as_secs() / 60);
        sleep(wait).await;
        daily_close(&orchestrator).await;
    }
}

async fn daily_close(orchestrator: &ExecutionOrchestrator) {
    match orchestrator.daily_close(Utc::now()).await {
        Ok(report) => info!(
            "Daily close {}: {} trades settled, pnl ${:+.2}, {} calibration outcomes",
            report.settlement.date,
            report.settlement.resolved,
            report.settlement.realized_pnl,
            report.calibration.len()
        ),
        Err(e) => error!("Daily close failed: {:#}", e),
    }
}

/// Time until the next `hour_utc:00` strictly after `now`.
pub fn duration_until_next(now: DateTime<Utc>, hour_utc: u32) -> Duration {
    let slot = NaiveTime::from_hms_opt(hour_utc % 24, 0, 0).unwrap_or_default();
    let mut next = Utc.from_utc_datetime(&now.date_naive().and_time(slot));
    if next <= now {
        next += ChronoDuration::days(1);
    }
    (next - now).to_std().unwrap_or(Duration::ZERO)
}
