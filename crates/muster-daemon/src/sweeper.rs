//! Periodic approval-timeout sweep.
//!
//! Pending approval requests older than the configured horizon are
//! auto-rejected; an unattended request must never approve itself.

use std::sync::Arc;

use muster_bridge::ApiState;
use muster_core::config::ApprovalConfig;

pub async fn run_approval_sweeper(state: Arc<ApiState>, config: ApprovalConfig) {
    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(
        horizon_secs = config.horizon_secs,
        sweep_interval_secs = config.sweep_interval_secs,
        "approval sweeper running"
    );

    loop {
        ticker.tick().await;
        for runtime in state.runtimes() {
            match runtime.gate().sweep_expired(config.horizon()).await {
                Ok(rejected) if !rejected.is_empty() => {
                    tracing::warn!(
                        squad = %runtime.squad().name,
                        count = rejected.len(),
                        "auto-rejected expired approvals"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(squad = %runtime.squad().name, error = %err, "approval sweep failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
