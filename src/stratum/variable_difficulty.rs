// src/stratum/variable_difficulty.rs

use log::{debug, info};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::config::DifficultyConfig;
use crate::shares::manager::SharesManager;
use crate::stratum::worker_stats::{now_ms, WorkerStats};

pub const VARDIFF_PERIOD: Duration = Duration::from_secs(10);

/// Progressive evaluation windows in minutes; 0 marks the final stage.
pub const WINDOWS_MINS: [u64; 7] = [1, 3, 10, 30, 60, 240, 0];
/// Allowed deviation from the target share rate per window, looser early.
pub const TOLERANCES: [f64; 7] = [1.0, 0.5, 0.25, 0.15, 0.1, 0.1, 0.1];

/// Rejection ratio at which the hashrate-keyed fallback table takes over.
const HIGH_REJECTION_RATE: f64 = 0.20;

/// Fallback difficulty by ASIC class, keyed on estimated hashrate in GH/s.
/// Ranges are closed; boundaries resolve to the lower tier by first match.
const ASIC_TIERS: [(f64, u64); 10] = [
    (100.0, 64),
    (200.0, 128),
    (400.0, 256),
    (1_000.0, 512),
    (2_000.0, 1024),
    (5_000.0, 2048),
    (8_000.0, 4096),
    (12_000.0, 8192),
    (15_000.0, 16384),
    (21_000.0, 32768),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VardiffAction {
    Keep,
    Retarget(f64),
    Promote,
}

/// One staged-controller decision for a worker, from its tracker state.
pub fn plan_adjustment(
    elapsed_mins: f64,
    shares: u64,
    window_idx: usize,
    diff: u64,
    expected_share_rate: f64,
) -> VardiffAction {
    let rate = shares as f64 / elapsed_mins;
    let ratio = rate / expected_share_rate;
    let i = window_idx % WINDOWS_MINS.len();
    let window = WINDOWS_MINS[i] as f64;
    let tol = TOLERANCES[i];

    // final stage: plain proportional control
    if WINDOWS_MINS[i] == 0 {
        if (1.0 - ratio).abs() >= tol {
            return VardiffAction::Retarget(diff as f64 * ratio);
        }
        return VardiffAction::Keep;
    }

    // a breach of any already-cleared window's tolerance regresses the worker
    for k in 1..=i {
        if (1.0 - ratio).abs() >= TOLERANCES[k] {
            return VardiffAction::Retarget(diff as f64 * ratio);
        }
    }

    if shares as f64 >= window * expected_share_rate * (1.0 + tol) {
        return VardiffAction::Retarget(diff as f64 * ratio);
    }

    if elapsed_mins >= window {
        if shares as f64 <= window * expected_share_rate * (1.0 - tol) {
            return VardiffAction::Retarget(diff as f64 * ratio.max(0.1));
        }
        return VardiffAction::Promote;
    }

    VardiffAction::Keep
}

pub fn pow2_floor(diff: f64) -> f64 {
    if !diff.is_finite() || diff < 1.0 {
        return 1.0;
    }
    2f64.powi(diff.log2().floor() as i32)
}

pub fn asic_tier_diff(hashrate_ghs: f64) -> u64 {
    for (bound, diff) in ASIC_TIERS {
        if hashrate_ghs <= bound {
            return diff;
        }
    }
    ASIC_TIERS[ASIC_TIERS.len() - 1].1
}

/// Applies a candidate difficulty to a worker: optional power-of-two clamp,
/// range clamp, high-rejection override. On an effective change the tracker
/// is disarmed until the next job announcement re-arms it.
pub fn update_var_diff(stats: &mut WorkerStats, candidate: f64, config: &DifficultyConfig) -> bool {
    let mut new_diff = candidate;
    if config.clamp_pow2 {
        new_diff = pow2_floor(new_diff);
    }
    new_diff = new_diff.clamp(config.min as f64, config.max as f64);

    if stats.shares_found > 0
        && stats.invalid_shares as f64 / stats.shares_found as f64 >= HIGH_REJECTION_RATE
    {
        new_diff =
            (asic_tier_diff(stats.hashrate_ghs) as f64).clamp(config.min as f64, config.max as f64);
    }

    let new_diff = new_diff.round().max(1.0) as u64;
    if new_diff == stats.min_diff {
        return false;
    }
    stats.min_diff = new_diff;
    stats.var_diff_start_time = None;
    stats.var_diff_window = 0;
    true
}

/// Periodic per-worker difficulty adjustment loop.
pub struct VariableDifficulty {
    config: DifficultyConfig,
    shares: Arc<SharesManager>,
}

impl VariableDifficulty {
    pub fn new(config: DifficultyConfig, shares: Arc<SharesManager>) -> Self {
        Self { config, shares }
    }

    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                sleep(VARDIFF_PERIOD).await;
                self.adjust_all().await;
            }
        });
    }

    /// One controller cycle over a snapshot of all workers.
    pub async fn adjust_all(&self) {
        let expected = self.config.target_shares_per_min;
        if expected <= 0.0 {
            return;
        }

        let workers = self.shares.snapshot_workers().await;
        let now = now_ms();
        for lock in workers {
            let mut stats = lock.write().await;
            if !stats.var_diff_enabled || stats.check_active(now) == 0 {
                continue;
            }
            let Some(start) = stats.var_diff_start_time else {
                debug!("VarDiff {}: no diff sent yet", stats.worker_name);
                continue;
            };
            let elapsed_mins = now.saturating_sub(start) as f64 / 60_000.0;
            if elapsed_mins <= 0.0 {
                continue;
            }

            match plan_adjustment(
                elapsed_mins,
                stats.var_diff_shares_found,
                stats.var_diff_window,
                stats.min_diff,
                expected,
            ) {
                VardiffAction::Keep => {}
                VardiffAction::Promote => {
                    stats.var_diff_window += 1;
                    debug!(
                        "VarDiff {}: advanced to window {}m",
                        stats.worker_name,
                        WINDOWS_MINS[stats.var_diff_window % WINDOWS_MINS.len()]
                    );
                }
                VardiffAction::Retarget(candidate) => {
                    let previous = stats.min_diff;
                    if update_var_diff(&mut stats, candidate, &self.config) {
                        info!(
                            "VarDiff {}: {} -> {} ({:.1} shares/min over {:.1}m)",
                            stats.worker_name,
                            previous,
                            stats.min_diff,
                            stats.var_diff_shares_found as f64 / elapsed_mins,
                            elapsed_mins
                        );
                    }
                }
            }
        }
    }
}
