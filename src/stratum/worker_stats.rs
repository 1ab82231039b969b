//src/stratum/worker_stats.rs

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::pow::diff_to_hash;

/// How far back shares count towards the hashrate estimate.
pub const SHARE_WINDOW_MS: u64 = 10 * 60 * 1000;
/// A worker with no share inside this window is considered inactive.
pub const ACTIVE_WINDOW_MS: u64 = 10 * 60 * 1000;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecentShare {
    pub timestamp: u64,
    pub difficulty: u64,
    pub nonce: u64,
}

#[derive(Debug)]
pub struct WorkerStats {
    pub address: String,
    pub worker_name: String,
    pub asic_type: String,
    pub blocks_found: u64,
    pub shares_found: u64,
    pub stale_shares: u64,
    pub invalid_shares: u64,
    pub duplicate_shares: u64,
    pub var_diff_shares_found: u64,
    pub start_time: u64,
    pub last_share: u64,
    /// None means the vardiff tracker is not armed (no difficulty sent yet,
    /// or a retarget is waiting for the next job announcement).
    pub var_diff_start_time: Option<u64>,
    pub var_diff_window: usize,
    pub min_diff: u64,
    pub hashrate_ghs: f64,
    pub var_diff_enabled: bool,
    pub recent_shares: VecDeque<RecentShare>,
}

impl WorkerStats {
    pub fn new(
        address: &str,
        worker_name: &str,
        min_diff: u64,
        asic_type: &str,
        var_diff_enabled: bool,
    ) -> Self {
        let now = now_ms();
        Self {
            address: address.to_owned(),
            worker_name: worker_name.to_owned(),
            asic_type: asic_type.to_owned(),
            blocks_found: 0,
            shares_found: 0,
            stale_shares: 0,
            invalid_shares: 0,
            duplicate_shares: 0,
            var_diff_shares_found: 0,
            start_time: now,
            last_share: 0,
            var_diff_start_time: None,
            var_diff_window: 0,
            min_diff,
            hashrate_ghs: 0.0,
            var_diff_enabled,
            recent_shares: VecDeque::new(),
        }
    }

    /// Records a credited share and evicts entries older than the window.
    pub fn push_recent_share(&mut self, now: u64, difficulty: u64, nonce: u64) {
        self.recent_shares.push_back(RecentShare { timestamp: now, difficulty, nonce });
        let cutoff = now.saturating_sub(SHARE_WINDOW_MS);
        while self.recent_shares.front().map_or(false, |s| s.timestamp < cutoff) {
            self.recent_shares.pop_front();
        }
    }

    pub fn has_recent_nonce(&self, nonce: u64) -> bool {
        self.recent_shares.iter().any(|s| s.nonce == nonce)
    }

    /// Average-difficulty hashrate estimate over shares inside the window.
    pub fn hashrate_ghs(&self, now: u64) -> f64 {
        let cutoff = now.saturating_sub(SHARE_WINDOW_MS);
        let mut count = 0u64;
        let mut diff_sum = 0.0;
        let mut oldest = now;
        for share in self.recent_shares.iter().filter(|s| s.timestamp >= cutoff) {
            count += 1;
            diff_sum += share.difficulty as f64;
            oldest = oldest.min(share.timestamp);
        }
        if count == 0 || now <= oldest {
            return 0.0;
        }
        let avg_diff = diff_sum / count as f64;
        let elapsed_secs = (now - oldest) as f64 / 1000.0;
        diff_to_hash(avg_diff) * count as f64 / elapsed_secs
    }

    /// Unix seconds of the last share if the worker is active inside the
    /// window, 0 otherwise. Doubles as a liveness flag and a gauge value.
    pub fn check_active(&self, now: u64) -> u64 {
        if self.last_share > 0 && now.saturating_sub(self.last_share) <= ACTIVE_WINDOW_MS {
            self.last_share / 1000
        } else {
            0
        }
    }
}
