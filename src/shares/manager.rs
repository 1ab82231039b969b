//src/shares/manager.rs

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Duration;

use crate::metrics::{
    MINER_ADDED_SHARES, MINER_BLOCKS_FOUND, MINER_DUPLICATED_SHARES, MINER_INVALID_SHARES,
    MINER_STALE_SHARES, SHARE_WINDOW_SIZE, WORKER_HASHRATE_GHS, WORKER_LAST_ACTIVE,
};
use crate::pow::{calculate_target, BlockHash};
use crate::shares::{Contribution, ShareWindow};
use crate::stratum::jobs::Jobs;
use crate::stratum::worker_stats::{now_ms, WorkerStats};

/// Cadence of the stats reporter.
pub const STATS_INTERVAL: Duration = Duration::from_secs(600);

/// Ramp-up horizon for the fallback allocation snapshot.
const FALLBACK_RAMP_MS: u64 = 5 * 60 * 1000;

pub type CloseSignal = mpsc::UnboundedSender<Box<str>>;

#[derive(Debug)]
pub struct WorkerEntry {
    pub stats: Arc<RwLock<WorkerStats>>,
    pub conn_id: u64,
}

/// Live state for one payout address.
#[derive(Debug, Default)]
pub struct MinerData {
    pub sockets: HashMap<u64, CloseSignal>,
    pub workers: HashMap<String, WorkerEntry>,
}

/// Everything the per-message critical section protects: worker registration
/// and the share window an accepted share lands in.
#[derive(Debug, Default)]
pub struct Miners {
    pub by_address: HashMap<String, MinerData>,
    pub window: ShareWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    Accepted { is_block: bool },
    Unauthorized,
    Duplicate,
    Stale,
    LowDifficulty,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DuplicateWorker;

/// Validates shares, keeps per-worker accounting and feeds the share window.
pub struct SharesManager {
    miners: Mutex<Miners>,
    jobs: Arc<Jobs>,
}

impl SharesManager {
    pub fn new(jobs: Arc<Jobs>) -> Arc<Self> {
        Arc::new(Self { miners: Mutex::new(Miners::default()), jobs })
    }

    /// Registers a worker under its payout address and attaches the socket.
    /// A worker name already live (on this or any other socket) is rejected.
    pub async fn authorize_worker(
        &self,
        conn_id: u64,
        close: CloseSignal,
        stats: WorkerStats,
    ) -> Result<Arc<RwLock<WorkerStats>>, DuplicateWorker> {
        let mut miners = self.miners.lock().await;
        let miner = miners.by_address.entry(stats.address.clone()).or_default();
        if miner.workers.contains_key(&stats.worker_name) {
            return Err(DuplicateWorker);
        }
        let name = stats.worker_name.clone();
        let stats = Arc::new(RwLock::new(stats));
        miner.sockets.insert(conn_id, close);
        miner.workers.insert(name, WorkerEntry { stats: Arc::clone(&stats), conn_id });
        Ok(stats)
    }

    /// Close-event cleanup: detach the socket and its workers, drop empty
    /// address entries.
    pub async fn disconnect(&self, conn_id: u64, bindings: &[(String, String)]) {
        let mut miners = self.miners.lock().await;
        for (address, worker_name) in bindings {
            let now_empty = match miners.by_address.get_mut(address) {
                Some(miner) => {
                    miner.sockets.remove(&conn_id);
                    miner.workers.remove(worker_name);
                    miner.sockets.is_empty() && miner.workers.is_empty()
                }
                None => false,
            };
            if now_empty {
                miners.by_address.remove(address);
            }
        }
    }

    /// Validates one submitted share and credits or rejects it. Exactly one
    /// counter moves per call, and an accepted share appends its contribution
    /// inside the same critical section.
    pub async fn add_share(
        &self,
        miner_id: &str,
        address: &str,
        header_hash: &BlockHash,
        base_difficulty: u64,
        nonce: u64,
        job_id: &str,
    ) -> ShareOutcome {
        let mut miners = self.miners.lock().await;

        let stats_lock = miners
            .by_address
            .get(address)
            .and_then(|m| m.workers.get(miner_id))
            .map(|w| Arc::clone(&w.stats));
        let Some(stats_lock) = stats_lock else {
            debug!("Share from unregistered worker {address}.{miner_id}");
            return ShareOutcome::Unauthorized;
        };
        let mut stats = stats_lock.write().await;

        if stats.has_recent_nonce(nonce) {
            stats.duplicate_shares += 1;
            MINER_DUPLICATED_SHARES.with_label_values(&[address]).inc();
            debug!("Duplicate share: worker={miner_id}, nonce={nonce:016x}");
            return ShareOutcome::Duplicate;
        }

        let Some(pow) = self.jobs.pow_of(header_hash).await else {
            stats.stale_shares += 1;
            MINER_STALE_SHARES.with_label_values(&[address]).inc();
            debug!("Stale share: worker={miner_id}, job_id={job_id}");
            return ShareOutcome::Stale;
        };

        let (is_block, value) = pow.check_work(nonce);
        let difficulty = if stats.min_diff == 0 { base_difficulty } else { stats.min_diff };
        if value > calculate_target(difficulty) {
            stats.invalid_shares += 1;
            MINER_INVALID_SHARES.with_label_values(&[address]).inc();
            debug!("Low-difficulty share: worker={miner_id}, nonce={nonce:016x}");
            return ShareOutcome::LowDifficulty;
        }

        let now = now_ms();
        stats.shares_found += 1;
        stats.var_diff_shares_found += 1;
        stats.last_share = now;
        stats.push_recent_share(now, difficulty, nonce);
        MINER_ADDED_SHARES.with_label_values(&[address]).inc();

        let daa_score = self.jobs.daa_score_of_job(job_id).await;
        miners.window.push(Contribution {
            address: address.to_owned(),
            miner_id: miner_id.to_owned(),
            difficulty,
            timestamp: now,
            job_id: job_id.to_owned(),
            daa_score,
        });
        SHARE_WINDOW_SIZE.set(miners.window.len() as f64);

        if is_block {
            match self.jobs.submit(miner_id, address, header_hash, nonce).await {
                Ok(()) => {
                    stats.blocks_found += 1;
                    MINER_BLOCKS_FOUND.with_label_values(&[address]).inc();
                    info!("Block found by {address}.{miner_id}, nonce={nonce:016x}");
                }
                // the share itself stays credited
                Err(e) => warn!("Block submission failed for {address}.{miner_id}: {e}"),
            }
        }

        ShareOutcome::Accepted { is_block }
    }

    /// Allocator API: drains credited shares up to the DAA-score cut-off.
    pub async fn drain_by_daa_score(&self, cutoff: u64) -> Vec<Contribution> {
        let mut miners = self.miners.lock().await;
        let drained = miners.window.drain_up_to(cutoff);
        SHARE_WINDOW_SIZE.set(miners.window.len() as f64);
        drained
    }

    /// Allocator API: synthetic contributions for reward events with no
    /// DAA-anchored shares. Each live worker is weighted by how long it has
    /// been waiting for its next share, capped at the ramp-up horizon.
    pub async fn fallback_snapshot(&self) -> Vec<Contribution> {
        let miners = self.miners.lock().await;
        let now = now_ms();
        let mut snapshot = Vec::new();
        for (address, miner) in &miners.by_address {
            for (name, entry) in &miner.workers {
                let stats = entry.stats.read().await;
                let elapsed = now.saturating_sub(stats.last_share).min(FALLBACK_RAMP_MS);
                let weight = elapsed as f64 / FALLBACK_RAMP_MS as f64;
                let mut difficulty = (weight * stats.min_diff as f64).round() as u64;
                if difficulty == 0 {
                    difficulty = (stats.min_diff / 10).max(1);
                }
                snapshot.push(Contribution {
                    address: address.clone(),
                    miner_id: name.clone(),
                    difficulty,
                    timestamp: now,
                    job_id: String::new(),
                    daa_score: 0,
                });
            }
        }
        snapshot
    }

    /// Signals every live socket to close, recording the given reason.
    pub async fn close_all_sockets(&self, reason: &str) {
        let miners = self.miners.lock().await;
        for miner in miners.by_address.values() {
            for close in miner.sockets.values() {
                let _ = close.send(reason.into());
            }
        }
    }

    /// Snapshot of every worker's stats handle, for the periodic loops.
    pub async fn snapshot_workers(&self) -> Vec<Arc<RwLock<WorkerStats>>> {
        let miners = self.miners.lock().await;
        miners
            .by_address
            .values()
            .flat_map(|m| m.workers.values().map(|w| Arc::clone(&w.stats)))
            .collect()
    }

    pub async fn window_len(&self) -> usize {
        self.miners.lock().await.window.len()
    }

    pub fn start_stats_reporter(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.report_stats().await;
            }
        });
    }

    /// One reporter pass: refresh gauges, print the worker table and ask the
    /// server to close sockets whose workers went quiet. Accounting is never
    /// touched here.
    pub async fn report_stats(&self) {
        let snapshot = {
            let miners = self.miners.lock().await;
            SHARE_WINDOW_SIZE.set(miners.window.len() as f64);
            let mut snapshot = Vec::new();
            for miner in miners.by_address.values() {
                for worker in miner.workers.values() {
                    snapshot.push((
                        Arc::clone(&worker.stats),
                        worker.conn_id,
                        miner.sockets.get(&worker.conn_id).cloned(),
                    ));
                }
            }
            snapshot
        };

        let now = now_ms();
        let mut rows = Vec::new();
        let mut totals = (0u64, 0u64, 0u64, 0u64, 0.0f64);
        for (stats_lock, conn_id, close) in &snapshot {
            let mut stats = stats_lock.write().await;
            let hashrate = stats.hashrate_ghs(now);
            stats.hashrate_ghs = hashrate;
            let active = stats.check_active(now);

            WORKER_HASHRATE_GHS
                .with_label_values(&[&stats.address, &stats.worker_name])
                .set(hashrate);
            WORKER_LAST_ACTIVE
                .with_label_values(&[&stats.address, &stats.worker_name])
                .set(active as f64);

            totals.0 += stats.shares_found;
            totals.1 += stats.stale_shares;
            totals.2 += stats.invalid_shares;
            totals.3 += stats.blocks_found;
            totals.4 += hashrate;

            let uptime_mins = now.saturating_sub(stats.start_time) as f64 / 60_000.0;
            rows.push(format!(
                "| {:<24} | {:>11} | {:>8} | {:>14} | {:>6} | {:>7} |",
                truncate(&stats.worker_name, 24),
                format_hashrate(hashrate),
                stats.min_diff,
                format!("{}/{}/{}", stats.shares_found, stats.stale_shares, stats.invalid_shares),
                stats.blocks_found,
                format!("{uptime_mins:.1}m"),
            ));

            if active == 0 {
                if let Some(close) = close {
                    info!(
                        "Closing idle connection {} for worker {}.{}",
                        conn_id, stats.address, stats.worker_name
                    );
                    let _ = close.send("inactive worker".into());
                }
            }
        }

        if rows.is_empty() {
            return;
        }
        let border = format!(
            "+-{}-+-{}-+-{}-+-{}-+-{}-+-{}-+",
            "-".repeat(24),
            "-".repeat(11),
            "-".repeat(8),
            "-".repeat(14),
            "-".repeat(6),
            "-".repeat(7)
        );
        let mut out = vec![
            border.clone(),
            format!(
                "| {:<24} | {:>11} | {:>8} | {:>14} | {:>6} | {:>7} |",
                "Worker", "Hash", "Diff", "Acc/Stl/Inv", "Blocks", "Time"
            ),
            border.clone(),
        ];
        out.extend(rows);
        out.push(border.clone());
        out.push(format!(
            "| {:<24} | {:>11} | {:>8} | {:>14} | {:>6} | {:>7} |",
            "TOTAL",
            format_hashrate(totals.4),
            "-",
            format!("{}/{}/{}", totals.0, totals.1, totals.2),
            totals.3,
            "-"
        ));
        out.push(border);
        info!("\n{}", out.join("\n"));
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        None => s,
        Some((idx, _)) => &s[..idx],
    }
}

fn format_hashrate(ghs: f64) -> String {
    if ghs < 1.0 {
        format!("{:.2}MH/s", ghs * 1000.0)
    } else if ghs < 1000.0 {
        format!("{ghs:.2}GH/s")
    } else {
        format!("{:.2}TH/s", ghs / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Command, NodeHandle};
    use crate::pow::tests::test_header;
    use crate::pow::RawHeader;

    const ADDRESS: &str = "kaspa:qqtestaddr0";

    struct Setup {
        manager: Arc<SharesManager>,
        jobs: Arc<Jobs>,
        node_recv: mpsc::UnboundedReceiver<Command>,
    }

    fn setup() -> Setup {
        let (handle, node_recv) = NodeHandle::new();
        let jobs = Jobs::new(handle, 8);
        let manager = SharesManager::new(Arc::clone(&jobs));
        Setup { manager, jobs, node_recv }
    }

    async fn authorize(
        manager: &SharesManager,
        worker: &str,
        min_diff: u64,
    ) -> (Arc<RwLock<WorkerStats>>, mpsc::UnboundedReceiver<Box<str>>) {
        let (close, close_recv) = mpsc::unbounded_channel();
        let stats = WorkerStats::new(ADDRESS, worker, min_diff, "unknown", true);
        let stats = manager.authorize_worker(1, close, stats).await.unwrap();
        (stats, close_recv)
    }

    async fn insert_template(jobs: &Jobs, header: RawHeader) -> (String, BlockHash) {
        let hash = header.finalize_hash().unwrap();
        let job = jobs.on_template(header).await.unwrap().unwrap();
        (job.job_id, hash)
    }

    /// Header whose network target is 1, so no share is ever a block.
    fn no_block_header(daa_score: u64) -> RawHeader {
        let mut header = test_header(daa_score, daa_score);
        header.bits = 0x03000001;
        header
    }

    #[tokio::test]
    async fn share_from_unregistered_worker_is_unauthorized() {
        let s = setup();
        let outcome = s.manager.add_share("w1", ADDRESS, &[0u8; 32], 1, 1, "a1b2").await;
        assert_eq!(outcome, ShareOutcome::Unauthorized);
        assert_eq!(s.manager.window_len().await, 0);
    }

    #[tokio::test]
    async fn accepted_share_credits_exactly_once() {
        let s = setup();
        let (job_id, hash) = insert_template(&s.jobs, no_block_header(500)).await;
        let (stats, _close) = authorize(&s.manager, "w1", 1).await;

        let outcome = s.manager.add_share("w1", ADDRESS, &hash, 1, 0x4d2, &job_id).await;
        assert_eq!(outcome, ShareOutcome::Accepted { is_block: false });

        let stats = stats.read().await;
        assert_eq!(stats.shares_found, 1);
        assert_eq!(stats.var_diff_shares_found, 1);
        assert_eq!(stats.stale_shares + stats.invalid_shares + stats.duplicate_shares, 0);
        assert_eq!(stats.recent_shares.len(), 1);
        assert!(stats.last_share > 0);

        assert_eq!(s.manager.window_len().await, 1);
        let drained = s.manager.drain_by_daa_score(500).await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].daa_score, 500);
        assert_eq!(drained[0].miner_id, "w1");
    }

    #[tokio::test]
    async fn duplicate_nonce_credits_only_the_first() {
        let s = setup();
        let (job_id, hash) = insert_template(&s.jobs, no_block_header(1)).await;
        let (stats, _close) = authorize(&s.manager, "w1", 1).await;

        let first = s.manager.add_share("w1", ADDRESS, &hash, 1, 42, &job_id).await;
        let second = s.manager.add_share("w1", ADDRESS, &hash, 1, 42, &job_id).await;
        assert_eq!(first, ShareOutcome::Accepted { is_block: false });
        assert_eq!(second, ShareOutcome::Duplicate);

        let stats = stats.read().await;
        assert_eq!(stats.shares_found, 1);
        assert_eq!(stats.duplicate_shares, 1);
        assert_eq!(s.manager.window_len().await, 1);
    }

    #[tokio::test]
    async fn evicted_template_makes_shares_stale() {
        let (handle, _node_recv) = NodeHandle::new();
        let jobs = Jobs::new(handle, 1);
        let manager = SharesManager::new(Arc::clone(&jobs));

        let (job_id, hash) = insert_template(&jobs, no_block_header(1)).await;
        insert_template(&jobs, no_block_header(2)).await;

        let (close, _close_recv) = mpsc::unbounded_channel();
        let stats = WorkerStats::new(ADDRESS, "w1", 1, "unknown", true);
        let stats = manager.authorize_worker(1, close, stats).await.unwrap();

        let outcome = manager.add_share("w1", ADDRESS, &hash, 1, 7, &job_id).await;
        assert_eq!(outcome, ShareOutcome::Stale);
        assert_eq!(stats.read().await.stale_shares, 1);
        assert_eq!(stats.read().await.shares_found, 0);
    }

    #[tokio::test]
    async fn weak_share_is_rejected_as_low_difficulty() {
        let s = setup();
        let (job_id, hash) = insert_template(&s.jobs, no_block_header(1)).await;
        let (stats, _close) = authorize(&s.manager, "w1", u64::MAX).await;

        // hunt for a nonce whose PoW value misses the (tiny) share target
        let pow = s.jobs.pow_of(&hash).await.unwrap();
        let target = calculate_target(u64::MAX);
        let nonce = (0..1024u64)
            .find(|n| {
                let (_, value) = pow.check_work(*n);
                value > target
            })
            .expect("a weak nonce exists");

        let outcome = s.manager.add_share("w1", ADDRESS, &hash, 1, nonce, &job_id).await;
        assert_eq!(outcome, ShareOutcome::LowDifficulty);
        let stats = stats.read().await;
        assert_eq!(stats.invalid_shares, 1);
        assert_eq!(stats.shares_found, 0);
        assert_eq!(s.manager.window_len().await, 0);
    }

    #[tokio::test]
    async fn block_share_is_submitted_upstream() {
        let mut s = setup();
        // default test bits put the network target near 2^255, so roughly
        // every other nonce is a block; hunt one down
        let (job_id, hash) = insert_template(&s.jobs, test_header(9, 9)).await;
        let (stats, _close) = authorize(&s.manager, "w1", 1).await;

        let pow = s.jobs.pow_of(&hash).await.unwrap();
        let nonce = (0..4096u64).find(|n| pow.check_work(*n).0).expect("a block nonce exists");

        let outcome = s.manager.add_share("w1", ADDRESS, &hash, 1, nonce, &job_id).await;
        assert_eq!(outcome, ShareOutcome::Accepted { is_block: true });
        assert_eq!(stats.read().await.blocks_found, 1);
        assert_eq!(stats.read().await.shares_found, 1);

        match s.node_recv.recv().await {
            Some(Command::SubmitBlock(block)) => assert_eq!(block.nonce, nonce),
            None => panic!("block never reached the submit capability"),
        }
    }

    #[tokio::test]
    async fn zero_min_diff_falls_back_to_base_difficulty() {
        let s = setup();
        let (job_id, hash) = insert_template(&s.jobs, no_block_header(1)).await;
        let (stats, _close) = authorize(&s.manager, "w1", 0).await;

        let outcome = s.manager.add_share("w1", ADDRESS, &hash, 1, 3, &job_id).await;
        assert_eq!(outcome, ShareOutcome::Accepted { is_block: false });
        assert_eq!(stats.read().await.recent_shares[0].difficulty, 1);
    }

    #[tokio::test]
    async fn duplicate_worker_name_is_rejected() {
        let s = setup();
        let (_stats, _close) = authorize(&s.manager, "w1", 64).await;

        let (close, _recv) = mpsc::unbounded_channel();
        let again = WorkerStats::new(ADDRESS, "w1", 64, "unknown", true);
        assert_eq!(s.manager.authorize_worker(2, close, again).await.unwrap_err(), DuplicateWorker);
    }

    #[tokio::test]
    async fn disconnect_prunes_empty_miner_entries() {
        let s = setup();
        let (_stats, _close) = authorize(&s.manager, "w1", 64).await;
        assert_eq!(s.manager.snapshot_workers().await.len(), 1);

        s.manager.disconnect(1, &[(ADDRESS.to_string(), "w1".to_string())]).await;
        assert!(s.manager.snapshot_workers().await.is_empty());
        assert_eq!(
            s.manager.add_share("w1", ADDRESS, &[0u8; 32], 1, 1, "a1b2").await,
            ShareOutcome::Unauthorized
        );
    }

    #[tokio::test]
    async fn fallback_snapshot_floors_fresh_workers() {
        let s = setup();
        let (stats, _close) = authorize(&s.manager, "w1", 1000).await;
        // just shared: ramp weight rounds to zero, floor kicks in
        stats.write().await.last_share = now_ms();

        let snapshot = s.manager.fallback_snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].difficulty, 100);

        // never shared: full weight
        let (_stats2, _close2) = authorize(&s.manager, "w2", 1000).await;
        let snapshot = s.manager.fallback_snapshot().await;
        let full = snapshot.iter().find(|c| c.miner_id == "w2").unwrap();
        assert_eq!(full.difficulty, 1000);
    }

    #[tokio::test]
    async fn fallback_snapshot_floor_is_at_least_one() {
        let s = setup();
        let (stats, _close) = authorize(&s.manager, "w1", 4).await;
        stats.write().await.last_share = now_ms();

        let snapshot = s.manager.fallback_snapshot().await;
        assert_eq!(snapshot[0].difficulty, 1);
    }

    #[tokio::test]
    async fn drained_shares_leave_higher_scores_behind() {
        let s = setup();
        let (job_a, hash_a) = insert_template(&s.jobs, no_block_header(10)).await;
        let (job_b, hash_b) = insert_template(&s.jobs, no_block_header(20)).await;
        let (_stats, _close) = authorize(&s.manager, "w1", 1).await;

        s.manager.add_share("w1", ADDRESS, &hash_a, 1, 1, &job_a).await;
        s.manager.add_share("w1", ADDRESS, &hash_b, 1, 2, &job_b).await;

        let drained = s.manager.drain_by_daa_score(10).await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].daa_score, 10);
        assert_eq!(s.manager.window_len().await, 1);
    }
}
