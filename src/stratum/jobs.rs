//src/stratum/jobs.rs

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};

use crate::node::NodeHandle;
use crate::pow::{BlockHash, Pow, RawHeader};

/// Job ids kept resolvable (for stale detection and DAA lookup) well past
/// template eviction, bounded by this multiple of the template cache.
const JOB_MAP_FACTOR: usize = 16;

/// Window inside which re-submission of the same completed block is dropped.
const SUBMIT_DEDUP_WINDOW: Duration = Duration::from_secs(10);

/// Payload delivered to job listeners on every fresh template.
#[derive(Clone, Debug)]
pub struct JobNotification {
    pub job_id: String,
    pub pre_pow_hash: BlockHash,
    pub timestamp: u64,
    pub header: Arc<RawHeader>,
}

#[derive(Debug)]
struct CachedTemplate {
    header: RawHeader,
    pow: Arc<Pow>,
    daa_score: u64,
}

#[derive(Debug, Default)]
struct JobsInner {
    templates: HashMap<BlockHash, CachedTemplate>,
    /// Insertion order of cached templates, oldest first.
    template_order: VecDeque<(String, BlockHash)>,
    job_to_hash: HashMap<String, BlockHash>,
    job_daa: HashMap<String, u64>,
    job_order: VecDeque<String>,
}

/// Registry of current and recent block templates, keyed by header hash and
/// exposed to miners under short random job ids.
pub struct Jobs {
    inner: RwLock<JobsInner>,
    notify: watch::Sender<Option<JobNotification>>,
    handle: NodeHandle,
    cache_size: usize,
    submitted: Arc<DashMap<String, Instant>>,
}

impl Jobs {
    pub fn new(handle: NodeHandle, cache_size: usize) -> Arc<Self> {
        let (notify, _) = watch::channel(None);
        let jobs = Arc::new(Self {
            inner: RwLock::new(JobsInner::default()),
            notify,
            handle,
            cache_size: cache_size.max(1),
            submitted: Arc::new(DashMap::new()),
        });
        tokio::spawn({
            let submitted = Arc::clone(&jobs.submitted);
            async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    let now = Instant::now();
                    submitted.retain(|_, v| now.duration_since(*v) < SUBMIT_DEDUP_WINDOW);
                }
            }
        });
        jobs
    }

    /// Registers listeners for new-job announcements.
    pub fn subscribe(&self) -> watch::Receiver<Option<JobNotification>> {
        self.notify.subscribe()
    }

    /// Caches an incoming template and announces it under a fresh job id.
    /// A header already cached is a no-op.
    pub async fn on_template(&self, header: RawHeader) -> Result<Option<JobNotification>> {
        let header_hash = header.finalize_hash()?;
        let pre_pow_hash = header.pre_pow_hash()?;
        let pow = Arc::new(Pow::new(&header)?);

        let mut w = self.inner.write().await;
        if w.templates.contains_key(&header_hash) {
            return Ok(None);
        }

        let job_id = loop {
            let id = hex::encode(rand::random::<[u8; 2]>());
            if !w.job_to_hash.contains_key(&id) {
                break id;
            }
        };

        let daa_score = header.daa_score;
        let timestamp = header.timestamp;
        let notification = JobNotification {
            job_id: job_id.clone(),
            pre_pow_hash,
            timestamp,
            header: Arc::new(header.clone()),
        };

        w.templates.insert(header_hash, CachedTemplate { header, pow, daa_score });
        w.template_order.push_back((job_id.clone(), header_hash));
        w.job_to_hash.insert(job_id.clone(), header_hash);
        w.job_daa.insert(job_id.clone(), daa_score);
        w.job_order.push_back(job_id.clone());

        while w.templates.len() > self.cache_size {
            if let Some((_, old_hash)) = w.template_order.pop_front() {
                w.templates.remove(&old_hash);
            }
        }
        // the job maps outlive their templates so shares still in flight, or
        // still sitting in the share window, keep resolving
        while w.job_order.len() > self.cache_size * JOB_MAP_FACTOR {
            if let Some(old_id) = w.job_order.pop_front() {
                w.job_to_hash.remove(&old_id);
                w.job_daa.remove(&old_id);
            }
        }
        drop(w);

        debug!(target: "stratum::jobs", "Inserted job: id={job_id}, daa_score={daa_score}");
        self.notify.send_replace(Some(notification.clone()));
        Ok(Some(notification))
    }

    pub async fn hash_of_job(&self, job_id: &str) -> Option<BlockHash> {
        self.inner.read().await.job_to_hash.get(job_id).copied()
    }

    pub async fn pow_of(&self, header_hash: &BlockHash) -> Option<Arc<Pow>> {
        self.inner.read().await.templates.get(header_hash).map(|t| Arc::clone(&t.pow))
    }

    /// DAA score recorded for the job, 0 when the id is unknown.
    pub async fn daa_score_of_job(&self, job_id: &str) -> u64 {
        self.inner.read().await.job_daa.get(job_id).copied().unwrap_or(0)
    }

    /// Stamps the nonce into the cached template and hands the completed
    /// block to the upstream submit capability.
    pub async fn submit(
        &self,
        miner_id: &str,
        address: &str,
        header_hash: &BlockHash,
        nonce: u64,
    ) -> Result<()> {
        let mut block = {
            let r = self.inner.read().await;
            match r.templates.get(header_hash) {
                Some(t) => t.header.clone(),
                None => return Err(anyhow!("Template no longer cached")),
            }
        };
        block.nonce = nonce;
        let block_hash = hex::encode(block.finalize_hash()?);

        let key = format!("{block_hash}:{nonce:016x}");
        let now = Instant::now();
        if let Some(entry) = self.submitted.get(&key) {
            if now.duration_since(*entry.value()) < SUBMIT_DEDUP_WINDOW {
                warn!(target: "stratum::jobs",
                    "Duplicate block submission: block_hash={block_hash}, nonce={nonce:016x}, miner={miner_id}"
                );
                return Err(anyhow!("Duplicate block submission"));
            }
        }
        self.submitted.insert(key, now);

        if !self.handle.submit_block(block) {
            return Err(anyhow!("Upstream submit channel closed"));
        }
        info!(target: "stratum::jobs",
            "Submitted block: block_hash={block_hash}, nonce={nonce:016x}, miner={miner_id}, address={address}"
        );
        Ok(())
    }
}
