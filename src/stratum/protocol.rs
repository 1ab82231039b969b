use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch, RwLock};

use crate::config::PoolConfig;
use crate::shares::manager::{DuplicateWorker, ShareOutcome, SharesManager};
use crate::stratum::jobs::{JobNotification, Jobs};
use crate::stratum::worker_stats::{now_ms, WorkerStats};
use crate::stratum::{Id, Request, Response};

const NEW_LINE: &str = "\n";

/// A connection buffering this much without a newline is cut off.
const MAX_BUFFERED_BYTES: usize = 512;

/// Duplicate shares tolerated per connection before it is dropped.
const MAX_DUPLICATE_SHARES: u64 = 100;

pub const ERR_UNKNOWN: u64 = 20;
pub const ERR_JOB_NOT_FOUND: u64 = 21;
pub const ERR_DUPLICATE_SHARE: u64 = 22;
pub const ERR_LOW_DIFFICULTY_SHARE: u64 = 23;
pub const ERR_UNAUTHORIZED_WORKER: u64 = 24;
pub const ERR_NOT_SUBSCRIBED: u64 = 25;

const BITMAIN_KEYWORDS: [&str; 3] = ["godminer", "bitmain", "antminer"];
const ICERIVER_KEYWORDS: [&str; 3] = ["iceriver", "icemining", "icm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEncoding {
    BigHeader,
    Bitmain,
}

pub fn is_bitmain(agent: &str) -> bool {
    let agent = agent.to_lowercase();
    BITMAIN_KEYWORDS.iter().any(|k| agent.contains(k))
}

pub fn detect_asic_type(agent: &str) -> &'static str {
    let lowered = agent.to_lowercase();
    if BITMAIN_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        "bitmain"
    } else if ICERIVER_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        "iceriver"
    } else {
        "unknown"
    }
}

/// Splits `address.worker` and validates the address form.
pub fn parse_login(login: &str) -> Result<(&str, &str)> {
    let (address, worker) = login.split_once('.').unwrap_or((login, ""));
    if !(address.starts_with("kaspa:") || address.starts_with("kaspatest:")) || address.len() < 10 {
        return Err(anyhow!("Invalid address format"));
    }
    if worker.is_empty() {
        return Err(anyhow!("Empty worker name"));
    }
    Ok((address, worker))
}

/// Extracts a client-requested difficulty (`d=N` or `diff=N`) from the
/// authorize password.
pub fn parse_password_diff(password: &str) -> Option<u64> {
    password
        .split([',', ';', ' '])
        .find_map(|tok| tok.strip_prefix("d=").or_else(|| tok.strip_prefix("diff=")))
        .and_then(|v| v.parse().ok())
}

/// Snaps to the arithmetically nearest power of two, lower on ties.
pub fn nearest_pow2(value: u64) -> u64 {
    if value <= 1 {
        return 1;
    }
    let lower = 1u64 << (63 - value.leading_zeros());
    let upper = lower << 1;
    if upper != 0 && upper - value < value - lower {
        upper
    } else {
        lower
    }
}

/// Recovers the full 16-hex-char nonce from a submit. Bitmain firmware sends
/// the whole nonce as a decimal string; everything else sends hex, with the
/// server-assigned extranonce prefixed when one is in use.
pub fn parse_nonce(encoding: JobEncoding, extranonce: &str, raw: &str) -> Result<u64> {
    let raw = raw.trim_start_matches("0x");
    if encoding == JobEncoding::Bitmain {
        if let Ok(nonce) = raw.parse::<u64>() {
            return Ok(nonce);
        }
    }
    let width = 16 - extranonce.len();
    let assembled = if !extranonce.is_empty() && raw.len() <= width {
        format!("{extranonce}{raw:0>width$}")
    } else {
        raw.to_string()
    };
    Ok(u64::from_str_radix(&assembled, 16)?)
}

/// Builds `mining.notify` params for a job in the connection's encoding.
pub fn encode_job(encoding: JobEncoding, job: &JobNotification) -> Value {
    match encoding {
        JobEncoding::BigHeader => {
            let payload = format!(
                "{}{}",
                hex::encode(job.pre_pow_hash),
                hex::encode(job.timestamp.to_le_bytes())
            );
            json!([job.job_id, payload])
        }
        JobEncoding::Bitmain => {
            let words: Vec<u64> = job
                .pre_pow_hash
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().expect("chunk is 8 bytes")))
                .collect();
            json!([job.job_id, words, job.timestamp])
        }
    }
}

/// Reads one newline-terminated frame, keeping partial input in `buffer`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
) -> Result<Option<String>> {
    loop {
        if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8(line)?;
            return Ok(Some(line.trim().to_string()));
        }
        if buffer.len() > MAX_BUFFERED_BYTES {
            return Err(anyhow!("receive buffer overflow"));
        }
        let mut chunk = [0u8; 512];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

enum Handled {
    Continue,
    Close(Box<str>),
}

#[derive(Debug)]
pub struct WorkerSlot {
    pub address: String,
    pub stats: Arc<RwLock<WorkerStats>>,
}

pub struct StratumConn {
    pub conn_id: u64,
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
    pub recv: watch::Receiver<Option<JobNotification>>,
    pub jobs: Arc<Jobs>,
    pub shares: Arc<SharesManager>,
    pub config: Arc<PoolConfig>,
    pub close_send: mpsc::UnboundedSender<Box<str>>,
    pub close_recv: mpsc::UnboundedReceiver<Box<str>>,
    pub peer: SocketAddr,
    pub port: u16,
    pub subscribed: bool,
    pub agent: Option<String>,
    pub asic_type: &'static str,
    pub encoding: JobEncoding,
    pub extranonce: String,
    pub difficulty: u64,
    pub connected_at: u64,
    pub last_seen: u64,
    pub duplicate_count: u64,
    pub buffer: Vec<u8>,
    pub workers: HashMap<String, WorkerSlot>,
    pub close_reason: Option<Box<str>>,
}

impl StratumConn {
    /// `(address, worker)` pairs bound to this socket, for close cleanup.
    pub fn bindings(&self) -> Vec<(String, String)> {
        self.workers.iter().map(|(name, slot)| (slot.address.clone(), name.clone())).collect()
    }

    pub async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                res = self.recv.changed() => match res {
                    Err(_) => {
                        self.close_reason = Some("job channel closed".into());
                        break;
                    }
                    Ok(()) => {
                        if self.subscribed {
                            self.write_template().await?;
                        }
                    }
                },
                reason = self.close_recv.recv() => {
                    self.close_reason =
                        Some(reason.unwrap_or_else(|| "server shutdown".into()));
                    break;
                },
                res = read_frame(&mut self.reader, &mut self.buffer) => match res {
                    Ok(Some(line)) => {
                        self.last_seen = now_ms();
                        debug!("Received from {}: {line}", self.peer);
                        let msg = match serde_json::from_str::<Request>(&line) {
                            Ok(msg) if msg.is_well_formed() => msg,
                            _ => {
                                self.close_reason = Some("malformed message".into());
                                break;
                            }
                        };
                        match self.handle_message(msg).await? {
                            Handled::Continue => {}
                            Handled::Close(reason) => {
                                self.close_reason = Some(reason);
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        self.close_reason.get_or_insert("client closed connection".into());
                        break;
                    }
                    Err(e) => {
                        self.close_reason = Some(format!("socket error: {e}").into_boxed_str());
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: Request) -> Result<Handled> {
        let Some(id) = msg.id else {
            return Ok(Handled::Close("malformed message".into()));
        };
        let params: Vec<Value> =
            serde_json::from_value(msg.params.unwrap_or_else(|| json!([])))?;

        match &*msg.method {
            "mining.subscribe" => self.handle_subscribe(id, params).await,
            "mining.authorize" => self.handle_authorize(id, params).await,
            "mining.submit" => self.handle_submit(id, params).await,
            "mining.configure" => {
                self.write_response(
                    id,
                    Some(json!({"version-rolling": false, "minimum-difficulty": true})),
                )
                .await?;
                Ok(Handled::Continue)
            }
            method => {
                debug!("Unknown method {method} from {}", self.peer);
                self.write_error_response(id, ERR_UNKNOWN, "Unknown method".into()).await?;
                Ok(Handled::Close("unknown method".into()))
            }
        }
    }

    async fn handle_subscribe(&mut self, id: Id, params: Vec<Value>) -> Result<Handled> {
        if self.subscribed {
            self.write_error_response(id, ERR_UNKNOWN, "Already subscribed".into()).await?;
            return Ok(Handled::Continue);
        }

        let agent = params.first().and_then(Value::as_str).unwrap_or("").to_string();
        self.asic_type = detect_asic_type(&agent);
        if is_bitmain(&agent) {
            self.encoding = JobEncoding::Bitmain;
        }
        if self.config.extranonce_size > 0 {
            let mut bytes = vec![0u8; self.config.extranonce_size as usize];
            rand::thread_rng().fill(&mut bytes[..]);
            self.extranonce = hex::encode(bytes);
        }
        self.subscribed = true;
        info!("Worker subscribed from {}: agent={agent}, encoding={:?}", self.peer, self.encoding);

        let result = match self.encoding {
            JobEncoding::Bitmain => {
                json!([Value::Null, self.extranonce, 8 - self.extranonce.len() / 2])
            }
            JobEncoding::BigHeader => json!([true, "EthereumStratum/1.0.0"]),
        };
        self.write_response(id, Some(result)).await?;
        self.agent = Some(agent);
        Ok(Handled::Continue)
    }

    async fn handle_authorize(&mut self, id: Id, params: Vec<Value>) -> Result<Handled> {
        let login = params.first().and_then(Value::as_str).unwrap_or("");
        let password = params.get(1).and_then(Value::as_str).unwrap_or("");

        let (address, worker_name) = match parse_login(login) {
            Ok(parts) => parts,
            Err(e) => {
                self.write_error_response(id, ERR_UNAUTHORIZED_WORKER, e.to_string().into())
                    .await?;
                return Ok(Handled::Continue);
            }
        };
        if self.workers.contains_key(worker_name) {
            self.write_error_response(id, ERR_UNAUTHORIZED_WORKER, "Duplicate worker".into())
                .await?;
            return Ok(Handled::Continue);
        }

        let diff_cfg = &self.config.difficulty;
        let mut difficulty = diff_cfg.default;
        let mut var_diff = diff_cfg.enabled;
        if self.port == self.config.client_diff_port {
            if let Some(requested) = parse_password_diff(password) {
                if (diff_cfg.min..=diff_cfg.max).contains(&requested) {
                    // snapping may step outside the range, clamp wins
                    difficulty = nearest_pow2(requested).clamp(diff_cfg.min, diff_cfg.max);
                    var_diff = false;
                } else {
                    debug!(
                        "Requested difficulty {requested} outside [{}, {}], using default",
                        diff_cfg.min, diff_cfg.max
                    );
                }
            }
        }

        let stats =
            WorkerStats::new(address, worker_name, difficulty, self.asic_type, var_diff);
        let stats = match self
            .shares
            .authorize_worker(self.conn_id, self.close_send.clone(), stats)
            .await
        {
            Ok(stats) => stats,
            Err(DuplicateWorker) => {
                self.write_error_response(
                    id,
                    ERR_UNAUTHORIZED_WORKER,
                    "Worker name already in use".into(),
                )
                .await?;
                return Ok(Handled::Continue);
            }
        };

        info!("Authorized worker {address}.{worker_name} at difficulty {difficulty}");
        let address = address.to_string();
        let worker_name = worker_name.to_string();
        self.workers.insert(worker_name, WorkerSlot { address, stats: Arc::clone(&stats) });

        self.write_response(id, Some(true)).await?;
        if !self.extranonce.is_empty() {
            self.write_notification(
                "mining.set_extranonce",
                Some(json!([
                    self.extranonce,
                    8 - self.extranonce.len() / 2
                ])),
            )
            .await?;
        }
        self.write_notification("mining.set_difficulty", Some(json!([difficulty]))).await?;
        self.difficulty = difficulty;
        stats.write().await.var_diff_start_time = Some(now_ms());
        self.write_template().await?;
        Ok(Handled::Continue)
    }

    async fn handle_submit(&mut self, id: Id, params: Vec<Value>) -> Result<Handled> {
        if !self.subscribed {
            self.write_error_response(id, ERR_NOT_SUBSCRIBED, "Not subscribed".into()).await?;
            return Ok(Handled::Continue);
        }
        let (login, job_id, nonce_str): (String, String, String) =
            match serde_json::from_value(Value::Array(params)) {
                Ok(parsed) => parsed,
                Err(_) => {
                    self.write_error_response(id, ERR_UNKNOWN, "Malformed submit".into())
                        .await?;
                    return Ok(Handled::Continue);
                }
            };

        let (addr_part, worker_name) = login.split_once('.').unwrap_or((login.as_str(), ""));
        let address = match self.workers.get(worker_name) {
            Some(slot) if slot.address == addr_part => slot.address.clone(),
            _ => {
                self.write_error_response(
                    id,
                    ERR_UNAUTHORIZED_WORKER,
                    "Unauthorized worker".into(),
                )
                .await?;
                return Ok(Handled::Continue);
            }
        };

        let Some(header_hash) = self.jobs.hash_of_job(&job_id).await else {
            self.write_error_response(id, ERR_JOB_NOT_FOUND, "Job not found".into()).await?;
            return Ok(Handled::Continue);
        };

        let nonce = match parse_nonce(self.encoding, &self.extranonce, &nonce_str) {
            Ok(nonce) => nonce,
            Err(e) => {
                debug!("Bad nonce {nonce_str:?} from {}: {e}", self.peer);
                self.write_error_response(id, ERR_UNKNOWN, "Malformed nonce".into()).await?;
                return Ok(Handled::Continue);
            }
        };

        let outcome = self
            .shares
            .add_share(worker_name, &address, &header_hash, self.difficulty, nonce, &job_id)
            .await;
        match outcome {
            ShareOutcome::Accepted { .. } => self.write_response(id, Some(true)).await?,
            ShareOutcome::Unauthorized => {
                self.write_error_response(id, ERR_UNAUTHORIZED_WORKER, "Unauthorized worker".into())
                    .await?
            }
            ShareOutcome::Stale => {
                self.write_error_response(id, ERR_JOB_NOT_FOUND, "Job not found".into()).await?
            }
            ShareOutcome::LowDifficulty => {
                self.write_error_response(
                    id,
                    ERR_LOW_DIFFICULTY_SHARE,
                    "Low difficulty share".into(),
                )
                .await?
            }
            ShareOutcome::Duplicate => {
                self.duplicate_count += 1;
                self.write_error_response(id, ERR_DUPLICATE_SHARE, "Duplicate share".into())
                    .await?;
                if self.duplicate_count > MAX_DUPLICATE_SHARES {
                    warn!("Excessive duplicate shares from {}", self.peer);
                    return Ok(Handled::Close("excessive duplicate shares".into()));
                }
            }
        }
        Ok(Handled::Continue)
    }

    /// Announces the current job, preceded by a difficulty update when the
    /// vardiff controller moved any of this socket's workers.
    pub async fn write_template(&mut self) -> Result<()> {
        let job = match self.recv.borrow_and_update().clone() {
            Some(job) => job,
            None => return Ok(()),
        };

        let mut target_diff: Option<u64> = None;
        for slot in self.workers.values() {
            let diff = slot.stats.read().await.min_diff;
            target_diff = Some(target_diff.map_or(diff, |t| t.min(diff)));
        }
        if let Some(diff) = target_diff {
            if diff != self.difficulty {
                self.difficulty = diff;
                self.write_notification("mining.set_difficulty", Some(json!([diff]))).await?;
                // restart the vardiff tracker at the announced difficulty
                let now = now_ms();
                for slot in self.workers.values() {
                    let mut stats = slot.stats.write().await;
                    stats.var_diff_start_time = Some(now);
                    stats.var_diff_shares_found = 0;
                }
            }
        }

        let params = encode_job(self.encoding, &job);
        self.write_notification("mining.notify", Some(params)).await
    }

    async fn write_response<T: Serialize>(&mut self, id: Id, result: Option<T>) -> Result<()> {
        let res = Response::ok(id, result)?;
        self.write(&res).await
    }

    async fn write_error_response(&mut self, id: Id, code: u64, message: Box<str>) -> Result<()> {
        let res = Response::err(id, code, message)?;
        self.write(&res).await
    }

    async fn write_notification(
        &mut self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<()> {
        let req = Request { id: None, method: method.into(), params };
        self.write(&req).await
    }

    async fn write<T: Serialize>(&mut self, data: &T) -> Result<()> {
        let data = serde_json::to_vec(data)?;
        debug!("Writing to {}: {}", self.peer, String::from_utf8_lossy(&data));
        self.writer.write_all(&data).await?;
        self.writer.write_all(NEW_LINE.as_bytes()).await?;
        Ok(())
    }
}
