//src/stratum/server.rs

use anyhow::Result;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use crate::config::PoolConfig;
use crate::metrics::ACTIVE_CONNECTIONS;
use crate::node::NodeHandle;
use crate::pow::RawHeader;
use crate::shares::manager::SharesManager;
use crate::stratum::jobs::Jobs;
use crate::stratum::protocol::{JobEncoding, StratumConn};
use crate::stratum::variable_difficulty::VariableDifficulty;
use crate::stratum::worker_stats::now_ms;

/// Wires the registry, shares manager and periodic tasks together and fans
/// incoming templates out to every subscribed connection.
pub struct Stratum {
    pub jobs: Arc<Jobs>,
    pub shares: Arc<SharesManager>,
    pub config: Arc<PoolConfig>,
    pub local_addrs: Vec<SocketAddr>,
    shutdown: broadcast::Sender<()>,
}

impl Stratum {
    pub async fn new(config: PoolConfig, handle: NodeHandle) -> Result<Self> {
        let config = Arc::new(config);
        let jobs = Jobs::new(handle, config.template_cache_size);
        let shares = SharesManager::new(Arc::clone(&jobs));
        let (shutdown, _) = broadcast::channel(1);

        shares.start_stats_reporter();
        Arc::new(VariableDifficulty::new(config.difficulty.clone(), Arc::clone(&shares))).start();

        let conn_counter = Arc::new(AtomicU64::new(1));
        let mut local_addrs = Vec::new();
        for port in &config.stratum_ports {
            let listener = TcpListener::bind(("0.0.0.0", *port)).await?;
            let local = listener.local_addr()?;
            info!("Listening on {local}");
            local_addrs.push(local);
            tokio::spawn(accept_loop(
                listener,
                local.port(),
                Arc::clone(&jobs),
                Arc::clone(&shares),
                Arc::clone(&config),
                Arc::clone(&conn_counter),
                shutdown.subscribe(),
            ));
        }

        Ok(Stratum { jobs, shares, config, local_addrs, shutdown })
    }

    /// Feeds a fresh template into the registry; subscribed connections pick
    /// the announcement up through the registry's job channel.
    pub async fn broadcast(&self, header: RawHeader) {
        match self.jobs.on_template(header).await {
            Ok(Some(job)) => debug!("Broadcasting new job: id={}", job.job_id),
            Ok(None) => debug!("Template already cached"),
            Err(e) => warn!("Dropping malformed template: {e}"),
        }
    }

    /// Stops accepting connections and closes every live socket.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.shares.close_all_sockets("server shutdown").await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    jobs: Arc<Jobs>,
    shares: Arc<SharesManager>,
    config: Arc<PoolConfig>,
    conn_counter: Arc<AtomicU64>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Stopped accepting connections on port {port}");
                break;
            }
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    let conn_id = conn_counter.fetch_add(1, AtomicOrdering::SeqCst);
                    info!("New connection {conn_id} from {peer} on port {port}");
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        port,
                        conn_id,
                        Arc::clone(&jobs),
                        Arc::clone(&shares),
                        Arc::clone(&config),
                    ));
                }
                Err(e) => error!("Failed to accept connection: {e}"),
            },
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    port: u16,
    conn_id: u64,
    jobs: Arc<Jobs>,
    shares: Arc<SharesManager>,
    config: Arc<PoolConfig>,
) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (close_send, close_recv) = mpsc::unbounded_channel();
    let now = now_ms();
    let default_difficulty = config.difficulty.default;

    let mut conn = StratumConn {
        conn_id,
        reader,
        writer,
        recv: jobs.subscribe(),
        jobs,
        shares: Arc::clone(&shares),
        config,
        close_send,
        close_recv,
        peer,
        port,
        subscribed: false,
        agent: None,
        asic_type: "unknown",
        encoding: JobEncoding::BigHeader,
        extranonce: String::new(),
        difficulty: default_difficulty,
        connected_at: now,
        last_seen: now,
        duplicate_count: 0,
        buffer: Vec::new(),
        workers: HashMap::new(),
        close_reason: None,
    };

    ACTIVE_CONNECTIONS.inc();
    let result = conn.run().await;
    ACTIVE_CONNECTIONS.dec();

    let reason = conn.close_reason.clone().unwrap_or_else(|| "connection task ended".into());
    match result {
        Ok(()) => info!("Connection {conn_id} from {peer} closed: {reason}"),
        Err(e) => warn!("Connection {conn_id} from {peer} errored: {e} ({reason})"),
    }
    shares.disconnect(conn_id, &conn.bindings()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DifficultyConfig;
    use crate::pow::tests::test_header;
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn test_config() -> PoolConfig {
        PoolConfig {
            stratum_ports: vec![0],
            client_diff_port: 8888,
            extranonce_size: 0,
            template_cache_size: 8,
            template_feed_addr: String::new(),
            difficulty: DifficultyConfig {
                min: 1,
                default: 1,
                max: 131_072,
                enabled: true,
                clamp_pow2: true,
                target_shares_per_min: 20.0,
            },
        }
    }

    #[tokio::test]
    async fn stratum_session_end_to_end() {
        let (handle, _node_recv) = NodeHandle::new();
        let stratum = Stratum::new(test_config(), handle).await.unwrap();
        let addr = stratum.local_addrs[0];

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        // subscribe
        writer
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"test-miner\"]}\n")
            .await
            .unwrap();
        let resp: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"][0], true);
        assert_eq!(resp["result"][1], "EthereumStratum/1.0.0");

        // authorize: response, then the initial difficulty
        writer
            .write_all(
                b"{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"kaspa:qqtestaddr0.w1\",\"x\"]}\n",
            )
            .await
            .unwrap();
        let resp: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp["id"], 2);
        assert_eq!(resp["result"], true);
        let notif: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(notif["method"], "mining.set_difficulty");
        assert_eq!(notif["params"][0], 1);

        // a new template reaches the subscriber as mining.notify
        stratum.broadcast(test_header(42, 42)).await;
        let notif: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(notif["method"], "mining.notify");
        let job_id = notif["params"][0].as_str().unwrap().to_string();
        assert_eq!(job_id.len(), 4);

        // a share on the live job is accepted
        writer
            .write_all(
                format!(
                    "{{\"id\":3,\"method\":\"mining.submit\",\"params\":[\"kaspa:qqtestaddr0.w1\",\"{job_id}\",\"00000000000004d2\"]}}\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let resp: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp["id"], 3);
        assert_eq!(resp["result"], true);
        assert!(resp["error"].is_null());

        // unknown job id fails with 21
        writer
            .write_all(
                b"{\"id\":4,\"method\":\"mining.submit\",\"params\":[\"kaspa:qqtestaddr0.w1\",\"zzzz\",\"1\"]}\n",
            )
            .await
            .unwrap();
        let resp: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp["error"][0], 21);

        // re-subscribe on the same socket fails with 20
        writer
            .write_all(b"{\"id\":5,\"method\":\"mining.subscribe\",\"params\":[\"test-miner\"]}\n")
            .await
            .unwrap();
        let resp: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp["error"][0], 20);

        // unknown method yields 20 and closes the socket
        writer
            .write_all(b"{\"id\":6,\"method\":\"mining.bogus\",\"params\":[]}\n")
            .await
            .unwrap();
        let resp: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp["error"][0], 20);
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn password_difficulty_is_ignored_off_the_client_diff_port() {
        let (handle, _node_recv) = NodeHandle::new();
        let mut config = test_config();
        config.difficulty.min = 64;
        config.difficulty.default = 2048;
        let stratum = Stratum::new(config, handle).await.unwrap();
        let addr = stratum.local_addrs[0];

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"m\"]}\n")
            .await
            .unwrap();
        lines.next_line().await.unwrap().unwrap();

        // not on the client-diff port: password difficulty is ignored
        writer
            .write_all(
                b"{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"kaspa:qqtestaddr0.w1\",\"d=512\"]}\n",
            )
            .await
            .unwrap();
        lines.next_line().await.unwrap().unwrap();
        let notif: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(notif["method"], "mining.set_difficulty");
        assert_eq!(notif["params"][0], 2048);
    }
}
