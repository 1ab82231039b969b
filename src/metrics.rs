use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static::lazy_static! {
    pub static ref MINER_ADDED_SHARES: CounterVec = register_counter_vec!(
        "miner_added_shares",
        "Number of shares accepted by miner address",
        &["address"]
    ).unwrap();

    pub static ref MINER_STALE_SHARES: CounterVec = register_counter_vec!(
        "miner_stale_shares",
        "Number of stale shares submitted by miner address",
        &["address"]
    ).unwrap();

    pub static ref MINER_INVALID_SHARES: CounterVec = register_counter_vec!(
        "miner_invalid_shares",
        "Number of low-difficulty shares submitted by miner address",
        &["address"]
    ).unwrap();

    pub static ref MINER_DUPLICATED_SHARES: CounterVec = register_counter_vec!(
        "miner_duplicated_shares",
        "Number of duplicated shares submitted by miner address",
        &["address"]
    ).unwrap();

    pub static ref MINER_BLOCKS_FOUND: CounterVec = register_counter_vec!(
        "miner_blocks_found",
        "Number of blocks found by miner address",
        &["address"]
    ).unwrap();

    pub static ref WORKER_HASHRATE_GHS: GaugeVec = register_gauge_vec!(
        "worker_hashrate_ghs",
        "Estimated worker hashrate in GH/s over the share window",
        &["address", "worker"]
    ).unwrap();

    pub static ref WORKER_LAST_ACTIVE: GaugeVec = register_gauge_vec!(
        "worker_last_active",
        "Unix seconds of the worker's last share inside the active window, 0 if inactive",
        &["address", "worker"]
    ).unwrap();

    pub static ref SHARE_WINDOW_SIZE: Gauge = register_gauge!(
        "share_window_size",
        "Current size of the share window"
    ).unwrap();

    pub static ref ACTIVE_CONNECTIONS: Gauge = register_gauge!(
        "active_connections",
        "Number of live stratum connections"
    ).unwrap();
}
