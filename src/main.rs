use anyhow::{Context, Result};
use dotenv::dotenv;
use log::{debug, info, warn, LevelFilter};
use std::env;

use crate::config::PoolConfig;
use crate::node::{Client, Message, NodeHandle};
use crate::stratum::server::Stratum;

mod config;
mod metrics;
mod node;
mod pow;
mod shares;
mod stratum;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let debug = env::var("DEBUG").map(|v| v.to_lowercase() == "true").unwrap_or(false);
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };

    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("kaspad_stratum", level)
        .init();

    let config = PoolConfig::load();
    let feed_addr = config.template_feed_addr.clone();

    let (handle, recv_cmd) = NodeHandle::new();
    let stratum = Stratum::new(config, handle).await.context("Failed to initialize Stratum")?;

    let mut msgs = Client::new(&feed_addr, recv_cmd);
    loop {
        tokio::select! {
            msg = msgs.recv() => match msg {
                Some(Message::Template(header)) => {
                    debug!("Received block template");
                    stratum.broadcast(header).await;
                }
                Some(Message::SubmitBlockResult(error)) => match error {
                    Some(e) => debug!("Submitted invalid block: {e}"),
                    None => info!("Found a block!"),
                },
                None => {
                    warn!("Template feed channel closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                stratum.shutdown().await;
                break;
            }
        }
    }

    Ok(())
}
