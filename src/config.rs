// src/config.rs

use log::info;
use std::env;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub stratum_ports: Vec<u16>,
    /// Port on which the authorize password may carry a client-chosen difficulty.
    pub client_diff_port: u16,
    /// Extranonce width in bytes, 0..=3. 0 disables extranonce assignment.
    pub extranonce_size: u8,
    pub template_cache_size: usize,
    pub template_feed_addr: String,
    pub difficulty: DifficultyConfig,
}

#[derive(Debug, Clone)]
pub struct DifficultyConfig {
    pub min: u64,
    pub default: u64,
    pub max: u64,
    pub enabled: bool,
    pub clamp_pow2: bool,
    pub target_shares_per_min: f64,
}

fn parse_env<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(fallback)
}

impl PoolConfig {
    pub fn load() -> Self {
        let ports_str = env::var("STRATUM_PORTS").unwrap_or("5555,8888".to_string());
        let mut stratum_ports: Vec<u16> =
            ports_str.split(',').filter_map(|s| s.trim().parse().ok()).collect();
        if stratum_ports.is_empty() {
            stratum_ports.push(5555);
        }

        let config = Self {
            stratum_ports,
            client_diff_port: parse_env("CLIENT_DIFF_PORT", 8888),
            extranonce_size: parse_env::<u8>("EXTRANONCE_SIZE", 2).min(3),
            template_cache_size: parse_env("TEMPLATE_CACHE_SIZE", 256),
            template_feed_addr: env::var("TEMPLATE_FEED_ADDR")
                .unwrap_or("localhost:7171".to_string()),
            difficulty: DifficultyConfig::load(),
        };

        info!(
            "Stratum ports: {:?} | Client-diff port: {} | Extranonce: {} bytes | Template cache: {}",
            config.stratum_ports,
            config.client_diff_port,
            config.extranonce_size,
            config.template_cache_size
        );

        config
    }
}

impl DifficultyConfig {
    pub fn load() -> Self {
        let min = parse_env("POOL_MIN_DIFFICULTY", 64);

        let default = parse_env::<u64>("POOL_DEFAULT_DIFFICULTY", 2048).max(min);

        let max = parse_env::<u64>("POOL_MAX_DIFFICULTY", 131_072).max(default);

        let enabled = env::var("VARDIFF_ENABLED")
            .ok()
            .and_then(|s| s.to_lowercase().parse().ok())
            .unwrap_or(true);

        let clamp_pow2 = env::var("VARDIFF_CLAMP_POW2")
            .ok()
            .and_then(|s| s.to_lowercase().parse().ok())
            .unwrap_or(true);

        let target_shares_per_min = parse_env("VARDIFF_TARGET_SHARES_PER_MIN", 20.0);

        let config = Self { min, default, max, enabled, clamp_pow2, target_shares_per_min };

        info!(
            "VarDiff {} | Range: {} → {} | Default: {} | Target: {} shares/min | Pow2 clamp: {}",
            if config.enabled { "ENABLED" } else { "DISABLED" },
            config.min,
            config.max,
            config.default,
            config.target_shares_per_min,
            config.clamp_pow2
        );

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_ordered() {
        let cfg = DifficultyConfig {
            min: 64,
            default: 2048,
            max: 131_072,
            enabled: true,
            clamp_pow2: true,
            target_shares_per_min: 20.0,
        };
        assert!(cfg.min <= cfg.default && cfg.default <= cfg.max);
    }
}
