pub mod retry;

use alloy_primitives::U256;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::models::common::Config;

const WEI_PER_ETHER: f64 = 1e18;

/// Prefix for environment overrides, e.g. `NFT_INDEXER__CACHE__REDIS_URL`
const ENV_PREFIX: &str = "NFT_INDEXER";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    info!("Config path: {}", path.to_string_lossy());

    let settings = config::Config::builder()
        .add_source(config::File::from(path).required(true))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .context("failed to read config file")?;

    let config: Config = settings
        .try_deserialize()
        .context("failed to parse config YAML")?;
    config.validate()?;

    Ok(config)
}

pub fn ether_to_wei(ether: f64) -> U256 {
    if !ether.is_finite() || ether <= 0.0 {
        return U256::ZERO;
    }
    U256::from((ether * WEI_PER_ETHER) as u128)
}

pub fn wei_to_ether(wei: U256) -> f64 {
    // f64 precision is plenty for display and statistics
    let wei: u128 = wei.try_into().unwrap_or(u128::MAX);
    wei as f64 / WEI_PER_ETHER
}

fn strip_html(error: &str) -> String {
    // If the error contains HTML tags, extract just the text content
    if error.contains("<!doctype html>") || error.contains("<html>") {
        error
            .lines()
            .map(|line| line.trim())
            .find(|line| {
                !line.starts_with('<')
                    && !line.ends_with('>')
                    && !line.is_empty()
                    && !line.starts_with("<!")
                    && *line != "html"
                    && *line != "body"
            })
            .unwrap_or(error)
            .to_string()
    } else {
        error.to_string()
    }
}
