//! CLI configuration loading, in the style of
//! `shuttle-gateway/src/args.rs`: a `clap::Parser` derive struct with
//! environment-variable fallbacks.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "corvusd", about = "Corvus deployment orchestration engine")]
pub struct Args {
    /// Directory whose children are per-slug asset subdirectories
    /// bind-mounted into serving containers
    #[arg(long, env = "CORVUS_ASSET_ROOT", default_value = "/var/lib/corvus/assets")]
    pub asset_root: PathBuf,

    /// Directory holding one append-only `<slug>.log` per deployment
    #[arg(long, env = "CORVUS_LOG_ROOT", default_value = "/var/lib/corvus/logs")]
    pub log_root: PathBuf,

    /// Directory for ephemeral per-pipeline working directories and
    /// uploaded archives
    #[arg(long, env = "CORVUS_TEMP_ROOT", default_value = "/tmp")]
    pub temp_root: PathBuf,

    /// Path to the SQLite state database
    #[arg(long, env = "CORVUS_STATE_DB", default_value = "/var/lib/corvus/state.sqlite")]
    pub state_db_path: String,

    /// Base domain that deployment URLs are served under, e.g.
    /// `<slug>.<base_domain>`
    #[arg(long, env = "CORVUS_BASE_DOMAIN", default_value = "localhost")]
    pub base_domain: String,

    /// Docker network shared with the reverse proxy, attached to serving
    /// containers at create time
    #[arg(long, env = "CORVUS_NETWORK", default_value = "corvus_net")]
    pub network_name: String,

    /// Image used for serving containers
    #[arg(long, env = "CORVUS_SERVE_IMAGE", default_value = "nginx:1.25-alpine")]
    pub serve_image: String,

    /// Image used for ephemeral build containers
    #[arg(long, env = "CORVUS_BUILD_IMAGE", default_value = "node:20-alpine")]
    pub build_image: String,

    /// Expiration reaper tick period, in seconds. Must be at least 1:
    /// `tokio::time::interval` panics on a zero-duration period.
    #[arg(
        long,
        env = "CORVUS_REAPER_INTERVAL_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub reaper_interval_secs: u64,
}

/// Runtime configuration threaded through the pipeline and dispatch
/// surface. Separate from [`Args`] so call sites don't carry a `clap`
/// dependency through their signatures.
#[derive(Debug, Clone)]
pub struct Config {
    pub asset_root: PathBuf,
    pub log_root: PathBuf,
    pub temp_root: PathBuf,
    pub base_domain: String,
    pub network_name: String,
    pub serve_image: String,
    pub build_image: String,
    pub reaper_interval_secs: u64,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            asset_root: args.asset_root.clone(),
            log_root: args.log_root.clone(),
            temp_root: args.temp_root.clone(),
            base_domain: args.base_domain.clone(),
            network_name: args.network_name.clone(),
            serve_image: args.serve_image.clone(),
            build_image: args.build_image.clone(),
            reaper_interval_secs: args.reaper_interval_secs,
        }
    }
}
