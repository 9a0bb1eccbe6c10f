use crate::sandbox::SandboxSettings;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "sqlquest", version, about = "SQL learning game server")]
pub struct Config {
    /// Address to serve the HTTP API on.
    #[arg(long, default_value = "0.0.0.0:5000")]
    pub listen: SocketAddr,

    /// JSON file with level definitions. The built-in catalog is used when omitted.
    #[arg(long)]
    pub levels: Option<PathBuf>,

    /// Seconds a sandbox lives after creation.
    #[arg(long, default_value_t = 3600)]
    pub sandbox_ttl_secs: u64,

    /// Per-query execution cap in milliseconds, 0 disables it.
    #[arg(long, default_value_t = 2000)]
    pub query_timeout_ms: u64,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn sandbox_settings(&self) -> SandboxSettings {
        SandboxSettings {
            ttl: Duration::from_secs(self.sandbox_ttl_secs),
        }
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_ms > 0).then(|| Duration::from_millis(self.query_timeout_ms))
    }
}
