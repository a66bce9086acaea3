use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

/// Command line and environment surface of the relay.
#[derive(Debug, Parser)]
#[command(name = "linecast-relay", about = "Scan-to-display trigger relay")]
pub struct Cli {
    /// Address to bind the HTTP and WebSocket listener on.
    #[arg(long, env = "LINECAST_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, env = "LINECAST_PORT", default_value_t = 8021)]
    pub port: u16,

    /// Secret used to sign and verify every token the relay mints.
    #[arg(long, env = "LINECAST_TOKEN_SECRET")]
    pub token_secret: String,

    /// Base URL clients can reach this relay on; embedded in QR
    /// payloads and share links.
    #[arg(long, env = "LINECAST_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Seconds an accepted connection gets to authenticate.
    #[arg(long, env = "LINECAST_AUTH_DEADLINE_SECS", default_value_t = 5)]
    pub auth_deadline_secs: u64,

    /// Number of recent transaction ids remembered per relay.
    #[arg(long, env = "LINECAST_DEDUPE_WINDOW", default_value_t = 100)]
    pub dedupe_window: usize,

    /// Lifetime of a QR pairing session, in seconds.
    #[arg(long, env = "LINECAST_QR_TTL_SECS", default_value_t = 300)]
    pub qr_session_ttl_secs: u64,

    /// Lifetime of the channel token minted on QR approval, in days.
    #[arg(long, env = "LINECAST_CHANNEL_TOKEN_TTL_DAYS", default_value_t = 30)]
    pub channel_token_ttl_days: i64,

    /// Lifetime of a quick pair session and its token, in seconds.
    #[arg(long, env = "LINECAST_QUICK_PAIR_TTL_SECS", default_value_t = 900)]
    pub quick_pair_ttl_secs: u64,

    /// How often expired pairing sessions are reclaimed, in seconds.
    #[arg(long, env = "LINECAST_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("token secret must not be empty")]
    EmptyTokenSecret,
    #[error("dedupe window must be at least 1")]
    ZeroDedupeWindow,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub token_secret: String,
    pub public_url: String,
    pub auth_deadline: Duration,
    pub dedupe_window: usize,
    pub qr_session_ttl: Duration,
    pub channel_token_ttl: time::Duration,
    pub quick_pair_ttl: Duration,
    pub sweep_interval: Duration,
}

impl TryFrom<&Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        if cli.token_secret.trim().is_empty() {
            return Err(ConfigError::EmptyTokenSecret);
        }
        if cli.dedupe_window == 0 {
            return Err(ConfigError::ZeroDedupeWindow);
        }
        let listen = SocketAddr::new(cli.host, cli.port);
        let public_url = cli
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", cli.port));
        Ok(Self {
            listen,
            token_secret: cli.token_secret.clone(),
            public_url,
            auth_deadline: Duration::from_secs(cli.auth_deadline_secs),
            dedupe_window: cli.dedupe_window,
            qr_session_ttl: Duration::from_secs(cli.qr_session_ttl_secs),
            channel_token_ttl: time::Duration::days(cli.channel_token_ttl_days),
            quick_pair_ttl: Duration::from_secs(cli.quick_pair_ttl_secs),
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_a_runnable_config() {
        let cli = Cli::parse_from(["linecast-relay", "--token-secret", "s3cret"]);
        let config = Config::try_from(&cli).unwrap();
        assert_eq!(config.listen.port(), 8021);
        assert_eq!(config.public_url, "http://localhost:8021");
        assert_eq!(config.auth_deadline, Duration::from_secs(5));
        assert_eq!(config.dedupe_window, 100);
        assert_eq!(config.qr_session_ttl, Duration::from_secs(300));
        assert_eq!(config.quick_pair_ttl, Duration::from_secs(900));
    }

    #[test]
    fn blank_secret_is_rejected() {
        let cli = Cli::parse_from(["linecast-relay", "--token-secret", "  "]);
        assert!(matches!(
            Config::try_from(&cli),
            Err(ConfigError::EmptyTokenSecret)
        ));
    }

    #[test]
    fn explicit_public_url_wins() {
        let cli = Cli::parse_from([
            "linecast-relay",
            "--token-secret",
            "s3cret",
            "--public-url",
            "https://relay.example",
        ]);
        let config = Config::try_from(&cli).unwrap();
        assert_eq!(config.public_url, "https://relay.example");
    }
}
