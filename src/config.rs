use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Port the listener binds to and the port peers are dialed on.
    pub port: u16,
    pub bind_ip: IpAddr,
    /// Upper bound on an outbound dial, zero for none.
    pub dial_timeout_ms: u64,
    pub accept_backoff_ms: u64,
    pub read_buffer_bytes: usize,
    pub max_line_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dial_timeout_ms: 5_000,
            accept_backoff_ms: 100,
            read_buffer_bytes: 1024,
            max_line_bytes: 64 * 1024,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("pushrelay.toml"))
            .merge(Json::file("pushrelay.json"))
            .merge(Env::prefixed("PUSHRELAY_"))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.read_buffer_bytes == 0 {
            anyhow::bail!("read_buffer_bytes must be greater than zero");
        }
        if self.max_line_bytes == 0 {
            anyhow::bail!("max_line_bytes must be greater than zero");
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        (self.dial_timeout_ms > 0).then(|| Duration::from_millis(self.dial_timeout_ms))
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }
}
