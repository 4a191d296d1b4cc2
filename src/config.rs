use crate::error::Error;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "default_domain_id")]
    pub gateway_domain_id: String,
    #[serde(default)]
    pub gateway_login: String,
    #[serde(default)]
    pub gateway_password: String,
    #[serde(default = "default_sender_id")]
    pub gateway_sender_id: String,
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    pub sentry_dsn: Option<String>,
}

/// Everything the gateway client needs, fixed at construction.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub domain_id: String,
    pub login: String,
    pub password: String,
    pub sender_id: String,
    pub timeout: Duration,
}

fn default_database_url() -> String {
    "sqlite://data.db".to_string()
}

fn default_gateway_url() -> String {
    "http://www.altiria.net/api/http".to_string()
}

fn default_domain_id() -> String {
    "comercial".to_string()
}

fn default_sender_id() -> String {
    "agoravot".to_string()
}

fn default_gateway_timeout() -> u64 {
    10_000
}

fn default_batch_size() -> i64 {
    10
}

fn default_sweep_interval() -> u64 {
    5000 // Default to 5 seconds
}

fn default_claim_lease() -> u64 {
    300
}

fn default_health_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenvy::dotenv().ok();

        let config = envy::from_env::<Config>()?;
        config.validate()?;

        Ok(config)
    }

    /// Checks credentials and limits before anything touches the gateway or the store.
    pub fn validate(&self) -> Result<(), Error> {
        if self.database_url.trim().is_empty() {
            return Err(Error::Configuration("DATABASE_URL is empty".into()));
        }
        if self.gateway_login.is_empty() {
            return Err(Error::Configuration("GATEWAY_LOGIN is not set".into()));
        }
        if self.gateway_password.is_empty() {
            return Err(Error::Configuration("GATEWAY_PASSWORD is not set".into()));
        }
        if self.gateway_domain_id.is_empty() {
            return Err(Error::Configuration("GATEWAY_DOMAIN_ID is empty".into()));
        }
        reqwest::Url::parse(&self.gateway_url).map_err(|e| {
            Error::Configuration(format!("GATEWAY_URL {:?} is invalid: {}", self.gateway_url, e))
        })?;
        if self.batch_size <= 0 {
            return Err(Error::Configuration("BATCH_SIZE must be positive".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::Configuration("SWEEP_INTERVAL_MS must be positive".into()));
        }
        if self.claim_lease_secs == 0 {
            return Err(Error::Configuration("CLAIM_LEASE_SECS must be positive".into()));
        }
        // A claim is renewed before every send, so one send must fit inside the lease.
        if self.claim_lease_secs.saturating_mul(1000) <= self.gateway_timeout_ms {
            return Err(Error::Configuration(format!(
                "CLAIM_LEASE_SECS ({}s) must exceed GATEWAY_TIMEOUT_MS ({}ms)",
                self.claim_lease_secs, self.gateway_timeout_ms
            )));
        }

        Ok(())
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.gateway_url.clone(),
            domain_id: self.gateway_domain_id.clone(),
            login: self.gateway_login.clone(),
            password: self.gateway_password.clone(),
            sender_id: self.gateway_sender_id.clone(),
            timeout: Duration::from_millis(self.gateway_timeout_ms),
        }
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}
