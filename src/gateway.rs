use crate::config::GatewayConfig;
use crate::error::Error;
use crate::response::{self, GatewayResponse};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Outbound side of the delivery gateway protocol.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send_message(&self, destination: &str, body: &str) -> Result<GatewayResponse, Error>;

    async fn get_credit(&self) -> Result<GatewayResponse, Error>;
}

#[async_trait]
impl<T: Gateway + ?Sized> Gateway for Arc<T> {
    async fn send_message(&self, destination: &str, body: &str) -> Result<GatewayResponse, Error> {
        (**self).send_message(destination, body).await
    }

    async fn get_credit(&self) -> Result<GatewayResponse, Error> {
        (**self).get_credit().await
    }
}

pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    async fn post(&self, form: &[(&str, &str)]) -> Result<GatewayResponse, Error> {
        let response = self
            .http
            .post(&self.config.base_url)
            .header(ACCEPT, "text/plain")
            .form(form)
            .send()
            .await?
            .error_for_status()?;

        let text = response.text().await?;
        debug!(response = %text, "Gateway replied.");

        Ok(response::parse(&text))
    }
}

#[async_trait]
impl Gateway for GatewayClient {
    #[instrument(skip(self, body))]
    async fn send_message(&self, destination: &str, body: &str) -> Result<GatewayResponse, Error> {
        self.post(&[
            ("cmd", "sendsms"),
            ("domainId", self.config.domain_id.as_str()),
            ("login", self.config.login.as_str()),
            ("passwd", self.config.password.as_str()),
            ("dest", destination),
            ("msg", body),
            ("senderId", self.config.sender_id.as_str()),
        ])
        .await
    }

    #[instrument(skip(self))]
    async fn get_credit(&self) -> Result<GatewayResponse, Error> {
        self.post(&[
            ("cmd", "getcredit"),
            ("domainId", self.config.domain_id.as_str()),
            ("login", self.config.login.as_str()),
            ("passwd", self.config.password.as_str()),
        ])
        .await
    }
}
