//! Agent mode: push this host's snapshot to a central instance on a timer.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agents::PushReceipt;
use crate::config::PushConfig;
use crate::engine::Engine;

const PUSH_TIMEOUT: Duration = Duration::from_secs(15);
const PUSH_PATH: &str = "/api/agents/push";

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("central rejected push with {status}: {body}")]
    Rejected { status: u16, body: String },
}

pub struct PushClient {
    http: reqwest::Client,
    endpoint: String,
    config: PushConfig,
}

impl PushClient {
    pub fn new(config: PushConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .user_agent(concat!("jailwarden/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let endpoint = format!("{}{PUSH_PATH}", config.url.trim_end_matches('/'));
        Self {
            http,
            endpoint,
            config,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Build and send one snapshot.
    pub async fn push_once(&self, engine: &Engine) -> Result<PushReceipt, PushError> {
        let snapshot = engine
            .snapshot(self.config.name.clone(), self.config.log_lines)
            .await;
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Agent-Id", &self.config.server_id)
            .header("X-Agent-Secret", &self.config.secret)
            .json(&snapshot)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Rejected {
                status: status.as_u16(),
                body: crate::parser::excerpt(&body, 200),
            });
        }
        Ok(response.json::<PushReceipt>().await?)
    }

    /// Push every `interval_secs` (plus up to 10% jitter) until `shutdown`
    /// flips to `true`.
    pub async fn run(self, engine: Engine, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        info!(endpoint = %self.endpoint, interval_secs = interval.as_secs(), "agent push loop started");

        loop {
            match self.push_once(&engine).await {
                Ok(receipt) => debug!(digest = %receipt.digest, registered = receipt.registered, "snapshot pushed"),
                Err(e) => warn!(error = %e, "snapshot push failed"),
            }

            let jitter_ms = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 10);
            let wait = interval + Duration::from_millis(jitter_ms);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("agent push loop stopped");
    }
}
