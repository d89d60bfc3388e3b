//! Telemetry POST to an HTTP collector.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde::Deserialize;
use tokio::time::Instant;

use super::payload::{self, RateLimit};
use crate::{
    module::PostCollection,
    outcome::{ModuleError, Outcome},
    store::Reading,
};

pub const KIND: &str = "http-post";

#[derive(Debug, Clone, Deserialize)]
pub struct HttpPostSettings {
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub min_interval_secs: Option<u64>,
    #[serde(default = "payload::default_fields")]
    pub fields: Vec<String>,
}

mod defaults {
    pub fn timeout_secs() -> u64 {
        10
    }
}

pub struct HttpPostSink {
    client: reqwest::Client,
    settings: HttpPostSettings,
    limit: RateLimit,
}

impl HttpPostSink {
    pub fn new(settings: HttpPostSettings) -> Result<Self, ModuleError> {
        reqwest::Url::parse(&settings.url)
            .map_err(|e| ModuleError::config(format!("{KIND}: bad url {}: {e}", settings.url)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ModuleError::config(format!("{KIND}: {e}")))?;
        let limit = RateLimit::new(Duration::from_secs(settings.min_interval_secs.unwrap_or(0)));
        Ok(Self {
            client,
            settings,
            limit,
        })
    }

    async fn send(&self, reading: &Reading) -> Result<(), ModuleError> {
        let body = payload::build(reading, &self.settings.fields, Utc::now());
        let mut request = self.client.post(&self.settings.url).json(&body);
        if let Some(token) = &self.settings.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ModuleError::sink(format!("POST {} failed: {e}", self.settings.url)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ModuleError::sink(format!(
                "POST {} returned {status}",
                self.settings.url
            )));
        }
        debug!("{KIND}: {} accepted {body}", self.settings.url);
        Ok(())
    }
}

#[async_trait]
impl PostCollection for HttpPostSink {
    fn name(&self) -> &str {
        KIND
    }

    async fn step(&mut self, reading: &Reading) -> Outcome {
        let now = Instant::now();
        if !self.limit.permits(now) {
            return Outcome::Success;
        }
        let result = self.send(reading).await;
        if result.is_ok() {
            self.limit.mark(now);
        }
        result.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn settings(url: &str) -> HttpPostSettings {
        serde_json::from_value(json!({"url": url, "timeout_secs": 2})).unwrap()
    }

    #[test]
    fn rejects_malformed_url() {
        assert!(matches!(
            HttpPostSink::new(settings("not a url")),
            Err(ModuleError::Configuration(_))
        ));
    }

    #[test]
    fn defaults() {
        let s: HttpPostSettings = serde_json::from_value(json!({"url": "http://x/"})).unwrap();
        assert_eq!(s.timeout_secs, 10);
        assert!(s.bearer_token.is_none());
        assert_eq!(s.fields, payload::default_fields());
    }

    #[tokio::test]
    async fn unreachable_collector_is_recoverable_sink_error() {
        let mut sink = HttpPostSink::new(settings("http://127.0.0.1:9/ingest")).unwrap();
        let outcome = sink.step(&Reading::unset()).await;
        assert!(matches!(outcome, Outcome::Recoverable(ModuleError::Sink(_))));
        assert!(sink.limit.permits(Instant::now()));
    }
}
