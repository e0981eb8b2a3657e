//! nsqlookupd discovery

use crate::error::{BusError, BusResult};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<LookupProducer>,
    /// Pre-1.0 nsqlookupd wraps the payload in `{"status_code", "data"}`
    #[serde(default)]
    data: Option<Box<LookupResponse>>,
}

#[derive(Debug, Deserialize)]
struct LookupProducer {
    broadcast_address: String,
    tcp_port: u16,
}

impl LookupResponse {
    fn into_addrs(self) -> Vec<String> {
        if let Some(inner) = self.data {
            return inner.into_addrs();
        }
        self.producers
            .into_iter()
            .map(|p| format!("{}:{}", p.broadcast_address, p.tcp_port))
            .collect()
    }
}

/// nsqd TCP addresses listed in a `/lookup` response body
pub fn parse_lookup(body: &str) -> Result<Vec<String>, serde_json::Error> {
    serde_json::from_str::<LookupResponse>(body).map(LookupResponse::into_addrs)
}

/// Queries every configured nsqlookupd and merges the answers
#[derive(Debug, Clone)]
pub struct LookupClient {
    http: reqwest::Client,
    addrs: Vec<String>,
}

impl LookupClient {
    pub fn new(addrs: Vec<String>, timeout: Duration) -> BusResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BusError::configuration(format!("http client: {e}"), None))?;
        Ok(Self { http, addrs })
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// nsqd nodes carrying `topic`; fails only when every lookupd failed
    pub async fn lookup(&self, topic: &str) -> BusResult<Vec<String>> {
        let mut found = BTreeSet::new();
        let mut last_err = None;
        let mut answered = false;

        for addr in &self.addrs {
            match self.query(addr, topic).await {
                Ok(nodes) => {
                    answered = true;
                    found.extend(nodes);
                }
                Err(e) => {
                    warn!(lookupd = %addr, topic, "lookup failed: {}", e);
                    last_err = Some(e);
                }
            }
        }

        match (answered, last_err) {
            (false, Some(e)) => Err(e),
            _ => Ok(found.into_iter().collect()),
        }
    }

    async fn query(&self, addr: &str, topic: &str) -> BusResult<Vec<String>> {
        let url = lookup_url(addr, topic);
        let response = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.nsq; version=1.0")
            .send()
            .await
            .map_err(|e| BusError::lookup(&url, e))?;

        // topic not registered yet
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(%url, "topic unknown to lookupd");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(BusError::lookup(&url, format!("status {}", response.status())));
        }

        let body = response.text().await.map_err(|e| BusError::lookup(&url, e))?;
        parse_lookup(&body).map_err(|e| BusError::lookup(&url, e))
    }
}

fn lookup_url(addr: &str, topic: &str) -> String {
    let base = addr.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/lookup?topic={topic}")
    } else {
        format!("http://{base}/lookup?topic={topic}")
    }
}
