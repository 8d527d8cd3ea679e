//! ABI registries: where ABIs come from when no cache has them.
//!
//! [`EtherscanRegistry`] speaks the Etherscan `module=contract&action=getabi`
//! API, which most explorers (Arbiscan, Polygonscan, Basescan…) also serve.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use chainstream_core::abi::ContractAbi;

use crate::error::RegistryError;

/// A definitive registry answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryLookup {
    Found(ContractAbi),
    /// The registry knows the address and has no ABI for it (unverified contract).
    NotAvailable,
}

/// Source of contract ABIs.
///
/// `Err` means "could not find out", never "there is no ABI".
#[async_trait]
pub trait AbiRegistry: Send + Sync {
    async fn fetch_abi(&self, address: &str) -> Result<RegistryLookup, RegistryError>;
}

// ─── Etherscan ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    message: String,
    result: String,
}

/// Interpret an Etherscan `getabi` response.
///
/// Only an explicit `NOTOK` for an unverified contract is a "no ABI" answer;
/// rate limits, error statuses and unparseable bodies are all transient.
pub fn parse_registry_response(status: u16, body: &str) -> Result<RegistryLookup, RegistryError> {
    if status != 200 {
        return Err(RegistryError::Status(status));
    }
    let resp: EtherscanResponse =
        serde_json::from_str(body).map_err(|e| RegistryError::Malformed(e.to_string()))?;

    if resp.status != "1" {
        let result = resp.result.to_lowercase();
        if resp.message == "NOTOK" && (result.is_empty() || result.contains("not verified")) {
            return Ok(RegistryLookup::NotAvailable);
        }
        if result.contains("rate limit") {
            return Err(RegistryError::RateLimited);
        }
        return Err(RegistryError::Malformed(format!(
            "status {} ({}): {}",
            resp.status, resp.message, resp.result
        )));
    }

    ContractAbi::from_json(&resp.result)
        .map(RegistryLookup::Found)
        .map_err(|e| RegistryError::InvalidAbi(e.to_string()))
}

/// Etherscan-compatible registry client.
///
/// Calls are spaced at least `min_interval` apart (200 ms by default, inside
/// the free-tier limit of 5 requests per second).
pub struct EtherscanRegistry {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl EtherscanRegistry {
    pub const DEFAULT_API_URL: &'static str = "https://api.etherscan.io/api";

    pub fn new(api_url: impl Into<String>, api_key: Option<String>) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("chainstream/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key,
            min_interval: Duration::from_millis(200),
            next_slot: Mutex::new(Instant::now()),
        })
    }

    /// Mainnet Etherscan.
    pub fn mainnet(api_key: Option<String>) -> Result<Self, RegistryError> {
        Self::new(Self::DEFAULT_API_URL, api_key)
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Wait for this caller's turn.
    async fn throttle(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.min_interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[async_trait]
impl AbiRegistry for EtherscanRegistry {
    async fn fetch_abi(&self, address: &str) -> Result<RegistryLookup, RegistryError> {
        self.throttle().await;

        let mut query = vec![
            ("module", "contract"),
            ("action", "getabi"),
            ("address", address),
        ];
        if let Some(key) = self.api_key.as_deref() {
            query.push(("apikey", key));
        }

        let resp = self.client.get(&self.api_url).query(&query).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        debug!(address, status, "registry answered");
        parse_registry_response(status, &body)
    }
}
