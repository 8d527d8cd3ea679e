//! Three-tier ABI lookup.
//!
//! 1. in-memory map of shared lookups, one per lower-cased address, so
//!    concurrent callers for the same contract wait on a single request
//! 2. the durable [`AbiStore`], including negative ("no ABI") entries
//! 3. the [`AbiRegistry`]
//!
//! A definitive "no ABI" from the registry is persisted with a TTL. Transient
//! registry failures are not persisted and are forgotten in memory too, so
//! the next call asks again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use chainstream_core::abi::{AbiRecord, AbiStore, ContractAbi};
use chainstream_core::types::unix_millis;

use crate::registry::{AbiRegistry, RegistryLookup};

type Lookup = Shared<BoxFuture<'static, Resolution>>;

/// What one lookup concluded.
#[derive(Debug, Clone)]
enum Resolution {
    Abi(Arc<ContractAbi>),
    /// Definitive or still-cached "no ABI".
    Unavailable,
    /// Could not find out; not worth remembering.
    Unknown,
}

impl Resolution {
    fn abi(&self) -> Option<Arc<ContractAbi>> {
        match self {
            Self::Abi(abi) => Some(abi.clone()),
            Self::Unavailable | Self::Unknown => None,
        }
    }
}

/// Resolves contract addresses to ABIs.
pub struct AbiResolver {
    store: Arc<dyn AbiStore>,
    registry: Arc<dyn AbiRegistry>,
    unavailable_ttl_ms: i64,
    lookups: Mutex<HashMap<String, Lookup>>,
}

impl AbiResolver {
    pub fn new(
        store: Arc<dyn AbiStore>,
        registry: Arc<dyn AbiRegistry>,
        unavailable_ttl_ms: i64,
    ) -> Self {
        Self {
            store,
            registry,
            unavailable_ttl_ms,
            lookups: Mutex::new(HashMap::new()),
        }
    }

    /// The ABI for `address`, or `None` when there is none (for now).
    pub async fn resolve(&self, address: &str) -> Option<Arc<ContractAbi>> {
        let key = address.to_lowercase();
        let lookup = {
            let mut lookups = self.lookups.lock().unwrap_or_else(|e| e.into_inner());
            lookups
                .entry(key.clone())
                .or_insert_with(|| {
                    resolve_uncached(
                        self.store.clone(),
                        self.registry.clone(),
                        key.clone(),
                        self.unavailable_ttl_ms,
                    )
                    .boxed()
                    .shared()
                })
                .clone()
        };

        let resolution = lookup.await;
        if matches!(resolution, Resolution::Unknown) {
            // let the next caller retry, unless someone already replaced the entry
            if let Ok(mut lookups) = self.lookups.lock() {
                if lookups.get(&key).and_then(|l| l.peek()).map_or(false, |r| {
                    matches!(r, Resolution::Unknown)
                }) {
                    lookups.remove(&key);
                }
            }
        }
        resolution.abi()
    }

    /// Number of addresses with a cached or in-flight lookup.
    pub fn cached_addresses(&self) -> usize {
        self.lookups.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Forget every in-memory result, e.g. after negative entries expired.
    pub fn clear_memory(&self) {
        if let Ok(mut lookups) = self.lookups.lock() {
            lookups.clear();
        }
    }
}

async fn resolve_uncached(
    store: Arc<dyn AbiStore>,
    registry: Arc<dyn AbiRegistry>,
    address: String,
    unavailable_ttl_ms: i64,
) -> Resolution {
    match store.get_abi(&address).await {
        Ok(Some(record)) if !record.is_expired(unix_millis()) => {
            return match record.abi {
                Some(abi) => Resolution::Abi(Arc::new(abi)),
                None => {
                    debug!(address = %address, "ABI known to be unavailable");
                    Resolution::Unavailable
                }
            };
        }
        Ok(_) => {}
        Err(err) => warn!(address = %address, error = %err, "ABI store read failed, asking registry"),
    }

    match registry.fetch_abi(&address).await {
        Ok(RegistryLookup::Found(abi)) => {
            if let Err(err) = abi.validate() {
                warn!(address = %address, error = %err, "registry ABI failed validation");
                return Resolution::Unknown;
            }
            info!(address = %address, members = abi.members().len(), "ABI fetched");
            if let Err(err) = store.put_abi(AbiRecord::available(&address, abi.clone())).await {
                warn!(address = %address, error = %err, "failed to persist ABI");
            }
            Resolution::Abi(Arc::new(abi))
        }
        Ok(RegistryLookup::NotAvailable) => {
            debug!(address = %address, "registry has no ABI");
            let record = AbiRecord::unavailable(&address, unavailable_ttl_ms, unix_millis());
            if let Err(err) = store.put_abi(record).await {
                warn!(address = %address, error = %err, "failed to persist negative ABI entry");
            }
            Resolution::Unavailable
        }
        Err(err) => {
            warn!(address = %address, error = %err, "ABI registry lookup failed");
            Resolution::Unknown
        }
    }
}
