//! Per-signer nonce reservation
//!
//! Concurrent submissions from one signer must use distinct, consecutive
//! nonces. The first reservation for an address seeds the counter from the
//! chain's pending count; a failed submission drops the cached value so the
//! next reservation resynchronises.

use alloy_primitives::Address;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
pub struct NonceTracker {
    next: Mutex<HashMap<Address, u64>>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next nonce for `address`.
    ///
    /// `fetch` is awaited under the lock, only when no value is cached, so
    /// two concurrent first reservations never both use the chain value.
    pub async fn reserve<F, Fut, E>(&self, address: Address, fetch: F) -> Result<u64, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64, E>>,
    {
        let mut next = self.next.lock().await;
        let nonce = match next.get(&address) {
            Some(nonce) => *nonce,
            None => {
                let fetched = fetch().await?;
                debug!(%address, nonce = fetched, "Nonce synchronised from chain");
                fetched
            }
        };
        next.insert(address, nonce.saturating_add(1));
        Ok(nonce)
    }

    /// Forget the cached nonce of `address`
    pub async fn invalidate(&self, address: Address) {
        if self.next.lock().await.remove(&address).is_some() {
            debug!(%address, "Nonce cache invalidated");
        }
    }

    /// Next nonce that would be handed out, if cached
    pub async fn peek(&self, address: Address) -> Option<u64> {
        self.next.lock().await.get(&address).copied()
    }
}
