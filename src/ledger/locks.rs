//! Per-position logical locks
//!
//! A cycle holds the lock of every key it touches until its commit lands;
//! entry registration takes the same lock. Keys are always acquired in
//! sorted order so two holders of overlapping sets cannot deadlock.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::PositionKey;

#[derive(Default)]
pub struct KeyLocks {
    locks: DashMap<PositionKey, Arc<Mutex<()>>>,
}

/// Guards for a set of keys; released together on drop
pub struct KeyGuard {
    keys: Vec<PositionKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    pub fn keys(&self) -> &[PositionKey] {
        &self.keys
    }

    pub fn covers(&self, key: &PositionKey) -> bool {
        self.keys.binary_search(key).is_ok()
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &PositionKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, key: &PositionKey) -> KeyGuard {
        self.lock_all([key.clone()]).await
    }

    pub async fn lock_all(&self, keys: impl IntoIterator<Item = PositionKey>) -> KeyGuard {
        let keys: Vec<PositionKey> = keys.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.slot(key).lock_owned().await);
        }
        KeyGuard {
            keys,
            _guards: guards,
        }
    }

    /// Drop slots nobody holds
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, Venue};
    use std::time::Duration;

    fn key(symbol: &str) -> PositionKey {
        PositionKey::new(Venue::Binance, symbol, Side::Long)
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::new());
        let guard = locks.lock(&key("BTCUSDT")).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&key("BTCUSDT")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _btc = locks.lock(&key("BTCUSDT")).await;
        let eth = tokio::time::timeout(Duration::from_millis(50), locks.lock(&key("ETHUSDT"))).await;
        assert!(eth.is_ok());
    }

    #[tokio::test]
    async fn lock_all_dedupes_and_sorts() {
        let locks = KeyLocks::new();
        let guard = locks
            .lock_all([key("SOLUSDT"), key("BTCUSDT"), key("SOLUSDT")])
            .await;
        assert_eq!(guard.keys().len(), 2);
        assert!(guard.covers(&key("BTCUSDT")));
        drop(guard);

        locks.prune();
        assert!(locks.is_empty());
    }
}
