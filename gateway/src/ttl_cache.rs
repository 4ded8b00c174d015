// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Short-lived cache for RPC answers that every payment task would otherwise
//! request on its own (gas price, tip cap).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug)]
pub struct TtlCache<T> {
    entry: RwLock<Option<(T, Instant)>>,
    cache_duration: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(cache_duration: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            cache_duration,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached value if it is younger than the TTL.
    pub async fn get_if_valid(&self) -> Option<T> {
        let entry = self.entry.read().await;
        match entry.as_ref() {
            Some((value, updated_at)) if updated_at.elapsed() < self.cache_duration => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            _ => None,
        }
    }

    pub async fn update(&self, value: T) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        *self.entry.write().await = Some((value, Instant::now()));
    }

    /// Returns the cached value or runs `fetch` and caches its success.
    pub async fn get_or_fetch<E, F, Fut>(&self, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get_if_valid().await {
            return Ok(value);
        }
        let value = fetch().await?;
        self.update(value.clone()).await;
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
