//! Cache of outbound gRPC channels, keyed by logical service name
//!
//! Caching per service name rather than per endpoint lets discovery rotate
//! endpoints underneath one cached channel. Entries are evicted after an idle
//! TTL or when the cache is full; a process-wide shutting-down flag stops new
//! channels from being created during teardown.

use crate::config::ChannelConfig;
use crate::error::RegistryError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

/// Cache counters for monitoring
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CachedChannel {
    channel: Channel,
    last_used: Instant,
}

/// Manages outbound gRPC channels for discovered services
pub struct ChannelManager {
    channels: RwLock<HashMap<String, CachedChannel>>,
    idle_ttl: Duration,
    max_size: usize,
    shutdown_budget: Duration,
    flow_control_window: u32,
    shutting_down: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ChannelManager {
    pub fn new(config: &ChannelConfig) -> Self {
        info!(
            "Initialized channel manager with TTL={}s, max size={}",
            config.idle_ttl_secs, config.max_size
        );
        Self {
            channels: RwLock::new(HashMap::new()),
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
            max_size: config.max_size,
            shutdown_budget: Duration::from_secs(config.shutdown_timeout_secs),
            flow_control_window: config.flow_control_window,
            shutting_down: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a cached channel for `service_name`, or build one balanced over
    /// the given `host:port` endpoints.
    ///
    /// Fails with `Unavailable` when no endpoints were discovered or when the
    /// process is shutting down.
    pub async fn get_or_create(
        &self,
        service_name: &str,
        endpoints: &[(String, u16)],
    ) -> Result<Channel, RegistryError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable(
                "Channel manager is shutting down".to_string(),
            ));
        }
        if endpoints.is_empty() {
            return Err(RegistryError::Unavailable(format!(
                "No instances found for service {}",
                service_name
            )));
        }

        let mut channels = self.channels.write().await;
        self.evict_expired(&mut channels);

        if let Some(cached) = channels.get_mut(service_name) {
            cached.last_used = Instant::now();
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Reusing cached gRPC channel for service: {}", service_name);
            return Ok(cached.channel.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        info!("Creating new gRPC channel for service: {}", service_name);

        let window = self.flow_control_window;
        let tonic_endpoints: Vec<Endpoint> = endpoints
            .iter()
            .map(|(host, port)| {
                Endpoint::from_shared(format!("http://{}:{}", host, port))
                    .map(|endpoint| {
                        endpoint
                            .initial_stream_window_size(Some(window))
                            .initial_connection_window_size(Some(window))
                            .connect_timeout(Duration::from_secs(5))
                    })
                    .map_err(|e| {
                        RegistryError::Callback(format!(
                            "Invalid endpoint for {}: {}",
                            service_name, e
                        ))
                    })
            })
            .collect::<Result<_, _>>()?;

        let channel = Channel::balance_list(tonic_endpoints.into_iter());

        if channels.len() >= self.max_size {
            self.evict_lru(&mut channels);
        }

        channels.insert(
            service_name.to_string(),
            CachedChannel {
                channel: channel.clone(),
                last_used: Instant::now(),
            },
        );

        Ok(channel)
    }

    /// Drop the cached channel for a service, if any
    pub async fn invalidate(&self, service_name: &str) {
        let mut channels = self.channels.write().await;
        if channels.remove(service_name).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!("Evicted gRPC channel for service: {}", service_name);
        }
    }

    fn evict_expired(&self, channels: &mut HashMap<String, CachedChannel>) {
        let now = Instant::now();
        let expired: Vec<String> = channels
            .iter()
            .filter(|(_, cached)| now.duration_since(cached.last_used) > self.idle_ttl)
            .map(|(name, _)| name.clone())
            .collect();

        for name in expired {
            channels.remove(&name);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted idle gRPC channel for service: {}", name);
        }
    }

    fn evict_lru(&self, channels: &mut HashMap<String, CachedChannel>) {
        let oldest = channels
            .iter()
            .min_by_key(|(_, cached)| cached.last_used)
            .map(|(name, _)| name.clone());

        if let Some(name) = oldest {
            channels.remove(&name);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted least recently used channel: {}", name);
        }
    }

    pub async fn active_channels(&self) -> usize {
        self.channels.read().await.len()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Whether teardown has started
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Drain the cache for process teardown.
    ///
    /// Sets the shutting-down flag so no new channels are created, then drops
    /// every cached channel within the shutdown budget. Dropping the last
    /// clone of a tonic channel closes its connections.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let drain = async {
            let mut channels = self.channels.write().await;
            let count = channels.len();
            channels.clear();
            count
        };

        match tokio::time::timeout(self.shutdown_budget, drain).await {
            Ok(count) => info!("Drained {} cached gRPC channels on shutdown", count),
            Err(_) => warn!("Channel cache drain timed out; connections will close on drop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(max_size: usize, idle_ttl_secs: u64) -> ChannelManager {
        ChannelManager::new(&ChannelConfig {
            idle_ttl_secs,
            max_size,
            shutdown_timeout_secs: 2,
            flow_control_window: 1024 * 1024,
        })
    }

    #[tokio::test]
    async fn test_channel_reused_per_service_name() {
        let manager = test_manager(10, 900);
        let endpoints = vec![("127.0.0.1".to_string(), 50051u16)];

        manager.get_or_create("svc", &endpoints).await.unwrap();
        manager.get_or_create("svc", &endpoints).await.unwrap();

        assert_eq!(manager.active_channels().await, 1);
        let stats = manager.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_no_endpoints_is_unavailable() {
        let manager = test_manager(10, 900);
        let result = manager.get_or_create("ghost", &[]).await;
        assert!(matches!(result, Err(RegistryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_capacity_cap_evicts_lru() {
        let manager = test_manager(2, 900);
        let endpoints = vec![("127.0.0.1".to_string(), 50051u16)];

        manager.get_or_create("a", &endpoints).await.unwrap();
        manager.get_or_create("b", &endpoints).await.unwrap();
        manager.get_or_create("c", &endpoints).await.unwrap();

        assert_eq!(manager.active_channels().await, 2);
        assert_eq!(manager.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_channels_expire() {
        let manager = test_manager(10, 1);
        let endpoints = vec![("127.0.0.1".to_string(), 50051u16)];

        manager.get_or_create("svc", &endpoints).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        manager.get_or_create("other", &endpoints).await.unwrap();

        assert_eq!(manager.active_channels().await, 1);
        assert_eq!(manager.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_shutdown_blocks_new_channels() {
        let manager = test_manager(10, 900);
        let endpoints = vec![("127.0.0.1".to_string(), 50051u16)];

        manager.get_or_create("svc", &endpoints).await.unwrap();
        manager.shutdown().await;

        assert_eq!(manager.active_channels().await, 0);
        let result = manager.get_or_create("svc", &endpoints).await;
        assert!(matches!(result, Err(RegistryError::Unavailable(_))));
    }
}
