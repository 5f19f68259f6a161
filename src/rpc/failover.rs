//! RPC endpoint health monitoring and failover.
//!
//! One provider is active at a time. A block subscription refreshes the
//! last-response timestamp on every event; a periodic health check rotates
//! to the next endpoint (round-robin) when the active one stays silent for
//! longer than the no-response timeout, then re-subscribes the same callback.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::provider::{Provider, ProviderFactory};
use super::types::BlockEvent;
use crate::config::{ChainConfig, Layer};
use crate::tx::NonceSource;

/// Called with each new block number.
pub type BlockCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverSettings {
    pub health_check_interval: Duration,
    pub no_response_timeout: Duration,
}

impl FailoverSettings {
    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            health_check_interval: Duration::from_secs(config.health_check_interval_secs),
            no_response_timeout: Duration::from_secs(config.no_response_timeout_secs),
        }
    }
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(5),
            no_response_timeout: Duration::from_secs(180),
        }
    }
}

struct ActiveProvider {
    index: usize,
    provider: Arc<dyn Provider>,
}

struct Subscription {
    callback: BlockCallback,
    pump: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps a block subscription alive across a list of RPC endpoints.
pub struct EndpointFailover {
    layer: Layer,
    endpoints: Vec<String>,
    factory: Arc<dyn ProviderFactory>,
    settings: FailoverSettings,
    active: RwLock<ActiveProvider>,
    last_response: Arc<Mutex<Instant>>,
    subscription: tokio::sync::Mutex<Option<Subscription>>,
    health_check: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointFailover {
    /// Create a manager starting at the first endpoint.
    pub fn new(
        layer: Layer,
        endpoints: Vec<String>,
        factory: Arc<dyn ProviderFactory>,
        settings: FailoverSettings,
    ) -> Result<Self> {
        let first = endpoints
            .first()
            .with_context(|| format!("no RPC endpoints configured for {}", layer))?;
        let provider = factory.connect(first)?;
        info!(%layer, endpoint = %first, count = endpoints.len(), "RPC failover initialized");

        Ok(Self {
            layer,
            endpoints,
            factory,
            settings,
            active: RwLock::new(ActiveProvider { index: 0, provider }),
            last_response: Arc::new(Mutex::new(Instant::now())),
            subscription: tokio::sync::Mutex::new(None),
            health_check: Mutex::new(None),
        })
    }

    pub async fn current_index(&self) -> usize {
        self.active.read().await.index
    }

    pub async fn current_endpoint(&self) -> String {
        let index = self.active.read().await.index;
        self.endpoints[index].clone()
    }

    pub async fn provider(&self) -> Arc<dyn Provider> {
        self.active.read().await.provider.clone()
    }

    fn touch(&self) {
        *lock(&self.last_response) = Instant::now();
    }

    fn silent_for(&self) -> Duration {
        lock(&self.last_response).elapsed()
    }

    /// Deliver every new block to `callback`, across rotations.
    ///
    /// Replaces any earlier callback and starts the health check.
    pub async fn subscribe_blocks<F>(self: &Arc<Self>, callback: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        if let Err(e) = self.attach(Arc::new(callback)).await {
            warn!(layer = %self.layer, error = %e, "Block subscription failed, waiting for health check");
        }
        self.ensure_health_check();
    }

    /// Subscribe `callback` on the active provider.
    async fn attach(&self, callback: BlockCallback) -> Result<()> {
        let provider = self.provider().await;
        let (events, mut rx) = mpsc::unbounded_channel();
        self.touch();

        let last_response = self.last_response.clone();
        let on_block = callback.clone();
        let layer = self.layer;
        let endpoint = provider.endpoint().to_string();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                *lock(&last_response) = Instant::now();
                match event {
                    BlockEvent::NewBlock(block) => on_block(block),
                    BlockEvent::Error(e) => warn!(%layer, %endpoint, error = %e, "Block subscription error"),
                }
            }
        });

        let previous = self.subscription.lock().await.replace(Subscription {
            callback,
            pump: Some(pump),
        });
        if let Some(pump) = previous.and_then(|s| s.pump) {
            pump.abort();
        }

        provider.subscribe_blocks(events).await?;
        info!(layer = %self.layer, endpoint = %provider.endpoint(), "Subscribed to new blocks");
        Ok(())
    }

    fn ensure_health_check(self: &Arc<Self>) {
        let mut slot = lock(&self.health_check);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.health_check_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.check_health().await;
            }
        }));
    }

    /// Rotate when the active endpoint has been silent too long.
    pub async fn check_health(&self) {
        let silent_for = self.silent_for();
        if silent_for <= self.settings.no_response_timeout {
            debug!(layer = %self.layer, silent_secs = silent_for.as_secs(), "RPC endpoint healthy");
            return;
        }

        let endpoint = self.current_endpoint().await;
        warn!(
            layer = %self.layer,
            endpoint = %endpoint,
            silent_secs = silent_for.as_secs(),
            "No response from RPC endpoint"
        );
        if let Err(e) = self.rotate_endpoint().await {
            error!(layer = %self.layer, error = %e, "Endpoint rotation failed");
        }
    }

    /// Close the active provider and switch to the next endpoint.
    ///
    /// An active subscription is moved to the new provider.
    pub async fn rotate_endpoint(&self) -> Result<()> {
        {
            let mut active = self.active.write().await;
            let from = active.index;

            if let Some(pump) = self
                .subscription
                .lock()
                .await
                .as_mut()
                .and_then(|s| s.pump.take())
            {
                pump.abort();
            }
            active.provider.close().await;

            let mut next = from;
            let mut connected = None;
            for _ in 0..self.endpoints.len() {
                next = (next + 1) % self.endpoints.len();
                match self.factory.connect(&self.endpoints[next]) {
                    Ok(provider) => {
                        connected = Some(provider);
                        break;
                    }
                    Err(e) => {
                        error!(layer = %self.layer, endpoint = %self.endpoints[next], error = %e, "Failed to create provider");
                    }
                }
            }
            let provider = connected.context("no endpoint could be connected")?;
            *active = ActiveProvider { index: next, provider };

            info!(
                layer = %self.layer,
                from = %self.endpoints[from],
                to = %self.endpoints[next],
                "Rotated RPC endpoint"
            );
        }

        let callback = self
            .subscription
            .lock()
            .await
            .as_ref()
            .map(|s| s.callback.clone());
        match callback {
            Some(callback) => self.attach(callback).await,
            None => {
                self.touch();
                Ok(())
            }
        }
    }

    pub async fn block_number(&self) -> Result<u64> {
        self.provider().await.block_number().await
    }

    /// Current block number and how long the request took.
    pub async fn check_block_number_with_latency(&self) -> Result<(u64, Duration)> {
        let started = Instant::now();
        let block = self.block_number().await?;
        let latency = started.elapsed();
        info!(layer = %self.layer, block, latency_ms = latency.as_millis() as u64, "Block number");
        Ok((block, latency))
    }

    pub async fn gas_price(&self) -> Result<u128> {
        self.provider().await.gas_price().await
    }
}

#[async_trait]
impl NonceSource for EndpointFailover {
    async fn transaction_count(&self, address: &str) -> Result<u64> {
        self.provider().await.transaction_count(address).await
    }
}

impl Drop for EndpointFailover {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.health_check).take() {
            task.abort();
        }
        if let Some(pump) = self.subscription.get_mut().as_mut().and_then(|s| s.pump.take()) {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeNetwork {
        active_subscriptions: AtomicUsize,
        max_active: AtomicUsize,
        closed: AtomicUsize,
        current: Mutex<Option<mpsc::UnboundedSender<BlockEvent>>>,
    }

    impl FakeNetwork {
        fn emit(&self, block: u64) {
            if let Some(events) = lock(&self.current).as_ref() {
                let _ = events.send(BlockEvent::NewBlock(block));
            }
        }
    }

    struct FakeProvider {
        endpoint: String,
        network: Arc<FakeNetwork>,
        subscribed: AtomicBool,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn endpoint(&self) -> &str {
            &self.endpoint
        }

        async fn request(&self, _method: &str, _params: Value) -> Result<Value> {
            Ok(json!("0x7"))
        }

        async fn subscribe_blocks(&self, events: mpsc::UnboundedSender<BlockEvent>) -> Result<()> {
            if !self.subscribed.swap(true, Ordering::SeqCst) {
                let now = self.network.active_subscriptions.fetch_add(1, Ordering::SeqCst) + 1;
                self.network.max_active.fetch_max(now, Ordering::SeqCst);
            }
            *lock(&self.network.current) = Some(events);
            Ok(())
        }

        async fn close(&self) {
            if self.subscribed.swap(false, Ordering::SeqCst) {
                self.network.active_subscriptions.fetch_sub(1, Ordering::SeqCst);
                lock(&self.network.current).take();
            }
            self.network.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeFactory {
        network: Arc<FakeNetwork>,
    }

    impl ProviderFactory for FakeFactory {
        fn connect(&self, endpoint: &str) -> Result<Arc<dyn Provider>> {
            Ok(Arc::new(FakeProvider {
                endpoint: endpoint.to_string(),
                network: self.network.clone(),
                subscribed: AtomicBool::new(false),
            }))
        }
    }

    fn failover(count: usize) -> (Arc<EndpointFailover>, Arc<FakeNetwork>) {
        let network = Arc::new(FakeNetwork::default());
        let endpoints = (0..count).map(|i| format!("https://rpc-{}.test", i)).collect();
        let manager = EndpointFailover::new(
            Layer::Layer2,
            endpoints,
            Arc::new(FakeFactory { network: network.clone() }),
            FailoverSettings::default(),
        )
        .unwrap();
        (Arc::new(manager), network)
    }

    fn recorder() -> (Arc<Mutex<Vec<u64>>>, impl Fn(u64) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |block| lock(&sink).push(block))
    }

    #[test]
    fn test_empty_endpoint_list_is_rejected() {
        let network = Arc::new(FakeNetwork::default());
        let result = EndpointFailover::new(
            Layer::Layer1,
            Vec::new(),
            Arc::new(FakeFactory { network }),
            FailoverSettings::default(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rotation_is_cyclic() {
        let (manager, network) = failover(3);

        for expected in [1, 2, 0, 1] {
            manager.rotate_endpoint().await.unwrap();
            assert_eq!(manager.current_index().await, expected);
        }
        assert_eq!(network.closed.load(Ordering::SeqCst), 4);
        assert_eq!(manager.current_endpoint().await, "https://rpc-1.test");
    }

    #[tokio::test]
    async fn test_rotation_moves_subscription_without_leaking() {
        let (manager, network) = failover(3);
        let (seen, callback) = recorder();
        manager.subscribe_blocks(callback).await;

        network.emit(10);
        tokio::time::sleep(Duration::from_millis(10)).await;

        for _ in 0..5 {
            manager.rotate_endpoint().await.unwrap();
            assert_eq!(network.active_subscriptions.load(Ordering::SeqCst), 1);
        }
        network.emit(11);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(network.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(*lock(&seen), vec![10, 11]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_endpoint_is_rotated() {
        let (manager, network) = failover(2);
        let (_seen, callback) = recorder();
        manager.subscribe_blocks(callback).await;

        tokio::time::sleep(Duration::from_secs(170)).await;
        assert_eq!(manager.current_index().await, 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(manager.current_index().await, 1);
        assert_eq!(network.active_subscriptions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_events_keep_endpoint_alive() {
        let (manager, network) = failover(2);
        let (seen, callback) = recorder();
        manager.subscribe_blocks(callback).await;

        for block in 1..=8 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            network.emit(block);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.current_index().await, 0);
        assert_eq!(lock(&seen).len(), 8);
    }

    #[tokio::test]
    async fn test_nonce_source_uses_active_provider() {
        let (manager, _network) = failover(1);
        assert_eq!(manager.transaction_count("0xmaker").await.unwrap(), 7);
        assert_eq!(manager.block_number().await.unwrap(), 7);
    }
}
