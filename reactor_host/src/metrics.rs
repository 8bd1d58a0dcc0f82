//! Metrics recording with pluggable sinks.
//!
//! The [`TelemetryManager`] fans every [`MetricEvent`] out to all registered
//! [`TelemetryProvider`]s concurrently. A provider that errors or panics is
//! logged and skipped; the caller and the other providers are unaffected.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    /// Incrementing count
    Counter,
    /// Point-in-time value
    Gauge,
    /// Distribution of values
    Histogram,
    /// Duration in seconds
    Timer,
}

/// One recorded measurement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricEvent {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl MetricEvent {
    pub fn new(name: impl Into<String>, metric_type: MetricType, value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            name: name.into(),
            metric_type,
            value,
            tags: BTreeMap::new(),
            context: Map::new(),
        }
    }

    pub fn tags(mut self, tags: &[(&str, &str)]) -> Self {
        self.tags
            .extend(tags.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// A metrics sink. Plugins contribute one through
/// [`Plugin::telemetry_provider`](crate::plugin::Plugin::telemetry_provider).
#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn record(&self, event: &MetricEvent) -> Result<()>;

    /// Push out anything buffered.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct TelemetryManager {
    providers: RwLock<Vec<Arc<dyn TelemetryProvider>>>,
}

impl std::fmt::Debug for TelemetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryManager")
            .field("providers", &self.provider_count())
            .finish()
    }
}

impl TelemetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provider(&self, provider: Arc<dyn TelemetryProvider>) {
        info!(provider = provider.name(), "Registered telemetry provider");
        self.providers.write().push(provider);
    }

    /// Initialize `provider` and register it. A provider that fails to
    /// initialize is not registered.
    pub async fn attach(&self, provider: Arc<dyn TelemetryProvider>) -> bool {
        let name = provider.name().to_string();
        match AssertUnwindSafe(provider.initialize()).catch_unwind().await {
            Ok(Ok(())) => {
                self.register_provider(provider);
                true
            }
            Ok(Err(e)) => {
                warn!(provider = %name, "Telemetry provider failed to initialize: {:#}", e);
                false
            }
            Err(_) => {
                error!(provider = %name, "Telemetry provider panicked during initialize");
                false
            }
        }
    }

    pub fn clear_providers(&self) {
        self.providers.write().clear();
    }

    pub fn provider_count(&self) -> usize {
        self.providers.read().len()
    }

    pub async fn initialize(&self) {
        self.dispatch("initialize", |p| async move { p.initialize().await }.boxed())
            .await;
    }

    pub async fn flush(&self) {
        self.dispatch("flush", |p| async move { p.flush().await }.boxed())
            .await;
    }

    pub async fn shutdown(&self) {
        self.dispatch("shutdown", |p| async move { p.shutdown().await }.boxed())
            .await;
    }

    pub async fn record(&self, event: MetricEvent) {
        debug!(metric = %event.name, value = event.value, "Recording metric");
        let event = Arc::new(event);
        self.dispatch("record", |p| {
            let event = event.clone();
            async move { p.record(&event).await }.boxed()
        })
        .await;
    }

    pub async fn record_counter(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(MetricEvent::new(name, MetricType::Counter, value).tags(tags))
            .await;
    }

    pub async fn record_gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(MetricEvent::new(name, MetricType::Gauge, value).tags(tags))
            .await;
    }

    pub async fn record_histogram(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(MetricEvent::new(name, MetricType::Histogram, value).tags(tags))
            .await;
    }

    pub async fn record_timer(&self, name: &str, duration: Duration, tags: &[(&str, &str)]) {
        self.record(
            MetricEvent::new(name, MetricType::Timer, duration.as_secs_f64()).tags(tags),
        )
        .await;
    }

    async fn dispatch<F>(&self, action: &'static str, invoke: F)
    where
        F: Fn(Arc<dyn TelemetryProvider>) -> BoxFuture<'static, Result<()>>,
    {
        // Snapshot so no lock is held across provider calls.
        let providers = self.providers.read().clone();
        if providers.is_empty() {
            return;
        }

        let calls = providers.into_iter().map(|provider| {
            let name = provider.name().to_string();
            let call = AssertUnwindSafe(invoke(provider)).catch_unwind();
            async move { (name, call.await) }
        });
        for (name, outcome) in join_all(calls).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(provider = %name, "Telemetry {} failed: {:#}", action, e),
                Err(_) => error!(provider = %name, "Telemetry provider panicked during {}", action),
            }
        }
    }
}

#[derive(Default)]
struct MemoryState {
    events: Vec<MetricEvent>,
    counters: HashMap<String, f64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
    timers: HashMap<String, Vec<f64>>,
}

/// Keeps every event and per-name aggregates in memory.
pub struct InMemoryTelemetryProvider {
    name: String,
    state: Mutex<MemoryState>,
}

impl Default for InMemoryTelemetryProvider {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryTelemetryProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn counter(&self, name: &str) -> f64 {
        self.state.lock().counters.get(name).copied().unwrap_or(0.0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.state.lock().gauges.get(name).copied()
    }

    pub fn histogram(&self, name: &str) -> Vec<f64> {
        self.state.lock().histograms.get(name).cloned().unwrap_or_default()
    }

    pub fn timers(&self, name: &str) -> Vec<f64> {
        self.state.lock().timers.get(name).cloned().unwrap_or_default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear(&self) {
        *self.state.lock() = MemoryState::default();
    }
}

#[async_trait]
impl TelemetryProvider for InMemoryTelemetryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn record(&self, event: &MetricEvent) -> Result<()> {
        let mut state = self.state.lock();
        let name = event.name.clone();
        match event.metric_type {
            MetricType::Counter => *state.counters.entry(name).or_default() += event.value,
            MetricType::Gauge => {
                state.gauges.insert(name, event.value);
            }
            MetricType::Histogram => state.histograms.entry(name).or_default().push(event.value),
            MetricType::Timer => state.timers.entry(name).or_default().push(event.value),
        }
        state.events.push(event.clone());
        Ok(())
    }
}
