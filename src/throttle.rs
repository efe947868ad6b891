//! Usage throttling at user, API and system level

use crate::config::ThrottleConfig;
use crate::context::Clock;
use crate::error::{BossError, Result};
use crate::utils::parse_size_suffix;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Egress,
    Ingress,
    Compute,
}

impl MetricType {
    /// Units a metric of this type is counted in
    pub fn default_units(&self) -> MetricUnits {
        match self {
            MetricType::Egress | MetricType::Ingress => MetricUnits::Bytes,
            MetricType::Compute => MetricUnits::Cuboids,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnits {
    #[serde(rename = "byte_count")]
    Bytes,
    #[serde(rename = "cuboid_count")]
    Cuboids,
    #[serde(rename = "voxel_count")]
    Voxels,
}

/// Default limits of one metric; `<= 0` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleMetric {
    pub mtype: MetricType,
    pub units: MetricUnits,
    pub def_system_limit: i64,
    pub def_api_limit: i64,
    pub def_user_limit: i64,
}

/// Level a threshold applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ThresholdName {
    System,
    Api(String),
    User(String),
}

impl ThresholdName {
    fn level(&self) -> &'static str {
        match self {
            ThresholdName::System => "System",
            ThresholdName::Api(_) => "API",
            ThresholdName::User(_) => "User",
        }
    }
}

impl fmt::Display for ThresholdName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdName::System => f.write_str("system"),
            ThresholdName::Api(name) => write!(f, "api:{}", name),
            ThresholdName::User(name) => write!(f, "user:{}", name),
        }
    }
}

/// Persisted threshold and usage: `{threshold_name, mtype, units, limit, value, since}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRow {
    pub threshold_name: String,
    pub mtype: MetricType,
    pub units: MetricUnits,
    /// Per-name override; `None` inherits the metric default
    pub limit: Option<i64>,
    pub value: i64,
    pub since: NaiveDate,
}

type RowKey = (String, MetricType, MetricUnits);

#[async_trait]
pub trait ThrottleStore: Send + Sync {
    async fn get_metric(&self, mtype: MetricType, units: MetricUnits) -> Result<Option<ThrottleMetric>>;

    async fn put_metric(&self, metric: ThrottleMetric) -> Result<()>;

    async fn get_row(
        &self,
        name: &str,
        mtype: MetricType,
        units: MetricUnits,
    ) -> Result<Option<ThrottleRow>>;

    async fn put_row(&self, row: ThrottleRow) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryThrottleStore {
    metrics: RwLock<HashMap<(MetricType, MetricUnits), ThrottleMetric>>,
    rows: RwLock<HashMap<RowKey, ThrottleRow>>,
}

impl MemoryThrottleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThrottleStore for MemoryThrottleStore {
    async fn get_metric(&self, mtype: MetricType, units: MetricUnits) -> Result<Option<ThrottleMetric>> {
        Ok(self.metrics.read().get(&(mtype, units)).copied())
    }

    async fn put_metric(&self, metric: ThrottleMetric) -> Result<()> {
        self.metrics.write().insert((metric.mtype, metric.units), metric);
        Ok(())
    }

    async fn get_row(
        &self,
        name: &str,
        mtype: MetricType,
        units: MetricUnits,
    ) -> Result<Option<ThrottleRow>> {
        Ok(self
            .rows
            .read()
            .get(&(name.to_string(), mtype, units))
            .cloned())
    }

    async fn put_row(&self, row: ThrottleRow) -> Result<()> {
        self.rows
            .write()
            .insert((row.threshold_name.clone(), row.mtype, row.units), row);
        Ok(())
    }
}

/// Payload sent to administrators when a request is throttled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleNotice {
    pub level: String,
    pub api: String,
    pub user: String,
    pub cost: i64,
    pub current: i64,
    pub limit: i64,
    pub host: String,
}

#[async_trait]
pub trait ThrottleNotifier: Send + Sync {
    async fn notify(&self, notice: ThrottleNotice) -> Result<()>;
}

/// Records notices in memory
#[derive(Default)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<ThrottleNotice>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<ThrottleNotice> {
        self.notices.lock().clone()
    }
}

#[async_trait]
impl ThrottleNotifier for MemoryNotifier {
    async fn notify(&self, notice: ThrottleNotice) -> Result<()> {
        self.notices.lock().push(notice);
        Ok(())
    }
}

pub struct ThrottleEngine {
    store: Arc<dyn ThrottleStore>,
    notifier: Arc<dyn ThrottleNotifier>,
    clock: Arc<dyn Clock>,
    config: ThrottleConfig,
    /// Serializes read-check-add of usage rows
    gate: tokio::sync::Mutex<()>,
}

impl ThrottleEngine {
    pub fn new(
        store: Arc<dyn ThrottleStore>,
        notifier: Arc<dyn ThrottleNotifier>,
        clock: Arc<dyn Clock>,
        config: ThrottleConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            config,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_context(ctx: &crate::context::CoreContext) -> Self {
        Self::new(
            ctx.throttle_store.clone(),
            ctx.notifier.clone(),
            ctx.clock.clone(),
            ctx.config.throttle.clone(),
        )
    }

    async fn metric(&self, mtype: MetricType, units: MetricUnits) -> Result<ThrottleMetric> {
        Ok(self
            .store
            .get_metric(mtype, units)
            .await?
            .unwrap_or(ThrottleMetric {
                mtype,
                units,
                def_system_limit: self.config.system_default_limit,
                def_api_limit: self.config.api_default_limit,
                def_user_limit: self.config.user_default_limit,
            }))
    }

    fn default_limit(metric: &ThrottleMetric, name: &ThresholdName) -> i64 {
        match name {
            ThresholdName::System => metric.def_system_limit,
            ThresholdName::Api(_) => metric.def_api_limit,
            ThresholdName::User(_) => metric.def_user_limit,
        }
    }

    /// Usage row for a threshold, created on first use and reset on a new month
    async fn current_row(
        &self,
        name: &ThresholdName,
        mtype: MetricType,
        units: MetricUnits,
    ) -> Result<ThrottleRow> {
        let today = self.clock.now().date_naive();
        let threshold_name = name.to_string();
        let mut row = self
            .store
            .get_row(&threshold_name, mtype, units)
            .await?
            .unwrap_or(ThrottleRow {
                threshold_name,
                mtype,
                units,
                limit: None,
                value: 0,
                since: today,
            });
        if (row.since.year(), row.since.month()) < (today.year(), today.month()) {
            row.value = 0;
            row.since = today;
        }
        Ok(row)
    }

    /// Charge `cost` against user, API and system usage in that order
    ///
    /// A level is throttled once its usage already exceeds its limit, so the request
    /// that crosses a limit is still served.
    pub async fn check(
        &self,
        api: &str,
        mtype: MetricType,
        user: &str,
        cost: i64,
        units: MetricUnits,
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        let metric = self.metric(mtype, units).await?;
        for name in [
            ThresholdName::User(user.to_string()),
            ThresholdName::Api(api.to_string()),
            ThresholdName::System,
        ] {
            let mut row = self.current_row(&name, mtype, units).await?;
            let limit = row.limit.unwrap_or_else(|| Self::default_limit(&metric, &name));
            if limit > 0 && row.value > limit {
                let notice = ThrottleNotice {
                    level: name.level().to_string(),
                    api: api.to_string(),
                    user: user.to_string(),
                    cost,
                    current: row.value,
                    limit,
                    host: self.config.host.clone(),
                };
                warn!(
                    threshold = %name,
                    api,
                    user,
                    cost,
                    current = row.value,
                    limit,
                    "request throttled"
                );
                let notifier = self.notifier.clone();
                tokio::spawn(async move {
                    if let Err(e) = notifier.notify(notice).await {
                        warn!(error = %e, "throttle notification failed");
                    }
                });
                return Err(BossError::Throttled(format!(
                    "{} is throttled. Expected available tomorrow.",
                    name.level()
                )));
            }
            row.value += cost;
            self.store.put_row(row).await?;
        }
        Ok(())
    }

    /// Override the limit of one threshold; accepts `K`, `M`, `G`, `T` suffixes
    pub async fn set_threshold(
        &self,
        name: &ThresholdName,
        mtype: MetricType,
        units: MetricUnits,
        limit: &str,
    ) -> Result<()> {
        let limit = parse_size_suffix(limit)?;
        let _gate = self.gate.lock().await;
        let mut row = self.current_row(name, mtype, units).await?;
        row.limit = Some(limit);
        self.store.put_row(row).await
    }

    /// Replace the default limits of a metric
    pub async fn set_metric_defaults(
        &self,
        mtype: MetricType,
        units: MetricUnits,
        system: &str,
        api: &str,
        user: &str,
    ) -> Result<()> {
        let metric = ThrottleMetric {
            mtype,
            units,
            def_system_limit: parse_size_suffix(system)?,
            def_api_limit: parse_size_suffix(api)?,
            def_user_limit: parse_size_suffix(user)?,
        };
        self.store.put_metric(metric).await
    }

    /// Current usage of a threshold after any month rollover
    pub async fn usage(
        &self,
        name: &ThresholdName,
        mtype: MetricType,
        units: MetricUnits,
    ) -> Result<i64> {
        Ok(self.current_row(name, mtype, units).await?.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use chrono::{TimeZone, Utc};

    fn engine(clock: Arc<ManualClock>) -> (ThrottleEngine, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        let engine = ThrottleEngine::new(
            Arc::new(MemoryThrottleStore::new()),
            notifier.clone(),
            clock,
            ThrottleConfig::default(),
        );
        (engine, notifier)
    }

    fn start() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()))
    }

    #[tokio::test]
    async fn test_user_limit_flags_next_request() {
        let clock = start();
        let (engine, notifier) = engine(clock.clone());
        let user = ThresholdName::User("alice".into());
        engine
            .set_threshold(&user, MetricType::Egress, MetricUnits::Bytes, "1000")
            .await
            .unwrap();

        engine.check("cutout", MetricType::Egress, "alice", 600, MetricUnits::Bytes).await.unwrap();
        engine.check("cutout", MetricType::Egress, "alice", 900, MetricUnits::Bytes).await.unwrap();
        assert_eq!(engine.usage(&user, MetricType::Egress, MetricUnits::Bytes).await.unwrap(), 1500);

        let err = engine
            .check("cutout", MetricType::Egress, "alice", 1, MetricUnits::Bytes)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 429);
        assert_eq!(err.to_string(), "User is throttled. Expected available tomorrow.");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].current, 1500);
        assert_eq!(notices[0].limit, 1000);

        clock.set(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        engine.check("cutout", MetricType::Egress, "alice", 7, MetricUnits::Bytes).await.unwrap();
        assert_eq!(engine.usage(&user, MetricType::Egress, MetricUnits::Bytes).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_unlimited_when_limit_not_positive() {
        let (engine, _) = engine(start());
        engine
            .set_metric_defaults(MetricType::Compute, MetricUnits::Cuboids, "-1", "0", "-1")
            .await
            .unwrap();
        for _ in 0..3 {
            engine
                .check("downsample", MetricType::Compute, "bob", 1 << 40, MetricUnits::Cuboids)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_api_level_throttles_all_users() {
        let (engine, _) = engine(start());
        let api = ThresholdName::Api("ingest".into());
        engine
            .set_threshold(&api, MetricType::Ingress, MetricUnits::Bytes, "1K")
            .await
            .unwrap();
        engine.check("ingest", MetricType::Ingress, "a", 2000, MetricUnits::Bytes).await.unwrap();
        let err = engine
            .check("ingest", MetricType::Ingress, "b", 1, MetricUnits::Bytes)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("API is throttled"));
    }

    #[test]
    fn test_threshold_names() {
        assert_eq!(ThresholdName::System.to_string(), "system");
        assert_eq!(ThresholdName::User("x".into()).to_string(), "user:x");
        assert_eq!(MetricType::Compute.default_units(), MetricUnits::Cuboids);
    }
}
