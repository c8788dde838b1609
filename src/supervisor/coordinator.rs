//! Bulk and group operations over the registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use super::error::SupervisorError;
use super::lifecycle::LifecycleManager;
use super::record::ProcessRecord;
use super::registry::Registry;

/// Pause between the stop and start halves of a restart.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug)]
enum Op {
    Start,
    Stop,
}

pub struct Coordinator {
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<Registry>,
    start_delay: Duration,
    settle_delay: Duration,
}

impl Coordinator {
    pub fn new(lifecycle: Arc<LifecycleManager>, start_delay: Duration) -> Self {
        let registry = lifecycle.registry().clone();
        Self {
            lifecycle,
            registry,
            start_delay,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn start_delay(&self) -> Duration {
        self.start_delay
    }

    /// Start every record without a live process, bucket by bucket.
    pub async fn start_all(&self) -> usize {
        self.start_ordered(self.registry.all()).await
    }

    /// Like [`Coordinator::start_all`], restricted to `auto_start` records.
    pub async fn auto_start_all(&self) -> usize {
        let records = self
            .registry
            .all()
            .into_iter()
            .filter(|r| r.config().auto_start)
            .collect();
        self.start_ordered(records).await
    }

    /// Stop every live record concurrently and wait for all of them.
    pub async fn stop_all(&self) -> usize {
        self.stop_concurrently(self.registry.all()).await
    }

    pub async fn restart_all(&self) -> usize {
        self.stop_all().await;
        tokio::time::sleep(self.settle_delay).await;
        self.start_all().await
    }

    pub async fn start_group(&self, group: &str) -> Result<usize, SupervisorError> {
        let members = self.registry.group(group)?;
        tracing::info!("Starting group '{}' ({} members)", group, members.len());
        Ok(self.start_ordered(members).await)
    }

    pub async fn stop_group(&self, group: &str) -> Result<usize, SupervisorError> {
        let members = self.registry.group(group)?;
        tracing::info!("Stopping group '{}' ({} members)", group, members.len());
        Ok(self.stop_concurrently(members).await)
    }

    pub async fn restart_group(&self, group: &str) -> Result<usize, SupervisorError> {
        self.stop_group(group).await?;
        tokio::time::sleep(self.settle_delay).await;
        self.start_group(group).await
    }

    /// Start non-live `records` grouped by `order`, ascending. Members of one
    /// bucket start concurrently; `start_delay` separates consecutive buckets.
    async fn start_ordered(&self, records: Vec<Arc<ProcessRecord>>) -> usize {
        let mut buckets: BTreeMap<i32, Vec<Arc<ProcessRecord>>> = BTreeMap::new();
        for record in records.into_iter().filter(|r| !r.is_alive()) {
            buckets.entry(record.config().order).or_default().push(record);
        }

        let mut dispatched = 0;
        let last = buckets.len();
        for (i, (order, bucket)) in buckets.into_iter().enumerate() {
            tracing::info!("Starting order bucket {} ({} processes)", order, bucket.len());
            dispatched += self.run_each(bucket, Op::Start).await;
            if i + 1 < last {
                tokio::time::sleep(self.start_delay).await;
            }
        }
        dispatched
    }

    async fn stop_concurrently(&self, records: Vec<Arc<ProcessRecord>>) -> usize {
        let live: Vec<_> = records.into_iter().filter(|r| r.is_alive()).collect();
        self.run_each(live, Op::Stop).await
    }

    /// Run `op` on every record on its own task and wait for all of them.
    /// Per-process failures are logged, never returned.
    async fn run_each(&self, records: Vec<Arc<ProcessRecord>>, op: Op) -> usize {
        let mut tasks = JoinSet::new();
        for record in records {
            let lifecycle = self.lifecycle.clone();
            let name = record.name().to_string();
            tasks.spawn(async move {
                let result = match op {
                    Op::Start => lifecycle.start_process(&name).await,
                    Op::Stop => lifecycle.stop_process(&name).await,
                };
                if let Err(e) = result {
                    tracing::warn!("[{}] {:?} failed: {}", name, op, e);
                }
            });
        }

        let mut dispatched = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(()) => dispatched += 1,
                Err(e) => tracing::warn!("Bulk {:?} task ended abnormally: {}", op, e),
            }
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use crate::events::MemoryEventStore;
    use std::collections::HashMap;

    fn coordinator(configs: Vec<ProcessConfig>) -> Coordinator {
        let mut groups = HashMap::new();
        groups.insert("pair".to_string(), vec!["a".to_string(), "b".to_string()]);
        let registry = Arc::new(Registry::new(
            "test",
            configs,
            groups,
            Arc::new(MemoryEventStore::new()),
        ));
        Coordinator::new(
            Arc::new(LifecycleManager::new(registry).unwrap()),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn unknown_group_is_rejected() {
        let coord = coordinator(vec![ProcessConfig::new("a", "true")]);
        assert!(matches!(
            coord.start_group("nope").await,
            Err(SupervisorError::NoSuchGroup(_))
        ));
        assert!(matches!(
            coord.restart_group("nope").await,
            Err(SupervisorError::NoSuchGroup(_))
        ));
    }

    #[tokio::test]
    async fn stop_all_with_nothing_running_is_a_no_op() {
        let coord = coordinator(vec![ProcessConfig::new("a", "true"), ProcessConfig::new("b", "true")]);
        assert_eq!(coord.stop_all().await, 0);
        assert_eq!(coord.stop_group("pair").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn launch_failures_are_absorbed() {
        let coord = coordinator(vec![
            ProcessConfig::new("a", "/definitely/not/a/binary").with_order(1),
            ProcessConfig::new("b", "/definitely/not/a/binary").with_order(2),
        ]);
        assert_eq!(coord.start_all().await, 2);
        for name in ["a", "b"] {
            let record = coord.registry.get(name).unwrap();
            assert_eq!(record.status(), crate::supervisor::ProcessStatus::FailedToStart);
            assert!(record.lock_state().last_error.is_some());
        }
    }

    #[tokio::test]
    async fn auto_start_all_skips_manual_processes() {
        let mut manual = ProcessConfig::new("b", "/definitely/not/a/binary");
        manual.auto_start = false;
        let mut auto = ProcessConfig::new("a", "/definitely/not/a/binary");
        auto.auto_start = true;
        let coord = coordinator(vec![auto, manual]);

        assert_eq!(coord.auto_start_all().await, 1);
        assert_eq!(
            coord.registry.get("b").unwrap().status(),
            crate::supervisor::ProcessStatus::NotStarted
        );
    }
}
