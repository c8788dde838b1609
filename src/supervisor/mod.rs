pub mod coordinator;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod process;
pub mod record;
pub mod registry;
pub mod state_machine;
pub mod watcher;

use std::sync::Arc;
use std::time::Duration;

pub use coordinator::Coordinator;
pub use error::SupervisorError;
pub use health::HealthState;
pub use lifecycle::LifecycleManager;
pub use record::{ProcessRecord, ProcessSnapshot};
pub use registry::Registry;
pub use state_machine::ProcessStatus;

use crate::config::SupervisorConfig;
use crate::events::{EventStore, MemoryEventStore};

/// Entry point for collaborators (REST layer, CLI, daemon binary).
///
/// Lifecycle and bulk calls return as soon as the work is dispatched; poll
/// [`Supervisor::get`] / [`Supervisor::all`] or subscribe to the event store
/// to observe the outcome. The awaitable forms live on [`LifecycleManager`]
/// and [`Coordinator`].
pub struct Supervisor {
    registry: Arc<Registry>,
    lifecycle: Arc<LifecycleManager>,
    coordinator: Arc<Coordinator>,
    auto_start: bool,
}

impl Supervisor {
    /// Validate `config` and build the registry. Nothing is launched.
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        Self::with_event_store(config, Arc::new(MemoryEventStore::new()))
    }

    pub fn with_event_store(
        config: SupervisorConfig,
        events: Arc<dyn EventStore>,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;
        let groups = config.group_map();
        let start_delay = config.start_delay();
        let registry = Arc::new(Registry::new(
            &config.node_name,
            config.processes,
            groups,
            events,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(registry.clone())?);
        let coordinator = Arc::new(Coordinator::new(lifecycle.clone(), start_delay));
        tracing::info!(
            "Supervisor ready on node '{}' with {} processes",
            registry.node_name(),
            registry.all().len()
        );
        Ok(Self {
            registry,
            lifecycle,
            coordinator,
            auto_start: config.auto_start,
        })
    }

    /// Override the pause used by restart-all and restart-group.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        let start_delay = self.coordinator.start_delay();
        self.coordinator = Arc::new(
            Coordinator::new(self.lifecycle.clone(), start_delay).with_settle_delay(settle_delay),
        );
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        self.registry.events()
    }

    // ── Registry reads ───────────────────────────────────

    pub fn get(&self, name: &str) -> Result<ProcessSnapshot, SupervisorError> {
        Ok(self.registry.get(name)?.snapshot())
    }

    pub fn all(&self) -> Vec<ProcessSnapshot> {
        self.registry.snapshots()
    }

    pub fn by_group(&self, group: &str) -> Result<Vec<ProcessSnapshot>, SupervisorError> {
        Ok(self.registry.group(group)?.iter().map(|r| r.snapshot()).collect())
    }

    pub fn groups(&self) -> Vec<String> {
        self.registry.group_names()
    }

    // ── Single process ───────────────────────────────────

    pub fn start(&self, name: &str) -> Result<(), SupervisorError> {
        self.dispatch(name, |lifecycle, name| async move {
            lifecycle.start_process(&name).await
        })
    }

    pub fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        self.dispatch(name, |lifecycle, name| async move {
            lifecycle.stop_process(&name).await
        })
    }

    pub fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        self.dispatch(name, |lifecycle, name| async move {
            lifecycle.restart_process(&name).await
        })
    }

    fn dispatch<F, Fut>(&self, name: &str, op: F) -> Result<(), SupervisorError>
    where
        F: FnOnce(Arc<LifecycleManager>, String) -> Fut,
        Fut: std::future::Future<Output = Result<(), SupervisorError>> + Send + 'static,
    {
        // 이름 검증은 동기적으로
        self.registry.get(name)?;
        let name = name.to_string();
        let fut = op(self.lifecycle.clone(), name.clone());
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::warn!("[{}] {}", name, e);
            }
        });
        Ok(())
    }

    // ── Bulk ─────────────────────────────────────────────

    pub fn start_all(&self) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            coordinator.start_all().await;
        });
    }

    pub fn stop_all(&self) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            coordinator.stop_all().await;
        });
    }

    pub fn restart_all(&self) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            coordinator.restart_all().await;
        });
    }

    pub fn auto_start_all(&self) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            coordinator.auto_start_all().await;
        });
    }

    pub fn start_group(&self, group: &str) -> Result<(), SupervisorError> {
        self.registry.group(group)?;
        let coordinator = self.coordinator.clone();
        let group = group.to_string();
        tokio::spawn(async move {
            if let Err(e) = coordinator.start_group(&group).await {
                tracing::warn!("{}", e);
            }
        });
        Ok(())
    }

    pub fn stop_group(&self, group: &str) -> Result<(), SupervisorError> {
        self.registry.group(group)?;
        let coordinator = self.coordinator.clone();
        let group = group.to_string();
        tokio::spawn(async move {
            if let Err(e) = coordinator.stop_group(&group).await {
                tracing::warn!("{}", e);
            }
        });
        Ok(())
    }

    pub fn restart_group(&self, group: &str) -> Result<(), SupervisorError> {
        self.registry.group(group)?;
        let coordinator = self.coordinator.clone();
        let group = group.to_string();
        tokio::spawn(async move {
            if let Err(e) = coordinator.restart_group(&group).await {
                tracing::warn!("{}", e);
            }
        });
        Ok(())
    }

    // ── Daemon hooks ─────────────────────────────────────

    /// Auto-start configured processes when the global flag is set.
    pub async fn boot(&self) -> usize {
        if !self.auto_start {
            tracing::info!("Global auto-start disabled, nothing launched");
            return 0;
        }
        let started = self.coordinator.auto_start_all().await;
        tracing::info!("Boot complete: {} processes auto-started", started);
        started
    }

    /// Stop every live process and wait for all of them.
    pub async fn shutdown(&self) -> usize {
        tracing::info!("Shutting down supervised processes");
        let stopped = self.coordinator.stop_all().await;
        tracing::info!("Shutdown complete: {} processes stopped", stopped);
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;

    fn config() -> SupervisorConfig {
        let mut cfg = SupervisorConfig::default();
        cfg.node_name = "unit".into();
        cfg.processes = vec![
            ProcessConfig::new("api", "/bin/api").with_order(1),
            ProcessConfig::new("worker", "/bin/worker").with_order(2),
        ];
        cfg.groups.insert("web".into(), vec!["api".into()]);
        cfg
    }

    #[tokio::test]
    async fn invalid_config_launches_nothing() {
        let mut cfg = config();
        cfg.processes.push(ProcessConfig::new("api", "/bin/dup"));
        assert!(matches!(
            Supervisor::new(cfg),
            Err(SupervisorError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn reads_report_not_started_records() {
        let sup = Supervisor::new(config()).unwrap();
        let all = sup.all();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|s| s.status == ProcessStatus::NotStarted && !s.alive));
        assert_eq!(sup.get("api").unwrap().order, 1);
        assert_eq!(sup.groups(), vec!["web"]);
        assert_eq!(sup.by_group("web").unwrap()[0].name, "api");
        assert_eq!(sup.events().count(), 0);
    }

    #[tokio::test]
    async fn unknown_names_fail_synchronously() {
        let sup = Supervisor::new(config()).unwrap();
        assert!(matches!(sup.start("nope"), Err(SupervisorError::NoSuchProcess(_))));
        assert!(matches!(sup.stop("nope"), Err(SupervisorError::NoSuchProcess(_))));
        assert!(matches!(sup.restart("nope"), Err(SupervisorError::NoSuchProcess(_))));
        assert!(matches!(sup.start_group("nope"), Err(SupervisorError::NoSuchGroup(_))));
        assert!(matches!(sup.by_group("nope"), Err(SupervisorError::NoSuchGroup(_))));
    }

    #[tokio::test]
    async fn boot_respects_global_flag() {
        let mut cfg = config();
        cfg.processes[0].auto_start = true;
        let sup = Supervisor::new(cfg).unwrap();
        assert_eq!(sup.boot().await, 0);
        assert_eq!(sup.get("api").unwrap().status, ProcessStatus::NotStarted);
        assert_eq!(sup.shutdown().await, 0);
    }
}
