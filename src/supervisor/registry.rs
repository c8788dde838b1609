use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::SupervisorError;
use super::record::{ProcessRecord, ProcessSnapshot, RecordState};
use super::ProcessStatus;
use crate::config::ProcessConfig;
use crate::events::{EventEntry, EventStore};

/// Name -> record map built once from configuration.
///
/// The map itself never changes after construction, so lookups and snapshots
/// need no lock; each record guards its own runtime state.
pub struct Registry {
    node_name: String,
    records: HashMap<String, Arc<ProcessRecord>>,
    groups: HashMap<String, Vec<String>>,
    events: Arc<dyn EventStore>,
}

impl Registry {
    pub fn new(
        node_name: &str,
        configs: Vec<ProcessConfig>,
        groups: HashMap<String, Vec<String>>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        let records = configs
            .into_iter()
            .map(|cfg| (cfg.name.clone(), Arc::new(ProcessRecord::new(cfg))))
            .collect();
        Self {
            node_name: node_name.to_string(),
            records,
            groups,
            events,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    pub fn get(&self, name: &str) -> Result<Arc<ProcessRecord>, SupervisorError> {
        self.records
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::NoSuchProcess(name.to_string()))
    }

    /// All records, ordered by start order then name.
    pub fn all(&self) -> Vec<Arc<ProcessRecord>> {
        let mut all: Vec<_> = self.records.values().cloned().collect();
        all.sort_by(|a, b| {
            a.config()
                .order
                .cmp(&b.config().order)
                .then_with(|| a.name().cmp(b.name()))
        });
        all
    }

    pub fn snapshots(&self) -> Vec<ProcessSnapshot> {
        self.all().iter().map(|r| r.snapshot()).collect()
    }

    /// Members of a configured group.
    pub fn group(&self, group: &str) -> Result<Vec<Arc<ProcessRecord>>, SupervisorError> {
        let members = self
            .groups
            .get(group)
            .ok_or_else(|| SupervisorError::NoSuchGroup(group.to_string()))?;
        Ok(members
            .iter()
            .filter_map(|name| match self.records.get(name) {
                Some(record) => Some(record.clone()),
                None => {
                    tracing::warn!("Group '{}' lists unknown process '{}'", group, name);
                    None
                }
            })
            .collect())
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.groups.keys().cloned().collect();
        names.sort();
        names
    }

    /// Set the status of `record`; see [`Registry::update`].
    pub fn set_status(&self, record: &ProcessRecord, status: ProcessStatus) -> Option<EventEntry> {
        self.update(record, |_| Some(status))
    }

    /// The single place where a record's status changes.
    ///
    /// `f` runs under the record's lock and may edit any runtime field. If it
    /// returns a status different from the current one, the status is swapped and
    /// an event is appended before the lock is released. Returning `None` or the
    /// current status emits nothing.
    pub fn update<F>(&self, record: &ProcessRecord, f: F) -> Option<EventEntry>
    where
        F: FnOnce(&mut RecordState) -> Option<ProcessStatus>,
    {
        let mut state = record.lock_state();
        let next = f(&mut *state)?;
        let previous = state.status();
        if previous == next {
            return None;
        }
        if !previous.can_transition(next) {
            tracing::warn!("[{}] unexpected transition {} -> {}", record.name(), previous, next);
        }
        state.replace_status(next);

        let now = Utc::now();
        let entry = EventEntry {
            id: 0,
            timestamp: now,
            node_name: self.node_name.clone(),
            process_name: record.name().to_string(),
            pid: state.pid,
            previous_status: previous,
            new_status: next,
            start_time: state.start_time,
            end_time: state.end_time,
            exit_code: state.exit_code,
            uptime_ms: state.uptime_ms(now),
        };
        let stored = self.events.append(entry);
        tracing::info!("[{}] {} -> {} (event #{})", record.name(), previous, next, stored.id);
        Some(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventStore;

    fn registry(events: Arc<MemoryEventStore>) -> Registry {
        let mut groups = HashMap::new();
        groups.insert("web".to_string(), vec!["api".to_string(), "ghost".to_string()]);
        Registry::new(
            "node-a",
            vec![
                ProcessConfig::new("worker", "w").with_order(2),
                ProcessConfig::new("api", "a").with_order(1),
                ProcessConfig::new("db", "d").with_order(1),
            ],
            groups,
            events,
        )
    }

    #[test]
    fn lookup_and_ordering() {
        let reg = registry(Arc::new(MemoryEventStore::new()));
        assert_eq!(reg.get("api").unwrap().name(), "api");
        assert!(matches!(reg.get("nope"), Err(SupervisorError::NoSuchProcess(_))));

        let names: Vec<_> = reg.all().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["api", "db", "worker"]);
        assert_eq!(reg.snapshots().len(), 3);
    }

    #[test]
    fn group_lookup_skips_unknown_members() {
        let reg = registry(Arc::new(MemoryEventStore::new()));
        let web = reg.group("web").unwrap();
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].name(), "api");
        assert!(matches!(reg.group("batch"), Err(SupervisorError::NoSuchGroup(_))));
        assert_eq!(reg.group_names(), vec!["web"]);
    }

    #[test]
    fn set_status_emits_once_per_change() {
        let events = Arc::new(MemoryEventStore::new());
        let reg = registry(events.clone());
        let api = reg.get("api").unwrap();

        let first = reg.set_status(&api, ProcessStatus::Starting).unwrap();
        assert_eq!(first.previous_status, ProcessStatus::NotStarted);
        assert_eq!(first.new_status, ProcessStatus::Starting);
        assert_eq!(first.node_name, "node-a");
        assert!(reg.set_status(&api, ProcessStatus::Starting).is_none());
        assert_eq!(events.count(), 1);

        reg.set_status(&api, ProcessStatus::Running);
        assert_eq!(events.find_by_process_name("api").len(), 2);
        assert_eq!(api.status(), ProcessStatus::Running);
    }

    #[test]
    fn update_snapshots_runtime_fields_into_event() {
        let events = Arc::new(MemoryEventStore::new());
        let reg = registry(events.clone());
        let db = reg.get("db").unwrap();

        let entry = reg
            .update(&db, |state| {
                state.pid = Some(4242);
                state.start_time = Some(Utc::now());
                Some(ProcessStatus::Starting)
            })
            .unwrap();
        assert_eq!(entry.pid, Some(4242));
        assert!(entry.uptime_ms.is_some());

        // Field edits without a status change produce no event.
        assert!(reg.update(&db, |state| {
            state.exit_code = Some(3);
            None
        })
        .is_none());
        assert_eq!(db.lock_state().exit_code, Some(3));
        assert_eq!(events.count(), 1);
    }

    #[test]
    fn records_transition_independently() {
        let events = Arc::new(MemoryEventStore::new());
        let reg = Arc::new(registry(events.clone()));

        let handles: Vec<_> = ["api", "db", "worker"]
            .into_iter()
            .map(|name| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    let record = reg.get(name).unwrap();
                    for status in [ProcessStatus::Starting, ProcessStatus::Running, ProcessStatus::Finished] {
                        reg.set_status(&record, status);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(events.count(), 9);
        let ids: std::collections::HashSet<_> =
            events.find_all(crate::events::PageRequest::new(0, 100)).content.iter().map(|e| e.id).collect();
        assert_eq!(ids.len(), 9, "ids are unique");
    }
}
