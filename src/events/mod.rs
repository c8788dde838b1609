//! Append-only audit log of process status transitions.
//!
//! Every entry is produced by the registry's status choke point; nothing else
//! appends. The in-memory store is the default backend; anything implementing
//! [`EventStore`] can replace it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::supervisor::ProcessStatus;

const BROADCAST_CAPACITY: usize = 1024;

/// One status transition. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEntry {
    /// Assigned by the store on append (0 means "not yet assigned").
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
    pub process_name: String,
    pub pid: Option<u32>,
    pub previous_status: ProcessStatus,
    pub new_status: ProcessStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Uptime in milliseconds at the moment of the event.
    pub uptime_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    /// Lenient parse: anything other than `asc` sorts newest first.
    pub fn parse_lenient(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("asc") {
            Self::Asc
        } else {
            Self::Desc
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    Id,
    Timestamp,
    ProcessName,
    Status,
}

impl SortField {
    /// Unknown fields fall back to event time.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('_', "").as_str() {
            "id" => Self::Id,
            "processname" | "name" => Self::ProcessName,
            "status" | "newstatus" => Self::Status,
            _ => Self::Timestamp,
        }
    }
}

/// Page query. `page` is zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
    pub sort_field: SortField,
    pub direction: SortDirection,
}

impl PageRequest {
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            size,
            sort_field: SortField::Timestamp,
            direction: SortDirection::Desc,
        }
    }

    /// Build from raw strings as a REST layer would receive them.
    pub fn parse(page: usize, size: usize, sort_field: &str, direction: &str) -> Self {
        Self {
            page,
            size,
            sort_field: SortField::parse_lenient(sort_field),
            direction: SortDirection::parse_lenient(direction),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, 20)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub page: usize,
    pub size: usize,
    pub total_elements: usize,
    pub total_pages: usize,
}

/// Query contract of the event log.
pub trait EventStore: Send + Sync {
    /// Store `entry`, assigning the next id when `entry.id == 0`. Returns the stored entry.
    fn append(&self, entry: EventEntry) -> EventEntry;
    fn find_by_process_name(&self, name: &str) -> Vec<EventEntry>;
    fn find_by_status(&self, status: ProcessStatus) -> Vec<EventEntry>;
    fn find_all(&self, request: PageRequest) -> Page<EventEntry>;
    fn delete_by_id(&self, id: u64) -> bool;
    fn clear_all(&self);
    fn count(&self) -> usize;
    /// Live feed of appended entries.
    fn subscribe(&self) -> broadcast::Receiver<EventEntry>;
}

struct EventBuffer {
    entries: VecDeque<EventEntry>,
    next_id: u64,
}

/// Unbounded in-memory event store.
pub struct MemoryEventStore {
    inner: Mutex<EventBuffer>,
    feed: broadcast::Sender<EventEntry>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Mutex::new(EventBuffer {
                entries: VecDeque::new(),
                next_id: 1,
            }),
            feed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EventBuffer> {
        // 버퍼는 문장 단위로 항상 일관된 상태이므로 poison은 무시
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn filtered(&self, keep: impl Fn(&EventEntry) -> bool) -> Vec<EventEntry> {
        self.lock().entries.iter().filter(|e| keep(e)).cloned().collect()
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for MemoryEventStore {
    fn append(&self, mut entry: EventEntry) -> EventEntry {
        {
            let mut buf = self.lock();
            if entry.id == 0 {
                entry.id = buf.next_id;
            }
            buf.next_id = buf.next_id.max(entry.id + 1);
            buf.entries.push_back(entry.clone());
        }
        // No subscribers is fine.
        let _ = self.feed.send(entry.clone());
        entry
    }

    fn find_by_process_name(&self, name: &str) -> Vec<EventEntry> {
        self.filtered(|e| e.process_name == name)
    }

    fn find_by_status(&self, status: ProcessStatus) -> Vec<EventEntry> {
        self.filtered(|e| e.new_status == status)
    }

    fn find_all(&self, request: PageRequest) -> Page<EventEntry> {
        let mut all: Vec<EventEntry> = self.lock().entries.iter().cloned().collect();
        all.sort_by(|a, b| {
            let ord = compare(a, b, request.sort_field);
            match request.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        });

        let total_elements = all.len();
        let size = request.size.max(1);
        let total_pages = total_elements.div_ceil(size);
        let content = all.into_iter().skip(request.page.saturating_mul(size)).take(size).collect();

        Page {
            content,
            page: request.page,
            size,
            total_elements,
            total_pages,
        }
    }

    fn delete_by_id(&self, id: u64) -> bool {
        let mut buf = self.lock();
        match buf.entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                buf.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    fn clear_all(&self) {
        let mut buf = self.lock();
        let removed = buf.entries.len();
        buf.entries.clear();
        tracing::info!("Cleared {} events", removed);
    }

    fn count(&self) -> usize {
        self.lock().entries.len()
    }

    fn subscribe(&self) -> broadcast::Receiver<EventEntry> {
        self.feed.subscribe()
    }
}

fn compare(a: &EventEntry, b: &EventEntry, field: SortField) -> Ordering {
    // id는 항상 2차 정렬 키 (같은 시각의 이벤트 순서 보장)
    let primary = match field {
        SortField::Id => Ordering::Equal,
        SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
        SortField::ProcessName => a.process_name.cmp(&b.process_name),
        SortField::Status => a.new_status.as_str().cmp(b.new_status.as_str()),
    };
    primary.then(a.id.cmp(&b.id))
}
