pub mod config;
pub mod events;
pub mod supervisor;
pub mod utils;

pub use config::{HealthCheckConfig, HealthPolicy, ProcessConfig, SupervisorConfig};
pub use events::{EventEntry, EventStore, MemoryEventStore, Page, PageRequest};
pub use supervisor::{ProcessSnapshot, ProcessStatus, Supervisor, SupervisorError};
