//! Master-side core: persistence backends, the three scheduler loops and
//! the HTTP API.

pub mod config;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod store;

pub use config::Config;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerMetrics};
pub use service::{Service, ServiceHost};
pub use store::memory::MemoryStore;
pub use store::postgres::PgStore;
