#![doc = include_str!("../README.md")]

pub mod cli;
pub mod config;
pub mod counter;
pub mod error;
pub mod gate;
pub mod http;
pub mod logging;
pub mod persist;
pub mod pool;
pub mod schedule;
pub mod server;
pub mod store;
pub mod window;

pub use config::{AppConfig, CounterConfig};
pub use counter::SlidingCounter;
pub use error::{ConfigError, CounterError, OpenError, StoreError};
pub use gate::GateStats;
pub use store::{JsonFileStore, MemoryStore, SnapshotStore};
pub use window::{Timestamp, TimestampWindow};
