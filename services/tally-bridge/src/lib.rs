//! vMix tally bridge.
//!
//! Supervises a fleet of vMix instances over their TCP API, tracks each
//! instance's activators (Recording, Streaming, External, MultiCorder) and
//! publishes the fleet-wide result as `ON`/`OFF` on a message bus topic.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//! ├── ConnectionLoop(endpoint)  (one per device: dial, subscribe, decode)
//! └── ...
//!         │ InstanceState snapshots
//!         ▼
//! FleetAggregator  (OR across devices, publishes on change)
//!         │
//!         ▼
//! Publisher        (MQTT in production, in-memory in tests)
//! ```
//!
//! ## Modules
//!
//! - `instance`: endpoints and per-device activator flags
//! - `connection`: the per-device reconnect loop
//! - `aggregator`: fleet-wide aggregation and change-triggered publication
//! - `supervisor`: spawns and stops the connection loops
//! - `bus`: publisher trait plus MQTT and in-memory implementations
//! - `config`: environment-driven configuration

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod connection;
pub mod instance;
pub mod supervisor;

// Re-export commonly used types
pub use aggregator::{Activity, FleetAggregator};
pub use bus::{BusError, Delivery, MemoryPublisher, MqttPublisher, PublishTarget, Publisher};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionLoop, ConnectionSettings};
pub use instance::{Endpoint, InstanceState};
pub use supervisor::Supervisor;
