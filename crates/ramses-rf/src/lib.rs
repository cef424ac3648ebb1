//! RAMSES-II entity graph and gateway service
//!
//! Built on the packet transport of `ramses-tx`, this crate learns the
//! heating system it hears: devices, controllers and their zones, the
//! bindings between devices, and the latest state each one reported.
//!
//! # Architecture
//!
//! 1. **Dispatcher** - lines → messages → [`EntityGraph`] and
//!    [`BindingTracker`] updates, emitted as [`DispatchEvent`]s
//! 2. **Entity graph** - devices, systems and zones; schema values are
//!    sticky, state values follow the latest packet
//! 3. **Gateway** - one task owning the interface, the command engine and
//!    the dispatcher, driven through a [`GatewayHandle`]
//! 4. **Procedures** - schedules, fault logs, discovery and binding as
//!    sequences of commands on the handle
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ramses_rf::{Gateway, GatewayConfigBuilder};
//! use ramses_tx::SerialInterface;
//!
//! let config = GatewayConfigBuilder::new().serial_port("/dev/ttyACM0").eavesdrop(true).build();
//! let interface = SerialInterface::from_config(&config.ramses.interface);
//! let (gateway, handle) = Gateway::new(interface, config);
//! tokio::spawn(gateway.run());
//!
//! let mut events = handle.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port interface (requires `libudev-dev` on Linux)

pub mod binding;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod faultlog;
pub mod gateway;
pub mod graph;
pub mod schedule;
pub mod schema;
pub mod system;
pub mod zone;

pub use binding::{BindingEvent, BindingState, BindingTracker};
pub use config::{BindingConfig, GatewayConfig, GatewayConfigBuilder, GraphConfig};
pub use device::Device;
pub use dispatcher::{DispatchEvent, DispatchStats, Dispatcher, FailureKind};
pub use error::{Result, RfError};
pub use faultlog::MAX_FAULT_LOG_ENTRIES;
pub use gateway::{Gateway, GatewayCommand, GatewayHandle, GatewayStats, Submitted};
pub use graph::{EntityGraph, EntityId, GraphEvent, MissingSchema};
pub use schema::{
    BindingRecord, DeviceSchema, Observation, SchemaSnapshot, Stamped, Sticky, SystemSchema,
    ZoneSchema, ZoneType,
};
pub use system::System;
pub use zone::Zone;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
