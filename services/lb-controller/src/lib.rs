//! lbsync load-balancer controller.
//!
//! Keeps pools, routes and health monitors on a load-balancer backend in step
//! with the applications an orchestrator runs. Routing-update events are
//! consumed one at a time, translated into controller calls and acknowledged
//! only once the backend has confirmed every change.

pub mod config;
pub mod consumer;
pub mod controller;
pub mod drivers;
pub mod error;
pub mod model;
pub mod naming;
pub mod registry;
pub mod source;

pub use config::{Config, DriverConfig, Secret};
pub use consumer::{BatchReport, ConsumerSettings, EventOutcome, RoutingConsumer};
pub use controller::{Controller, ControllerSettings, PoolHandle};
pub use error::{LbError, ObjectKind};
pub use model::{Backend, Credentials, JobId, Member, MonitorSpec, MonitorType};
pub use naming::{MonitorTemplate, Naming};
pub use registry::{CacheState, Cached, Registry};
pub use source::{EventSource, HttpEventSource, QueueEventSource};
