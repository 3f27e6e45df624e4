//! Gridex coordinator.
//!
//! Control plane of the compute exchange: accepts worker sessions over TCP,
//! schedules queued jobs onto matching workers, settles credit-accounted
//! results, and serves the dashboard API.

pub mod api;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;

pub use api::{ApiRequest, ApiResponse, ApiService};
pub use registry::{ConnectedWorker, Registry};
pub use scheduler::{ScheduleError, Scheduler};
pub use server::Coordinator;
