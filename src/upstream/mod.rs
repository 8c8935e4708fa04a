pub mod backend;
pub mod health;
pub mod loadbalance;
pub mod probe;
pub mod registry;

pub use backend::{BackendRecord, InFlightGuard, InactiveReason, LoadHorizon};
pub use health::HealthMonitor;
pub use loadbalance::LoadBalancer;
pub use probe::{LivenessProbe, ProbeOutcome, TcpConnectProbe};
pub use registry::{BackendRegistry, BackendState, ServiceView};
