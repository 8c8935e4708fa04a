pub mod context;
pub mod feedback;
pub mod inbound;
pub mod outbound;

pub use context::BoxBody;
pub use feedback::Feedback;
pub use inbound::InboundProxy;
pub use outbound::{DispatchSettings, Dispatcher, Target};
