//! Consumer side: transport seams, the self-healing connection supervisor
//! and handler plumbing.

pub mod handler;
pub mod memory;
pub mod supervisor;
pub mod transport;

pub use handler::{publish_paged_response, AckingHandler, Consumer, ResponsePage};
pub use memory::InProcessTransport;
pub use supervisor::{ConnectionSupervisor, DeliveryHandler, SupervisorState};
pub use transport::{Channel, ChannelEvent, Topology, Transport};
