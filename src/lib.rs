//! FleetMQ library root.

pub mod bridge;
pub mod broker;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod protocol;

pub use bridge::RequestBridge;
pub use broker::{BindingTable, ClientRegistry, Delivery, DeliveryTarget, Dispatcher, MemoryBroker};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use consumer::{Channel, ConnectionSupervisor, Consumer, InProcessTransport, Transport};
pub use crypto::{MessageEncryptor, PassthroughEncryptor};
pub use error::{Error, Result};
pub use protocol::{MessageEnvelope, MessageProperties, PageState};
