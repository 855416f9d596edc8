//! In-memory broker core: mailboxes, bindings, client registry and the
//! dispatch loop that moves envelopes between them.

pub mod bindings;
pub mod clients;
pub mod dispatcher;
pub mod exchange;
pub mod server;

pub use bindings::BindingTable;
pub use clients::{ClientRegistry, Delivery, DeliveryTarget};
pub use dispatcher::{Dispatcher, DispatcherState};
pub use exchange::ExchangeTable;
pub use server::MemoryBroker;
