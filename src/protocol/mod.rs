//! Wire-level protocol types shared by the broker and consumers.

pub mod envelope;
pub mod paging;

pub use envelope::{MessageEnvelope, MessageProperties};
pub use paging::{pages, PageState};
