//! Durable queue of writes made while the server was unreachable.

mod store;
mod types;

pub use store::{OperationQueue, QueueError, QueueResult};
pub use types::{MutationMethod, OpId, OpStatus, QueuedOperation};
