//! Order persistence and command execution.

pub mod dispatch;
pub mod store;

pub use dispatch::{Dispatched, OrderDispatcher};
pub use store::{InMemoryOrderStore, OrderStore};
