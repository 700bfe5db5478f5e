//! Execution history of hunting tasks, keyed by the public address they were
//! executed from.

pub mod memory;
pub mod traits;

pub use memory::InMemoryHistory;
pub use traits::HistoryStore;
