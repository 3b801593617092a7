//! In-process adapters.
//!
//! Used by the test suites and by the monolith for state that does not need to outlive the
//! process. Each adapter can be told to fail so error paths can be exercised.

mod bus;
mod cache;
mod repository;
mod store;

pub use bus::MemoryBus;
pub use cache::MemoryCache;
pub use repository::MemoryRepository;
pub use store::MemoryObjectStore;

use crate::error::BoxError;

fn injected(what: &str) -> BoxError {
    format!("injected {} failure", what).into()
}
