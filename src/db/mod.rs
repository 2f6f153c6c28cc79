pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod retry;
pub mod services;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use retry::{with_retry, RetryPolicy};
pub use store::{AlertInvocationStore, AlertStore, MonitorStore, StatusStore};
