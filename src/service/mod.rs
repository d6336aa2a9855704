//! Ingestion and aggregation services over the retention store.

mod aggregate;
mod ingest;
mod validate;

pub use aggregate::*;
pub use ingest::*;
pub use validate::*;

use crate::db::{Store, StoreError};

/// Run a blocking store call off the async executor.
async fn blocking<T, F>(store: &Store, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store)).await?
}
