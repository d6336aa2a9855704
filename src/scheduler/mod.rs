//! Background maintenance tasks for the retention store.

mod retention;

pub use retention::*;
