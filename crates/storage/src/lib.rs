pub mod error;
pub mod janitor;
pub mod manager;

pub use error::StorageError;
pub use janitor::{Janitor, SweepReport};
pub use manager::{sanitize_filename, Category, StorageManager, WorkingArea};
