pub mod error;
pub mod models;
pub mod store;

pub use error::{JournalError, JournalResult};
pub use models::{
    JobStatus, MediaKind, UploadRecord, CANCELLED_BY_USER, REMOVED_BY_USER,
};
pub use store::{JournalFilter, SqliteJournalStore, SqliteJournalStoreBuilder};
