pub mod config;
pub mod dedup;
pub mod error;
pub mod journal;
pub mod manager;
pub mod progress;
pub mod scheduler;
pub mod sqlite;
pub mod transcode;
pub mod transfer;

pub use config::{
    load_media_config, DedupSection, EndpointsSection, LimitsSection, MediaConfig, PathsSection,
    ProfileEntry, ProfilesSection, RetrySection, TranscodeSection, TransferSection,
};
pub use dedup::{fingerprint, DuplicateMatch, DuplicatePolicy, DuplicateRule};
pub use error::{ConfigError, Result};
pub use journal::{
    JobStatus, JournalError, JournalFilter, JournalResult, MediaKind, SqliteJournalStore,
    SqliteJournalStoreBuilder, UploadRecord, CANCELLED_BY_USER, REMOVED_BY_USER,
};
pub use manager::{
    CatalogCommitter, CommitError, HttpCatalogCommitter, JobSnapshot, UploadContext, UploadError,
    UploadJobManager, UploadResult,
};
pub use progress::{composite_percent, StageProgress};
pub use scheduler::AdmissionScheduler;
pub use transcode::{
    CommandExecutor, FfmpegTranscoder, SourceMedia, SystemCommandExecutor, TranscodeError,
    TranscodeResult, VariantBlob, VariantTranscoder,
};
pub use transfer::{
    ChunkReceipt, ChunkRequest, ChunkTransport, ChunkedTransferClient, HttpChunkTransport,
    RetryPolicy, TransferError, TransferResult, TransferTask,
};
