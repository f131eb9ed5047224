pub mod checksum;
pub mod chunk_worker;
pub mod config;
pub mod coordinator;
pub mod destination;
pub mod errors;
pub mod orchestrator;
pub mod queue;
pub mod source;
pub mod transfer_plan;
pub mod walker;
pub mod work;

pub use checksum::ChecksumType;
pub use config::FetchConfig;
pub use destination::{
    Destination, FileManifest, LocalDirDestination, MemoryDestination, MemorySink, Sink,
};
pub use errors::{ErrorCategory, Failure, FailureLog, FailureStage};
pub use orchestrator::{FetchSummary, Orchestrator, Progress, QueueDepths};
pub use source::{
    Connector, EntryKind, ReadSeek, RemoteEntry, SchemeConnector, Source, SourceParams,
};
pub use transfer_plan::{Chunk, FinishedPart};
pub use work::{CompletedFile, WorkItem};
