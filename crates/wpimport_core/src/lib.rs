pub mod config;
pub mod error;
pub mod identity;
pub mod mapper;
pub mod migrate;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod runtime;
pub mod schema;
pub mod source;
pub mod store;

pub use error::{FailureReason, MappingError, RecordFailure, SourceError, WriteError};
pub use identity::IdentityMap;
pub use model::{ContentItem, ContentKind, DestinationId, NaturalKey, NormalizedRecord};
pub use orchestrator::{MigrationOptions, MigrationOrchestrator};
pub use report::{MigrationOutcome, ResultReporter};
pub use source::{HttpMediaFetcher, MediaFetcher, SourceClient, WordPressClient};
pub use store::{SqliteContentStore, TargetWriter};
