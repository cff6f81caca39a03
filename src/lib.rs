#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod queue;
pub mod reconcile;
pub mod serializer;
pub mod storage;
pub mod telemetry;
pub mod vdata;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the embedding surface at crate root for convenience
pub use crate::client::{Handle, SilentClient, SilentClientBuilder, SubmitOptions, Submission};
pub use crate::config::Config;
pub use crate::queue::record::{QueuedRequest, RequestDescriptor};
pub use crate::queue::{
    Backoff, Behavior, CancelToken, RetryMatcher, RetryPolicy, Status, Transport, TransportError,
};
pub use crate::reconcile::{StateCell, StateMatcher};
pub use crate::serializer::{SerializerRegistry, ValueSerializer};
pub use crate::storage::{FileStore, MemoryStore, PersistentStore};
pub use crate::vdata::{access_path, virtualize, AccessMode, Key, Kind, Value, VdataId};
