//! `productsnap-generation`
//!
//! **Responsibility:** boundary to the external collaborators of the job core.
//!
//! - [`GenerationAdapter`]: the AI image provider call (HTTP provider or a
//!   scripted stand-in), selected at construction time through [`Generator`].
//! - [`ResultPersister`]: durable, idempotent storage of generated artifacts,
//!   on the filesystem ([`FsResultPersister`]) or in memory for tests.
//!
//! Nothing in this crate touches job state; workers own that.

pub mod adapter;
pub mod backend;
pub mod error;
pub mod filesystem;
pub mod http;
pub mod persister;
pub mod prompts;
pub mod scripted;

pub use adapter::{
    Artifact, GenerationAdapter, GenerationRequest, ProgressReceiver, ProgressReporter,
};
pub use backend::Generator;
pub use error::GenerationError;
pub use filesystem::FsResultPersister;
pub use http::{HttpGenerator, HttpGeneratorConfig};
pub use persister::{InMemoryResultPersister, ResultPersister, StableRef, StorageError};
pub use scripted::{ScriptedGenerator, ScriptedOutcome};
