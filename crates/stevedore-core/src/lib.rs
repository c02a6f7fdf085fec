//! Core building blocks shared by the stevedore binaries.
//!
//! Stores, key resolution, the transform pipeline, and the provisioning
//! workflow live here so operator surfaces stay thin.

pub mod cluster;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod nodelock;
pub mod pipeline;
pub mod process;
pub mod provision;
pub mod resolver;
pub mod store;
pub mod workflow;

pub use config::{default_registry, keys, Layout, SetupContext, SetupFlavor};
pub use error::{StevedoreError, StevedoreResult};
pub use resolver::KeyResolver;
pub use store::{open_store, ConfStore, FileKvStore, InMemoryKvStore, KvStore, Value};
pub use workflow::{Orchestrator, Service, WorkflowLevel, WorkflowReport};
