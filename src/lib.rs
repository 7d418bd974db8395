//! Registers the CLIs packaged in Docker images and serves their XML
//! parameter specs over HTTP.

pub mod api;
pub mod config;
pub mod discovery;
pub mod error;
pub mod jobs;
pub mod puller;
pub mod registry;
pub mod routes;
pub mod runtime;
pub mod types;
pub mod xmlspec;

// Shared by unit and integration tests.
pub mod test_support;

pub use api::{build_router, AppState};
pub use config::Config;
pub use error::{ApiError, DiscoveryError, ImageError, JobError, RegistryError, WaitError};
pub use jobs::{JobHandle, JobOrchestrator};
pub use registry::Registry;
pub use runtime::{DockerRuntime, ImageRuntime};
pub use types::{CliEntry, ImageRef, Job, JobEvent, JobStatus, Operation, RegistryRecord};
