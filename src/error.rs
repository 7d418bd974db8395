use thiserror::Error;

use crate::types::JobStatus;

/// A string that is not a `repo:tag` or `repo@digest` reference.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("image reference `{0}` has no tag or digest")]
    MissingSeparator(String),
    #[error("image reference `{0}` has an empty repository, tag or digest")]
    EmptyComponent(String),
    #[error("image reference `{0}` has more than one digest separator")]
    MultipleSeparators(String),
}

/// Errors from the container runtime and the puller built on it.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image not found: {0}")]
    NotFound(String),

    /// Network or daemon hiccup; the puller retries these.
    #[error("transient failure for {image}: {reason}")]
    Transient { image: String, reason: String },

    #[error("container run timed out after {0}s")]
    Timeout(u64),

    #[error("runtime error: {0}")]
    Runtime(String),
}

/// The image pulled but does not carry a usable CLI manifest.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("`--list_cli` output of {image} is not a JSON object: {reason}")]
    ListOutput { image: String, reason: String },

    #[error("{0} does not declare any CLI")]
    EmptyManifest(String),

    #[error("`{cli} --xml` of {image} produced no XML")]
    XmlOutput { image: String, cli: String },

    #[error("invalid XML spec for {cli}: {reason}")]
    Xml { cli: String, reason: String },

    #[error(transparent)]
    Runtime(#[from] ImageError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two job runs wrote the same key concurrently. Per-image
    /// serialization makes this unreachable unless that invariant breaks.
    #[error("conflicting write for {0}")]
    StoreConflict(String),

    #[error("registry lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("illegal job transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },
}

/// Failure of a caller waiting on a job, not of the job itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("job {0} did not finish within {1}s")]
    TimedOut(u64, u64),

    #[error("job {0} was dropped before reaching a terminal state")]
    Dropped(u64),
}

/// Rejections produced by the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid `name` parameter: {0}")]
    InvalidName(String),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error("no metadata registered for {0}")]
    NotRegistered(String),

    #[error("no route published at {0}")]
    UnknownRoute(String),

    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Wait(#[from] WaitError),
}
