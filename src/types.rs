//! Data structures shared by the registry, the job orchestrator and the
//! HTTP layer.
//!
//! Everything here is serialised with [`serde`](https://serde.rs/) and
//! appears verbatim in API responses, so field names follow the wire
//! format rather than Rust conventions where the two differ.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::ReferenceError;
use crate::xmlspec::CliSpec;

/// The part of an image reference after the repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    /// `repo:tag`
    Tag(String),
    /// `repo@sha256:...`
    Digest(String),
}

impl Reference {
    pub fn as_str(&self) -> &str {
        match self {
            Reference::Tag(s) | Reference::Digest(s) => s,
        }
    }
}

/// A pullable image: repository plus exactly one tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageRef {
    pub repository: String,
    pub reference: Reference,
}

impl ImageRef {
    pub fn tagged(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            reference: Reference::Tag(tag.into()),
        }
    }

    /// Tag or digest string, used as the second level of the registry record.
    pub fn version(&self) -> &str {
        self.reference.as_str()
    }
}

impl FromStr for ImageRef {
    type Err = ReferenceError;

    /// `@` selects the digest form. Otherwise the last `:` that is not part
    /// of a `host:port` prefix separates the tag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (repository, reference) = if let Some((repo, digest)) = s.split_once('@') {
            (repo, Reference::Digest(digest.to_string()))
        } else {
            match s.rfind(':') {
                Some(idx) if !s[idx + 1..].contains('/') => {
                    (&s[..idx], Reference::Tag(s[idx + 1..].to_string()))
                }
                _ => return Err(ReferenceError::MissingSeparator(s.to_string())),
            }
        };

        if repository.is_empty() || reference.as_str().is_empty() {
            return Err(ReferenceError::EmptyComponent(s.to_string()));
        }
        if reference.as_str().contains('@') || has_stray_colon(repository) {
            return Err(ReferenceError::MultipleSeparators(s.to_string()));
        }

        Ok(Self {
            repository: repository.to_string(),
            reference,
        })
    }
}

/// A `:` is only allowed in the registry host (`host:port/...`).
fn has_stray_colon(repository: &str) -> bool {
    match repository.split_once('/') {
        Some((_, path)) => path.contains(':'),
        None => repository.contains(':'),
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}:{}", self.repository, tag),
            Reference::Digest(digest) => write!(f, "{}@{}", self.repository, digest),
        }
    }
}

impl Serialize for ImageRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One CLI discovered inside an image.
#[derive(Debug, Clone, Serialize)]
pub struct CliEntry {
    #[serde(skip)]
    pub image: ImageRef,
    #[serde(skip)]
    pub name: String,
    /// Implementation type reported by `--list_cli`, e.g. `python`.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Route serving the raw XML spec.
    pub xmlspec: String,
    /// Route serving the parsed spec as JSON.
    #[serde(rename = "spec")]
    pub spec_route: String,
    /// Hex sha256 of the XML, also used as the ETag.
    pub digest: String,
    #[serde(skip)]
    pub xml: String,
    #[serde(skip)]
    pub spec: CliSpec,
}

/// repository -> tag or digest -> cli name -> entry.
pub type RegistryRecord = BTreeMap<String, BTreeMap<String, BTreeMap<String, CliEntry>>>;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }

    /// Jobs move strictly forward: queued, running, then one terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Running, Success) | (Running, Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// What a job does to its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Operation {
    Add,
    Delete { delete_from_local_repo: bool },
}

/// Job type tag carried on every record and event.
pub const JOB_TYPE: &str = "cli_job";

/// Snapshot of a job as exposed over the API.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: u64,
    #[serde(rename = "type")]
    pub job_type: &'static str,
    pub operation: Operation,
    pub image: ImageRef,
    pub status: JobStatus,
    pub log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lifecycle notification broadcast on every status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job_id: u64,
    #[serde(rename = "type")]
    pub job_type: &'static str,
    pub operation: Operation,
    pub image: ImageRef,
    pub status: JobStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tag_form() {
        let r: ImageRef = "dsarchive/histomicstk:v0.1.3".parse().unwrap();
        assert_eq!(r.repository, "dsarchive/histomicstk");
        assert_eq!(r.reference, Reference::Tag("v0.1.3".into()));
        assert_eq!(r.to_string(), "dsarchive/histomicstk:v0.1.3");
    }

    #[test]
    fn parses_digest_form_with_colon_in_digest() {
        let r: ImageRef = "library/busybox@sha256:abcd".parse().unwrap();
        assert_eq!(r.repository, "library/busybox");
        assert_eq!(r.reference, Reference::Digest("sha256:abcd".into()));
        assert_eq!(r.to_string(), "library/busybox@sha256:abcd");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let r: ImageRef = "localhost:5000/tools/cli:1.0".parse().unwrap();
        assert_eq!(r.repository, "localhost:5000/tools/cli");
        assert_eq!(r.version(), "1.0");

        assert!(matches!(
            "localhost:5000/tools/cli".parse::<ImageRef>(),
            Err(ReferenceError::MissingSeparator(_))
        ));
    }

    #[test]
    fn rejects_malformed_references() {
        assert!("busybox".parse::<ImageRef>().is_err());
        assert!(":latest".parse::<ImageRef>().is_err());
        assert!("busybox:".parse::<ImageRef>().is_err());
        assert!("busybox@".parse::<ImageRef>().is_err());
        for both in ["a@b@c", "a:b:c", "repo:tag@sha256:abc", "host:5000/repo:tag@sha256:abc"] {
            assert!(
                matches!(
                    both.parse::<ImageRef>(),
                    Err(ReferenceError::MultipleSeparators(_))
                ),
                "{both} should be rejected"
            );
        }
    }

    #[test]
    fn status_transitions_only_move_forward() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Error));
        assert!(!Queued.can_transition_to(Success));
        assert!(!Success.can_transition_to(Error));
        assert!(!Error.can_transition_to(Running));
        assert!(Success.is_terminal() && Error.is_terminal());
        assert!(!Running.is_terminal());
    }
}
