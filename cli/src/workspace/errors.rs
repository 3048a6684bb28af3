//! Error types for the workspace core.
//!
//! Errors are plain structured values grouped by the pipeline stage that
//! produces them. User-facing wording is rendered at the command layer;
//! tests inspect the structured variants directly.

use std::path::PathBuf;
use thiserror::Error;

use crate::workspace::identity::PackageIdentity;

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Errors raised while turning manifests into a constraint set.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("package '{identity}' requires tools version {required} but {found} is in use")]
    UnsupportedToolsVersion {
        identity: PackageIdentity,
        found: String,
        required: String,
    },

    #[error("tools version of '{identity}' is incompatible with its dependents")]
    IncompatibleToolsVersion { identity: PackageIdentity },

    #[error("cyclic dependency between {cycle:?}")]
    CyclicDependency { cycle: Vec<PackageIdentity> },

    #[error("product '{product}' not found in package '{package}'")]
    ProductNotFound {
        product: String,
        package: PackageIdentity,
    },

    #[error("root package '{identity}' declared more than once")]
    DuplicateRootPackage { identity: PackageIdentity },

    #[error("override for '{expected}' points at a directory named '{found}'")]
    OverrideBasenameMismatch { expected: String, found: String },
}

/// Errors produced by the resolver proper.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("dependencies could not be resolved: {explanation}")]
    Unsatisfiable { explanation: String },

    #[error("branch '{branch}' not found{}", .suggestion.as_ref().map(|s| format!("; did you mean '{}'?", s)).unwrap_or_default())]
    BranchNotFound {
        branch: String,
        suggestion: Option<String>,
    },

    #[error("revision '{revision}' not found")]
    RevisionNotFound { revision: String },

    #[error("package '{package}' is pinned to a revision but depends on local package '{local}'")]
    RevisionDependencyHasLocalDependency {
        package: PackageIdentity,
        local: String,
    },

    #[error("target '{target}' of product '{product}' uses unsafe build flags")]
    UnsafeFlagsInDependency { target: String, product: String },
}

/// Errors from remote I/O: HTTP fetches and source-control operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch of {url} failed with status {status}")]
    Failed { url: String, status: u16 },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("timeout fetching {url}")]
    Timeout { url: String },

    #[error("checkout of '{identity}' at {revision} failed: {message}")]
    CheckoutFailed {
        identity: PackageIdentity,
        revision: String,
        message: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

/// Errors from binary-artifact and prebuilt archive handling.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("checksum of downloaded artifact for '{target}' does not match (expected {expected}, got {actual})")]
    ChecksumMismatch {
        target: String,
        expected: String,
        actual: String,
    },

    #[error("failed to extract artifact for '{target}': {message}")]
    ExtractionFailed { target: String, message: String },

    #[error("artifact at {path} for '{target}' has an unexpected type")]
    UnexpectedArtifactType { target: String, path: PathBuf },
}

/// Signature-envelope verification failures.
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalidSignature")]
    InvalidSignature,

    #[error("untrustedCertificate")]
    UntrustedCertificate,

    #[error("expiredCertificate")]
    ExpiredCertificate,
}

/// Errors from managed-state transitions driven by user operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StateError {
    #[error("dependency '{identity}' is already in edit mode")]
    DependencyAlreadyInEditMode { identity: PackageIdentity },

    #[error("local dependency '{identity}' cannot be edited")]
    LocalDependencyCannotBeEdited { identity: PackageIdentity },

    #[error("dependency '{identity}' has uncommitted changes in its edit directory")]
    UncommittedChangesInEdit { identity: PackageIdentity },

    #[error("edit directory for '{identity}' is missing")]
    MissingEditDirectory { identity: PackageIdentity },

    #[error("no managed dependency named '{identity}'")]
    UnknownDependency { identity: PackageIdentity },

    #[error("workspace at {path} is locked by another process")]
    WorkspaceLocked { path: PathBuf },
}

/// Manifest loading failures surfaced by the loader collaborator.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no manifest found for '{location}' at {revision}")]
    NotFound { location: String, revision: String },

    #[error("manifest of '{location}' is malformed: {message}")]
    Invalid { location: String, message: String },

    #[error("io error reading manifest: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error of every workspace operation.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("io error at {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("graph is invalid: cyclic dependency through product '{product}'")]
    CyclicDependencyDetected { product: String },
}

impl WorkspaceError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        WorkspaceError::Io {
            context: context.into(),
            source,
        }
    }
}
