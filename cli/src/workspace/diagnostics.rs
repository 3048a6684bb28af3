//! Structured diagnostic stream threaded through all workspace components.
//!
//! The core never writes to standard streams. Components emit records into
//! a shared sink through a [`DiagnosticsScope`]; child scopes inherit
//! metadata. Concurrent subtasks may emit in any order, so consumers that
//! care about order sort by timestamp, and tests compare sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::workspace::identity::PackageIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// One structured diagnostic record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub package: Option<PackageIdentity>,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Shared collector behind every scope.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSink {
    records: Arc<Mutex<Vec<Diagnostic>>>,
}

impl DiagnosticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_scope(&self) -> DiagnosticsScope {
        DiagnosticsScope {
            sink: self.clone(),
            package: None,
            metadata: BTreeMap::new(),
        }
    }

    /// All records merged by timestamp.
    pub fn records(&self) -> Vec<Diagnostic> {
        let mut records = self.records.lock().unwrap().clone();
        records.sort_by_key(|r| r.timestamp);
        records
    }

    /// Messages at or above the given severity, as an unordered set view.
    pub fn messages_at_least(&self, severity: Severity) -> Vec<String> {
        let mut messages: Vec<String> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.severity >= severity)
            .map(|r| r.message.clone())
            .collect();
        messages.sort();
        messages
    }

    pub fn has_errors(&self) -> bool {
        self.records
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.severity == Severity::Error)
    }

    fn push(&self, record: Diagnostic) {
        self.records.lock().unwrap().push(record);
    }
}

/// A handle for emitting diagnostics with inherited metadata.
#[derive(Debug, Clone)]
pub struct DiagnosticsScope {
    sink: DiagnosticsSink,
    package: Option<PackageIdentity>,
    metadata: BTreeMap<String, String>,
}

impl DiagnosticsScope {
    /// A child scope attributed to a package; metadata is inherited.
    pub fn package_scope(&self, identity: PackageIdentity) -> DiagnosticsScope {
        DiagnosticsScope {
            sink: self.sink.clone(),
            package: Some(identity),
            metadata: self.metadata.clone(),
        }
    }

    /// A child scope with one additional metadata entry.
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.insert(key.into(), value.into());
        DiagnosticsScope {
            sink: self.sink.clone(),
            package: self.package.clone(),
            metadata,
        }
    }

    pub fn emit(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Debug => log::debug!("{}", message),
            Severity::Info => log::info!("{}", message),
            Severity::Warning => log::warn!("{}", message),
            Severity::Error => log::error!("{}", message),
        }
        self.sink.push(Diagnostic {
            severity,
            message,
            package: self.package.clone(),
            metadata: self.metadata.clone(),
            timestamp: Utc::now(),
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(Severity::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(Severity::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(Severity::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(Severity::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_inherit_metadata() {
        let sink = DiagnosticsSink::new();
        let root = sink.root_scope().with_metadata("operation", "resolve");
        let child = root.package_scope(PackageIdentity::plain("foo"));
        child.warning("something happened");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metadata.get("operation").unwrap(), "resolve");
        assert_eq!(
            records[0].package.as_ref().unwrap(),
            &PackageIdentity::plain("foo")
        );
    }

    #[test]
    fn severity_filter_is_inclusive() {
        let sink = DiagnosticsSink::new();
        let scope = sink.root_scope();
        scope.debug("d");
        scope.warning("w");
        scope.error("e");

        assert_eq!(sink.messages_at_least(Severity::Warning), vec!["e", "w"]);
        assert!(sink.has_errors());
    }
}
