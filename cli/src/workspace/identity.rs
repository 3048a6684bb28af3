//! Canonical package identities.
//!
//! Every store in the workspace is keyed by a [`PackageIdentity`]: a
//! lowercased canonical form derived from however the dependency was
//! spelled (HTTPS URL, SSH form, local path, registry identifier). All
//! spellings of the same package collapse to one identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// The deduplication key for a package across all its location spellings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageIdentity(String);

impl PackageIdentity {
    /// An identity taken verbatim from a known-canonical name.
    pub fn plain(name: &str) -> Self {
        PackageIdentity(name.to_lowercase())
    }

    /// Derive the identity for a dependency location. Total: every string
    /// yields some identity.
    pub fn for_location(location: &str) -> Self {
        let location = location.trim();

        // Absolute file-system paths are keyed by their basename. Distinct
        // paths with the same basename intentionally share an identity; the
        // workspace resolves that conflict by nearest-root preference.
        if location.starts_with('/') || is_windows_absolute(location) {
            let basename = Path::new(location)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| location.to_string());
            return PackageIdentity(strip_git_suffix(&basename).to_lowercase());
        }

        // Registry identifiers keep their dotted scope.name form.
        if is_registry_identity(location) {
            return PackageIdentity(location.to_lowercase());
        }

        let mut rest = location.to_string();

        // `git@host:path` becomes `host/path`.
        if let Some(stripped) = rest.strip_prefix("git@") {
            rest = stripped.replacen(':', "/", 1);
        }

        // Strip any scheme.
        if let Some(idx) = rest.find("://") {
            rest = rest[idx + 3..].to_string();
        }

        // Drop credentials, query and fragment.
        if let Some(idx) = rest.find('@') {
            // user@host/path forms; keep everything after the credentials
            let (head, tail) = rest.split_at(idx);
            if !head.contains('/') {
                rest = tail[1..].to_string();
            }
        }
        if let Some(idx) = rest.find(['?', '#']) {
            rest.truncate(idx);
        }

        while rest.contains("//") {
            rest = rest.replace("//", "/");
        }
        let rest = rest.trim_end_matches('/');
        let rest = strip_git_suffix(rest);

        let stem = rest.rsplit('/').next().unwrap_or(rest);
        PackageIdentity(stem.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PackageIdentity {
    fn from(value: &str) -> Self {
        PackageIdentity::for_location(value)
    }
}

fn strip_git_suffix(s: &str) -> &str {
    if s.len() >= 4 && s[s.len() - 4..].eq_ignore_ascii_case(".git") {
        &s[..s.len() - 4]
    } else {
        s
    }
}

fn is_windows_absolute(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() > 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Registry ids are `scope.name`: a single dotted segment pair with no
/// path separators or scheme.
fn is_registry_identity(s: &str) -> bool {
    if s.contains('/') || s.contains(':') || s.contains('@') {
        return false;
    }
    let mut parts = s.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scope), Some(name), None) => {
            !scope.is_empty()
                && !name.is_empty()
                && scope.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_spellings_collapse() {
        let spellings = [
            "https://github.com/apple/swift-syntax",
            "https://github.com/apple/swift-syntax.git",
            "http://github.com/apple/swift-syntax",
            "git@github.com:apple/swift-syntax.git",
            "https://GitHub.com/Apple/Swift-Syntax",
            "https://github.com/apple//swift-syntax/",
            "https://github.com/apple/swift-syntax?ref=main",
        ];
        let identities: std::collections::BTreeSet<_> = spellings
            .iter()
            .map(|s| PackageIdentity::for_location(s))
            .collect();
        assert_eq!(identities.len(), 1);
        assert_eq!(
            identities.into_iter().next().unwrap().as_str(),
            "swift-syntax"
        );
    }

    #[test]
    fn paths_key_by_basename() {
        let a = PackageIdentity::for_location("/home/one/Bar");
        let b = PackageIdentity::for_location("/srv/other/bar");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "bar");
    }

    #[test]
    fn registry_ids_keep_dotted_form() {
        let id = PackageIdentity::for_location("mona.LinkedList");
        assert_eq!(id.as_str(), "mona.linkedlist");
    }

    #[test]
    fn fragment_and_query_are_dropped() {
        let id = PackageIdentity::for_location("https://example.com/a/b.git#frag");
        assert_eq!(id.as_str(), "b");
    }

    #[test]
    fn derivation_is_total() {
        for s in ["", "weird", "::::", "a/b/c", "C:\\pkgs\\Thing"] {
            let _ = PackageIdentity::for_location(s);
        }
    }
}
