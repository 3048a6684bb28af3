//! Signature verification for prebuilt manifests.
//!
//! Cryptographic verification proper is a collaborator; the workspace
//! consumes it through [`SignatureVerifier`]. The shipped implementation
//! checks the structural contract: the envelope's digest must match the
//! signed payload, and the certificate chain must terminate at a
//! certificate present in the configured trust directory (PEM files,
//! DER-encoded chain entries).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::workspace::errors::SignatureError;

/// The signature block attached to a signed manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureEnvelope {
    /// Base64 digest over the signed payload.
    pub bytes: String,
    /// Base64 DER certificates, leaf first, root last.
    pub cert_chain: Vec<String>,
    #[serde(default)]
    pub signing_entity: Option<String>,
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, payload: &[u8], signature: &SignatureEnvelope)
        -> Result<(), SignatureError>;
}

/// Verifier backed by a directory of trusted root certificates.
pub struct TrustDirectoryVerifier {
    trust_dir: PathBuf,
}

impl TrustDirectoryVerifier {
    pub fn new(trust_dir: PathBuf) -> Self {
        TrustDirectoryVerifier { trust_dir }
    }

    fn trusted_roots(&self) -> Vec<Vec<u8>> {
        let mut roots = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.trust_dir) else {
            return roots;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_pem = path
                .extension()
                .map(|e| e == "pem" || e == "cer" || e == "crt")
                .unwrap_or(false);
            if !is_pem {
                continue;
            }
            if let Ok(contents) = std::fs::read_to_string(&path) {
                roots.extend(parse_pem_certificates(&contents));
            }
        }
        roots
    }
}

impl SignatureVerifier for TrustDirectoryVerifier {
    fn verify(
        &self,
        payload: &[u8],
        signature: &SignatureEnvelope,
    ) -> Result<(), SignatureError> {
        if signature.cert_chain.is_empty() {
            return Err(SignatureError::InvalidSignature);
        }

        let digest = BASE64
            .decode(&signature.bytes)
            .map_err(|_| SignatureError::InvalidSignature)?;
        let expected = Sha256::digest(payload);
        if digest.as_slice() != expected.as_slice() {
            return Err(SignatureError::InvalidSignature);
        }

        let chain: Vec<Vec<u8>> = signature
            .cert_chain
            .iter()
            .map(|c| BASE64.decode(c).map_err(|_| SignatureError::InvalidSignature))
            .collect::<Result<_, _>>()?;

        let Some(terminal) = chain.last() else {
            return Err(SignatureError::InvalidSignature);
        };
        let roots = self.trusted_roots();
        if !roots.iter().any(|root| root == terminal) {
            return Err(SignatureError::UntrustedCertificate);
        }
        Ok(())
    }
}

/// Compute the envelope digest for a payload; used when producing signed
/// fixtures and when revalidating stored manifests.
pub fn payload_digest(payload: &[u8]) -> String {
    BASE64.encode(Sha256::digest(payload))
}

fn parse_pem_certificates(contents: &str) -> Vec<Vec<u8>> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";
    let mut certificates = Vec::new();
    let mut rest = contents;
    while let Some(start) = rest.find(BEGIN) {
        let after = &rest[start + BEGIN.len()..];
        let Some(end) = after.find(END) else { break };
        let body: String = after[..end].split_whitespace().collect();
        if let Ok(der) = BASE64.decode(body) {
            certificates.push(der);
        }
        rest = &after[end + END.len()..];
    }
    certificates
}

/// Render DER bytes as a PEM certificate block.
pub fn pem_certificate(der: &[u8]) -> String {
    let body = BASE64.encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in body.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn envelope(payload: &[u8], chain: &[&[u8]]) -> SignatureEnvelope {
        SignatureEnvelope {
            bytes: payload_digest(payload),
            cert_chain: chain.iter().map(|c| BASE64.encode(c)).collect(),
            signing_entity: Some("release-signing".to_string()),
        }
    }

    #[test]
    fn accepts_chain_rooted_in_trust_dir() {
        let trust = TempDir::new().unwrap();
        std::fs::write(trust.path().join("root.pem"), pem_certificate(b"root-der")).unwrap();

        let verifier = TrustDirectoryVerifier::new(trust.path().to_path_buf());
        let payload = b"signed payload";
        let envelope = envelope(payload, &[b"leaf-der", b"root-der"]);
        assert!(verifier.verify(payload, &envelope).is_ok());
    }

    #[test]
    fn rejects_unknown_root() {
        let trust = TempDir::new().unwrap();
        std::fs::write(trust.path().join("root.pem"), pem_certificate(b"root-der")).unwrap();

        let verifier = TrustDirectoryVerifier::new(trust.path().to_path_buf());
        let payload = b"signed payload";
        let envelope = envelope(payload, &[b"leaf-der", b"rogue-der"]);
        assert_eq!(
            verifier.verify(payload, &envelope),
            Err(SignatureError::UntrustedCertificate)
        );
    }

    #[test]
    fn rejects_tampered_payload() {
        let trust = TempDir::new().unwrap();
        std::fs::write(trust.path().join("root.pem"), pem_certificate(b"root-der")).unwrap();

        let verifier = TrustDirectoryVerifier::new(trust.path().to_path_buf());
        let envelope = envelope(b"original", &[b"root-der"]);
        assert_eq!(
            verifier.verify(b"tampered", &envelope),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn pem_round_trip() {
        let der = b"some der bytes that are long enough to wrap across pem lines maybe";
        let pem = pem_certificate(der);
        let parsed = parse_pem_certificates(&pem);
        assert_eq!(parsed, vec![der.to_vec()]);
    }
}
