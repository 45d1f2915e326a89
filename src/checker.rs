//! Post-handshake identity checking
//!
//! Matches a peer certificate's identity against what the caller
//! expected to be talking to. The matching itself is a pure function
//! over extracted [`CertIdentity`] data: SAN DNS entries first, legacy
//! Common Name only when the certificate carries no SAN entry at all,
//! IP literals against SAN IP entries only, and an optional pinned
//! certificate fingerprint on top.
//!
//! Wildcard rules: a bare `*` as the leftmost label matches exactly one
//! non-empty label of the expected host. `*.example.com` matches
//! `a.example.com` but neither `example.com` nor `a.b.example.com`.
//! Partial-label wildcards (`f*.example.com`) are compared literally.

use crate::cert::CertIdentity;
use openssl::x509::X509Ref;
use std::net::IpAddr;

/// What the caller expects the peer's certificate to identify
#[derive(Debug, Clone, Default)]
pub struct IdentityExpectation {
    /// DNS name the peer must present (SAN DNS entry or legacy CN)
    pub expected_host: Option<String>,
    /// IP literal the peer must present as a SAN IP entry
    pub expected_ip: Option<IpAddr>,
    /// SHA-256 digest the whole certificate must hash to
    pub pinned_fingerprint: Option<Vec<u8>>,
    /// Whether a leftmost `*` label may match a host label
    pub allow_wildcards: bool,
}

impl IdentityExpectation {
    /// Expect a DNS hostname, wildcards allowed
    pub fn host(host: impl Into<String>) -> Self {
        IdentityExpectation {
            expected_host: Some(host.into()),
            allow_wildcards: true,
            ..Default::default()
        }
    }

    /// Expect an IP literal
    pub fn ip(addr: IpAddr) -> Self {
        IdentityExpectation {
            expected_ip: Some(addr),
            allow_wildcards: true,
            ..Default::default()
        }
    }

    /// Additionally pin the certificate to a SHA-256 fingerprint
    pub fn pinned(mut self, fingerprint: Vec<u8>) -> Self {
        self.pinned_fingerprint = Some(fingerprint);
        self
    }

    /// Enable or disable wildcard matching
    pub fn wildcards(mut self, allow: bool) -> Self {
        self.allow_wildcards = allow;
        self
    }
}

/// Identity-check failure kinds
///
/// Exactly one of these classifies every failed check; malformed input
/// is classified, never panicked on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    /// The peer presented no certificate at all
    #[error("peer did not present a certificate")]
    NoCertificate,

    /// The certificate carries identities, none of which match
    #[error("peer certificate does not match {expected:?} (certificate offers {found:?})")]
    WrongHost {
        expected: String,
        found: Vec<String>,
    },

    /// The certificate carries no usable identity at all
    #[error("peer certificate carries no usable identity patterns")]
    NoCertPatterns,
}

/// Certificate identity checker
pub struct Checker;

impl Checker {
    /// Check a peer certificate against an expectation.
    ///
    /// `cert` is `None` when the peer presented no certificate (an
    /// anonymous peer under a permissive verify mode).
    pub fn check(
        cert: Option<&X509Ref>,
        expectation: &IdentityExpectation,
    ) -> Result<(), CheckError> {
        let cert = cert.ok_or(CheckError::NoCertificate)?;
        Self::check_identity(&CertIdentity::from_x509(cert), expectation)
    }

    /// Pure matching over extracted identity fields.
    pub fn check_identity(
        identity: &CertIdentity,
        expectation: &IdentityExpectation,
    ) -> Result<(), CheckError> {
        if let Some(expected_ip) = expectation.expected_ip {
            // IP matching uses SAN IP entries only; CN never applies.
            if !identity.ip_addrs.contains(&expected_ip) {
                return Err(CheckError::WrongHost {
                    expected: expected_ip.to_string(),
                    found: identity.ip_addrs.iter().map(|ip| ip.to_string()).collect(),
                });
            }
        } else if let Some(expected_host) = expectation.expected_host.as_deref() {
            Self::check_host(identity, expected_host, expectation.allow_wildcards)?;
        }

        if let Some(pinned) = expectation.pinned_fingerprint.as_deref() {
            if identity.fingerprint != pinned {
                return Err(CheckError::WrongHost {
                    expected: hex(pinned),
                    found: vec![hex(&identity.fingerprint)],
                });
            }
        }

        Ok(())
    }

    fn check_host(
        identity: &CertIdentity,
        expected_host: &str,
        allow_wildcards: bool,
    ) -> Result<(), CheckError> {
        // SAN DNS entries are authoritative. The CN is a legacy fallback
        // consulted only when the certificate has no SAN entry of any
        // type; a SAN with only IP entries still disables it.
        let candidates: Vec<&str> = if !identity.dns_names.is_empty() {
            identity.dns_names.iter().map(|s| s.as_str()).collect()
        } else if !identity.has_san {
            identity.common_name.iter().map(|s| s.as_str()).collect()
        } else {
            Vec::new()
        };

        if candidates.is_empty() {
            return Err(CheckError::NoCertPatterns);
        }

        if candidates
            .iter()
            .any(|c| host_matches(c, expected_host, allow_wildcards))
        {
            Ok(())
        } else {
            Err(CheckError::WrongHost {
                expected: expected_host.to_string(),
                found: candidates.iter().map(|s| s.to_string()).collect(),
            })
        }
    }
}

/// Component-wise, case-insensitive hostname comparison.
///
/// A bare `*` in the candidate's leftmost label matches exactly one
/// non-empty host label; it never spans a label boundary.
fn host_matches(candidate: &str, host: &str, allow_wildcards: bool) -> bool {
    let cand: Vec<&str> = candidate.split('.').collect();
    let host: Vec<&str> = host.split('.').collect();

    if cand.len() != host.len() {
        return false;
    }

    cand.iter().zip(host.iter()).enumerate().all(|(i, (c, h))| {
        if allow_wildcards && i == 0 && *c == "*" {
            !h.is_empty()
        } else {
            c.eq_ignore_ascii_case(h)
        }
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
