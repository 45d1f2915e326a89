//! Certificate identity extraction
//!
//! Pulls the identity-bearing fields out of an X.509 certificate so the
//! checker can operate on plain data: Common Name, subjectAltName DNS
//! entries, subjectAltName IP entries, and a deterministic digest of the
//! whole certificate for fingerprint pinning.

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::x509::X509Ref;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Identity fields of a single certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertIdentity {
    /// Subject Common Name, if the subject carries one
    pub common_name: Option<String>,
    /// subjectAltName DNS entries, in certificate order
    pub dns_names: Vec<String>,
    /// subjectAltName IP entries
    pub ip_addrs: Vec<IpAddr>,
    /// SHA-256 digest of the DER-encoded certificate
    pub fingerprint: Vec<u8>,
    /// Whether the certificate carries a subjectAltName extension with
    /// at least one entry of any type
    pub has_san: bool,
}

impl CertIdentity {
    /// Extract identity fields from a certificate
    pub fn from_x509(cert: &X509Ref) -> Self {
        let common_name = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|s| s.to_string());

        let mut dns_names = Vec::new();
        let mut ip_addrs = Vec::new();
        let mut has_san = false;

        if let Some(san) = cert.subject_alt_names() {
            for name in san {
                has_san = true;
                if let Some(dns) = name.dnsname() {
                    dns_names.push(dns.to_string());
                } else if let Some(ip) = name.ipaddress() {
                    if let Some(addr) = decode_ip(ip) {
                        ip_addrs.push(addr);
                    }
                }
            }
        }

        let fingerprint = cert
            .digest(MessageDigest::sha256())
            .map(|d| d.to_vec())
            .unwrap_or_default();

        CertIdentity {
            common_name,
            dns_names,
            ip_addrs,
            fingerprint,
            has_san,
        }
    }
}

/// Decode a subjectAltName iPAddress octet string (4 or 16 bytes)
fn decode_ip(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
