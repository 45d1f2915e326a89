//! Post-handshake session introspection
//!
//! A [`ConnectionInfo`] is a snapshot of the negotiated session taken
//! when the handshake completes: protocol version, cipher suite, SNI
//! name, session reuse, and the identity fields of each certificate in
//! the peer chain.

use crate::cert::CertIdentity;
use openssl::ssl::{NameType, SslRef};

/// Negotiated-session snapshot
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Negotiated protocol version (e.g. "TLSv1.3")
    pub version: String,

    /// Negotiated cipher suite
    pub cipher: String,

    /// SNI servername, where one was sent
    pub servername: Option<String>,

    /// Whether the session was resumed
    pub session_reused: bool,

    /// Identity fields per peer-chain certificate, leaf first
    pub peer_identities: Vec<CertIdentity>,
}

impl ConnectionInfo {
    /// Snapshot a completed session
    pub fn from_ssl(ssl: &SslRef) -> Self {
        let cipher = ssl
            .current_cipher()
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "<undef>".to_string());

        let mut peer_identities = Vec::new();
        if let Some(leaf) = ssl.peer_certificate() {
            peer_identities.push(CertIdentity::from_x509(&leaf));
        }
        if let Some(chain) = ssl.peer_cert_chain() {
            for cert in chain {
                let id = CertIdentity::from_x509(cert);
                if peer_identities.first() != Some(&id) {
                    peer_identities.push(id);
                }
            }
        }

        ConnectionInfo {
            version: ssl.version_str().to_string(),
            cipher,
            servername: ssl.servername(NameType::HOST_NAME).map(|s| s.to_string()),
            session_reused: ssl.session_reused(),
            peer_identities,
        }
    }

    /// Leaf certificate identity, when the peer presented one
    pub fn peer_identity(&self) -> Option<&CertIdentity> {
        self.peer_identities.first()
    }
}
