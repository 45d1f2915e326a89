//! Blocking TLS session layer over OpenSSL
//!
//! This crate provides the session plumbing that sits between an
//! application and the OpenSSL engine: shared, reusable session
//! contexts, a connection state machine with deadline-bounded blocking
//! I/O, and a post-handshake hostname/identity checker.
//!
//! # Architecture
//!
//! 1. `SessionContext` holds verification policy and trust material and
//!    is shared (by counted reference) across many connections.
//! 2. The context `registry` maps each context's native handle back to
//!    the owning `SessionContext`, so OpenSSL's global verify callback
//!    can recover per-context policy mid-handshake.
//! 3. `Connection` drives one TLS session over one owned `TcpStream`:
//!    handshake, identity check, data transfer, close-notify exchange.
//! 4. `checker` matches the peer certificate's identity (SAN DNS/IP
//!    entries, legacy Common Name) against an expected host or IP.
//!
//! # Examples
//!
//! ## Client
//!
//! ```no_run
//! use tlslayer::{Connection, IdentityExpectation, SessionContext, VerifyMode};
//! use std::net::TcpStream;
//!
//! let ctx = SessionContext::create(None, None, None).unwrap();
//! ctx.load_verify_locations(Some("ca.pem".as_ref()), None).unwrap();
//! ctx.set_verify(VerifyMode::PEER, 9, None).unwrap();
//!
//! let tcp = TcpStream::connect("m2test.local:4433").unwrap();
//! let mut conn = Connection::new(&ctx, tcp)
//!     .with_expectation(IdentityExpectation::host("m2test.local"));
//! conn.connect().unwrap();
//! let mut buf = [0u8; 1024];
//! let n = conn.read(&mut buf).unwrap();
//! # let _ = n;
//! ```
//!
//! ## Server
//!
//! ```no_run
//! use tlslayer::{Connection, SessionContext};
//! use std::net::TcpListener;
//!
//! let ctx = SessionContext::create(None, None, None).unwrap();
//! ctx.load_cert_file("server.pem").unwrap();
//!
//! let listener = TcpListener::bind("0.0.0.0:4433").unwrap();
//! let (tcp, _) = listener.accept().unwrap();
//! let mut conn = Connection::new(&ctx, tcp);
//! conn.accept().unwrap();
//! conn.write(b"hello").unwrap();
//! ```

pub mod cert;
pub mod checker;
pub mod connection;
pub mod context;
pub mod info;
pub mod registry;

pub use cert::CertIdentity;
pub use checker::{CheckError, Checker, IdentityExpectation};
pub use connection::{Connection, ConnectionState, ShutdownKind};
pub use context::{ProtocolVersion, SessionContext, VerifyCallback, VerifyMode};
pub use info::ConnectionInfo;

/// Result type for session-layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Session-layer errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller bug: missing trust source, invalid parameter, operation in
    /// the wrong state. Not retriable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Engine-reported protocol failure during the handshake. Fatal to
    /// the connection; a retry needs a fresh connection.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A deadline-bounded blocking call expired.
    #[error("operation timed out")]
    Timeout,

    /// Post-handshake identity check failed.
    #[error(transparent)]
    Identity(#[from] checker::CheckError),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
