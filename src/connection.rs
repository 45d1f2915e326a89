//! TLS connection state machine
//!
//! One [`Connection`] binds one owned `TcpStream` to one shared
//! [`SessionContext`] and drives it through
//! `New → Handshaking → Established → ShuttingDown → Closed`.
//!
//! Blocking semantics: `connect`/`accept` ride the socket's read/write
//! timeouts for the handshake phase; `read`/`write` poll the descriptor
//! first so a data-phase timeout abandons the one call without touching
//! connection state. The close-notify exchange on shutdown is best
//! effort and degrades to an abrupt close rather than an error.

use crate::checker::{Checker, IdentityExpectation};
use crate::context::SessionContext;
use crate::info::ConnectionInfo;
use crate::{Error, Result};
use openssl::ssl::{ErrorCode, HandshakeError, ShutdownResult, Ssl, SslRef, SslStream};
use openssl::x509::{X509Ref, X509VerifyResult, X509};
use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, handshake not yet driven
    New,
    /// Handshake in progress
    Handshaking,
    /// Handshake and identity check complete; data may flow
    Established,
    /// Close-notify exchange in progress (locally or peer-initiated)
    ShuttingDown,
    /// Session over; the transport has been released
    Closed,
}

/// How a shutdown went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// Close-notify exchange completed within the deadline
    Clean,
    /// Close-notify failed or timed out; the transport was torn down
    /// abruptly. Not an error: the application exchange is already done.
    Abrupt,
}

// Cap on transparent WANT_READ/WANT_WRITE retries (peer-initiated
// renegotiation); a peer that never completes one must not block forever.
const MAX_RENEGOTIATION_RETRIES: usize = 8;

enum Transport {
    Idle(TcpStream),
    Active(SslStream<TcpStream>),
    Gone,
}

enum Role {
    Client,
    Server,
}

/// One TLS session over one owned byte stream
pub struct Connection {
    context: SessionContext,
    transport: Transport,
    state: ConnectionState,
    timeout: Option<Duration>,
    expectation: Option<IdentityExpectation>,
    peer_chain: Vec<X509>,
    info: Option<ConnectionInfo>,
}

impl Connection {
    /// Bind a transport stream to a context. Transport ownership moves
    /// to the connection; the context is shared by counted reference.
    pub fn new(context: &SessionContext, transport: TcpStream) -> Connection {
        Connection {
            context: context.clone(),
            transport: Transport::Idle(transport),
            state: ConnectionState::New,
            timeout: None,
            expectation: None,
            peer_chain: Vec::new(),
            info: None,
        }
    }

    /// Require the peer's certificate to match `expectation` after the
    /// handshake. A mismatch closes the connection before the caller
    /// ever sees it established.
    pub fn with_expectation(mut self, expectation: IdentityExpectation) -> Connection {
        self.expectation = Some(expectation);
        self
    }

    /// Deadline applied to every blocking operation. `None` blocks
    /// indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Peer certificate chain captured at handshake completion, leaf
    /// first. Empty before the handshake or when the peer sent nothing.
    pub fn peer_certificate_chain(&self) -> &[X509] {
        &self.peer_chain
    }

    /// The peer's leaf certificate
    pub fn peer_certificate(&self) -> Option<&X509Ref> {
        self.peer_chain.first().map(|c| &**c)
    }

    /// Negotiated protocol version string, e.g. `"TLSv1.3"`
    pub fn negotiated_version(&self) -> Option<&str> {
        self.info.as_ref().map(|i| i.version.as_str())
    }

    /// Post-handshake session snapshot
    pub fn info(&self) -> Option<&ConnectionInfo> {
        self.info.as_ref()
    }

    /// Drive the client-side handshake to completion.
    pub fn connect(&mut self) -> Result<()> {
        self.handshake(Role::Client)
    }

    /// Drive the server-side handshake to completion.
    pub fn accept(&mut self) -> Result<()> {
        self.handshake(Role::Server)
    }

    fn handshake(&mut self, role: Role) -> Result<()> {
        if self.state != ConnectionState::New {
            return Err(Error::Configuration(
                "handshake already driven on this connection".into(),
            ));
        }
        let tcp = match std::mem::replace(&mut self.transport, Transport::Gone) {
            Transport::Idle(tcp) => tcp,
            _ => {
                return Err(Error::Configuration(
                    "connection transport already consumed".into(),
                ))
            }
        };

        self.state = ConnectionState::Handshaking;
        match self.drive_handshake(role, tcp) {
            Ok(stream) => {
                self.peer_chain = collect_peer_chain(stream.ssl());
                self.info = Some(ConnectionInfo::from_ssl(stream.ssl()));
                self.transport = Transport::Active(stream);
                self.state = ConnectionState::Established;
                log::debug!(
                    "handshake complete: {} {}",
                    self.info.as_ref().map(|i| i.version.as_str()).unwrap_or("?"),
                    self.info.as_ref().map(|i| i.cipher.as_str()).unwrap_or("?"),
                );
            }
            Err(e) => {
                // Handshake failure is fatal to this connection.
                self.state = ConnectionState::Closed;
                return Err(e);
            }
        }

        if let Some(expectation) = self.expectation.clone() {
            if let Err(e) = Checker::check(self.peer_certificate(), &expectation) {
                log::warn!("peer identity check failed: {}", e);
                self.abort();
                return Err(Error::Identity(e));
            }
        }
        Ok(())
    }

    fn drive_handshake(&mut self, role: Role, tcp: TcpStream) -> Result<SslStream<TcpStream>> {
        let ctx = self.context.frozen_context()?;
        let mut ssl = Ssl::new(&ctx)?;

        if let Role::Client = role {
            // SNI from the expected hostname, when there is one.
            if let Some(host) = self
                .expectation
                .as_ref()
                .and_then(|e| e.expected_host.as_deref())
            {
                ssl.set_hostname(host)?;
            }
        }

        // The handshake deadline rides on the socket timeouts; cleared
        // again once the session is up.
        tcp.set_read_timeout(self.timeout)?;
        tcp.set_write_timeout(self.timeout)?;

        let result = match role {
            Role::Client => ssl.connect(tcp),
            Role::Server => ssl.accept(tcp),
        };

        match result {
            Ok(stream) => {
                stream.get_ref().set_read_timeout(None)?;
                stream.get_ref().set_write_timeout(None)?;
                Ok(stream)
            }
            Err(HandshakeError::SetupFailure(stack)) => Err(Error::OpenSsl(stack)),
            Err(HandshakeError::WouldBlock(_)) => Err(Error::Timeout),
            Err(HandshakeError::Failure(mid)) => {
                if let Some(io) = mid.error().io_error() {
                    if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                        return Err(Error::Timeout);
                    }
                }
                let verify = mid.ssl().verify_result();
                let msg = if verify != X509VerifyResult::OK {
                    format!("{} (certificate verify: {})", mid.error(), verify.error_string())
                } else {
                    mid.error().to_string()
                };
                Err(Error::Handshake(msg))
            }
        }
    }

    /// Read application data. Valid only in `Established`; blocks until
    /// at least one byte arrives, the peer closes (`Ok(0)`), or the
    /// timeout expires. A timeout abandons this call only.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_established()?;
        if !self.poll_transport(true)? {
            return Err(Error::Timeout);
        }

        for _ in 0..MAX_RENEGOTIATION_RETRIES {
            let stream = match &mut self.transport {
                Transport::Active(stream) => stream,
                _ => return Err(Error::Configuration("connection transport gone".into())),
            };
            match stream.ssl_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) => match e.code() {
                    ErrorCode::ZERO_RETURN => {
                        // Peer sent close-notify.
                        self.state = ConnectionState::ShuttingDown;
                        return Ok(0);
                    }
                    // Peer-initiated renegotiation; retry transparently.
                    ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => continue,
                    _ => return self.fail_stream(&e),
                },
            }
        }
        Err(Error::Handshake(
            "renegotiation did not complete within the retry limit".into(),
        ))
    }

    /// Write application data. Valid only in `Established`; returns the
    /// number of bytes accepted by the engine.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.ensure_established()?;
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.poll_transport(false)? {
            return Err(Error::Timeout);
        }

        for _ in 0..MAX_RENEGOTIATION_RETRIES {
            let stream = match &mut self.transport {
                Transport::Active(stream) => stream,
                _ => return Err(Error::Configuration("connection transport gone".into())),
            };
            match stream.ssl_write(buf) {
                Ok(n) => return Ok(n),
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => continue,
                    _ => return self.fail_stream(&e),
                },
            }
        }
        Err(Error::Handshake(
            "renegotiation did not complete within the retry limit".into(),
        ))
    }

    /// Perform the close-notify exchange best-effort within the
    /// configured timeout, then release the transport. Idempotent and
    /// never fails: a failed clean shutdown degrades to an abrupt close.
    pub fn shutdown(&mut self) -> ShutdownKind {
        let kind = match std::mem::replace(&mut self.transport, Transport::Gone) {
            Transport::Active(mut stream) => {
                self.state = ConnectionState::ShuttingDown;
                let kind = close_notify(&mut stream, self.timeout);
                let _ = stream.get_ref().shutdown(Shutdown::Both);
                kind
            }
            Transport::Idle(tcp) => {
                let _ = tcp.shutdown(Shutdown::Both);
                ShutdownKind::Clean
            }
            Transport::Gone => ShutdownKind::Clean,
        };
        if kind == ShutdownKind::Abrupt {
            log::warn!("TLS shutdown degraded to abrupt close");
        }
        self.state = ConnectionState::Closed;
        kind
    }

    /// Alias for [`shutdown`](Connection::shutdown) discarding the
    /// outcome; safe to call any number of times.
    pub fn close(&mut self) {
        let _ = self.shutdown();
    }

    fn ensure_established(&self) -> Result<()> {
        if self.state != ConnectionState::Established {
            return Err(Error::Configuration(format!(
                "connection is not established (state: {:?})",
                self.state
            )));
        }
        Ok(())
    }

    fn poll_transport(&mut self, want_read: bool) -> Result<bool> {
        let stream = match &self.transport {
            Transport::Active(stream) => stream,
            _ => return Err(Error::Configuration("connection transport gone".into())),
        };
        poll_ready(stream, want_read, self.timeout)
    }

    /// Map a fatal stream error; timeouts abandon the call without
    /// corrupting connection state, anything else closes the session.
    fn fail_stream(&mut self, e: &openssl::ssl::Error) -> Result<usize> {
        if let Some(io) = e.io_error() {
            if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                return Err(Error::Timeout);
            }
        }
        self.abort();
        if let Some(stack) = e.ssl_error() {
            return Err(Error::OpenSsl(stack.clone()));
        }
        match e.io_error() {
            Some(io) => Err(Error::Io(std::io::Error::new(io.kind(), io.to_string()))),
            None => Err(Error::Handshake(e.to_string())),
        }
    }

    /// Abrupt teardown: no close-notify wait, transport released.
    fn abort(&mut self) {
        if let Transport::Active(mut stream) = std::mem::replace(&mut self.transport, Transport::Gone)
        {
            let _ = stream.get_ref().set_read_timeout(Some(Duration::from_millis(50)));
            let _ = stream.shutdown();
            let _ = stream.get_ref().shutdown(Shutdown::Both);
        }
        self.state = ConnectionState::Closed;
    }
}

/// Close-notify exchange within the deadline: send ours, then wait for
/// the peer's.
fn close_notify(stream: &mut SslStream<TcpStream>, timeout: Option<Duration>) -> ShutdownKind {
    if stream.get_ref().set_read_timeout(timeout).is_err()
        || stream.get_ref().set_write_timeout(timeout).is_err()
    {
        return ShutdownKind::Abrupt;
    }
    match stream.shutdown() {
        Ok(ShutdownResult::Received) => ShutdownKind::Clean,
        Ok(ShutdownResult::Sent) => match stream.shutdown() {
            Ok(_) => ShutdownKind::Clean,
            Err(_) => ShutdownKind::Abrupt,
        },
        Err(_) => ShutdownKind::Abrupt,
    }
}

/// Readiness wait on the raw descriptor, short-circuiting on data the
/// engine has already buffered.
fn poll_ready(
    stream: &SslStream<TcpStream>,
    want_read: bool,
    timeout: Option<Duration>,
) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    if want_read && stream.ssl().pending() > 0 {
        return Ok(true);
    }

    let mut pfd = pollfd {
        fd: stream.get_ref().as_raw_fd(),
        events: if want_read { POLLIN } else { POLLOUT },
        revents: 0,
    };

    let timeout_ms = timeout.map(|d| d.as_millis() as i32).unwrap_or(-1);

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    Ok(result > 0)
}

/// Peer chain as captured at handshake completion, leaf first, with the
/// engine's duplicate leaf entry (client side) folded away.
fn collect_peer_chain(ssl: &SslRef) -> Vec<X509> {
    let mut chain = Vec::new();
    if let Some(leaf) = ssl.peer_certificate() {
        chain.push(leaf);
    }
    if let Some(stack) = ssl.peer_cert_chain() {
        for cert in stack {
            let dup = chain.first().map_or(false, |leaf: &X509| {
                match (leaf.to_der(), cert.to_der()) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => false,
                }
            });
            if !dup {
                chain.push(cert.to_owned());
            }
        }
    }
    chain
}
