//! Session context configuration
//!
//! A [`SessionContext`] aggregates the trust store, verification policy,
//! protocol-version bounds, cipher policy and optional local certificate
//! for any number of connections. Contexts follow a configure-then-freeze
//! contract: all configuration happens up front, and creating the first
//! connection freezes the context into an immutable engine context that
//! every connection then shares by counted reference. Configuration
//! calls after the freeze fail with a configuration error instead of
//! racing live handshakes.

use crate::registry;
use crate::{Error, Result};
use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::ssl::{
    SslContext, SslContextBuilder, SslFiletype, SslMethod, SslVerifyMode, SslVersion,
};
use openssl::x509::store::{X509Lookup, X509Store};
use openssl::x509::{X509Ref, X509StoreContext, X509StoreContextRef, X509};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// SSL 3.0 (deprecated, rarely used)
    Ssl3,
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl ProtocolVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            ProtocolVersion::Ssl3 => SslVersion::SSL3,
            ProtocolVersion::Tls10 => SslVersion::TLS1,
            ProtocolVersion::Tls11 => SslVersion::TLS1_1,
            ProtocolVersion::Tls12 => SslVersion::TLS1_2,
            ProtocolVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::Ssl3 => "SSLv3",
            ProtocolVersion::Tls10 => "TLSv1.0",
            ProtocolVersion::Tls11 => "TLSv1.1",
            ProtocolVersion::Tls12 => "TLSv1.2",
            ProtocolVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    /// Parse a protocol version name (case-insensitive)
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SSLV3" | "SSL3" => Ok(ProtocolVersion::Ssl3),
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(ProtocolVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(ProtocolVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(ProtocolVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(ProtocolVersion::Tls13),
            _ => Err(Error::Configuration(format!(
                "invalid protocol version: {}",
                s
            ))),
        }
    }
}

/// Peer verification mode (combinable flags)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerifyMode {
    peer: bool,
    fail_if_no_peer_cert: bool,
    client_once: bool,
}

impl VerifyMode {
    /// Don't verify the peer certificate
    pub const NONE: VerifyMode = VerifyMode {
        peer: false,
        fail_if_no_peer_cert: false,
        client_once: false,
    };

    /// Verify the peer certificate when one is presented
    pub const PEER: VerifyMode = VerifyMode {
        peer: true,
        fail_if_no_peer_cert: false,
        client_once: false,
    };

    /// Additionally fail the handshake when the peer presents no
    /// certificate (server-side)
    pub fn fail_if_no_peer_cert(mut self) -> Self {
        self.fail_if_no_peer_cert = true;
        self
    }

    /// Only request a client certificate on the initial handshake
    pub fn client_once(mut self) -> Self {
        self.client_once = true;
        self
    }

    /// Whether this mode requests peer verification at all
    pub fn requests_peer(&self) -> bool {
        self.peer
    }

    fn to_openssl(self) -> SslVerifyMode {
        if !self.peer {
            return SslVerifyMode::NONE;
        }
        let mut mode = SslVerifyMode::PEER;
        if self.fail_if_no_peer_cert {
            mode |= SslVerifyMode::FAIL_IF_NO_PEER_CERT;
        }
        if self.client_once {
            mode |= SslVerifyMode::CLIENT_ONCE;
        }
        mode
    }
}

/// Custom per-certificate verification predicate.
///
/// Invoked once per certificate in the peer chain with the certificate,
/// the engine's default verdict, and the chain depth; its return value
/// overrides the engine's accept/reject decision.
pub type VerifyCallback = dyn Fn(Option<&X509Ref>, bool, u32) -> bool + Send + Sync;

// Handles are never reused: a monotonic counter, not the native pointer,
// so a stale handle can only miss in the registry.
static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(1);

fn handle_index() -> std::result::Result<openssl::ex_data::Index<SslContext, usize>, ErrorStack> {
    static INDEX: OnceLock<openssl::ex_data::Index<SslContext, usize>> = OnceLock::new();
    if let Some(idx) = INDEX.get() {
        return Ok(*idx);
    }
    let idx = SslContext::new_ex_index::<usize>()?;
    Ok(*INDEX.get_or_init(|| idx))
}

enum CtxState {
    Building(SslContextBuilder),
    Frozen(SslContext),
    Closed,
}

pub(crate) struct ContextInner {
    handle: usize,
    state: Mutex<CtxState>,
    verify_mode: Mutex<VerifyMode>,
    verify_depth: AtomicU32,
    verify_callback: Mutex<Option<Arc<VerifyCallback>>>,
    closed: AtomicBool,
}

impl ContextInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run the configured predicate for one certificate in the peer
    /// chain. Called from the registry-routed engine callback.
    fn invoke_verify(&self, preverify_ok: bool, x509_ctx: &X509StoreContextRef) -> bool {
        let callback = { self.verify_callback.lock().unwrap().clone() };
        match callback {
            Some(cb) => cb(
                x509_ctx.current_cert(),
                preverify_ok,
                x509_ctx.error_depth() as u32,
            ),
            None => preverify_ok,
        }
    }

    /// Freeze the context on first use and hand out a shared reference
    /// to the native context. Connections keep the native context alive
    /// through this reference even after `close()`.
    pub(crate) fn frozen_context(&self) -> Result<SslContext> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            CtxState::Frozen(ctx) => Ok(ctx.clone()),
            CtxState::Closed => Err(Error::Configuration("session context is closed".into())),
            CtxState::Building(_) => {
                let CtxState::Building(builder) = std::mem::replace(&mut *state, CtxState::Closed)
                else {
                    unreachable!()
                };
                let ctx = builder.build();
                *state = CtxState::Frozen(ctx.clone());
                log::debug!("session context {} frozen", self.handle);
                Ok(ctx)
            }
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // Deregister before the native context is released below.
        registry::deregister(self.handle);
    }
}

/// Shared per-listener/per-client TLS configuration.
///
/// Cloning is cheap and shares the same underlying context; the native
/// resources are released when the last clone and the last connection
/// created from it have both gone away.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<ContextInner>,
}

impl SessionContext {
    /// Create a context and register it in the process-wide registry.
    ///
    /// `min`/`max` bound the negotiable protocol version; `cipher_policy`
    /// is an OpenSSL cipher-list string. Verification defaults to
    /// [`VerifyMode::NONE`].
    pub fn create(
        min: Option<ProtocolVersion>,
        max: Option<ProtocolVersion>,
        cipher_policy: Option<&str>,
    ) -> Result<SessionContext> {
        let mut builder = SslContextBuilder::new(SslMethod::tls())?;
        builder.set_min_proto_version(min.map(|v| v.to_openssl_version()))?;
        builder.set_max_proto_version(max.map(|v| v.to_openssl_version()))?;
        if let Some(ciphers) = cipher_policy {
            builder.set_cipher_list(ciphers)?;
        }
        builder.set_verify(SslVerifyMode::NONE);

        let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        builder.set_ex_data(handle_index()?, handle);

        let inner = Arc::new(ContextInner {
            handle,
            state: Mutex::new(CtxState::Building(builder)),
            verify_mode: Mutex::new(VerifyMode::NONE),
            verify_depth: AtomicU32::new(0),
            verify_callback: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        registry::register(handle, &inner);
        Ok(SessionContext { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> SessionContext {
        SessionContext { inner }
    }

    fn inner_ref(&self) -> &ContextInner {
        &self.inner
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    /// The native handle this context is registered under
    pub fn handle(&self) -> usize {
        self.inner.handle
    }

    fn with_builder<R>(&self, f: impl FnOnce(&mut SslContextBuilder) -> Result<R>) -> Result<R> {
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            CtxState::Building(builder) => f(builder),
            CtxState::Frozen(_) => Err(Error::Configuration(
                "session context is frozen; configure before creating connections".into(),
            )),
            CtxState::Closed => Err(Error::Configuration("session context is closed".into())),
        }
    }

    /// Load trusted CAs from a bundle file, a hashed directory, or both.
    ///
    /// At least one source is mandatory: peer verification without any
    /// trust anchor can only ever fail.
    pub fn load_verify_locations(
        &self,
        ca_file: Option<&Path>,
        ca_dir: Option<&Path>,
    ) -> Result<()> {
        if ca_file.is_none() && ca_dir.is_none() {
            return Err(Error::Configuration(
                "load_verify_locations requires a CA file or a CA directory".into(),
            ));
        }
        self.with_builder(|builder| {
            if let Some(file) = ca_file {
                builder.set_ca_file(file)?;
            }
            if let Some(dir) = ca_dir {
                let dir = dir.to_str().ok_or_else(|| {
                    Error::Configuration("CA directory path is not valid UTF-8".into())
                })?;
                let lookup = builder.cert_store_mut().add_lookup(X509Lookup::hash_dir())?;
                lookup.add_dir(dir, SslFiletype::PEM)?;
            }
            Ok(())
        })
    }

    /// Install an explicit, pre-built trust store.
    pub fn load_trusted_store(&self, store: X509Store) -> Result<()> {
        self.with_builder(|builder| {
            builder.set_cert_store(store);
            Ok(())
        })
    }

    /// Load the local certificate chain and private key from a combined
    /// PEM file (leaf certificate first, then any intermediates, then
    /// the key).
    pub fn load_cert_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut pem = Vec::new();
        File::open(path.as_ref())?.read_to_end(&mut pem)?;

        let chain = X509::stack_from_pem(&pem)
            .map_err(|e| Error::Configuration(format!("failed to load certificate: {}", e)))?;
        let mut chain = chain.into_iter();
        let leaf = chain.next().ok_or_else(|| {
            Error::Configuration("certificate file contains no certificate".into())
        })?;
        let key = PKey::private_key_from_pem(&pem)
            .map_err(|e| Error::Configuration(format!("failed to load private key: {}", e)))?;

        self.with_builder(|builder| {
            builder.set_certificate(&leaf)?;
            for intermediate in chain {
                builder.add_extra_chain_cert(intermediate)?;
            }
            builder.set_private_key(&key)?;
            builder.check_private_key()?;
            Ok(())
        })
    }

    /// Set the verification policy.
    ///
    /// `callback`, when given, is invoked once per certificate in the
    /// peer chain and its verdict overrides the engine's default; the
    /// engine hook recovers this context through the registry.
    pub fn set_verify(
        &self,
        mode: VerifyMode,
        depth: u32,
        callback: Option<Arc<VerifyCallback>>,
    ) -> Result<()> {
        self.with_builder(|builder| {
            builder.set_verify_depth(depth);
            if callback.is_some() {
                builder.set_verify_callback(mode.to_openssl(), verify_trampoline);
            } else {
                builder.set_verify(mode.to_openssl());
            }
            Ok(())
        })?;
        *self.inner.verify_mode.lock().unwrap() = mode;
        self.inner.verify_depth.store(depth, Ordering::SeqCst);
        *self.inner.verify_callback.lock().unwrap() = callback;
        Ok(())
    }

    /// Configured verification mode
    pub fn verify_mode(&self) -> VerifyMode {
        *self.inner.verify_mode.lock().unwrap()
    }

    /// Configured verification depth
    pub fn verify_depth(&self) -> u32 {
        self.inner.verify_depth.load(Ordering::SeqCst)
    }

    /// Close the context: deregister from the registry, then release the
    /// native context. Idempotent. Connections created from this context
    /// keep the native resources alive through their own references.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            registry::deregister(self.inner.handle);
        }
        *self.inner.state.lock().unwrap() = CtxState::Closed;
    }

    pub(crate) fn frozen_context(&self) -> Result<SslContext> {
        self.inner.frozen_context()
    }
}

/// Global per-certificate verification hook.
///
/// Carries no object context of its own: it recovers the owning
/// [`SessionContext`] from the native handle stashed in the engine
/// context's ex-data, via the process-wide registry.
fn verify_trampoline(preverify_ok: bool, x509_ctx: &mut X509StoreContextRef) -> bool {
    let ssl_idx = match X509StoreContext::ssl_idx() {
        Ok(idx) => idx,
        Err(_) => return preverify_ok,
    };
    let ssl = match x509_ctx.ex_data(ssl_idx) {
        Some(ssl) => ssl,
        None => return preverify_ok,
    };
    let handle_idx = match handle_index() {
        Ok(idx) => idx,
        Err(_) => return preverify_ok,
    };
    let handle = match ssl.ssl_context().ex_data(handle_idx) {
        Some(handle) => *handle,
        None => return preverify_ok,
    };
    match registry::lookup(handle) {
        Some(ctx) => ctx.inner_ref().invoke_verify(preverify_ok, x509_ctx),
        // Context gone mid-handshake: fall back to the engine verdict.
        None => preverify_ok,
    }
}
