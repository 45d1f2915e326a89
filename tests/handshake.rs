//! Loopback handshake integration tests: trust, identity checking, and
//! registry-routed verification callbacks.

mod common;

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tlslayer::{
    CheckError, Connection, ConnectionState, Error, IdentityExpectation, SessionContext,
    VerifyMode,
};

/// Server context presenting a leaf for `m2test.local` issued by a
/// throwaway CA; returns the CA bundle file alongside.
fn server_fixture() -> (SessionContext, tempfile::NamedTempFile) {
    let (ca_cert, ca_key) = common::ca("tlslayer test CA");
    let (leaf, leaf_key) = common::issue(&ca_cert, &ca_key, "m2test.local", &["m2test.local"]);
    let server_pem = common::combined_pem(&leaf, &leaf_key);
    let ca_pem = common::cert_pem(&ca_cert);

    let ctx = SessionContext::create(None, None, None).unwrap();
    ctx.load_cert_file(server_pem.path()).unwrap();
    (ctx, ca_pem)
}

fn spawn_echo_server(listener: TcpListener, ctx: SessionContext) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        let mut conn = Connection::new(&ctx, tcp);
        if conn.accept().is_err() {
            // The client side of the test decided this handshake fails.
            return;
        }
        let mut buf = [0u8; 64];
        if let Ok(n) = conn.read(&mut buf) {
            if n > 0 {
                let _ = conn.write(&buf[..n]);
            }
        }
        conn.close();
    })
}

#[test]
fn test_trusted_peer_with_matching_identity() {
    let (server_ctx, ca_pem) = server_fixture();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_echo_server(listener, server_ctx);

    let ctx = SessionContext::create(None, None, None).unwrap();
    ctx.load_verify_locations(Some(ca_pem.path()), None).unwrap();
    ctx.set_verify(VerifyMode::PEER, 9, None).unwrap();

    let tcp = TcpStream::connect(addr).unwrap();
    let mut conn =
        Connection::new(&ctx, tcp).with_expectation(IdentityExpectation::host("m2test.local"));
    conn.connect().unwrap();

    assert_eq!(conn.state(), ConnectionState::Established);
    assert!(!conn.peer_certificate_chain().is_empty());
    assert!(conn.negotiated_version().unwrap().starts_with("TLS"));

    let info = conn.info().unwrap();
    assert_eq!(
        info.peer_identity().unwrap().dns_names,
        vec!["m2test.local"]
    );

    conn.write(b"hello").unwrap();
    let mut buf = [0u8; 5];
    let n = conn.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");

    conn.close();
    assert_eq!(conn.state(), ConnectionState::Closed);
    server.join().unwrap();
}

#[test]
fn test_wrong_host_never_observed_established() {
    let (server_ctx, ca_pem) = server_fixture();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_echo_server(listener, server_ctx);

    let ctx = SessionContext::create(None, None, None).unwrap();
    ctx.load_verify_locations(Some(ca_pem.path()), None).unwrap();
    ctx.set_verify(VerifyMode::PEER, 9, None).unwrap();

    let tcp = TcpStream::connect(addr).unwrap();
    let mut conn =
        Connection::new(&ctx, tcp).with_expectation(IdentityExpectation::host("other.local"));
    match conn.connect() {
        Err(Error::Identity(CheckError::WrongHost { expected, found })) => {
            assert_eq!(expected, "other.local");
            assert_eq!(found, vec!["m2test.local"]);
        }
        other => panic!("expected WrongHost, got {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);
    server.join().unwrap();
}

#[test]
fn test_untrusted_issuer_fails_handshake() {
    let (server_ctx, _ca_pem) = server_fixture();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_echo_server(listener, server_ctx);

    // Peer verification requested, but no trust anchor loaded.
    let ctx = SessionContext::create(None, None, None).unwrap();
    ctx.set_verify(VerifyMode::PEER, 9, None).unwrap();

    let tcp = TcpStream::connect(addr).unwrap();
    let mut conn = Connection::new(&ctx, tcp);
    match conn.connect() {
        Err(Error::Handshake(msg)) => assert!(msg.contains("certificate verify")),
        other => panic!("expected handshake failure, got {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);
    server.join().unwrap();
}

#[test]
fn test_verify_callback_is_routed_through_registry() {
    let (server_ctx, _ca_pem) = server_fixture();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_echo_server(listener, server_ctx);

    // No trust anchor: the engine rejects every certificate, and the
    // context's predicate (recovered via the registry mid-handshake)
    // overrides it to accept.
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let ctx = SessionContext::create(None, None, None).unwrap();
    ctx.set_verify(
        VerifyMode::PEER,
        9,
        Some(Arc::new(move |cert, _preverify_ok, _depth| {
            seen.fetch_add(1, Ordering::SeqCst);
            cert.is_some()
        })),
    )
    .unwrap();

    let tcp = TcpStream::connect(addr).unwrap();
    let mut conn = Connection::new(&ctx, tcp);
    conn.connect().unwrap();

    assert_eq!(conn.state(), ConnectionState::Established);
    assert!(calls.load(Ordering::SeqCst) > 0);

    conn.write(b"ping").unwrap();
    let mut buf = [0u8; 4];
    conn.read(&mut buf).unwrap();
    conn.close();
    server.join().unwrap();
}

#[test]
fn test_verify_callback_rejection_fails_handshake() {
    let (server_ctx, ca_pem) = server_fixture();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = spawn_echo_server(listener, server_ctx);

    // Trust anchor present, but the predicate vetoes the chain.
    let ctx = SessionContext::create(None, None, None).unwrap();
    ctx.load_verify_locations(Some(ca_pem.path()), None).unwrap();
    ctx.set_verify(VerifyMode::PEER, 9, Some(Arc::new(|_, _, _| false)))
        .unwrap();

    let tcp = TcpStream::connect(addr).unwrap();
    let mut conn = Connection::new(&ctx, tcp);
    assert!(matches!(conn.connect(), Err(Error::Handshake(_))));
    assert_eq!(conn.state(), ConnectionState::Closed);
    server.join().unwrap();
}

#[test]
fn test_server_identity_expectation_without_client_cert() {
    let (server_ctx, _ca_pem) = server_fixture();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        // The server expects to identify the client, but never requested
        // a certificate: the anonymous peer is classified, not accepted.
        let mut conn = Connection::new(&server_ctx, tcp)
            .with_expectation(IdentityExpectation::host("client.local"));
        match conn.accept() {
            Err(Error::Identity(CheckError::NoCertificate)) => {}
            other => panic!("expected NoCertificate, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
    });

    let ctx = SessionContext::create(None, None, None).unwrap();
    let tcp = TcpStream::connect(addr).unwrap();
    let mut conn = Connection::new(&ctx, tcp);
    // The client handshake itself completes; the peer then tears the
    // session down when its identity check fails.
    if conn.connect().is_ok() {
        let mut buf = [0u8; 8];
        let _ = conn.read(&mut buf);
    }
    server.join().unwrap();
}

#[test]
fn test_required_client_cert_missing_fails() {
    let (server_ctx, ca_pem) = server_fixture();
    server_ctx
        .load_verify_locations(Some(ca_pem.path()), None)
        .unwrap();
    server_ctx
        .set_verify(VerifyMode::PEER.fail_if_no_peer_cert(), 9, None)
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        let mut conn = Connection::new(&server_ctx, tcp);
        assert!(matches!(conn.accept(), Err(Error::Handshake(_))));
        assert_eq!(conn.state(), ConnectionState::Closed);
    });

    let ctx = SessionContext::create(None, None, None).unwrap();
    let tcp = TcpStream::connect(addr).unwrap();
    let mut conn = Connection::new(&ctx, tcp);
    let _ = conn.connect();
    server.join().unwrap();
}
