//! TCP socket integration tests against loopback listeners
//!
//! Covers:
//! - connecting, queued writes completing in order, exact-length reads
//! - terminator reads, including the maximum-length cutoff
//! - refused connections, family fallback and the delayed alternate
//! - connect, read and write timeouts extended by the delegate
//! - graceful disconnects after reads, writes or both, and half-duplex
//!   streams
//! - lookups answered after close
//! - request validation errors

mod common;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use common::{assert_quiet, next, TcpEvent, TcpRecorder};
use duosock::{Error, TcpSocket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Accept one connection and echo everything back until EOF
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    addr
}

/// Accept one connection and hand it to the test
async fn one_shot_server() -> (SocketAddr, tokio::task::JoinHandle<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    (addr, accept)
}

async fn connected(
    recorder: TcpRecorder,
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<TcpEvent>,
    addr: SocketAddr,
) -> TcpSocket {
    let sock = TcpSocket::builder().delegate(recorder).build().unwrap();
    sock.connect(&addr.ip().to_string(), addr.port(), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    match next(rx).await {
        TcpEvent::Connected(host, port) => {
            assert_eq!(host, addr.ip().to_string());
            assert_eq!(port, addr.port());
        }
        other => panic!("expected connect, got {:?}", other),
    }
    sock
}

/// Writes complete in order and an exact-length read gathers both echoes
#[tokio::test]
async fn test_connect_write_read_echo() {
    let addr = echo_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = connected(recorder, &mut rx, addr).await;
    assert!(sock.is_connected());
    assert!(sock.is_ipv4());
    assert_eq!(sock.connected_address(), Some(addr));

    sock.write_data(&b"ABC"[..], None, 1).unwrap();
    sock.write_data(&b"DEF"[..], None, 2).unwrap();
    sock.read_data_to_length(6, Some(Duration::from_secs(5)), 3)
        .unwrap();

    let mut wrote = Vec::new();
    let mut read = None;
    while read.is_none() || wrote.len() < 2 {
        match next(&mut rx).await {
            TcpEvent::Wrote(tag) => wrote.push(tag),
            TcpEvent::Read(data, tag) => read = Some((data, tag)),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(wrote, vec![1, 2]);
    assert_eq!(read, Some((b"ABCDEF".to_vec(), 3)));

    sock.disconnect();
    assert!(matches!(next(&mut rx).await, TcpEvent::Disconnected(None)));
    sock.closed().await;
    assert!(sock.is_disconnected());
}

/// One burst from the peer is split at each terminator
#[tokio::test]
async fn test_terminator_reads_split_burst() {
    let (addr, accept) = one_shot_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = connected(recorder, &mut rx, addr).await;

    let mut server = accept.await.unwrap();
    server.write_all(b"HELLO\r\nWORLD\r\n").await.unwrap();

    sock.read_data_to_terminator(b"\r\n", None, None, 10)
        .unwrap();
    sock.read_data_to_terminator(b"\r\n", None, None, 11)
        .unwrap();

    match next(&mut rx).await {
        TcpEvent::Read(data, 10) => assert_eq!(data, b"HELLO\r\n"),
        other => panic!("unexpected event: {:?}", other),
    }
    match next(&mut rx).await {
        TcpEvent::Read(data, 11) => assert_eq!(data, b"WORLD\r\n"),
        other => panic!("unexpected event: {:?}", other),
    }
}

/// Too many bytes without the terminator closes the socket
#[tokio::test]
async fn test_terminator_read_maxed_out() {
    let (addr, accept) = one_shot_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = connected(recorder, &mut rx, addr).await;

    let mut server = accept.await.unwrap();
    server.write_all(b"abcdefghij").await.unwrap();
    sock.read_data_to_terminator(b"\n", Some(4), None, 1)
        .unwrap();

    match next(&mut rx).await {
        TcpEvent::Disconnected(Some(Error::ReadMaxedOut)) => {}
        other => panic!("expected ReadMaxedOut, got {:?}", other),
    }
}

/// A refused connection reports the system error
#[tokio::test]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder().delegate(recorder).build().unwrap();
    sock.connect("127.0.0.1", addr.port(), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    match next(&mut rx).await {
        TcpEvent::Disconnected(Some(err @ Error::System(_))) => {
            assert_eq!(err.io_kind(), Some(std::io::ErrorKind::ConnectionRefused));
        }
        other => panic!("expected a refused connection, got {:?}", other),
    }
    sock.closed().await;
}

/// The delegate extends a read timeout once, then lets it fire
#[tokio::test]
async fn test_read_timeout_extended_once() {
    let (addr, accept) = one_shot_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let recorder = recorder.with_read_extensions(1, Duration::from_millis(100));
    let sock = connected(recorder, &mut rx, addr).await;
    let _server = accept.await.unwrap();

    let started = Instant::now();
    sock.read_data(Some(Duration::from_millis(150)), 5).unwrap();

    match next(&mut rx).await {
        TcpEvent::Disconnected(Some(Error::ReadTimeout)) => {}
        other => panic!("expected a read timeout, got {:?}", other),
    }
    // 150ms plus the 100ms extension, with a little slack for timer rounding
    assert!(started.elapsed() >= Duration::from_millis(240));
}

#[tokio::test]
async fn test_connect_requires_delegate() {
    let sock = TcpSocket::new();
    let err = sock.connect("127.0.0.1", 80, None).await.unwrap_err();
    assert!(err.is_config_error());
}

#[tokio::test]
async fn test_request_validation() {
    let (recorder, _rx) = TcpRecorder::new();
    let sock = TcpSocket::builder().delegate(recorder).build().unwrap();

    assert!(matches!(
        sock.connect("", 80, None).await,
        Err(Error::BadParam(_))
    ));
    assert!(matches!(
        sock.read_data_to_length(0, None, 0),
        Err(Error::BadParam(_))
    ));
    assert!(matches!(
        sock.read_data_to_terminator(b"", None, None, 0),
        Err(Error::BadParam(_))
    ));
    assert!(matches!(
        sock.read_data_to_terminator(b"\r\n", Some(1), None, 0),
        Err(Error::BadParam(_))
    ));
    assert!(matches!(
        sock.write_data(Vec::new(), None, 0),
        Err(Error::BadParam(_))
    ));
}

#[tokio::test]
async fn test_second_connect_rejected() {
    let addr = echo_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = connected(recorder, &mut rx, addr).await;

    let err = sock
        .connect("127.0.0.1", addr.port(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadConfig(_)));
}

/// Queued writes drain before the socket closes
#[tokio::test]
async fn test_disconnect_after_writing() {
    let (addr, accept) = one_shot_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = connected(recorder, &mut rx, addr).await;
    let mut server = accept.await.unwrap();

    sock.write_data(&b"last words"[..], None, 9).unwrap();
    sock.disconnect_after_writing();

    assert!(matches!(next(&mut rx).await, TcpEvent::Wrote(9)));
    assert!(matches!(next(&mut rx).await, TcpEvent::Disconnected(None)));

    let mut received = Vec::new();
    server.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"last words");
}

/// With half-duplex the peer's EOF only closes the read side
#[tokio::test]
async fn test_half_duplex_keeps_writing() {
    let (addr, accept) = one_shot_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder()
        .delegate(recorder)
        .allow_half_duplex(true)
        .build()
        .unwrap();
    sock.connect("127.0.0.1", addr.port(), None).await.unwrap();
    assert!(matches!(next(&mut rx).await, TcpEvent::Connected(..)));

    let mut server = accept.await.unwrap();
    server.write_all(b"bye").await.unwrap();
    server.shutdown().await.unwrap();

    sock.read_data_to_length(3, None, 1).unwrap();
    match next(&mut rx).await {
        TcpEvent::Read(data, 1) => assert_eq!(data, b"bye"),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(matches!(next(&mut rx).await, TcpEvent::ReadStreamClosed));

    sock.write_data(&b"still here"[..], None, 2).unwrap();
    assert!(matches!(next(&mut rx).await, TcpEvent::Wrote(2)));

    let mut buf = [0u8; 10];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");
    assert!(sock.is_connected());
}

/// Without half-duplex, EOF while idle is a clean close
#[tokio::test]
async fn test_peer_close_while_idle() {
    let (addr, accept) = one_shot_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let _sock = connected(recorder, &mut rx, addr).await;

    drop(accept.await.unwrap());
    assert!(matches!(next(&mut rx).await, TcpEvent::Disconnected(None)));
}

/// EOF under an unfinished read is an error
#[tokio::test]
async fn test_peer_close_during_read() {
    let (addr, accept) = one_shot_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = connected(recorder, &mut rx, addr).await;

    sock.read_data_to_length(10, None, 1).unwrap();
    let mut server = accept.await.unwrap();
    server.write_all(b"abc").await.unwrap();
    drop(server);

    match next(&mut rx).await {
        TcpEvent::Disconnected(Some(Error::ConnectionClosed)) => {}
        other => panic!("expected ConnectionClosed, got {:?}", other),
    }
}

/// Nothing reaches the delegate once the socket has disconnected
#[tokio::test]
async fn test_no_callbacks_after_disconnect() {
    let (addr, accept) = one_shot_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = connected(recorder, &mut rx, addr).await;
    let mut server = accept.await.unwrap();

    sock.read_data(None, 1).unwrap();
    sock.disconnect();
    assert!(matches!(next(&mut rx).await, TcpEvent::Disconnected(None)));

    let _ = server.write_all(b"too late").await;
    assert_quiet(&mut rx, Duration::from_millis(200)).await;
}

/// The stock logging delegate is enough to drive a socket to completion
#[tokio::test]
async fn test_logging_delegate() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let sock = TcpSocket::builder()
        .delegate(duosock::LoggingTcpDelegate)
        .build()
        .unwrap();
    sock.connect("127.0.0.1", port, None).await.unwrap();
    tokio::time::timeout(common::EVENT_WAIT, sock.closed())
        .await
        .unwrap();
    assert!(sock.is_disconnected());
}

/// A socket that closed stays closed
#[tokio::test]
async fn test_connect_after_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder().delegate(recorder).build().unwrap();
    sock.connect("127.0.0.1", port, None).await.unwrap();
    assert!(matches!(next(&mut rx).await, TcpEvent::Disconnected(Some(_))));
    sock.closed().await;

    let err = sock.connect("127.0.0.1", port, None).await.unwrap_err();
    assert!(matches!(err, Error::BadConfig(_)));
}

/// Disconnecting a socket that never started leaves it usable
#[tokio::test]
async fn test_disconnect_before_connect_is_ignored() {
    let addr = echo_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder().delegate(recorder).build().unwrap();
    sock.disconnect();
    assert!(sock.is_disconnected());

    sock.connect("127.0.0.1", addr.port(), None).await.unwrap();
    assert!(matches!(next(&mut rx).await, TcpEvent::Connected(..)));
}

/// Local and peer addresses are published once connected
#[tokio::test]
async fn test_connection_info() {
    let addr = echo_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = connected(recorder, &mut rx, addr).await;

    let info = sock.info();
    assert!(info.is_connected());
    assert!(!info.is_secure());
    assert_eq!(info.peer_addr, Some(addr));
    assert_eq!(sock.connected_host(), Some("127.0.0.1".to_string()));
    assert_eq!(sock.connected_port(), Some(addr.port()));
    assert_eq!(sock.local_host(), Some("127.0.0.1".to_string()));
    assert!(sock.local_port().is_some_and(|p| p != 0));
}

/// A literal address skips the lookup and connects directly
#[tokio::test]
async fn test_connect_to_address() {
    let addr = echo_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder().delegate(recorder).build().unwrap();
    sock.connect_to_address(addr, None).await.unwrap();
    assert!(matches!(next(&mut rx).await, TcpEvent::Connected(_, p) if p == addr.port()));

    let err = TcpSocket::builder()
        .delegate(TcpRecorder::new().0)
        .ipv4_enabled(false)
        .build()
        .unwrap()
        .connect_to_address(addr, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadConfig(_)));
}

async fn localhost_has_both_families() -> bool {
    match tokio::net::lookup_host("localhost:0").await {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            addrs.iter().any(|a| a.is_ipv4())
                && addrs.iter().any(|a| a.is_ipv6())
                && common::ipv6_available()
        }
        Err(_) => false,
    }
}

/// Preferring IPv6 races the IPv6 address first
#[tokio::test]
async fn test_prefer_ipv6_localhost() {
    if !localhost_has_both_families().await {
        return;
    }
    let listener = TcpListener::bind("[::1]:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder()
        .delegate(recorder)
        .prefer_ipv6()
        .build()
        .unwrap();
    sock.connect("localhost", port, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    match next(&mut rx).await {
        TcpEvent::Connected(host, p) => {
            assert_eq!(host, "::1");
            assert_eq!(p, port);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(sock.is_ipv6());
}

/// IPv4 is refused, so the race falls through to IPv6
#[tokio::test]
async fn test_fallback_to_ipv6() {
    if !localhost_has_both_families().await {
        return;
    }
    let listener = TcpListener::bind("[::1]:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    if std::net::TcpListener::bind(("127.0.0.1", port)).is_err() {
        // someone else owns the IPv4 side of this port
        return;
    }
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder().delegate(recorder).build().unwrap();
    sock.connect("localhost", port, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    match next(&mut rx).await {
        TcpEvent::Connected(host, _) => assert_eq!(host, "::1"),
        other => panic!("unexpected event: {:?}", other),
    }
}

/// The preferred family failing on the spot still falls through to the other
#[tokio::test]
async fn test_preferred_family_fails_immediately() {
    if !localhost_has_both_families().await {
        return;
    }
    let (addr, accept) = one_shot_server().await;

    // IPv6 local binds land on a port somebody already listens on
    let blocker = std::net::TcpListener::bind("[::1]:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();
    if std::net::TcpListener::bind(("127.0.0.1", taken)).is_err() {
        return;
    }

    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder()
        .delegate(recorder)
        .prefer_ipv6()
        .build()
        .unwrap();
    sock.connect_via_interface(
        "localhost",
        addr.port(),
        &format!("localhost:{}", taken),
        Some(Duration::from_secs(5)),
    )
    .await
    .unwrap();

    match next(&mut rx).await {
        TcpEvent::Connected(host, port) => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(port, addr.port());
        }
        other => panic!("expected an IPv4 connect, got {:?}", other),
    }
    assert!(sock.is_ipv4());
    let _server = accept.await.unwrap();
    drop(blocker);
}

/// A hanging preferred family hands over to the alternate once the delay passes
#[tokio::test]
async fn test_alternate_family_after_delay() {
    if !localhost_has_both_families().await {
        return;
    }
    let (addr, accept) = one_shot_server().await;
    let Some((_stalled, _, _held)) =
        common::saturated_listener(SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], addr.port()))).await
    else {
        return;
    };

    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder()
        .delegate(recorder)
        .prefer_ipv6()
        .alternate_address_delay(Duration::from_millis(200))
        .build()
        .unwrap();

    let started = Instant::now();
    sock.connect("localhost", addr.port(), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    match next(&mut rx).await {
        TcpEvent::Connected(host, port) => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(port, addr.port());
        }
        other => panic!("expected the alternate to win, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(190));
    assert!(sock.is_ipv4());
    let _server = accept.await.unwrap();
}

/// A connect that never completes closes with the connect timeout
#[tokio::test]
async fn test_connect_timeout() {
    let Some((_stalled, addr, _held)) =
        common::saturated_listener("127.0.0.1:0".parse().unwrap()).await
    else {
        return;
    };
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder().delegate(recorder).build().unwrap();

    let started = Instant::now();
    sock.connect_to_address(addr, Some(Duration::from_millis(200)))
        .await
        .unwrap();
    match next(&mut rx).await {
        TcpEvent::Disconnected(Some(Error::ConnectTimeout)) => {}
        other => panic!("expected a connect timeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(190));
    assert!(!sock.is_connected());
}

#[tokio::test]
async fn test_connect_timeout_extended() {
    let Some((_stalled, addr, _held)) =
        common::saturated_listener("127.0.0.1:0".parse().unwrap()).await
    else {
        return;
    };
    let (recorder, mut rx) = TcpRecorder::new();
    let recorder = recorder.with_connect_extensions(1, Duration::from_millis(200));
    let sock = TcpSocket::builder().delegate(recorder).build().unwrap();

    let started = Instant::now();
    sock.connect_to_address(addr, Some(Duration::from_millis(200)))
        .await
        .unwrap();
    match next(&mut rx).await {
        TcpEvent::Disconnected(Some(Error::ConnectTimeout)) => {}
        other => panic!("expected a connect timeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(390));
}

/// The peer never reads, so a large write stalls until both deadlines pass
#[tokio::test]
async fn test_write_timeout_extended() {
    let (addr, accept) = one_shot_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let recorder = recorder.with_write_extensions(1, Duration::from_millis(200));
    let sock = connected(recorder, &mut rx, addr).await;
    let _server = accept.await.unwrap();

    let started = Instant::now();
    sock.write_data(vec![0x5a; 32 * 1024 * 1024], Some(Duration::from_millis(200)), 4)
        .unwrap();

    match next(&mut rx).await {
        TcpEvent::Disconnected(Some(Error::WriteTimeout)) => {}
        other => panic!("expected a write timeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(390));
}

/// Data arriving inside the extension completes the same read
#[tokio::test]
async fn test_read_extension_keeps_packet() {
    let (addr, accept) = one_shot_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let recorder = recorder.with_read_extensions(1, Duration::from_millis(400));
    let sock = connected(recorder, &mut rx, addr).await;
    let mut server = accept.await.unwrap();

    sock.read_data_to_length(4, Some(Duration::from_millis(150)), 7)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    server.write_all(b"late").await.unwrap();

    match next(&mut rx).await {
        TcpEvent::Read(data, 7) => assert_eq!(data, b"late"),
        other => panic!("expected the extended read, got {:?}", other),
    }
    assert_quiet(&mut rx, Duration::from_millis(400)).await;
    assert!(sock.is_connected());
}

/// Queued reads finish, later requests are refused, then the socket closes
#[tokio::test]
async fn test_disconnect_after_reading() {
    let (addr, accept) = one_shot_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = connected(recorder, &mut rx, addr).await;
    let mut server = accept.await.unwrap();

    sock.read_data_to_length(5, None, 1).unwrap();
    sock.disconnect_after_reading();
    sock.read_data(None, 2).unwrap();
    server.write_all(b"hello").await.unwrap();

    match next(&mut rx).await {
        TcpEvent::Read(data, 1) => assert_eq!(data, b"hello"),
        other => panic!("expected the queued read, got {:?}", other),
    }
    assert!(matches!(next(&mut rx).await, TcpEvent::Disconnected(None)));
    assert_quiet(&mut rx, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_disconnect_after_reading_and_writing() {
    let addr = echo_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = connected(recorder, &mut rx, addr).await;

    sock.write_data(&b"ping"[..], None, 1).unwrap();
    sock.read_data_to_length(4, None, 2).unwrap();
    sock.disconnect_after_reading_and_writing();
    sock.write_data(&b"late"[..], None, 3).unwrap();

    let mut wrote = false;
    let mut read = false;
    while !(wrote && read) {
        match next(&mut rx).await {
            TcpEvent::Wrote(1) => wrote = true,
            TcpEvent::Read(data, 2) => {
                assert_eq!(data, b"ping");
                read = true;
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(matches!(next(&mut rx).await, TcpEvent::Disconnected(None)));
    assert_quiet(&mut rx, Duration::from_millis(200)).await;
}

/// Closing while the host lookup is in flight drops its answer
#[tokio::test]
async fn test_lookup_after_close_is_ignored() {
    let addr = echo_server().await;
    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder()
        .delegate(recorder)
        .ipv6_enabled(false)
        .build()
        .unwrap();

    sock.connect("localhost", addr.port(), None).await.unwrap();
    sock.disconnect();

    assert!(matches!(next(&mut rx).await, TcpEvent::Disconnected(None)));
    assert_quiet(&mut rx, Duration::from_millis(300)).await;
    assert!(sock.is_disconnected());
}

/// Both families failing on the spot close once, with nothing left armed
#[tokio::test]
async fn test_both_families_fail_immediately() {
    if !localhost_has_both_families().await {
        return;
    }
    let (addr, _accept) = one_shot_server().await;
    let v6_blocker = std::net::TcpListener::bind("[::1]:0").unwrap();
    let taken = v6_blocker.local_addr().unwrap().port();
    let Ok(v4_blocker) = std::net::TcpListener::bind(("127.0.0.1", taken)) else {
        return;
    };

    let (recorder, mut rx) = TcpRecorder::new();
    let sock = TcpSocket::builder()
        .delegate(recorder)
        .prefer_ipv6()
        .alternate_address_delay(Duration::from_millis(100))
        .build()
        .unwrap();
    sock.connect_via_interface(
        "localhost",
        addr.port(),
        &format!("localhost:{}", taken),
        Some(Duration::from_secs(5)),
    )
    .await
    .unwrap();

    match next(&mut rx).await {
        TcpEvent::Disconnected(Some(err)) => {
            assert_eq!(err.io_kind(), Some(std::io::ErrorKind::AddrInUse));
        }
        other => panic!("expected a bind failure, got {:?}", other),
    }
    assert_quiet(&mut rx, Duration::from_millis(300)).await;
    assert!(sock.is_disconnected());
    drop((v6_blocker, v4_blocker));
}
