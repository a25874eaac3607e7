//! UDP socket integration tests over loopback
//!
//! Covers:
//! - binding, sending by address and by host name, continuous and one-shot
//!   receiving
//! - connect narrowing the socket to one family and one peer
//! - send and receive filters in both execution modes
//! - multicast membership, delivery and the family it retires
//! - queue-drain close and size limits, including ignored zero limits

mod common;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use common::{assert_quiet, next, UdpEvent, UdpRecorder};
use duosock::{Error, FilterContext, FilterMode, FilterVerdict, UdpSocket};
use tokio::sync::mpsc::UnboundedReceiver;

const QUIET: Duration = Duration::from_millis(200);

/// Loopback receiver on an ephemeral IPv4 port, already receiving
async fn receiver() -> (UdpSocket, UnboundedReceiver<UdpEvent>, SocketAddr) {
    let (recorder, rx) = UdpRecorder::new();
    let sock = UdpSocket::builder()
        .delegate(recorder)
        .ipv6_enabled(false)
        .build()
        .unwrap();
    sock.bind_to_address(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .unwrap();
    sock.begin_receiving().await.unwrap();
    let addr = sock.local_address_v4().unwrap();
    (sock, rx, addr)
}

fn sender() -> (UdpSocket, UnboundedReceiver<UdpEvent>) {
    let (recorder, rx) = UdpRecorder::new();
    let sock = UdpSocket::builder().delegate(recorder).build().unwrap();
    (sock, rx)
}

async fn expect_datagram(rx: &mut UnboundedReceiver<UdpEvent>) -> (Vec<u8>, SocketAddr, Option<FilterContext>) {
    match next(rx).await {
        UdpEvent::Received(data, from, context) => (data, from, context),
        other => panic!("expected a datagram, got {:?}", other),
    }
}

#[tokio::test]
async fn test_send_and_receive() {
    let (_recv, mut recv_rx, addr) = receiver().await;
    let (send, mut send_rx) = sender();

    send.send_to_address(&b"hello"[..], addr, None, 1);
    assert!(matches!(next(&mut send_rx).await, UdpEvent::Sent(1)));

    let (data, from, context) = expect_datagram(&mut recv_rx).await;
    assert_eq!(data, b"hello");
    assert!(from.ip().is_loopback());
    assert!(context.is_none());
    // the first send bound the sender implicitly
    assert_eq!(send.local_port(), Some(from.port()));
}

/// A host name is resolved in queue order
#[tokio::test]
async fn test_send_to_host() {
    let (_recv, mut recv_rx, addr) = receiver().await;
    let (recorder, mut send_rx) = UdpRecorder::new();
    let send = UdpSocket::builder()
        .delegate(recorder)
        .ipv6_enabled(false)
        .build()
        .unwrap();

    send.send_to_host(&b"first"[..], "localhost", addr.port(), None, 1);
    send.send_to_address(&b"second"[..], addr, None, 2);
    assert!(matches!(next(&mut send_rx).await, UdpEvent::Sent(1)));
    assert!(matches!(next(&mut send_rx).await, UdpEvent::Sent(2)));

    assert_eq!(expect_datagram(&mut recv_rx).await.0, b"first");
    assert_eq!(expect_datagram(&mut recv_rx).await.0, b"second");
}

/// Connecting fixes the peer and retires the other family
#[tokio::test]
async fn test_connect_narrows_socket() {
    let (_recv, mut recv_rx, addr) = receiver().await;
    let (send, mut send_rx) = sender();

    send.connect_to_address(addr).await.unwrap();
    match next(&mut send_rx).await {
        UdpEvent::Connected(peer) => assert_eq!(peer, addr),
        other => panic!("expected connect, got {:?}", other),
    }
    assert!(send.is_connected());
    assert!(send.is_ipv4());
    assert!(!send.is_ipv6_enabled());
    assert_eq!(send.connected_address(), Some(addr));

    send.send(&b"to the peer"[..], None, 1);
    assert!(matches!(next(&mut send_rx).await, UdpEvent::Sent(1)));
    assert_eq!(expect_datagram(&mut recv_rx).await.0, b"to the peer");

    // an explicit destination is refused once connected
    send.send_to_address(&b"elsewhere"[..], addr, None, 2);
    match next(&mut send_rx).await {
        UdpEvent::NotSent(2, Error::BadConfig(_)) => {}
        other => panic!("expected BadConfig, got {:?}", other),
    }

    assert!(matches!(
        send.connect_to_address(addr).await,
        Err(Error::BadConfig(_))
    ));
}

/// Sending without a destination needs a connected socket
#[tokio::test]
async fn test_send_requires_connection() {
    let (send, mut send_rx) = sender();
    send.send(&b"nowhere"[..], None, 4);
    match next(&mut send_rx).await {
        UdpEvent::NotSent(4, Error::BadConfig(_)) => {}
        other => panic!("expected BadConfig, got {:?}", other),
    }
}

#[tokio::test]
async fn test_oversized_send() {
    let (recorder, mut rx) = UdpRecorder::new();
    let send = UdpSocket::builder()
        .delegate(recorder)
        .max_send_size(16)
        .build()
        .unwrap();

    send.send_to_address(vec![0u8; 32], "127.0.0.1:9".parse().unwrap(), None, 3);
    match next(&mut rx).await {
        UdpEvent::NotSent(3, Error::BadParam(_)) => {}
        other => panic!("expected BadParam, got {:?}", other),
    }
}

/// Zero limits are ignored at runtime, positive ones take effect
#[tokio::test]
async fn test_zero_size_limits_ignored() {
    let (sock, mut rx) = sender();
    sock.set_max_send_buffer_size(0);
    sock.set_max_receive_ipv4_buffer_size(0);
    sock.set_max_receive_ipv6_buffer_size(0);
    // a round trip through the socket so the settings above have landed
    sock.enable_broadcast(false).await.unwrap();

    let info = sock.info();
    assert!(info.max_send_size > 0);
    assert!(info.max_receive_ipv4_size > 0);
    assert!(info.max_receive_ipv6_size > 0);

    sock.set_max_send_buffer_size(8);
    sock.send_to_address(vec![0u8; 16], "127.0.0.1:9".parse().unwrap(), None, 4);
    match next(&mut rx).await {
        UdpEvent::NotSent(4, Error::BadParam(_)) => {}
        other => panic!("expected BadParam, got {:?}", other),
    }
}

/// A rejected send is reported as sent and never leaves the host
#[tokio::test]
async fn test_send_filter_drops_silently() {
    for mode in [FilterMode::Sync, FilterMode::Async] {
        let (_recv, mut recv_rx, addr) = receiver().await;
        let (send, mut send_rx) = sender();
        send.set_send_filter(|_data: &[u8], _to: SocketAddr, tag| tag != 2, mode);

        send.send_to_address(&b"kept"[..], addr, None, 1);
        send.send_to_address(&b"dropped"[..], addr, None, 2);
        send.send_to_address(&b"kept too"[..], addr, None, 3);
        for tag in 1..=3 {
            match next(&mut send_rx).await {
                UdpEvent::Sent(t) => assert_eq!(t, tag),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        assert_eq!(expect_datagram(&mut recv_rx).await.0, b"kept");
        assert_eq!(expect_datagram(&mut recv_rx).await.0, b"kept too");
        assert_quiet(&mut recv_rx, QUIET).await;
    }
}

/// Accepted datagrams carry the filter's context to the delegate
#[tokio::test]
async fn test_receive_filter_context() {
    for mode in [FilterMode::Sync, FilterMode::Async] {
        let (recv, mut recv_rx, addr) = receiver().await;
        recv.set_receive_filter(
            |data: &[u8], _from: SocketAddr| {
                if data.starts_with(b"drop") {
                    FilterVerdict::Reject
                } else {
                    FilterVerdict::Accept(Some(Arc::new(data.len()) as FilterContext))
                }
            },
            mode,
        );

        let (send, mut send_rx) = sender();
        send.send_to_address(&b"drop me"[..], addr, None, 1);
        send.send_to_address(&b"keep"[..], addr, None, 2);
        assert!(matches!(next(&mut send_rx).await, UdpEvent::Sent(1)));
        assert!(matches!(next(&mut send_rx).await, UdpEvent::Sent(2)));

        let (data, _, context) = expect_datagram(&mut recv_rx).await;
        assert_eq!(data, b"keep");
        let context = context.expect("filter context");
        assert_eq!(context.downcast_ref::<usize>(), Some(&4));
        assert_quiet(&mut recv_rx, QUIET).await;
    }
}

/// One-shot receiving delivers a single datagram per request
#[tokio::test]
async fn test_receive_once() {
    let (recorder, mut recv_rx) = UdpRecorder::new();
    let recv = UdpSocket::builder()
        .delegate(recorder)
        .ipv6_enabled(false)
        .build()
        .unwrap();
    recv.bind_to_address(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .unwrap();
    let addr = recv.local_address_v4().unwrap();
    recv.receive_once().await.unwrap();

    let (send, mut send_rx) = sender();
    send.send_to_address(&b"one"[..], addr, None, 1);
    send.send_to_address(&b"two"[..], addr, None, 2);
    assert!(matches!(next(&mut send_rx).await, UdpEvent::Sent(1)));
    assert!(matches!(next(&mut send_rx).await, UdpEvent::Sent(2)));

    assert_eq!(expect_datagram(&mut recv_rx).await.0, b"one");
    assert_quiet(&mut recv_rx, QUIET).await;
    assert!(!recv.info().is_receiving());

    recv.receive_once().await.unwrap();
    assert_eq!(expect_datagram(&mut recv_rx).await.0, b"two");
}

/// Paused sockets hold datagrams until receiving resumes
#[tokio::test]
async fn test_pause_receiving() {
    let (recv, mut recv_rx, addr) = receiver().await;
    recv.pause_receiving();
    // let the pause land before sending
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (send, mut send_rx) = sender();
    send.send_to_address(&b"held"[..], addr, None, 1);
    assert!(matches!(next(&mut send_rx).await, UdpEvent::Sent(1)));
    assert_quiet(&mut recv_rx, QUIET).await;

    recv.begin_receiving().await.unwrap();
    assert_eq!(expect_datagram(&mut recv_rx).await.0, b"held");
}

#[tokio::test]
async fn test_close_after_sending() {
    let (_recv, mut recv_rx, addr) = receiver().await;
    let (send, mut send_rx) = sender();

    send.send_to_address(&b"parting"[..], addr, None, 1);
    send.close_after_sending();

    assert!(matches!(next(&mut send_rx).await, UdpEvent::Sent(1)));
    assert!(matches!(next(&mut send_rx).await, UdpEvent::Closed(None)));
    send.closed().await;
    assert!(send.is_closed());
    assert_eq!(expect_datagram(&mut recv_rx).await.0, b"parting");
}

/// Closing a socket that never opened anything stays silent
#[tokio::test]
async fn test_close_unused_socket() {
    let (sock, mut rx) = sender();
    sock.close();
    sock.closed().await;
    assert_quiet(&mut rx, QUIET).await;
}

#[tokio::test]
async fn test_bind_rules() {
    let (sock, _rx) = sender();
    sock.bind_to_port(0, None).await.unwrap();
    assert!(sock.local_port().is_some());

    assert!(matches!(
        sock.bind_to_port(0, None).await,
        Err(Error::BadConfig(_))
    ));
    assert!(matches!(
        sock.enable_reuse_port(true).await,
        Err(Error::BadConfig(_))
    ));

    let (other, _rx) = sender();
    assert!(matches!(
        other.bind_to_port(0, Some("no-such-interface0")).await,
        Err(Error::BadParam(_))
    ));
}

/// Binding one IPv4 address retires IPv6
#[tokio::test]
async fn test_bind_address_deactivates_other_family() {
    let (sock, _rx) = sender();
    sock.bind_to_address(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .unwrap();
    assert!(sock.is_ipv4());
    assert!(!sock.is_ipv6());
    assert!(!sock.is_ipv6_enabled());
    assert_eq!(sock.local_host(), Some("127.0.0.1".to_string()));
}

#[tokio::test]
async fn test_multicast_group_validation() {
    let (sock, _rx) = sender();
    assert!(matches!(
        sock.join_multicast_group("example.com", None).await,
        Err(Error::BadParam(_))
    ));
    assert!(matches!(
        sock.join_multicast_group("10.1.2.3", None).await,
        Err(Error::BadParam(_))
    ));
}

/// Joining an IPv4 group retires IPv6
#[tokio::test]
async fn test_multicast_join_deactivates_ipv6() {
    let (sock, _rx) = sender();
    sock.bind_to_port(0, None).await.unwrap();

    match sock.join_multicast_group("239.255.42.99", None).await {
        Ok(()) => {}
        // hosts without a multicast route cannot join at all
        Err(Error::System(_)) => return,
        Err(e) => panic!("unexpected error: {}", e),
    }
    assert!(!sock.is_ipv6_enabled());
    assert!(!sock.is_ipv6());
    sock.leave_multicast_group("239.255.42.99", None)
        .await
        .unwrap();
}

/// Sending over IPv6 once an IPv4 membership dropped that family
#[tokio::test]
async fn test_ipv6_send_after_ipv4_join() {
    let (sock, mut rx) = sender();
    sock.bind_to_port(0, None).await.unwrap();
    match sock.join_multicast_group("239.255.42.99", None).await {
        Ok(()) => {}
        Err(Error::System(_)) => return,
        Err(e) => panic!("unexpected error: {}", e),
    }

    sock.send_to_address(&b"nowhere"[..], "[::1]:9".parse().unwrap(), None, 1);
    match next(&mut rx).await {
        UdpEvent::NotSent(1, Error::BadConfig(_)) => {}
        other => panic!("expected BadConfig, got {:?}", other),
    }
    assert!(!sock.is_closed());
}

/// A send aimed at a family that is dropped while it waits does not stall
/// the queue behind it
#[tokio::test]
async fn test_send_addressed_to_retired_family_is_failed() {
    if !common::ipv6_available() {
        return;
    }
    let (sock, mut rx) = sender();
    sock.bind_to_port(0, None).await.unwrap();

    sock.send_to_address(&b"v6"[..], "[::1]:9".parse().unwrap(), None, 1);
    match sock.join_multicast_group("239.255.42.99", None).await {
        Ok(()) => {}
        Err(Error::System(_)) => return,
        Err(e) => panic!("unexpected error: {}", e),
    }
    sock.send_to_address(&b"v4"[..], "127.0.0.1:9".parse().unwrap(), None, 2);

    // the first send may have left before the join landed
    match next(&mut rx).await {
        UdpEvent::Sent(1) | UdpEvent::NotSent(1, Error::BadConfig(_)) => {}
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(matches!(next(&mut rx).await, UdpEvent::Sent(2)));
    assert_eq!(sock.info().pending_sends, 0);
}

#[tokio::test]
async fn test_multicast_delivery() {
    const GROUP: &str = "239.255.42.100";

    let (recorder, mut recv_rx) = UdpRecorder::new();
    let recv = UdpSocket::builder()
        .delegate(recorder)
        .ipv6_enabled(false)
        .build()
        .unwrap();
    recv.bind_to_port(0, None).await.unwrap();
    match recv.join_multicast_group(GROUP, None).await {
        Ok(()) => {}
        Err(Error::System(_)) => return,
        Err(e) => panic!("unexpected error: {}", e),
    }
    recv.begin_receiving().await.unwrap();
    let port = recv.local_port().unwrap();

    let (recorder, mut send_rx) = UdpRecorder::new();
    let send = UdpSocket::builder()
        .delegate(recorder)
        .ipv6_enabled(false)
        .build()
        .unwrap();
    send.send_to_host(&b"to the group"[..], GROUP, port, None, 1);
    match next(&mut send_rx).await {
        UdpEvent::Sent(1) => {}
        // no route for the group on this host
        UdpEvent::NotSent(1, Error::System(_)) => return,
        other => panic!("unexpected event: {:?}", other),
    }

    let (data, from, _) = expect_datagram(&mut recv_rx).await;
    assert_eq!(data, b"to the group");
    assert!(from.is_ipv4());
}

#[tokio::test]
async fn test_broadcast_needs_ipv4() {
    let (sock, _rx) = sender();
    sock.enable_broadcast(true).await.unwrap();

    let (recorder, _rx) = UdpRecorder::new();
    let v6_only = UdpSocket::builder()
        .delegate(recorder)
        .ipv4_enabled(false)
        .build()
        .unwrap();
    if common::ipv6_available() {
        assert!(matches!(
            v6_only.enable_broadcast(true).await,
            Err(Error::BadConfig(_))
        ));
    }
}

#[tokio::test]
async fn test_builder_rejects_both_families_disabled() {
    let err = UdpSocket::builder()
        .ipv4_enabled(false)
        .ipv6_enabled(false)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::BadConfig(_)));
}
