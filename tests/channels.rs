//! Channels, host registry and broadcast over live connections

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use futures::StreamExt;
use tokio::io::DuplexStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use websocket_channels::core::assembler::Incoming;
use websocket_channels::core::close::parse_close_payload;
use websocket_channels::core::frame::OpCode;
use websocket_channels::{
    Broadcaster, ChannelEvent, Connection, EngineConfig, Host, HostEvent, Message, UpgradeRequest,
    WebSocketCodec,
};

const WAIT: Duration = Duration::from_secs(2);

type Peer = Framed<DuplexStream, WebSocketCodec>;

fn attach(host: &Host, path: &str) -> (Connection, Peer) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let conn = host
        .accept(server_io, UpgradeRequest::new(path).with_header("X-Room", "blue"))
        .expect("accept");
    (conn, Framed::new(client_io, WebSocketCodec::client(1 << 20)))
}

async fn next_text(peer: &mut Peer) -> String {
    match timeout(WAIT, peer.next()).await.unwrap().unwrap().unwrap() {
        Incoming::Text(text) => text,
        other => panic!("unexpected {:?}", other),
    }
}

async fn nothing_arrives(peer: &mut Peer) -> bool {
    timeout(Duration::from_millis(100), peer.next()).await.is_err()
}

fn keep_channels() -> EngineConfig {
    EngineConfig::default_with_overrides(|c| c.channel.close_when_empty = false)
}

#[tokio::test]
async fn test_filtered_broadcast() {
    let host = Host::new(keep_channels());
    let (a, mut peer_a) = attach(&host, "/a");
    let (b, mut peer_b) = attach(&host, "/b");
    let (c, mut peer_c) = attach(&host, "/c");

    let room = host.channel("room");
    for conn in [&a, &b, &c] {
        assert!(room.bind(conn.handle()));
    }
    let mut events = room.subscribe();

    let report = room
        .broadcast_filtered("hello", |conn| conn.request().path != "/b")
        .unwrap();
    assert_eq!(report.recipients, 2);
    assert_eq!(report.delivered, 2);

    assert_eq!(next_text(&mut peer_a).await, "hello");
    assert_eq!(next_text(&mut peer_c).await, "hello");
    assert!(nothing_arrives(&mut peer_b).await);

    // Exactly one aggregate notification, carrying the unfiltered message.
    assert!(matches!(events.try_recv(), Ok(ChannelEvent::Broadcast(Message::Text(t))) if t == "hello"));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_broadcast_except_sender() {
    let host = Host::new(keep_channels());
    let (a, mut peer_a) = attach(&host, "/");
    let (b, mut peer_b) = attach(&host, "/");

    let room = host.channel("room");
    room.bind(a.handle());
    room.bind(b.handle());

    room.broadcast_except("from a", a.id()).unwrap();
    assert_eq!(next_text(&mut peer_b).await, "from a");
    assert!(nothing_arrives(&mut peer_a).await);
}

#[tokio::test]
async fn test_channel_close_tears_down_membership() {
    let host = Host::new(keep_channels());
    let (a, _peer_a) = attach(&host, "/");
    let (b, _peer_b) = attach(&host, "/");

    let room = host.channel("room");
    let lobby = host.channel("lobby");
    room.bind(a.handle());
    room.bind(b.handle());
    lobby.bind(a.handle());
    let mut events = room.subscribe();

    room.close();

    assert!(a.handle().channels() == vec!["lobby".to_string()]);
    assert!(b.handle().channels().is_empty());
    assert!(host.get_channel("room").is_none());
    assert!(host.get_channel("lobby").is_some());

    let mut unbinds = 0;
    loop {
        match events.try_recv() {
            Ok(ChannelEvent::Unbind(_)) => unbinds += 1,
            Ok(ChannelEvent::Close) => break,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(unbinds, 2);
}

#[tokio::test]
async fn test_lazy_channel_with_filter() {
    let host = Host::new(keep_channels());
    let (a, _pa) = attach(&host, "/blue");
    let (b, _pb) = attach(&host, "/red");

    let blue = host.channel_with("blue", |conn| conn.request().path == "/blue");
    assert!(blue.contains(a.id()));
    assert!(!blue.contains(b.id()));

    // The filter only applies when the channel is created.
    let again = host.channel_with("blue", |_| true);
    assert_eq!(again.len(), 1);
}

#[tokio::test]
async fn test_empty_channel_closes_itself_by_default() {
    let host = Host::default();
    let (a, _pa) = attach(&host, "/");

    let room = host.channel("room");
    room.bind(a.handle());
    room.unbind(a.handle());

    assert!(room.is_closed());
    assert!(host.get_channel("room").is_none());
    assert!(!room.bind(a.handle()));
}

#[tokio::test]
async fn test_closed_connection_is_never_selected() {
    let host = Host::new(keep_channels());
    let (a, _pa) = attach(&host, "/");
    let (b, mut peer_b) = attach(&host, "/");
    let room = host.channel("room");
    room.bind(a.handle());
    room.bind(b.handle());

    a.handle().close(Some(1000), "");
    let report = room.broadcast("after close").unwrap();

    assert_eq!(report.recipients, 1);
    assert_eq!(next_text(&mut peer_b).await, "after close");
}

#[tokio::test]
async fn test_slow_member_does_not_block_others() {
    let host = Host::new(EngineConfig::default_with_overrides(|c| {
        c.connection.outbound_queue = 1;
        c.channel.close_when_empty = false;
    }));
    // Tiny pipe: the slow peer never reads, so its driver stalls on write.
    let (server_io, _slow_client) = tokio::io::duplex(16);
    let slow = host.accept(server_io, UpgradeRequest::new("/slow")).unwrap();
    let (fast, mut peer_fast) = attach(&host, "/fast");

    let room = host.channel("room");
    room.bind(slow.handle());
    room.bind(fast.handle());

    let mut dropped = 0;
    for i in 0..20 {
        let report = room.broadcast(format!("tick-{i}")).unwrap();
        dropped += report.dropped;
        assert_eq!(next_text(&mut peer_fast).await, format!("tick-{i}"));
    }
    assert!(dropped > 0);
}

#[tokio::test]
async fn test_host_broadcast_and_events() {
    let host = Host::default();
    let mut events = host.subscribe();
    let (a, mut peer_a) = attach(&host, "/");
    let (_b, mut peer_b) = attach(&host, "/");

    let report = host.broadcast("everyone").unwrap();
    assert_eq!(report.recipients, 2);
    assert_eq!(next_text(&mut peer_a).await, "everyone");
    assert_eq!(next_text(&mut peer_b).await, "everyone");

    assert!(matches!(events.try_recv(), Ok(HostEvent::Connected(id)) if id == a.id()));
    assert!(matches!(events.try_recv(), Ok(HostEvent::Connected(_))));
    assert!(matches!(events.try_recv(), Ok(HostEvent::Broadcast(_))));
}

#[tokio::test]
async fn test_close_all_drains_host() {
    let host = Host::default();
    let (_a, mut peer_a) = attach(&host, "/");
    let (_b, mut peer_b) = attach(&host, "/");

    host.close_all(1001, "maintenance");
    assert!(host.is_empty());

    for peer in [&mut peer_a, &mut peer_b] {
        match timeout(WAIT, peer.next()).await.unwrap() {
            Some(Ok(Incoming::Control(frame))) if frame.opcode == OpCode::Close => {
                let close = parse_close_payload(&frame.payload).unwrap().unwrap();
                assert_eq!(close.code, 1001);
                assert_eq!(close.reason, "maintenance");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    // Peers never answer; drivers give up after the close timeout.
    drop(peer_a);
    drop(peer_b);
    assert!(host.wait_idle(WAIT).await);
}

#[tokio::test]
async fn test_channel_refuses_connections_from_other_hosts() {
    let home = Host::new(keep_channels());
    let other = Host::new(keep_channels());
    let (foreign, _pf) = attach(&other, "/");

    let (server_io, _client_io) = tokio::io::duplex(1024);
    let standalone = Connection::standalone(
        server_io,
        UpgradeRequest::new("/"),
        &EngineConfig::default().connection,
    );

    let room = home.channel("room");
    assert!(!room.bind(foreign.handle()));
    assert!(!room.bind(standalone.handle()));
    assert!(room.is_empty());
    assert!(foreign.handle().channels().is_empty());
    assert!(standalone.handle().channels().is_empty());

    // A local member still leaves the channel completely when it closes.
    let (local, _pl) = attach(&home, "/");
    assert!(room.bind(local.handle()));
    local.handle().close(Some(1000), "");
    assert!(!room.contains(local.id()));
    assert!(room.is_empty());
}
