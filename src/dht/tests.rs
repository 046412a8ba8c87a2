use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use primitive_types::U256;

use crate::bencode::Value;
use crate::metadata::Descriptor;

use super::routing::{Bucket, BucketFull};
use super::*;

fn id_with_first_byte(byte: u8) -> Id {
    let mut bytes = [0u8; 20];
    bytes[0] = byte;
    bytes[19] = byte.wrapping_add(1);
    Id(bytes)
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn whole_space_bucket() -> Bucket {
    Bucket::new(U256::zero(), U256::one() << 160)
}

fn assert_tiles_whole_space(buckets: &[Bucket]) {
    assert_eq!(buckets[0].min, U256::zero());
    for pair in buckets.windows(2) {
        assert_eq!(pair[1].min, pair[0].max);
    }
    assert_eq!(buckets.last().unwrap().max, U256::one() << 160);
}

#[test]
fn test_id_generate_distinct() {
    assert_ne!(Id::generate(), Id::generate());
}

#[test]
fn test_id_from_bytes_rejects_bad_length() {
    assert!(Id::from_bytes(&[1u8; 19]).is_err());
    assert!(Id::from_bytes(&[1u8; 21]).is_err());
    assert!(Id::from_bytes(&[1u8; 20]).is_ok());
}

#[test]
fn test_id_distance() {
    let zero = Id([0u8; 20]);
    let ones = Id([0xFF; 20]);
    assert_eq!(zero.distance(&zero), U256::zero());
    assert_eq!(zero.distance(&ones), U256::MAX >> 96);
    assert_eq!(zero.distance(&ones), ones.distance(&zero));
}

#[test]
fn test_id_random_in_range() {
    let min = U256::from(1u32) << 100;
    let max = U256::from(3u32) << 100;
    for _ in 0..100 {
        let value = Id::random_in(min, max).to_u256();
        assert!(value >= min && value < max);
    }
}

#[test]
fn test_bucket_holds_k_then_overflows() {
    let mut bucket = whole_space_bucket();
    for i in 0..K {
        bucket
            .add(Node::new(id_with_first_byte(i as u8), addr(7000)), Touch::None)
            .unwrap();
        assert_eq!(bucket.nodes.len(), i + 1);
    }
    let overflow = Node::new(id_with_first_byte(0xAB), addr(7000));
    assert_eq!(bucket.add(overflow, Touch::None), Err(BucketFull));
    assert_eq!(bucket.nodes.len(), K);
}

#[test]
fn test_bucket_merges_known_id_instead_of_duplicating() {
    let mut bucket = whole_space_bucket();
    let id = id_with_first_byte(1);
    bucket.add(Node::new(id, addr(7000)), Touch::None).unwrap();
    bucket.add(Node::new(id, addr(7001)), Touch::Query).unwrap();

    assert_eq!(bucket.nodes.len(), 1);
    assert_eq!(bucket.nodes[0].addr, addr(7001));
}

#[test]
fn test_bucket_merges_even_when_full() {
    let mut bucket = whole_space_bucket();
    for i in 0..K {
        bucket
            .add(Node::new(id_with_first_byte(i as u8), addr(7000)), Touch::None)
            .unwrap();
    }
    let known = Node::new(id_with_first_byte(0), addr(7009));
    assert!(bucket.add(known, Touch::Reply).is_ok());
    assert_eq!(bucket.nodes.len(), K);
    assert!(bucket.nodes[0].replied);
    assert_eq!(bucket.nodes[0].addr, addr(7009));
}

#[test]
fn test_bucket_remove_bumps_timestamp_even_when_absent() {
    let mut bucket = whole_space_bucket();
    let before = bucket.last_changed;
    std::thread::sleep(Duration::from_millis(5));
    bucket.remove(&id_with_first_byte(9));
    assert!(bucket.last_changed > before);
}

#[test]
fn test_table_split_preserves_tiling_and_nodes() {
    let table = RoutingTable::new(Id([0u8; 20]));
    let spread: Vec<Id> = (0..9u8).map(|i| id_with_first_byte(i * 0x1C + 1)).collect();
    for (i, id) in spread.iter().enumerate() {
        table.insert(Node::new(*id, addr(7000 + i as u16)));
    }

    let buckets = table.snapshot();
    assert!(buckets.len() >= 2);
    assert_tiles_whole_space(&buckets);
    assert_eq!(table.node_count(), 9);
    for bucket in &buckets {
        for node in &bucket.nodes {
            assert!(bucket.covers(&node.id));
        }
    }
}

#[test]
fn test_table_only_splits_own_branch() {
    // own id sits at the bottom of the space; the top half may never grow
    // past one bucket
    let table = RoutingTable::new(Id([0u8; 20]));
    for i in 0..9 {
        let mut bytes = [0u8; 20];
        bytes[0] = 0x80 | i;
        bytes[19] = i;
        table.insert(Node::new(Id(bytes), addr(7100 + i as u16)));
    }

    // the ninth high node forced one split, then got dropped
    assert_eq!(table.node_count(), 8);
    assert_eq!(table.snapshot().len(), 2);

    // the half covering our own id still has room
    table.insert(Node::new(id_with_first_byte(0x01), addr(7200)));
    assert_eq!(table.node_count(), 9);
}

#[test]
fn test_table_never_holds_own_id() {
    let own = Id::generate();
    let table = RoutingTable::new(own);
    table.insert(Node::new(own, addr(7000)));
    assert!(table.is_empty());
    assert_eq!(table.node_count(), 0);
}

#[test]
fn test_nearest_sorted_bounded_and_from_table() {
    let table = RoutingTable::new(id_with_first_byte(0xFE));
    let mut inserted = Vec::new();
    for i in 0..20u8 {
        let id = id_with_first_byte(i * 3);
        inserted.push(id);
        table.insert(Node::new(id, addr(7000 + i as u16)));
    }

    let target = id_with_first_byte(0x1F);
    let nearest = table.nearest(&target);
    assert!(nearest.len() <= K);
    for pair in nearest.windows(2) {
        assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
    }
    for node in &nearest {
        assert!(inserted.contains(&node.id));
    }
}

#[test]
fn test_nearest_on_empty_table() {
    let table = RoutingTable::new(Id::generate());
    assert!(table.nearest(&Id::generate()).is_empty());
}

#[test]
fn test_token_reused_within_window() {
    let mut node = Node::new(Id::generate(), addr(7000));
    let first = node.grant_token();
    let second = node.grant_token();
    assert_eq!(first, second);
    assert_eq!(node.tokens.len(), 1);
}

#[test]
fn test_token_not_reused_after_window() {
    let mut node = Node::new(Id::generate(), addr(7000));
    let first = node.grant_token();
    node.tokens[0].issued_at = Instant::now() - Duration::from_secs(6 * 60);
    let second = node.grant_token();
    assert_ne!(first, second);
}

#[test]
fn test_token_not_accepted_after_lifetime() {
    let mut node = Node::new(Id::generate(), addr(7000));
    let token = node.grant_token();
    assert!(node.accepts_token(&token));
    node.tokens[0].issued_at = Instant::now() - Duration::from_secs(11 * 60);
    assert!(!node.accepts_token(&token));
}

#[test]
fn test_expired_tokens_pruned_from_tail() {
    let mut node = Node::new(Id::generate(), addr(7000));
    node.grant_token();
    node.tokens[0].issued_at = Instant::now() - Duration::from_secs(11 * 60);
    node.grant_token();
    assert_eq!(node.tokens.len(), 1);
}

#[test]
fn test_krpc_query_round_trip() {
    let tid = KrpcMessage::new_tid();
    assert_eq!(tid.len(), 4);
    let mut args = BTreeMap::new();
    args.insert(Bytes::from_static(b"id"), Value::Bytes(Bytes::from_static(&[7u8; 20])));
    let wire = KrpcMessage::Query {
        tid: tid.clone(),
        method: "ping".into(),
        args,
    }
    .to_bytes();

    match KrpcMessage::from_bytes(&wire).unwrap() {
        KrpcMessage::Query { tid: t, method, args } => {
            assert_eq!(t, tid);
            assert_eq!(method, "ping");
            assert!(args.contains_key(b"id".as_slice()));
        }
        other => panic!("expected query, got {:?}", other),
    }
}

#[test]
fn test_krpc_error_round_trip() {
    let wire = KrpcMessage::Error {
        tid: Bytes::from_static(b"aa"),
        code: 201,
        message: "oops".into(),
    }
    .to_bytes();

    match KrpcMessage::from_bytes(&wire).unwrap() {
        KrpcMessage::Error { code, message, .. } => {
            assert_eq!(code, 201);
            assert_eq!(message, "oops");
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn test_krpc_rejects_malformed_envelopes() {
    assert!(KrpcMessage::from_bytes(b"garbage").is_err());
    // missing transaction id
    assert!(KrpcMessage::from_bytes(b"d1:y1:qe").is_err());
    // unknown tag
    assert!(KrpcMessage::from_bytes(b"d1:t2:aa1:y1:xe").is_err());
}

#[test]
fn test_query_decode_full_circle() {
    let tracker = QueryTracker::new();
    let msg = DhtMessage::AnnouncePeerQuery {
        tid: Bytes::from_static(b"ab12"),
        id: id_with_first_byte(3),
        info_hash: id_with_first_byte(9),
        port: 6881,
        token: Bytes::from_static(b"tok!"),
    };
    let wire = msg.to_krpc().to_bytes();
    let decoded =
        DhtMessage::from_krpc(KrpcMessage::from_bytes(&wire).unwrap(), &tracker).unwrap();
    match decoded {
        DhtMessage::AnnouncePeerQuery {
            info_hash,
            port,
            token,
            ..
        } => {
            assert_eq!(info_hash, id_with_first_byte(9));
            assert_eq!(port, 6881);
            assert_eq!(token.as_ref(), b"tok!");
        }
        other => panic!("expected announce_peer, got {:?}", other),
    }
}

#[test]
fn test_unknown_query_method_fails() {
    let tracker = QueryTracker::new();
    let mut args = BTreeMap::new();
    args.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(&[1u8; 20])),
    );
    let msg = KrpcMessage::Query {
        tid: Bytes::from_static(b"aa"),
        method: "gossip".into(),
        args,
    };
    assert!(matches!(
        DhtMessage::from_krpc(msg, &tracker),
        Err(DhtError::UnknownMethod(name)) if name == "gossip"
    ));
}

#[test]
fn test_unknown_fault_code_fails() {
    let tracker = QueryTracker::new();
    let msg = KrpcMessage::Error {
        tid: Bytes::from_static(b"aa"),
        code: 299,
        message: "?".into(),
    };
    assert!(matches!(
        DhtMessage::from_krpc(msg, &tracker),
        Err(DhtError::UnknownFaultCode(299))
    ));
}

#[test]
fn test_fault_codes_map_to_kinds() {
    let tracker = QueryTracker::new();
    for (code, kind) in [
        (201, FaultKind::Generic),
        (202, FaultKind::Server),
        (203, FaultKind::Protocol),
        (204, FaultKind::UnknownMethod),
    ] {
        let msg = KrpcMessage::Error {
            tid: Bytes::from_static(b"aa"),
            code,
            message: String::new(),
        };
        match DhtMessage::from_krpc(msg, &tracker).unwrap() {
            DhtMessage::Fault { kind: decoded, .. } => assert_eq!(decoded, kind),
            other => panic!("expected fault, got {:?}", other),
        }
        assert_eq!(kind.code(), code);
    }
}

#[test]
fn test_reply_without_pending_record_fails() {
    let tracker = QueryTracker::new();
    let mut values = BTreeMap::new();
    values.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(&[1u8; 20])),
    );
    let msg = KrpcMessage::Response {
        tid: Bytes::from_static(b"zz"),
        values,
    };
    assert!(matches!(
        DhtMessage::from_krpc(msg, &tracker),
        Err(DhtError::UnmatchedReply)
    ));
}

#[test]
fn test_reply_typed_by_pending_method() {
    // a find_node reply decodes the packed nodes field, even when the
    // response also carries a values list
    let tracker = QueryTracker::new();
    let tid = Bytes::from_static(b"fn01");
    tracker.record(tid.clone(), QueryMethod::FindNode);

    let record = CompactNode {
        id: id_with_first_byte(5),
        addr: SocketAddrV4::new(Ipv4Addr::new(9, 9, 9, 9), 6881),
    }
    .to_record();
    let mut values = BTreeMap::new();
    values.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(&[1u8; 20])),
    );
    values.insert(
        Bytes::from_static(b"nodes"),
        Value::Bytes(Bytes::copy_from_slice(&record)),
    );
    values.insert(
        Bytes::from_static(b"values"),
        Value::List(vec![Value::Bytes(Bytes::from_static(&[1, 2, 3, 4, 26, 225]))]),
    );

    let msg = KrpcMessage::Response { tid, values };
    match DhtMessage::from_krpc(msg, &tracker).unwrap() {
        DhtMessage::FindNodeReply { nodes, .. } => {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].id, id_with_first_byte(5));
            assert_eq!(nodes[0].addr.port(), 6881);
        }
        other => panic!("expected find_node reply, got {:?}", other),
    }
    assert!(tracker.is_empty());
}

#[test]
fn test_truncated_node_records_fail() {
    let tracker = QueryTracker::new();
    let tid = Bytes::from_static(b"fn02");
    tracker.record(tid.clone(), QueryMethod::FindNode);

    let mut values = BTreeMap::new();
    values.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(&[1u8; 20])),
    );
    values.insert(
        Bytes::from_static(b"nodes"),
        Value::Bytes(Bytes::copy_from_slice(&[0u8; 27])),
    );

    let msg = KrpcMessage::Response { tid, values };
    assert!(matches!(
        DhtMessage::from_krpc(msg, &tracker),
        Err(DhtError::TruncatedRecords { kind: "node", len: 27 })
    ));
}

#[test]
fn test_get_peers_reply_decodes_single_peer() {
    let tracker = QueryTracker::new();
    let tid = Bytes::from_static(b"gp01");
    tracker.record(tid.clone(), QueryMethod::GetPeers);

    let mut values = BTreeMap::new();
    values.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(&[1u8; 20])),
    );
    values.insert(Bytes::from_static(b"token"), Value::string("tk"));
    values.insert(
        Bytes::from_static(b"values"),
        Value::List(vec![Value::Bytes(Bytes::from_static(&[1, 2, 3, 4, 0x1A, 0xE1]))]),
    );

    let msg = KrpcMessage::Response { tid, values };
    match DhtMessage::from_krpc(msg, &tracker).unwrap() {
        DhtMessage::GetPeersReply { peers, .. } => {
            let peers = peers.unwrap();
            assert_eq!(peers, vec![SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881)]);
        }
        other => panic!("expected get_peers reply, got {:?}", other),
    }
}

#[test]
fn test_get_peers_reply_without_token_fails() {
    let tracker = QueryTracker::new();
    let tid = Bytes::from_static(b"gp02");
    tracker.record(tid.clone(), QueryMethod::GetPeers);

    let mut values = BTreeMap::new();
    values.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(&[1u8; 20])),
    );
    values.insert(
        Bytes::from_static(b"nodes"),
        Value::Bytes(Bytes::new()),
    );
    let msg = KrpcMessage::Response { tid, values };
    assert!(DhtMessage::from_krpc(msg, &tracker).is_err());
}

#[test]
fn test_tracker_sweep_keeps_fresh_records() {
    let tracker = QueryTracker::new();
    tracker.record(Bytes::from_static(b"aaaa"), QueryMethod::Ping);
    tracker.sweep();
    assert_eq!(tracker.len(), 1);
}

#[derive(Default)]
struct RecordingListener {
    lookups: Mutex<Vec<Id>>,
    announces: Mutex<Vec<Id>>,
    pursue: bool,
}

impl CrawlerListener for RecordingListener {
    fn on_peer_lookup(&self, info_hash: &Id) {
        self.lookups.lock().push(*info_hash);
    }

    fn on_announce(&self, info_hash: &Id) -> bool {
        self.announces.lock().push(*info_hash);
        self.pursue
    }

    fn on_metadata(&self, _info_hash: &Id, _descriptor: &Descriptor) {}
}

async fn peer_socket() -> (tokio::net::UdpSocket, SocketAddr) {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = socket.local_addr().unwrap();
    (socket, local)
}

async fn recv_envelope(socket: &tokio::net::UdpSocket) -> KrpcMessage {
    let mut buf = vec![0u8; 65536];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    KrpcMessage::from_bytes(&buf[..len]).unwrap()
}

#[tokio::test]
async fn test_ping_round_trip() {
    let listener = Arc::new(RecordingListener::default());
    let crawler = Crawler::start("127.0.0.1", 0, listener).await.unwrap();
    let crawler_addr = crawler.local_addr().unwrap();
    let (peer, _) = peer_socket().await;

    let ping = DhtMessage::PingQuery {
        tid: Bytes::from_static(b"pg01"),
        id: id_with_first_byte(0x42),
    };
    peer.send_to(&ping.to_krpc().to_bytes(), crawler_addr)
        .await
        .unwrap();

    match recv_envelope(&peer).await {
        KrpcMessage::Response { tid, values } => {
            assert_eq!(tid.as_ref(), b"pg01");
            let responder = values.get(b"id".as_slice()).and_then(|v| v.as_bytes()).unwrap();
            assert_eq!(responder.as_ref(), crawler.own_id().as_bytes());
        }
        other => panic!("expected a reply, got {:?}", other),
    }

    // the sender was folded into the routing table
    assert_eq!(crawler.table().node_count(), 1);
    crawler.stop().await;
}

#[tokio::test]
async fn test_get_peers_token_reused_across_requests() {
    let listener = Arc::new(RecordingListener::default());
    let crawler = Crawler::start("127.0.0.1", 0, Arc::clone(&listener) as Arc<dyn CrawlerListener>)
        .await
        .unwrap();
    let crawler_addr = crawler.local_addr().unwrap();
    let (peer, _) = peer_socket().await;

    let info_hash = id_with_first_byte(0x77);
    let mut tokens = Vec::new();
    for tid in [b"gp10", b"gp11"] {
        let query = DhtMessage::GetPeersQuery {
            tid: Bytes::copy_from_slice(tid),
            id: id_with_first_byte(0x42),
            info_hash,
        };
        peer.send_to(&query.to_krpc().to_bytes(), crawler_addr)
            .await
            .unwrap();
        match recv_envelope(&peer).await {
            KrpcMessage::Response { values, .. } => {
                tokens.push(values.get(b"token".as_slice()).and_then(|v| v.as_bytes()).cloned().unwrap());
            }
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    assert_eq!(tokens[0], tokens[1]);
    assert_eq!(listener.lookups.lock().as_slice(), &[info_hash, info_hash]);
    crawler.stop().await;
}

#[tokio::test]
async fn test_announce_is_not_gated_on_token() {
    // announcements are acted on without checking the token against the
    // ones we issued; tokens are bookkeeping only for now
    let listener = Arc::new(RecordingListener::default());
    let crawler = Crawler::start("127.0.0.1", 0, Arc::clone(&listener) as Arc<dyn CrawlerListener>)
        .await
        .unwrap();
    let crawler_addr = crawler.local_addr().unwrap();
    let (peer, _) = peer_socket().await;

    let info_hash = id_with_first_byte(0x99);
    let announce = DhtMessage::AnnouncePeerQuery {
        tid: Bytes::from_static(b"an01"),
        id: id_with_first_byte(0x42),
        info_hash,
        port: 6881,
        token: Bytes::from_static(b"not-a-token-we-issued"),
    };
    peer.send_to(&announce.to_krpc().to_bytes(), crawler_addr)
        .await
        .unwrap();

    match recv_envelope(&peer).await {
        KrpcMessage::Response { tid, .. } => assert_eq!(tid.as_ref(), b"an01"),
        other => panic!("expected an ack, got {:?}", other),
    }
    assert_eq!(listener.announces.lock().as_slice(), &[info_hash]);
    crawler.stop().await;
}

#[tokio::test]
async fn test_discovery_reply_splits_table() {
    let listener = Arc::new(RecordingListener::default());
    let crawler = Crawler::start("127.0.0.1", 0, listener).await.unwrap();
    let crawler_addr = crawler.local_addr().unwrap();
    let (peer, peer_addr) = peer_socket().await;

    // seed the table with the fake peer so the maintenance pass queries it
    let peer_id = id_with_first_byte(0x55);
    crawler.table().insert(Node::new(peer_id, peer_addr));

    // wait for the crawler's own-id lookup to reach us
    let tid = loop {
        match recv_envelope(&peer).await {
            KrpcMessage::Query { tid, method, .. } if method == "find_node" => break tid,
            _ => continue,
        }
    };

    // answer with eight nodes spread across both halves of the id space
    let spread: Vec<CompactNode> = (0..8u8)
        .map(|i| CompactNode {
            id: id_with_first_byte(i * 0x20 + 2),
            addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 21000 + i as u16),
        })
        .collect();
    let reply = DhtMessage::FindNodeReply {
        tid,
        id: peer_id,
        nodes: spread.clone(),
    };
    peer.send_to(&reply.to_krpc().to_bytes(), crawler_addr)
        .await
        .unwrap();

    // nine nodes force at least one split
    let deadline = Instant::now() + Duration::from_secs(5);
    while crawler.table().node_count() < 9 {
        assert!(Instant::now() < deadline, "table never absorbed the reply");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let buckets = crawler.table().snapshot();
    assert!(buckets.len() >= 2);
    assert_tiles_whole_space(&buckets);
    for node in &spread {
        let nearest = crawler.table().nearest(&node.id);
        assert!(nearest.iter().any(|n| n.id == node.id));
    }
    crawler.stop().await;
}
