//! End-to-end tests for the resource manager

use peermit_manager::{
    Direction, Limit, LimitTable, MetricsReporter, Multiaddr, PeerId, ProtocolId, ResourceManager,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn ma(s: &str) -> Multiaddr {
    Multiaddr::parse(s).unwrap()
}

/// System allows 3 inbound conns / 2 fds, transient 1 conn / 1 fd, and peer
/// "A" 2 conns / 1 fd.
fn conn_move_table() -> LimitTable {
    let mut table = LimitTable::unlimited();
    table.system = Limit {
        memory: 16384,
        conns_in: 3,
        conns_out: 3,
        conns: 6,
        fd: 2,
        ..Limit::unlimited()
    };
    table.transient = Limit {
        memory: 4096,
        conns_in: 1,
        conns_out: 1,
        conns: 2,
        fd: 1,
        ..Limit::unlimited()
    };
    table.conn = Limit {
        memory: 4096,
        conns_in: 1,
        conns_out: 1,
        conns: 1,
        fd: 1,
        ..Limit::unlimited()
    };
    table.peer.insert(
        PeerId::from("A"),
        Limit {
            memory: 8192,
            conns_in: 2,
            conns_out: 2,
            conns: 4,
            fd: 1,
            ..Limit::unlimited()
        },
    );
    table
}

#[tokio::test]
async fn connection_moves_from_transient_to_peer() {
    let mgr = ResourceManager::new(conn_move_table()).unwrap();
    let peer_a = PeerId::from("A");
    let addr = ma("/ip4/1.2.3.4/tcp/1234");

    let conn1 = mgr
        .open_connection(Direction::Inbound, true, addr.clone())
        .unwrap();

    // the transient fd/conn budget is spent
    let err = mgr
        .open_connection(Direction::Inbound, true, addr.clone())
        .unwrap_err();
    assert!(err.is_limit_exceeded());

    // attaching to the peer frees the transient budget
    conn1.set_peer(&peer_a).unwrap();
    mgr.view_transient(|t| assert!(t.stat().is_empty()));

    let conn2 = mgr
        .open_connection(Direction::Inbound, true, addr.clone())
        .unwrap();

    // peer A's fd cap refuses the second descriptor, leaving conn2 where it
    // was
    let err = conn2.set_peer(&peer_a).unwrap_err();
    assert!(err.is_limit_exceeded());
    assert!(conn2.peer_scope().is_none());
    mgr.view_transient(|t| assert_eq!(t.stat().num_conns_in, 1));

    conn2.done();
    let conn3 = mgr
        .open_connection(Direction::Inbound, false, addr.clone())
        .unwrap();
    conn3.set_peer(&peer_a).unwrap();

    mgr.view_peer(&peer_a, |p| {
        let stat = p.stat();
        assert_eq!(stat.num_conns_in, 2);
        assert_eq!(stat.num_fd, 1);
    });
    mgr.view_system(|s| {
        assert_eq!(s.stat().num_conns_in, 2);
        assert_eq!(s.stat().num_fd, 1);
    });

    conn1.done();
    conn3.done();
    mgr.view_system(|s| assert!(s.stat().is_empty()));
    mgr.view_peer(&peer_a, |p| assert!(p.stat().is_empty()));

    mgr.close().await;
}

/// Service "svcA" accepts at most 2 inbound streams; a third stream stays
/// attached (and chargeable) on its protocol.
fn service_cap_table() -> LimitTable {
    let mut table = LimitTable::unlimited();
    table.service.insert(
        "svcA".to_string(),
        Limit {
            streams_in: 2,
            streams: 2,
            ..Limit::unlimited()
        },
    );
    table
}

#[tokio::test]
async fn service_cap_leaves_stream_on_protocol() {
    let mgr = ResourceManager::new(service_cap_table()).unwrap();
    let peer_a = PeerId::from("A");
    let proto_a = ProtocolId::from("/protoA/1.0.0");

    let s1 = mgr.open_stream(&peer_a, Direction::Inbound).unwrap();
    let s2 = mgr.open_stream(&peer_a, Direction::Inbound).unwrap();
    let s3 = mgr.open_stream(&peer_a, Direction::Inbound).unwrap();

    s1.set_protocol(&proto_a).unwrap();
    s2.set_protocol(&proto_a).unwrap();
    s3.set_protocol(&proto_a).unwrap();
    mgr.view_protocol(&proto_a, |p| assert_eq!(p.stat().num_streams_in, 3));
    mgr.view_transient(|t| assert!(t.stat().is_empty()));

    s1.set_service("svcA").unwrap();
    s2.set_service("svcA").unwrap();
    let err = s3.set_service("svcA").unwrap_err();
    assert!(err.is_limit_exceeded());

    // the failed move leaves s3 charged to the protocol
    assert!(s3.service_scope().is_none());
    assert!(s3.protocol_scope().is_some());
    mgr.view_service("svcA", |s| assert_eq!(s.stat().num_streams_in, 2));
    mgr.view_protocol(&proto_a, |p| assert_eq!(p.stat().num_streams_in, 1));

    // and it still accounts there
    s3.reserve_memory(1024).unwrap();
    mgr.view_protocol(&proto_a, |p| assert_eq!(p.stat().memory, 1024));
    mgr.view_service("svcA", |s| assert_eq!(s.stat().memory, 0));

    s1.done();
    s2.done();
    s3.done();
    mgr.view_system(|s| assert!(s.stat().is_empty()));

    mgr.close().await;
}

#[tokio::test]
async fn attachment_transitions_are_checked() {
    let mgr = ResourceManager::new(LimitTable::unlimited()).unwrap();
    let peer_a = PeerId::from("A");
    let proto_a = ProtocolId::from("/protoA/1.0.0");

    let stream = mgr.open_stream(&peer_a, Direction::Outbound).unwrap();

    // a service needs a protocol first
    let err = stream.set_service("svcA").unwrap_err();
    assert!(matches!(
        err,
        peermit_manager::Error::Resource(
            peermit_manager::ResourceError::InvalidTransition { .. }
        )
    ));

    stream.set_protocol(&proto_a).unwrap();
    let err = stream.set_protocol(&proto_a).unwrap_err();
    assert!(matches!(
        err,
        peermit_manager::Error::Resource(peermit_manager::ResourceError::AlreadyAttached { .. })
    ));

    stream.set_service("svcA").unwrap();
    let err = stream.set_service("svcA").unwrap_err();
    assert!(matches!(
        err,
        peermit_manager::Error::Resource(peermit_manager::ResourceError::AlreadyAttached { .. })
    ));

    let conn = mgr
        .open_connection(Direction::Outbound, false, ma("/ip4/8.8.8.8/tcp/4001"))
        .unwrap();
    conn.set_peer(&peer_a).unwrap();
    let err = conn.set_peer(&peer_a).unwrap_err();
    assert!(matches!(
        err,
        peermit_manager::Error::Resource(peermit_manager::ResourceError::AlreadyAttached { .. })
    ));

    stream.done();
    conn.done();
    mgr.close().await;
}

#[tokio::test]
async fn allowlisted_connections_use_their_own_tree() {
    // the default tree admits nothing, so only allowlisted remotes get in
    let mut table = LimitTable::unlimited();
    table.transient = Limit::block_all();

    let mgr = ResourceManager::builder(table)
        .with_allowlisted_multiaddrs(vec![
            ma("/ip4/1.2.3.0/ipcidr/24"),
            ma("/ip4/9.8.7.6/p2p/PeerA"),
        ])
        .build()
        .unwrap();

    let err = mgr
        .open_connection(Direction::Inbound, true, ma("/ip4/5.5.5.5/tcp/1"))
        .unwrap_err();
    assert!(err.is_limit_exceeded());

    // open network: any peer may attach
    let open = mgr
        .open_connection(Direction::Inbound, true, ma("/ip4/1.2.3.20/tcp/1"))
        .unwrap();
    assert!(open.is_allowlisted());
    open.set_peer(&PeerId::from("whoever")).unwrap();

    // gated network: only the listed peer may attach
    let gated = mgr
        .open_connection(Direction::Inbound, true, ma("/ip4/9.8.7.6/tcp/1"))
        .unwrap();
    assert!(gated.is_allowlisted());
    let err = gated.set_peer(&PeerId::from("PeerB")).unwrap_err();
    assert!(matches!(
        err,
        peermit_manager::Error::Resource(
            peermit_manager::ResourceError::AllowlistRejected { .. }
        )
    ));
    gated.set_peer(&PeerId::from("PeerA")).unwrap();

    // nothing ever touched the default tree
    mgr.view_system(|s| assert!(s.stat().is_empty()));
    mgr.view_transient(|t| assert!(t.stat().is_empty()));

    open.done();
    gated.done();
    mgr.close().await;
}

#[tokio::test]
async fn gc_reclaims_unused_scopes_only() {
    let mgr = ResourceManager::builder(LimitTable::unlimited())
        .with_gc_interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    let peer_a = PeerId::from("A");
    let peer_b = PeerId::from("B");
    let proto_a = ProtocolId::from("/protoA/1.0.0");

    let stream_a = mgr.open_stream(&peer_a, Direction::Inbound).unwrap();
    stream_a.set_protocol(&proto_a).unwrap();
    let scope_a = mgr.view_peer(&peer_a, Arc::clone);
    let scope_proto = mgr.view_protocol(&proto_a, Arc::clone);

    let _stream_b = mgr.open_stream(&peer_b, Direction::Inbound).unwrap();
    let scope_b = mgr.view_peer(&peer_b, Arc::clone);

    // everything still referenced; nothing is reclaimed
    mgr.collect_garbage();
    assert!(scope_a.reserve_memory(1).is_ok());
    scope_a.release_memory(1);
    assert!(scope_b.reserve_memory(1).is_ok());
    scope_b.release_memory(1);

    // peer A and the protocol lose their last leaf
    stream_a.done();
    mgr.collect_garbage();
    assert!(scope_a.reserve_memory(1).unwrap_err().is_scope_closed());
    // the protocol scope was still referenced by its per-peer sub-scope in
    // the first pass; the next pass reclaims it
    mgr.collect_garbage();
    assert!(scope_proto.reserve_memory(1).unwrap_err().is_scope_closed());
    // peer B still has a live stream
    assert!(scope_b.reserve_memory(1).is_ok());
    scope_b.release_memory(1);

    mgr.close().await;
}

#[tokio::test]
async fn view_reference_protects_from_gc() {
    let mgr = ResourceManager::builder(LimitTable::unlimited())
        .with_gc_interval(Duration::from_secs(3600))
        .build()
        .unwrap();

    let proto = ProtocolId::from("/protoA/1.0.0");
    mgr.view_protocol(&proto, |scope| {
        mgr.collect_garbage();
        assert!(scope.reserve_memory(1).is_ok());
        scope.release_memory(1);
    });

    mgr.close().await;
}

#[derive(Default)]
struct CountingReporter {
    allowed_conns: AtomicUsize,
    blocked_conns: AtomicUsize,
    allowed_streams: AtomicUsize,
    blocked_peers: AtomicUsize,
    allowed_memory: AtomicUsize,
    blocked_memory: AtomicUsize,
}

impl MetricsReporter for CountingReporter {
    fn allow_conn(&self, _dir: Direction, _use_fd: bool) {
        self.allowed_conns.fetch_add(1, Ordering::Relaxed);
    }

    fn block_conn(&self, _dir: Direction, _use_fd: bool) {
        self.blocked_conns.fetch_add(1, Ordering::Relaxed);
    }

    fn allow_stream(&self, _peer: &PeerId, _dir: Direction) {
        self.allowed_streams.fetch_add(1, Ordering::Relaxed);
    }

    fn block_peer(&self, _peer: &PeerId) {
        self.blocked_peers.fetch_add(1, Ordering::Relaxed);
    }

    fn allow_memory(&self, _size: i64) {
        self.allowed_memory.fetch_add(1, Ordering::Relaxed);
    }

    fn block_memory(&self, _size: i64) {
        self.blocked_memory.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::test]
async fn metrics_report_allows_and_blocks() {
    let reporter = Arc::new(CountingReporter::default());
    let mgr = ResourceManager::builder(conn_move_table())
        .with_metrics(reporter.clone())
        .build()
        .unwrap();
    let peer_a = PeerId::from("A");
    let addr = ma("/ip4/1.2.3.4/tcp/1234");

    let conn = mgr
        .open_connection(Direction::Inbound, true, addr.clone())
        .unwrap();
    let _ = mgr
        .open_connection(Direction::Inbound, true, addr.clone())
        .unwrap_err();
    assert_eq!(reporter.allowed_conns.load(Ordering::Relaxed), 1);
    assert_eq!(reporter.blocked_conns.load(Ordering::Relaxed), 1);

    conn.set_peer(&peer_a).unwrap();
    let stream = mgr.open_stream(&peer_a, Direction::Inbound).unwrap();
    assert_eq!(reporter.allowed_streams.load(Ordering::Relaxed), 1);

    conn.reserve_memory(1024).unwrap();
    assert!(conn.reserve_memory(1 << 40).is_err());
    assert!(reporter.allowed_memory.load(Ordering::Relaxed) >= 1);
    assert!(reporter.blocked_memory.load(Ordering::Relaxed) >= 1);

    stream.done();
    conn.done();
    mgr.close().await;
}

#[tokio::test]
async fn trace_file_records_the_lifecycle() {
    use flate2::read::GzDecoder;
    use std::io::{BufRead, BufReader};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peermit.trace.gz");

    let mgr = ResourceManager::builder(conn_move_table())
        .with_trace(&path)
        .build()
        .unwrap();
    let peer_a = PeerId::from("A");

    let conn = mgr
        .open_connection(Direction::Inbound, true, ma("/ip4/1.2.3.4/tcp/1234"))
        .unwrap();
    conn.set_peer(&peer_a).unwrap();
    conn.reserve_memory(2048).unwrap();
    conn.release_memory(2048);
    conn.done();
    mgr.close().await;

    let file = std::fs::File::open(&path).unwrap();
    let events: Vec<serde_json::Value> = BufReader::new(GzDecoder::new(file))
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect();

    assert_eq!(events[0]["Type"], "start");
    assert!(events[0]["Limit"].is_object());

    let types: Vec<&str> = events
        .iter()
        .map(|e| e["Type"].as_str().unwrap())
        .collect();
    assert!(types.contains(&"create_scope"));
    assert!(types.contains(&"add_conn"));
    assert!(types.contains(&"reserve_memory"));
    assert!(types.contains(&"release_memory"));
    assert!(types.contains(&"destroy_scope"));

    // every record is classified and timestamped
    for evt in &events {
        assert!(evt["Time"].as_str().unwrap().contains('T'));
        if let Some(scope) = evt.get("Scope") {
            assert!(scope["Class"].as_str().is_some());
        }
    }

    let conn_create = events
        .iter()
        .find(|e| e["Type"] == "create_scope" && e["Scope"]["Class"] == "conn")
        .unwrap();
    assert!(conn_create["Limit"].is_object());

    mgr.close().await;
}

#[tokio::test]
async fn transactions_roll_back_through_leaf_scopes() {
    let mgr = ResourceManager::new(conn_move_table()).unwrap();

    let conn = mgr
        .open_connection(Direction::Inbound, false, ma("/ip4/1.2.3.4/tcp/1"))
        .unwrap();

    let tx = conn.begin_transaction().unwrap();
    tx.reserve_memory(4096).unwrap();
    assert_eq!(conn.stat().memory, 4096);
    mgr.view_system(|s| assert_eq!(s.stat().memory, 4096));

    // the conn limit is shared with the transaction
    assert!(conn.reserve_memory(1).unwrap_err().is_limit_exceeded());

    tx.done();
    assert_eq!(conn.stat().memory, 0);
    mgr.view_system(|s| assert_eq!(s.stat().memory, 0));

    conn.done();
    mgr.close().await;
}

#[tokio::test]
async fn dropping_scopes_releases_their_charges() {
    let mgr = ResourceManager::new(conn_move_table()).unwrap();

    {
        let _conn = mgr
            .open_connection(Direction::Inbound, true, ma("/ip4/1.2.3.4/tcp/1"))
            .unwrap();
        mgr.view_system(|s| assert_eq!(s.stat().num_conns_in, 1));
    }
    mgr.view_system(|s| assert!(s.stat().is_empty()));
    mgr.view_transient(|t| assert!(t.stat().is_empty()));

    mgr.close().await;
}
