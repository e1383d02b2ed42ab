use relay::{master, Config, Forwarder};
use reputation::{Digest, Kind, Mutation};
use std::time::Duration;
use store::{Options, Store};
use tokio::net::TcpListener;

fn fast_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(50),
        read_idle_timeout: Duration::from_millis(500),
        reconnect_delay: Duration::from_millis(50),
        bootstrap_retry: Duration::from_millis(50),
    }
}

fn digest(i: u8) -> Digest {
    Digest([i; 20])
}

/// Poll `predicate` against a read-only view of the store until it holds.
async fn wait_for(home: &std::path::Path, mut predicate: impl FnMut(&Store) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(view) = Store::open_read_only(home, &Options::default()) {
            if predicate(&view) {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for store state"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_forwarder_buffers_while_down_and_drains_fifo() {
    let master_home = tempfile::tempdir().unwrap();
    let config = fast_config();

    // Reserve an address, then close it so the master is "down".
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let forwarder = Forwarder::spawn(addr, config.clone());
    let mut up = forwarder.up();
    assert!(!*up.borrow());

    // Five reports arrive while the upstream is unreachable.
    for t in 1..=5u32 {
        assert!(forwarder.enqueue(Mutation::new(digest(7), Kind::Report, 1000 + t)));
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!*up.borrow());

    // The master comes up at the same address.
    let store = Store::open(master_home.path(), &Options::default()).unwrap();
    let pipeline = master::Pipeline::spawn(store);
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(master::serve_forwarding(
        listener,
        pipeline.clone(),
        config.clone(),
    ));

    up.wait_for(|up| *up).await.unwrap();

    wait_for(master_home.path(), |view| {
        view.get(&digest(7))
            .unwrap()
            .map_or(false, |r| r.report_count == 5)
    })
    .await;

    // All five mutations landed in order: the final timestamps win.
    let view = Store::open_read_only(master_home.path(), &Options::default()).unwrap();
    let record = view.get(&digest(7)).unwrap().unwrap();
    assert_eq!(record.entered, 1001);
    assert_eq!(record.updated, 1005);
}

#[tokio::test]
async fn test_local_front_end_sessions_relay_upstream() {
    use reputation::Frame;
    use tokio::io::AsyncWriteExt;

    let master_home = tempfile::tempdir().unwrap();
    let config = fast_config();

    let store = Store::open(master_home.path(), &Options::default()).unwrap();
    let pipeline = master::Pipeline::spawn(store);
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(master::serve_forwarding(
        upstream,
        pipeline.clone(),
        config.clone(),
    ));

    let forwarder = std::sync::Arc::new(Forwarder::spawn(upstream_addr, config.clone()));
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();
    tokio::spawn(relay::slave::serve_local(local, forwarder, config.clone()));

    // A front-end process streams frames over the loopback channel.
    let mut client = tokio::net::TcpStream::connect(local_addr).await.unwrap();
    let mut buf = Vec::new();
    Frame::Heartbeat.encode(&mut buf);
    Frame::Mutation(Mutation::new(digest(3), Kind::Report, 700)).encode(&mut buf);
    Frame::Mutation(Mutation::new(digest(3), Kind::Whitelist, 800)).encode(&mut buf);
    client.write_all(&buf).await.unwrap();

    wait_for(master_home.path(), |view| {
        view.get(&digest(3))
            .unwrap()
            .map_or(false, |r| r.report_count == 1 && r.whitelist_count == 1)
    })
    .await;
}

#[tokio::test]
async fn test_replication_streams_backlog_then_live_commits() {
    let master_home = tempfile::tempdir().unwrap();
    let follower_home = tempfile::tempdir().unwrap();
    let config = fast_config();

    let store = Store::open(master_home.path(), &Options::default()).unwrap();
    let pipeline = master::Pipeline::spawn(store);

    // Three commits land before any follower exists.
    for i in 1..=3u8 {
        pipeline
            .mutate(Mutation::new(digest(i), Kind::Report, 2000 + i as u32))
            .await
            .unwrap();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(master::serve_replication(
        listener,
        pipeline.clone(),
        master_home.path().to_owned(),
        Options::default(),
        config.clone(),
    ));

    let applier = relay::Applier::spawn(
        addr,
        follower_home.path().to_owned(),
        Options::default(),
        config.clone(),
    );
    let mut up = applier.up();
    up.wait_for(|up| *up).await.unwrap();

    // The backlog reaches the follower.
    wait_for(follower_home.path(), |view| {
        (1..=3u8).all(|i| view.lookup_active(&digest(i)).unwrap().is_some())
    })
    .await;

    // Live commits follow, including a whitelist on an existing digest.
    pipeline
        .mutate(Mutation::new(digest(2), Kind::Whitelist, 2100))
        .await
        .unwrap();
    pipeline
        .mutate(Mutation::new(digest(9), Kind::Report, 2200))
        .await
        .unwrap();

    wait_for(follower_home.path(), |view| {
        let whitelisted = view
            .get(&digest(2))
            .unwrap()
            .map_or(false, |r| r.whitelist_count == 1 && r.report_count == 1);
        whitelisted && view.lookup_active(&digest(9)).unwrap().is_some()
    })
    .await;

    // The follower is a replica, not a divergent copy.
    let master_view = Store::open_read_only(master_home.path(), &Options::default()).unwrap();
    let follower_view = Store::open_read_only(follower_home.path(), &Options::default()).unwrap();
    assert_eq!(
        master_view.get(&digest(2)).unwrap(),
        follower_view.get(&digest(2)).unwrap()
    );
}
