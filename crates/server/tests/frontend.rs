use reputation::Mutation;
use server::{Frontend, MutationSink, ServerOutcome};
use std::sync::{Arc, Mutex};
use store::{Options, Store};
use tokio::net::UdpSocket;
use tokio::sync::watch;

#[derive(Clone, Default)]
struct Collected(Arc<Mutex<Vec<Mutation>>>);

impl MutationSink for Collected {
    fn submit(&self, mutation: Mutation) -> bool {
        self.0.lock().unwrap().push(mutation);
        true
    }
}

const DIGEST: &str = "00112233445566778899aabbccddeeff00112233";

#[tokio::test]
async fn test_serves_datagrams_until_upstream_down() {
    let dir = tempfile::tempdir().unwrap();
    drop(Store::open(dir.path(), &Options::default()).unwrap());
    let store = Store::open_read_only(dir.path(), &Options::default()).unwrap();

    let sink = Collected::default();
    let mut frontend = Frontend::new(store, sink.clone());

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (up_tx, up_rx) = watch::channel(true);

    let serve = tokio::spawn(async move { frontend.serve(socket, up_rx).await });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(addr).await.unwrap();

    // A ping answers 200 with the caller's thread.
    client
        .send(b"Op: ping\nPV: 2.0\nThread: 321\nTime: 99\n")
        .await
        .unwrap();
    let mut buffer = [0u8; server::MAX_PACKET_SIZE];
    let n = client.recv(&mut buffer).await.unwrap();
    let reply = server::Packet::decode(&buffer[..n]);
    assert_eq!(reply.get("Code"), Some("200"));
    assert_eq!(reply.get("Thread"), Some("321"));

    // A report is answered immediately and queued for the upstream.
    client
        .send(
            format!("Op: report\nOp-Digest: {DIGEST}\nPV: 2.0\nThread: 322\nTime: 99\n").as_bytes(),
        )
        .await
        .unwrap();
    let n = client.recv(&mut buffer).await.unwrap();
    assert_eq!(server::Packet::decode(&buffer[..n]).get("Code"), Some("200"));
    assert_eq!(sink.0.lock().unwrap().len(), 1);

    // Losing the upstream unbinds the listener.
    up_tx.send(false).unwrap();
    let outcome = serve.await.unwrap().unwrap();
    assert_eq!(outcome, ServerOutcome::UpstreamDown);
}
