use crate::packet::{Packet, MAX_PACKET_SIZE};
use reputation::{unix_time, Digest, Kind, Mutation, StatisticsRing};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use store::Store;
use tokio::net::UdpSocket;

/// Where accepted report/whitelist mutations go. The slave front-end
/// plugs in its upstream forwarder; tests plug in a buffer.
pub trait MutationSink {
    /// Returns false when the sink is gone and the mutation was dropped.
    fn submit(&self, mutation: Mutation) -> bool;
}

impl MutationSink for relay::Forwarder {
    fn submit(&self, mutation: Mutation) -> bool {
        self.enqueue(mutation)
    }
}

impl<S: MutationSink> MutationSink for std::sync::Arc<S> {
    fn submit(&self, mutation: Mutation) -> bool {
        (**self).submit(mutation)
    }
}

/// Why the serve loop returned.
#[derive(Debug, PartialEq)]
pub enum ServerOutcome {
    /// An authorized shutdown request arrived.
    Shutdown,
    /// The upstream went down and the socket should be unbound.
    UpstreamDown,
}

#[derive(Default)]
struct Stats {
    requests: StatisticsRing,
    checks: StatisticsRing,
    hits: StatisticsRing,
    reports: StatisticsRing,
    whitelists: StatisticsRing,
}

pub struct Frontend<S: MutationSink> {
    store: Store,
    sink: S,
    admin: HashSet<IpAddr>,
    stats: Stats,
}

impl<S: MutationSink> Frontend<S> {
    /// `store` is a read-only view; all writes go through `sink`.
    pub fn new(store: Store, sink: S) -> Self {
        Self {
            store,
            sink,
            admin: HashSet::from([IpAddr::from([127, 0, 0, 1])]),
            stats: Stats::default(),
        }
    }

    pub fn add_admin_address(&mut self, address: IpAddr) {
        self.admin.insert(address);
    }

    /// Serve datagrams until an admin shutdown arrives or the upstream
    /// connection reads false.
    pub async fn serve(
        &mut self,
        socket: UdpSocket,
        mut up: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<ServerOutcome> {
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                incoming = socket.recv_from(&mut buffer) => {
                    let (n, peer) = incoming?;
                    let (reply, shutdown) = self.handle_datagram(&buffer[..n], peer);
                    if let Err(err) = socket.send_to(&reply, peer).await {
                        tracing::debug!(%peer, %err, "could not send reply");
                    }
                    if shutdown {
                        tracing::info!(%peer, "shutdown requested; stopping the listener");
                        return Ok(ServerOutcome::Shutdown);
                    }
                }
                changed = up.changed() => {
                    changed?;
                    if !*up.borrow() {
                        tracing::info!("upstream is down; unbinding the listener");
                        return Ok(ServerOutcome::UpstreamDown);
                    }
                }
            }
        }
    }

    /// Process one request and produce its reply. Returns the reply bytes
    /// and whether an authorized shutdown was requested.
    pub fn handle_datagram(&mut self, data: &[u8], peer: SocketAddr) -> (Vec<u8>, bool) {
        let mut res = Packet::default();
        res.set("PV", "2.0");

        let req = match Packet::parse(data) {
            Ok(req) => req,
            Err(err) => {
                tracing::debug!(%peer, %err, "rejecting malformed request");
                // Echo whatever thread the sender managed to transmit.
                let partial = Packet::decode(data);
                res.set("Thread", partial.get("Thread").unwrap_or_default());
                res.set("Code", 400);
                res.set("Diag", "Bad Request");
                return (res.archive(), false);
            }
        };

        res.set("Thread", req.get("Thread").unwrap_or_default());
        res.set("Code", 200);
        res.set("Diag", "OK");

        if req.get("PV") != Some("2.0") {
            res.set("Code", 505);
            res.set("Diag", "Version Not Supported");
            return (res.archive(), false);
        }

        self.stats.requests.report();

        let op = req.get("Op").unwrap_or_default();
        let mut shutdown = false;
        match op {
            "shutdown" | "statistics" => {
                if !self.admin.contains(&peer.ip()) {
                    res.set("Code", 401);
                    res.set("Diag", "Unauthorized");
                } else if op == "shutdown" {
                    shutdown = true;
                } else {
                    self.answer_statistics(&mut res);
                }
            }
            "check" => self.answer_check(&req, &mut res),
            "report" => {
                self.stats.reports.report();
                self.forward(&req, Kind::Report);
            }
            "whitelist" => {
                self.stats.whitelists.report();
                self.forward(&req, Kind::Whitelist);
            }
            "ping" => (), // A plain 200 is the whole answer.
            _ => {
                res.set("Code", 501);
                res.set("Diag", "Not supported operation");
            }
        }

        (res.archive(), shutdown)
    }

    fn answer_check(&mut self, req: &Packet, res: &mut Packet) {
        self.stats.checks.report();

        // Parse validated the digest already.
        let digest: Digest = req.get("Op-Digest").unwrap_or_default().parse().unwrap_or(Digest([0; 20]));

        let mut count = 0;
        let mut wl_count = 0;
        match self.store.lookup_active(&digest) {
            Ok(Some(record)) => {
                // A lone report past the retention horizon reads as absent.
                if !Store::is_publicly_hidden(&record, unix_time()) {
                    self.stats.hits.report();
                    count = record.report_count;
                    wl_count = record.whitelist_count;
                }
            }
            Ok(None) => (),
            Err(err) => tracing::warn!(%digest, %err, "check lookup failed"),
        }

        res.set("Count", count);
        res.set("WL-Count", wl_count);
    }

    fn answer_statistics(&mut self, res: &mut Packet) {
        res.set("Stats-Average-Requests", self.stats.requests.average());
        res.set("Stats-Average-Checks", self.stats.checks.average());
        res.set("Stats-Average-Hits", self.stats.hits.average());
        res.set("Stats-Average-Reports", self.stats.reports.average());
        res.set("Stats-Average-Whitelists", self.stats.whitelists.average());
        res.set("Stats-Total-Requests", self.stats.requests.total());
        res.set("Stats-Total-Checks", self.stats.checks.total());
        res.set("Stats-Total-Hits", self.stats.hits.total());
        res.set("Stats-Total-Reports", self.stats.reports.total());
        res.set("Stats-Total-Whitelists", self.stats.whitelists.total());
    }

    fn forward(&self, req: &Packet, kind: Kind) {
        let Ok(digest) = req.get("Op-Digest").unwrap_or_default().parse::<Digest>() else {
            return;
        };
        let mutation = Mutation::new(digest, kind, unix_time());
        if !self.sink.submit(mutation) {
            tracing::warn!(%digest, %kind, "mutation sink is gone; dropping");
        }
    }
}
