use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, RwLock},
};

use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    cancel::CancelToken,
    config::SystemConfig,
    contact::Contact,
    lookup::{IterativeLookup, LookupError, LookupOptions, LookupResult, LookupType},
    storage::{self, Storage},
    table::{Observed, RoutingTable},
    transport::{Request, RequestHandler, Response, RpcSender},
    Id,
};

/// Remote fan-out result of a `store` call. `attempted` counts the peers
/// targeted, `acknowledged` the ones that confirmed the write; the local
/// copy is not part of either.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreReport {
    pub attempted: usize,
    pub acknowledged: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Every targeted peer acknowledged (or there was nobody to target)
    Ok,
    Partial,
    /// Peers were targeted, none acknowledged; the caller may retry
    Failed,
}

impl StoreReport {
    pub fn outcome(&self) -> StoreOutcome {
        if self.acknowledged == self.attempted {
            StoreOutcome::Ok
        } else if self.acknowledged > 0 {
            StoreOutcome::Partial
        } else {
            StoreOutcome::Failed
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    #[error(transparent)]
    Rejected(#[from] storage::Error),
    #[error("Store cancelled")]
    Cancelled,
}

impl From<LookupError> for StoreError {
    fn from(x: LookupError) -> Self {
        match x {
            LookupError::Cancelled => StoreError::Cancelled,
        }
    }
}

/// Ties the routing table, the local store and the transport together:
/// owns the shared state, answers inbound requests, runs bootstrap and
/// periodic maintenance. The transport keeps a weak reference back to
/// this and feeds it every decoded datagram.
pub struct KademliaNode<T: RpcSender> {
    // Immutable data
    config: SystemConfig,
    id: Id,
    addr: SocketAddr,
    // Mutable runtime data
    transport: T,
    pub table: Mutex<RoutingTable>,
    pub storage: RwLock<Storage>,
}

impl<T> KademliaNode<T>
where
    T: RpcSender + Send + Sync + 'static,
{
    pub fn new(config: SystemConfig, id: Id, addr: SocketAddr, transport: T) -> Self {
        Self {
            table: Mutex::new(RoutingTable::new(id, config.routing.clone())),
            storage: RwLock::new(Storage::new(config.storage.clone())),
            config,
            id,
            addr,
            transport,
        }
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// The advertised datagram endpoint (also the identity preimage).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Records evidence that a peer is alive. When a full bucket asks for
    /// it, the least recently seen occupant is probed in the background
    /// and the table is told how that went.
    pub fn observe_contact(self: &Arc<Self>, contact: Contact) {
        let outcome = self.table.lock().unwrap().observe(contact);
        if let Observed::ProbeHead(head) = outcome {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let res = this.transport.send(head.addr, Request::Ping).await;
                let alive = matches!(res, Ok(Response::Pong));
                let mut table = this.table.lock().unwrap();
                if alive {
                    table.head_alive(head.id);
                } else {
                    table.head_dead(head.id);
                }
            });
        }
    }

    fn closer_bucket(&self, target: Id) -> Vec<Contact> {
        self.table
            .lock()
            .unwrap()
            .closest(target, self.config.routing.bucket_size)
    }

    fn lookup_options(&self) -> LookupOptions {
        LookupOptions {
            parallelism: self.config.lookup.parallelism,
        }
    }

    /// Converges on the k closest live contacts to `target`.
    pub async fn query_nodes(
        self: &Arc<Self>,
        target: Id,
        cancel: CancelToken,
    ) -> Result<Vec<Contact>, LookupError> {
        let bucket = self.closer_bucket(target);
        let searcher =
            IterativeLookup::create(self, self.lookup_options(), LookupType::Nodes, target);
        match searcher.run(bucket, cancel).await? {
            LookupResult::CloserNodes(x) => Ok(x),
            LookupResult::ValueFound(_) => unreachable!(),
        }
    }

    /// Looks a key up, local store first, then iteratively on the
    /// overlay. `None` means the overlay converged without a hit.
    pub async fn query_value(
        self: &Arc<Self>,
        key: &str,
        cancel: CancelToken,
    ) -> Result<Option<String>, LookupError> {
        {
            // Check if it's already in storage
            let storage = self.storage.read().unwrap();
            if let Some(value) = storage.get(key) {
                return Ok(Some(value.clone()));
            }
        }

        let target = Id::for_key(key);
        let bucket = self.closer_bucket(target);
        let searcher = IterativeLookup::create(
            self,
            self.lookup_options(),
            LookupType::Value(key.to_owned()),
            target,
        );
        Ok(match searcher.run(bucket, cancel).await? {
            LookupResult::CloserNodes(_) => None,
            LookupResult::ValueFound(x) => Some(x),
        })
    }

    /// Joins the overlay: seed endpoints are pinged (their identities are
    /// learned from the responses flowing through the receive loop), then
    /// a self-lookup spreads our existence across the id space.
    pub async fn bootstrap(self: &Arc<Self>, seeds: &[SocketAddr]) {
        join_all(seeds.iter().map(|addr| {
            let fut = self.transport.send(*addr, Request::Ping);
            async move {
                if let Err(x) = fut.await {
                    info!("Bootstrap seed {addr} did not answer: {x}");
                }
            }
        }))
        .await;

        if let Err(x) = self.query_nodes(self.id, CancelToken::never()).await {
            warn!("Bootstrap self-lookup aborted: {x}");
        }
    }

    /// Announces our own binding (`id hex → "ip:port"`) to the overlay.
    pub async fn publish_self(self: &Arc<Self>) -> Result<StoreReport, StoreError> {
        let address = format!("{}:{}", self.addr.ip(), self.addr.port());
        self.store(self.id.as_hex(), address, CancelToken::never())
            .await
    }

    async fn send_request_and_count(&self, nodes: Vec<Contact>, request: Request) -> usize {
        let mut answers = nodes
            .iter()
            .filter(|x| x.id != self.id)
            .map(|x| async {
                // tag the future (to know which peer answered)
                (x.id, self.transport.send(x.addr, request.clone()).await)
            })
            .collect::<FuturesUnordered<_>>();

        let mut count = 0;

        while let Some((id, x)) = answers.next().await {
            match x {
                Ok(Response::Stored(true)) => count += 1,
                Ok(Response::Stored(false)) => warn!("{id:?} rejected the binding"),
                Ok(_) => warn!("Unknown response received from {id:?}"),
                Err(x) => warn!("Transport error querying {id:?}: {x}"),
            }
        }

        count
    }

    /// Writes the binding locally and replicates it to the k closest
    /// nodes to the key. A report with zero acknowledgements (and peers
    /// attempted) is a recoverable failure, the binding only lives here.
    pub async fn store(
        self: &Arc<Self>,
        key: String,
        value: String,
        cancel: CancelToken,
    ) -> Result<StoreReport, StoreError> {
        Storage::check_entry(&self.config.storage, &key, &value)?;

        info!("Inserting {key:?} into the network -> {value:?}");
        self.storage
            .write()
            .unwrap()
            .insert(key.clone(), value.clone())?;

        let target = Id::for_key(&key);
        let nodes = self.query_nodes(target, cancel).await?;
        let attempted = nodes.iter().filter(|x| x.id != self.id).count();

        let request = Request::Store { key, value };
        let acknowledged = self.send_request_and_count(nodes, request).await;

        Ok(StoreReport {
            attempted,
            acknowledged,
        })
    }

    /// One maintenance pass: random lookups through buckets that went
    /// silent for a refresh interval, liveness probes for bucket heads
    /// not heard from within the liveness window.
    pub async fn refresh<R: Rng>(self: &Arc<Self>, rng: &mut R) {
        let timing = &self.config.timing;
        let (targets, idle_heads) = {
            let table = self.table.lock().unwrap();
            let targets: Vec<Id> = table
                .stale_buckets(timing.refresh_interval)
                .into_iter()
                .map(|i| table.random_id_in_bucket(i, rng))
                .collect();
            (targets, table.idle_heads(timing.liveness_window))
        };

        debug!(
            "Refreshing {} stale buckets, probing {} idle heads",
            targets.len(),
            idle_heads.len()
        );

        let mut lookups = targets
            .into_iter()
            .map(|target| self.query_nodes(target, CancelToken::never()))
            .collect::<FuturesUnordered<_>>();
        while lookups.next().await.is_some() {
            continue;
        }

        join_all(idle_heads.into_iter().map(|head| async move {
            let res = self.transport.send(head.addr, Request::Ping).await;
            let mut table = self.table.lock().unwrap();
            if matches!(res, Ok(Response::Pong)) {
                table.head_alive(head.id);
            } else {
                table.head_dead(head.id);
            }
        }))
        .await;
    }
}

impl<T> RequestHandler for KademliaNode<T>
where
    T: RpcSender + Send + Sync + 'static,
{
    #[instrument(skip(self, request), fields(kad_id = %self.id, sender = %sender.id))]
    fn on_request(&self, sender: &Contact, request: Request) -> Response {
        debug!("Request: {:?}", request);
        let k = self.config.routing.bucket_size;

        match request {
            Request::Ping => Response::Pong,

            Request::FindNode(target) => {
                let found = self.table.lock().unwrap().closest(target, k);
                let found: Vec<Contact> =
                    found.into_iter().filter(|x| x.id != sender.id).collect();
                debug!("| Find closer {target:?}: {found:?}");
                Response::Nodes(found)
            }

            Request::Store { key, value } => {
                debug!("| Store {key:?} -> {value:?}");
                let res = self.storage.write().unwrap().insert(key, value);
                if let Err(x) = &res {
                    warn!("Rejecting binding: {x}");
                }
                Response::Stored(res.is_ok())
            }

            Request::FindValue { key } => {
                // Send the value if stored, else the closest known nodes
                let stored = self.storage.read().unwrap().get(&key).cloned();
                match stored {
                    Some(value) => Response::Value(value),
                    None => {
                        let target = Id::for_key(&key);
                        let found = self.table.lock().unwrap().closest(target, k);
                        Response::Nodes(
                            found.into_iter().filter(|x| x.id != sender.id).collect(),
                        )
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use futures::future;

    use super::*;
    use crate::transport::TransportError;

    /// Answers every Store with an ack, drops everything else.
    #[derive(Clone, Default)]
    struct AckContacter(Arc<Mutex<HashMap<SocketAddr, usize>>>);

    impl RpcSender for AckContacter {
        type Fut = future::Ready<Result<Response, TransportError>>;

        fn send(&self, to: SocketAddr, request: Request) -> Self::Fut {
            future::ready(match request {
                Request::Store { .. } => {
                    *self.0.lock().unwrap().entry(to).or_insert(0) += 1;
                    Ok(Response::Stored(true))
                }
                _ => Err(TransportError::Timeout),
            })
        }
    }

    fn node(hex: &str) -> Arc<KademliaNode<AckContacter>> {
        let addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        Arc::new(KademliaNode::new(
            SystemConfig::default(),
            Id::from_hex(hex).unwrap(),
            addr,
            AckContacter::default(),
        ))
    }

    #[test_log::test(tokio::test)]
    async fn isolated_store_and_find() {
        let a = node("a0");
        let report = a
            .store("k1".into(), "v1".into(), CancelToken::never())
            .await
            .unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.outcome(), StoreOutcome::Ok);

        assert_eq!(
            a.query_value("k1", CancelToken::never()).await.unwrap(),
            Some("v1".to_owned())
        );
        assert_eq!(a.query_value("k2", CancelToken::never()).await.unwrap(), None);
    }

    #[test_log::test(tokio::test)]
    async fn store_rejects_wire_illegal_keys() {
        let a = node("a0");
        let res = a
            .store("bad|key".into(), "v".into(), CancelToken::never())
            .await;
        assert_eq!(res, Err(StoreError::Rejected(storage::Error::InvalidKey)));
    }

    #[test_log::test(tokio::test)]
    async fn handlers_answer_from_local_state() {
        let a = node("a0");
        let sender = Contact::new(Id::from_hex("0b").unwrap(), "127.0.0.1:9999".parse().unwrap());
        a.observe_contact(Contact::new(
            Id::from_hex("b0").unwrap(),
            "127.0.0.1:40002".parse().unwrap(),
        ));

        assert_eq!(a.on_request(&sender, Request::Ping), Response::Pong);

        match a.on_request(&sender, Request::FindNode(Id::from_hex("b1").unwrap())) {
            Response::Nodes(nodes) => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].id, Id::from_hex("b0").unwrap());
            }
            x => panic!("unexpected response {x:?}"),
        }

        let stored = a.on_request(
            &sender,
            Request::Store {
                key: "kx".into(),
                value: "vx".into(),
            },
        );
        assert_eq!(stored, Response::Stored(true));
        assert_eq!(
            a.on_request(&sender, Request::FindValue { key: "kx".into() }),
            Response::Value("vx".into())
        );

        // A miss falls back to the closest known nodes
        match a.on_request(&sender, Request::FindValue { key: "missing".into() }) {
            Response::Nodes(_) => {}
            x => panic!("unexpected response {x:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn find_node_response_omits_the_asker() {
        let a = node("a0");
        let peer = Contact::new(Id::from_hex("b0").unwrap(), "127.0.0.1:40002".parse().unwrap());
        a.observe_contact(peer.clone());
        match a.on_request(&peer, Request::FindNode(Id::from_hex("b0").unwrap())) {
            Response::Nodes(nodes) => assert!(nodes.is_empty()),
            x => panic!("unexpected response {x:?}"),
        }
    }
}
