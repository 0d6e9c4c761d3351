use std::{collections::HashSet, sync::Arc};

use futures::prelude::*;
use futures::stream::FuturesUnordered;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{
    cancel::CancelToken,
    contact::Contact,
    id::cmp_by_distance,
    transport::{Request, Response, RpcSender, TransportError},
    Id, KademliaNode,
};

#[derive(Clone, Debug)]
pub struct LookupOptions {
    // Also called alpha in the original paper
    // n. of nodes queried in parallel
    pub parallelism: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LookupType {
    /// Converge on the k closest nodes to the target
    Nodes,
    /// Same walk, but any peer holding the key short-circuits with its value
    Value(String),
}

pub enum LookupResult {
    CloserNodes(Vec<Contact>),
    ValueFound(String),
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("Lookup cancelled")]
    Cancelled,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum QueryState {
    Waiting,
    Querying,
    Queried,
}

/// Iterative lookup, taken from the Kademlia original paper.
/// Works by keeping a window of the k closest known contacts to the
/// target id. Newly discovered contacts enter the window only while they
/// are among the k closest; at most `parallelism` are queried at a time.
/// A contact is queried at most once; one that times out (or errors) is
/// dropped from the window and never reconsidered. When every contact in
/// the window has been queried there is nothing closer left to learn and
/// the lookup has converged.
pub struct IterativeLookup<'a, T: RpcSender> {
    node: &'a Arc<KademliaNode<T>>,
    options: LookupOptions,
    lookup: LookupType,
    target: Id,
}

impl<'a, T> IterativeLookup<'a, T>
where
    T: RpcSender + Send + Sync + 'static,
{
    pub fn create(
        node: &'a Arc<KademliaNode<T>>,
        options: LookupOptions,
        lookup: LookupType,
        target: Id,
    ) -> Self {
        Self {
            node,
            options,
            lookup,
            target,
        }
    }

    fn start_query(
        &self,
        window: &mut [(QueryState, Contact)],
    ) -> Option<impl Future<Output = (Id, Result<Response, TransportError>)>> {
        // Picking the first waiting entry always picks the closest
        // unqueried contact, the window is kept sorted by distance
        let to = window.iter_mut().find(|x| x.0 == QueryState::Waiting)?;

        to.0 = QueryState::Querying;
        let used_id = to.1.id;

        let message = match &self.lookup {
            LookupType::Nodes => Request::FindNode(self.target),
            LookupType::Value(key) => Request::FindValue { key: key.clone() },
        };

        let fut = self.node.transport().send(to.1.addr, message);
        Some(fut.map(move |x| (used_id, x)))
    }

    fn sort_window(&self, window: &mut [(QueryState, Contact)]) {
        window.sort_by(|a, b| cmp_by_distance(a.1.id, b.1.id, self.target));
    }

    #[instrument(skip_all, fields(kad_id = %self.node.id(), target = %self.target))]
    pub async fn run(
        self,
        first_bucket: Vec<Contact>,
        mut cancel: CancelToken,
    ) -> Result<LookupResult, LookupError> {
        let window_size = self.node.config().routing.bucket_size;
        let parallelism = self.options.parallelism;
        let self_id = self.node.id();

        let mut seen: HashSet<Id> = first_bucket.iter().map(|x| x.id).collect();
        seen.insert(self_id);
        debug!("First bucket: {:?}", first_bucket);

        let mut window: Vec<(QueryState, Contact)> = first_bucket
            .into_iter()
            .map(|x| (QueryState::Waiting, x))
            .collect();
        self.sort_window(&mut window);
        window.truncate(window_size);

        let pending: FuturesUnordered<_> = (0..parallelism)
            .filter_map(|_| self.start_query(&mut window))
            .collect();

        let mut available_futures = parallelism - pending.len() as u32;

        tokio::pin!(pending);
        while !pending.is_empty() {
            let (id, res) = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Dropping the pending set abandons the in-flight
                    // requests, their transport entries expire on their own
                    debug!("Lookup cancelled");
                    return Err(LookupError::Cancelled);
                }
                Some(x) = pending.next() => x,
            };
            available_futures += 1; // 1 space available again
            debug!("Response from {:?}: {:?}", id, res);

            match res {
                Err(x) => {
                    debug!("Error requesting from {:?}: {}", id, x);
                    // Out of the window it can no longer shadow closer
                    // contacts; `seen` keeps it from ever being re-queried
                    window.retain(|x| x.1.id != id);
                }
                Ok(response) => {
                    if let Some(entry) = window.iter_mut().find(|x| x.1.id == id) {
                        entry.0 = QueryState::Queried;
                    }
                    // A missing entry means the responder fell out of the
                    // window meanwhile; its answer is still worth merging

                    match response {
                        Response::Nodes(nodes) => {
                            for node in nodes {
                                if !seen.insert(node.id) {
                                    continue;
                                }
                                self.node.observe_contact(node.clone());
                                window.push((QueryState::Waiting, node));
                            }
                            self.sort_window(&mut window);
                            window.truncate(window_size);
                        }
                        Response::Value(value) => {
                            if let LookupType::Value(_) = self.lookup {
                                return Ok(LookupResult::ValueFound(value));
                            }
                            warn!("Node {id:?} returned a value in a node-only lookup");
                        }
                        x => warn!("Node {id:?} returned invalid response: {x:?}"),
                    }
                }
            }

            while available_futures > 0 {
                match self.start_query(&mut window) {
                    None => break,
                    Some(x) => pending.push(x),
                }
                available_futures -= 1;
            }

            if window.iter().all(|x| x.0 == QueryState::Queried) {
                // All of the closest contacts answered, anyone else still
                // in flight cannot know anything closer
                break;
            }
        }

        let alive_window = self.node.config().timing.liveness_window;
        let nodes = window
            .into_iter()
            .filter(|x| x.0 == QueryState::Queried)
            .map(|x| x.1)
            .filter(|x| x.is_alive(alive_window))
            .collect();
        Ok(LookupResult::CloserNodes(nodes))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{Arc, Mutex},
    };

    use futures::future;

    use super::*;
    use crate::{config::SystemConfig, transport::RequestHandler};

    /// In-process network: requests are answered synchronously by the
    /// destination node, emulating what the datagram receive loop does
    /// (observe on both ends, timeouts for offline peers).
    #[derive(Clone, Default)]
    struct SimNet {
        peers: Arc<Mutex<HashMap<SocketAddr, SimPeer>>>,
    }

    #[derive(Clone)]
    struct SimPeer {
        node: Arc<KademliaNode<SimSender>>,
        online: bool,
    }

    #[derive(Clone)]
    struct SimSender {
        net: SimNet,
        origin_id: Id,
        origin_addr: SocketAddr,
    }

    impl RpcSender for SimSender {
        type Fut = future::Ready<Result<Response, TransportError>>;

        fn send(&self, to: SocketAddr, request: Request) -> Self::Fut {
            let (peer, origin) = {
                let peers = self.net.peers.lock().unwrap();
                let peer = peers.get(&to).cloned();
                let origin = peers.get(&self.origin_addr).map(|x| x.node.clone());
                (peer, origin)
            };
            let peer = match peer {
                Some(x) if x.online => x,
                _ => return future::ready(Err(TransportError::Timeout)),
            };

            let from = Contact::new(self.origin_id, self.origin_addr);
            peer.node.observe_contact(from.clone());
            let response = peer.node.on_request(&from, request);
            if let Some(origin) = origin {
                origin.observe_contact(Contact::new(peer.node.id(), to));
            }
            future::ready(Ok(response))
        }
    }

    impl SimNet {
        fn add_node(&self, id: Id, port: u16) -> Arc<KademliaNode<SimSender>> {
            let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            let sender = SimSender {
                net: self.clone(),
                origin_id: id,
                origin_addr: addr,
            };
            let node = Arc::new(KademliaNode::new(SystemConfig::default(), id, addr, sender));
            self.peers.lock().unwrap().insert(
                addr,
                SimPeer {
                    node: node.clone(),
                    online: true,
                },
            );
            node
        }

        fn set_online(&self, addr: SocketAddr, online: bool) {
            self.peers.lock().unwrap().get_mut(&addr).unwrap().online = online;
        }
    }

    fn id(hex: &str) -> Id {
        Id::from_hex(hex).unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn ring_converges_on_closest() {
        let net = SimNet::default();
        let mut nodes = Vec::new();
        for i in 0..8u16 {
            nodes.push(net.add_node(id(&format!("{:02x}", i * 0x20)), 41000 + i));
        }

        let first = nodes[0].addr();
        for node in nodes.iter().skip(1) {
            node.bootstrap(&[first]).await;
        }

        let found = nodes[0]
            .query_nodes(id("f0"), CancelToken::never())
            .await
            .unwrap();
        assert!(!found.is_empty());
        // No 0xf0 node exists, 0xe0 is the closest live id
        assert_eq!(found[0].id, id("e0"));
    }

    #[test_log::test(tokio::test)]
    async fn value_found_through_intermediary() {
        let net = SimNet::default();
        let a = net.add_node(id("a0"), 42001);
        let b = net.add_node(id("b0"), 42002);
        let c = net.add_node(id("c0"), 42003);

        a.storage.write().unwrap().insert("kq".into(), "vq".into()).unwrap();
        // B knows A, C knows only B
        b.observe_contact(Contact::new(a.id(), a.addr()));
        c.observe_contact(Contact::new(b.id(), b.addr()));

        let value = c.query_value("kq", CancelToken::never()).await.unwrap();
        assert_eq!(value, Some("vq".to_owned()));
    }

    #[test_log::test(tokio::test)]
    async fn lookup_absorbs_dead_peers() {
        let net = SimNet::default();
        let a = net.add_node(id("a0"), 43001);
        let b = net.add_node(id("b0"), 43002);
        let c = net.add_node(id("c0"), 43003);
        let d = net.add_node(id("d0"), 43004);

        a.observe_contact(Contact::new(b.id(), b.addr()));
        a.observe_contact(Contact::new(c.id(), c.addr()));
        b.observe_contact(Contact::new(d.id(), d.addr()));
        net.set_online(c.addr(), false);
        net.set_online(d.addr(), false);

        let found = a.query_nodes(id("b1"), CancelToken::never()).await.unwrap();
        // The dead peers are dropped, the live one is still reported
        let ids: Vec<Id> = found.iter().map(|x| x.id).collect();
        assert_eq!(ids, vec![id("b0")]);
    }

    #[test_log::test(tokio::test)]
    async fn cancellation_aborts_lookup() {
        let net = SimNet::default();
        let a = net.add_node(id("a0"), 44001);
        let b = net.add_node(id("b0"), 44002);
        a.observe_contact(Contact::new(b.id(), b.addr()));

        let handle = crate::cancel::CancelHandle::new();
        let token = handle.token();
        handle.cancel();
        // An already-signalled token aborts before any round completes
        let res = a.query_nodes(id("f0"), token).await;
        assert_eq!(res.unwrap_err(), LookupError::Cancelled);
    }

    #[test_log::test(tokio::test)]
    async fn empty_table_returns_no_nodes() {
        let net = SimNet::default();
        let a = net.add_node(id("a0"), 45001);
        let found = a.query_nodes(id("f0"), CancelToken::never()).await.unwrap();
        assert!(found.is_empty());

        assert_eq!(a.query_value("nope", CancelToken::never()).await.unwrap(), None);
    }
}
