use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{net::UdpSocket, sync::oneshot, time::timeout};
use tracing::{debug, warn};
use udht_logic::{
    cancel::CancelToken,
    config::TimingConfig,
    transport::{Request, RequestHandler, Response, RpcSender, TransportError},
    Contact, Id, KademliaNode,
};

use crate::codec::{Body, FindValueReply, Message, MessageKind, PeerInfo, RequestId, MAX_DATAGRAM};

struct PendingRequest {
    expected: MessageKind,
    waiter: oneshot::Sender<Body>,
    deadline: Instant,
}

/// One bound datagram socket with its correlation state. The receive
/// loop demultiplexes everything arriving on the socket: responses wake
/// their pending waiter, requests are answered in a spawned task so a
/// slow handler never stalls the loop.
pub struct UdpEndpoint {
    socket: UdpSocket,
    local_id: Id,
    request_timeout: Duration,
    max_retries: u32,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    pub(crate) dht: Weak<KademliaNode<UdpSender>>,
    malformed: AtomicU64,
}

impl UdpEndpoint {
    pub(crate) fn new(
        socket: UdpSocket,
        local_id: Id,
        timing: &TimingConfig,
        dht: Weak<KademliaNode<UdpSender>>,
    ) -> Self {
        UdpEndpoint {
            socket,
            local_id,
            request_timeout: timing.request_timeout,
            max_retries: timing.max_retries,
            pending: Mutex::new(HashMap::new()),
            dht,
            malformed: AtomicU64::new(0),
        }
    }

    /// Frames dropped by the codec so far.
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Sends one request and awaits its correlated response.
    pub async fn send_request(
        &self,
        to: SocketAddr,
        request: Request,
    ) -> Result<Response, TransportError> {
        let body = request_body(request);
        let expected = body
            .kind()
            .response_kind()
            .expect("request bodies always pair with a response kind");
        let request_id = RequestId::random();
        let message = Message {
            sender: self.local_id,
            request_id,
            body,
        };
        let data = message
            .encode()
            .map_err(|x| TransportError::UnknownError(x.to_string().into()))?;

        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + self.request_timeout;
        self.pending.lock().unwrap().insert(
            request_id,
            PendingRequest {
                expected,
                waiter: tx,
                deadline,
            },
        );

        debug!("Send to {to}: {:?}", message.body);
        if let Err(x) = self.socket.send_to(&data, to).await {
            self.pending.lock().unwrap().remove(&request_id);
            debug!("Send to {to} failed: {x}");
            return Err(TransportError::Unreachable);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(body)) => Ok(response_from_body(body)),
            // A dropped waiter is shutdown, unless the deadline sweep beat
            // our own timer to it
            Ok(Err(_)) if Instant::now() < deadline => Err(TransportError::Cancelled),
            Ok(Err(_)) => Err(TransportError::Timeout),
            Err(_) => {
                self.pending.lock().unwrap().remove(&request_id);
                Err(TransportError::Timeout)
            }
        }
    }

    /// `send_request` with the configured attempt budget. Resolves on the
    /// first response, on budget exhaustion, or right away on
    /// cancellation.
    pub async fn send_with_retry(
        &self,
        to: SocketAddr,
        request: Request,
    ) -> Result<Response, TransportError> {
        let mut last = TransportError::Timeout;
        for attempt in 0..=self.max_retries {
            match self.send_request(to, request.clone()).await {
                Ok(x) => return Ok(x),
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                Err(x) => {
                    debug!("Attempt {attempt} towards {to} failed: {x}");
                    last = x;
                }
            }
        }
        Err(last)
    }

    fn process_datagram(self: &Arc<Self>, data: &[u8], src: SocketAddr) {
        let message = match Message::decode(data) {
            Ok(x) => x,
            Err(x) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed datagram from {src}: {x}");
                return;
            }
        };
        let dht = match self.dht.upgrade() {
            Some(x) => x,
            None => return, // Shutting down
        };

        // Any well-formed datagram is evidence its sender is alive
        let contact = Contact::new(message.sender, src);
        dht.observe_contact(contact.clone());

        let kind = message.body.kind();
        if kind.is_request() {
            let endpoint = self.clone();
            tokio::spawn(async move {
                endpoint
                    .answer_request(dht, contact, message.request_id, kind, message.body)
                    .await;
            });
        } else {
            self.deliver_response(src, message);
        }
    }

    async fn answer_request(
        &self,
        dht: Arc<KademliaNode<UdpSender>>,
        contact: Contact,
        request_id: RequestId,
        kind: MessageKind,
        body: Body,
    ) {
        let request = match request_from_body(body) {
            Some(x) => x,
            None => return,
        };
        let response = dht.on_request(&contact, request);
        let reply = Message {
            sender: self.local_id,
            // A response always echoes the request's correlation token
            request_id,
            body: response_body(kind, response),
        };
        match reply.encode() {
            Ok(data) => {
                if let Err(x) = self.socket.send_to(&data, contact.addr).await {
                    warn!("Failed to answer {}: {x}", contact.addr);
                }
            }
            Err(x) => warn!("Failed to encode response for {}: {x}", contact.addr),
        }
    }

    fn deliver_response(&self, src: SocketAddr, message: Message) {
        let mut pending = self.pending.lock().unwrap();
        match pending.get(&message.request_id) {
            Some(entry) if entry.expected == message.body.kind() => {
                let entry = pending.remove(&message.request_id).unwrap();
                drop(pending);
                // An error only means the requester gave up meanwhile
                let _ = entry.waiter.send(message.body);
            }
            Some(_) => debug!(
                "Response kind mismatch from {src} for {}, dropping",
                message.request_id
            ),
            // Duplicate, expired or plain unsolicited: drop silently
            None => debug!("Uncorrelated response from {src}, dropping"),
        }
    }

    /// Entries whose waiter was abandoned (a cancelled lookup drops its
    /// futures) would otherwise linger; the receive loop sweeps them out
    /// once their deadline passes.
    fn expire_pending(&self) {
        let now = Instant::now();
        self.pending.lock().unwrap().retain(|_, x| x.deadline > now);
    }

    fn drain_pending(&self) {
        // Dropping the waiters resolves every in-flight request to
        // `Cancelled` on the sender side
        self.pending.lock().unwrap().clear();
    }
}

/// Reads datagrams until the shutdown token fires. Socket-level receive
/// errors are logged and the loop continues; only shutdown stops it.
pub(crate) async fn run_receiver(endpoint: Arc<UdpEndpoint>, mut shutdown: CancelToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut sweep = tokio::time::interval(endpoint.request_timeout);
    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sweep.tick() => {
                endpoint.expire_pending();
                continue;
            }
            res = endpoint.socket.recv_from(&mut buf) => match res {
                Ok(x) => x,
                Err(x) => {
                    warn!("Socket receive error: {x}");
                    continue;
                }
            },
        };
        endpoint.process_datagram(&buf[..len], src);
    }
    debug!("Receive loop stopped");
    endpoint.drain_pending();
}

/// Cloneable send handle, the node's view of the endpoint.
#[derive(Clone)]
pub struct UdpSender(pub(crate) Arc<UdpEndpoint>);

impl UdpSender {
    pub fn endpoint(&self) -> &UdpEndpoint {
        &self.0
    }
}

impl RpcSender for UdpSender {
    type Fut = BoxFuture<'static, Result<Response, TransportError>>;

    fn send(&self, to: SocketAddr, request: Request) -> Self::Fut {
        let endpoint = self.0.clone();
        async move { endpoint.send_request(to, request).await }.boxed()
    }
}

fn request_body(request: Request) -> Body {
    match request {
        Request::Ping => Body::Ping,
        Request::FindNode(target) => Body::FindNode { target },
        Request::Store { key, value } => Body::Store { key, value },
        Request::FindValue { key } => Body::FindValue { key },
    }
}

fn request_from_body(body: Body) -> Option<Request> {
    Some(match body {
        Body::Ping => Request::Ping,
        Body::FindNode { target } => Request::FindNode(target),
        Body::Store { key, value } => Request::Store { key, value },
        Body::FindValue { key } => Request::FindValue { key },
        _ => return None,
    })
}

fn peers_from_contacts(nodes: Vec<Contact>) -> Vec<PeerInfo> {
    nodes
        .into_iter()
        .map(|x| PeerInfo {
            id: x.id,
            addr: x.addr,
        })
        .collect()
}

fn contacts_from_peers(nodes: Vec<PeerInfo>) -> Vec<Contact> {
    nodes
        .into_iter()
        .map(|x| Contact::new(x.id, x.addr))
        .collect()
}

/// Maps a handler's answer onto the wire kind matching the request; a
/// FIND_VALUE miss travels as the `nodes` arm of FIND_VALUE_RESPONSE.
fn response_body(request_kind: MessageKind, response: Response) -> Body {
    match (request_kind, response) {
        (MessageKind::Ping, _) => Body::PingResponse,
        (MessageKind::FindNode, Response::Nodes(nodes)) => Body::FindNodeResponse {
            nodes: peers_from_contacts(nodes),
        },
        (MessageKind::Store, Response::Stored(ok)) => Body::StoreResponse { ok },
        (MessageKind::FindValue, Response::Value(value)) => {
            Body::FindValueResponse(FindValueReply::Value(value))
        }
        (MessageKind::FindValue, Response::Nodes(nodes)) => {
            Body::FindValueResponse(FindValueReply::Nodes(peers_from_contacts(nodes)))
        }
        (kind, response) => {
            warn!("Handler answered {kind:?} with {response:?}, sending an empty refusal");
            match kind {
                MessageKind::Store => Body::StoreResponse { ok: false },
                MessageKind::FindNode => Body::FindNodeResponse { nodes: vec![] },
                MessageKind::FindValue => {
                    Body::FindValueResponse(FindValueReply::Nodes(vec![]))
                }
                _ => Body::PingResponse,
            }
        }
    }
}

fn response_from_body(body: Body) -> Response {
    match body {
        Body::PingResponse => Response::Pong,
        Body::FindNodeResponse { nodes } => Response::Nodes(contacts_from_peers(nodes)),
        Body::StoreResponse { ok } => Response::Stored(ok),
        Body::FindValueResponse(FindValueReply::Value(value)) => Response::Value(value),
        Body::FindValueResponse(FindValueReply::Nodes(nodes)) => {
            Response::Nodes(contacts_from_peers(nodes))
        }
        // Request kinds never reach a waiter, the pending table only
        // accepts the expected response kind
        _ => Response::Pong,
    }
}
