use std::{io, net::SocketAddr, sync::Arc};

use tokio::net::UdpSocket;
use tracing::info;
use udht_logic::{cancel::CancelToken, config::SystemConfig, Id, KademliaNode};

pub mod codec;
mod endpoint;

pub use endpoint::{UdpEndpoint, UdpSender};

/// Binds a datagram endpoint and wires a node around it: the node owns
/// the sender half, the endpoint keeps a weak pointer back for the
/// receive loop, and the loop runs until `shutdown` fires.
///
/// The node's identity is derived from `advertised` (falling back to the
/// bound address), so give the externally visible address when behind
/// port rewriting.
pub async fn create_node(
    config: SystemConfig,
    listen: SocketAddr,
    advertised: Option<SocketAddr>,
    shutdown: CancelToken,
) -> io::Result<Arc<KademliaNode<UdpSender>>> {
    let socket = UdpSocket::bind(listen).await?;
    let local = socket.local_addr()?;
    let advertised = advertised.unwrap_or(local);
    let id = Id::from_addr(&advertised);
    info!("Starting node {id} on {local} (advertised as {advertised})");

    let node = Arc::new_cyclic(|weak_dht| {
        let endpoint = Arc::new(UdpEndpoint::new(
            socket,
            id,
            &config.timing,
            weak_dht.clone(),
        ));
        KademliaNode::new(config, id, advertised, UdpSender(endpoint))
    });

    let endpoint = node.transport().clone();
    tokio::spawn(endpoint::run_receiver(endpoint.0, shutdown));

    Ok(node)
}
