use std::{
    fmt::{self, Debug},
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::Id;

/// A peer as the routing table knows it: identity, datagram endpoint and
/// the last moment it proved to be alive.
///
/// Contacts are cheap value objects; two contacts are the same peer iff
/// their ids are equal, whatever the address or timestamp says.
#[derive(Clone)]
pub struct Contact {
    pub id: Id,
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

impl Contact {
    pub fn new(id: Id, addr: SocketAddr) -> Self {
        Contact {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_alive(&self, window: Duration) -> bool {
        self.last_seen.elapsed() <= window
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Contact")
            .field(&self.id.as_short_hex())
            .field(&self.addr)
            .finish()
    }
}
