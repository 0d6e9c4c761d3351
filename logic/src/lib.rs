#![forbid(unsafe_code)]

pub mod cancel;
pub mod config;
pub mod consts;
pub mod lookup;
pub mod storage;
pub mod transport;
mod contact;
mod id;
mod kbucket;
mod node;
mod table;

pub use contact::Contact;
pub use id::{cmp_by_distance, common_prefix_len, distance, Id};
pub use node::{KademliaNode, StoreError, StoreOutcome, StoreReport};
pub use table::{Observed, RoutingTable};
