/// Identifier length in bytes (160 bits, Kademlia-sized).
pub const ID_LEN: usize = 20;

pub const ID_LEN_BITS: usize = ID_LEN * 8;
