use std::{
    fmt::{self, Debug, Display},
    net::SocketAddr,
    ops::{BitAnd, BitOr, BitXor, Not},
};

use itertools::izip;
use rand::{distributions::Standard, prelude::Distribution, Rng};
use sha2::{Digest, Sha256};

use crate::consts::{ID_LEN, ID_LEN_BITS};

/// 160-bit node (or key) identifier.
///
/// The only structure the overlay relies on is bitwise XOR and the
/// lexicographic (MSB-first) order it induces, so `Ord` doubles as
/// the "closer to target" comparison once both sides are XORed with
/// the target.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Id(pub [u8; ID_LEN]);

impl Id {
    pub const ZERO: Id = Id([0u8; ID_LEN]);

    /// Number of leading zero bits, 0..=160.
    pub fn leading_zeros(&self) -> u32 {
        let mut res = 0u32;
        for x in self.0 {
            if x == 0 {
                res += 8;
            } else {
                res += x.leading_zeros();
                break;
            }
        }
        res
    }

    /// Returns a copy with the given bit (0 = most significant) set.
    pub fn set_bit(mut self, bit: u32) -> Id {
        self.0[bit as usize / 8] |= 0x80 >> (bit % 8);
        self
    }

    /// Mask with the first `bits` high-order bits set.
    pub fn create_left_mask(bits: u32) -> Id {
        let mut res = Id::ZERO;
        let full = (bits as usize / 8).min(ID_LEN);
        for x in res.0.iter_mut().take(full) {
            *x = 0xff;
        }
        if full < ID_LEN && bits as usize % 8 != 0 {
            res.0[full] = !(0xffu8 >> (bits % 8));
        }
        res
    }

    /// Parses big-endian hex, right-padding with zeros when fewer than
    /// 40 digits are given (handy in tests and fixed prefixes).
    pub fn from_hex(data: &str) -> Result<Id, hex::FromHexError> {
        if data.len() > 2 * ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut bytes = [0u8; ID_LEN];
        hex::decode_to_slice(data, &mut bytes[..data.len() / 2])?;
        Ok(Id(bytes))
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_short_hex(&self) -> String {
        let hex_id = self.as_hex();
        let trimmed = hex_id.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_owned()
        } else {
            trimmed.to_owned()
        }
    }

    /// Identity of the node reachable at `addr`: SHA-256 of `"ip:port"`
    /// truncated to 160 bits. Deterministic, stable for the node's lifetime.
    pub fn from_addr(addr: &SocketAddr) -> Id {
        Self::digest(format!("{}:{}", addr.ip(), addr.port()).as_bytes())
    }

    /// Lookup target for an opaque key: id-shaped keys (exactly 40 hex
    /// digits) are taken verbatim, anything else is hashed. Every node
    /// must agree on this mapping or closeness diverges across the
    /// network.
    pub fn for_key(key: &str) -> Id {
        if key.len() == 2 * ID_LEN {
            if let Ok(id) = Id::from_hex(key) {
                return id;
            }
        }
        Self::digest(key.as_bytes())
    }

    fn digest(data: &[u8]) -> Id {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&hash[..ID_LEN]);
        Id(bytes)
    }
}

/// XOR distance between two identifiers.
pub fn distance(a: Id, b: Id) -> Id {
    a ^ b
}

/// Leading bits shared by `a` and `b`, 0..=160.
pub fn common_prefix_len(a: Id, b: Id) -> u32 {
    (a ^ b).leading_zeros()
}

/// Order of `a` and `b` by XOR distance to `target`, MSB-first. Strict:
/// two ids compare equal only when they are the same id.
pub fn cmp_by_distance(a: Id, b: Id, target: Id) -> std::cmp::Ordering {
    (a ^ target).cmp(&(b ^ target))
}

impl BitXor for Id {
    type Output = Id;

    fn bitxor(self, rhs: Id) -> Id {
        let mut res = Id::ZERO;
        for (a, b, r) in izip!(&self.0, &rhs.0, &mut res.0) {
            *r = a ^ b;
        }
        res
    }
}

impl BitAnd for Id {
    type Output = Id;

    fn bitand(self, rhs: Id) -> Id {
        let mut res = Id::ZERO;
        for (a, b, r) in izip!(&self.0, &rhs.0, &mut res.0) {
            *r = a & b;
        }
        res
    }
}

impl BitOr for Id {
    type Output = Id;

    fn bitor(self, rhs: Id) -> Id {
        let mut res = Id::ZERO;
        for (a, b, r) in izip!(&self.0, &rhs.0, &mut res.0) {
            *r = a | b;
        }
        res
    }
}

impl Not for Id {
    type Output = Id;

    fn not(self) -> Id {
        let mut res = self;
        for x in res.0.iter_mut() {
            *x = !*x;
        }
        res
    }
}

impl Distribution<Id> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Id {
        let mut res = Id::ZERO;
        rng.fill(&mut res.0[..]);
        res
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Id").field(&self.as_short_hex()).finish()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_short_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor() {
        let a = Id([1; ID_LEN]);
        let b = Id::ZERO;
        assert_eq!(a ^ a, b);
        assert_eq!(a ^ b, a);
        assert_eq!(b ^ a, a);
    }

    #[test]
    fn distance_symmetry() {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let a: Id = rng.gen();
            let b: Id = rng.gen();
            assert_eq!(distance(a, b), distance(b, a));
            assert_eq!(distance(a, a), Id::ZERO);
        }
    }

    #[test]
    fn leading_zeros() {
        let mut a = Id::ZERO;
        assert_eq!(a.leading_zeros(), 160);
        a.0[9] = 2;
        assert_eq!(a.leading_zeros(), 9 * 8 + 6);
        a.0[0] = 1;
        assert_eq!(a.leading_zeros(), 7);
    }

    #[test]
    fn order_is_msb_first() {
        let a = Id::from_hex("01").unwrap();
        let b = Id::from_hex("02").unwrap();
        let c = Id::ZERO.set_bit(159);
        assert!(a < b);
        assert!(c < a);
        assert!(Id::ZERO < c);
    }

    #[test]
    fn distance_order_is_strict() {
        use std::cmp::Ordering;

        let mut rng = rand::thread_rng();
        let target: Id = rng.gen();
        for _ in 0..32 {
            let a: Id = rng.gen();
            let b: Id = rng.gen();
            let ab = cmp_by_distance(a, b, target);
            let ba = cmp_by_distance(b, a, target);
            assert_eq!(ab, ba.reverse());
            assert_eq!(ab == Ordering::Equal, a == b);
        }
        assert_eq!(cmp_by_distance(target, target, target), Ordering::Equal);
    }

    #[test]
    fn bit_helpers() {
        assert_eq!(Id::ZERO.set_bit(0), Id::from_hex("80").unwrap());
        assert_eq!(Id::ZERO.set_bit(9), Id::from_hex("0040").unwrap());
        assert_eq!(Id::create_left_mask(0), Id::ZERO);
        assert_eq!(Id::create_left_mask(12), Id::from_hex("fff0").unwrap());
        assert_eq!(Id::create_left_mask(160), !Id::ZERO);
    }

    #[test]
    fn hex_roundtrip() {
        let id = Id::from_hex("a000000000000000000000000000000000000000").unwrap();
        assert_eq!(id, Id::from_hex("a0").unwrap());
        assert_eq!(id.as_short_hex(), id.as_hex());
        assert_eq!(Id::from_hex("00ff").unwrap().as_short_hex(), "ff".to_owned() + &"0".repeat(36));
        assert_eq!(Id::from_hex(&id.as_hex()).unwrap(), id);
        assert!(Id::from_hex("zz").is_err());
    }

    #[test]
    fn key_mapping() {
        let hex_key = "00000000000000000000000000000000000000aa";
        assert_eq!(Id::for_key(hex_key), Id::from_hex(hex_key).unwrap());
        // Non-hex keys of any length go through the digest
        assert_ne!(Id::for_key("k1"), Id::for_key("k2"));
        assert_eq!(Id::for_key("k1"), Id::for_key("k1"));
    }

    #[test]
    fn addr_identity_is_stable() {
        let addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        assert_eq!(Id::from_addr(&addr), Id::from_addr(&addr));
        let other: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        assert_ne!(Id::from_addr(&addr), Id::from_addr(&other));
    }
}
