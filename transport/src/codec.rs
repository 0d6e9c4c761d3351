use std::{
    fmt::{self, Debug, Display, Write},
    net::{IpAddr, SocketAddr},
};

use rand::Rng;
use thiserror::Error;
use udht_logic::{consts::ID_LEN, Id};

/// Hard cap on a single frame; anything longer is malformed.
pub const MAX_DATAGRAM: usize = 4096;

// A frame never carries more payload pairs than this
const MAX_PAYLOAD_PAIRS: usize = 8;

/// Message framing: `kind|sender_id|request_id|n|k1|v1|...|kn|vn|`,
/// printable bytes only. The pipe is the field separator and the newline
/// is reserved, neither may appear inside a payload value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub sender: Id,
    pub request_id: RequestId,
    pub body: Body,
}

/// Correlation token: 16 random bytes, hex on the wire. Drawn from a
/// cryptographically secure generator so a response cannot be forged
/// without seeing the request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub [u8; 16]);

impl RequestId {
    pub fn random() -> Self {
        RequestId(rand::thread_rng().gen())
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestId").field(&hex::encode(self.0)).finish()
    }
}

/// A peer as carried inside a `nodes` payload: `ip:port:id`. The id
/// travels with the address so the receiver never has to re-derive it
/// from a possibly rewritten source address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: Id,
    pub addr: SocketAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping = 0,
    FindNode = 1,
    Store = 2,
    FindValue = 3,
    PingResponse = 4,
    FindNodeResponse = 5,
    StoreResponse = 6,
    FindValueResponse = 7,
}

impl MessageKind {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: &str) -> Option<MessageKind> {
        use MessageKind::*;
        Some(match code {
            "0" => Ping,
            "1" => FindNode,
            "2" => Store,
            "3" => FindValue,
            "4" => PingResponse,
            "5" => FindNodeResponse,
            "6" => StoreResponse,
            "7" => FindValueResponse,
            _ => return None,
        })
    }

    pub fn is_request(&self) -> bool {
        self.code() < 4
    }

    /// The response kind correlating to a request kind.
    pub fn response_kind(&self) -> Option<MessageKind> {
        use MessageKind::*;
        Some(match self {
            Ping => PingResponse,
            FindNode => FindNodeResponse,
            Store => StoreResponse,
            FindValue => FindValueResponse,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    Ping,
    PingResponse,
    FindNode { target: Id },
    FindNodeResponse { nodes: Vec<PeerInfo> },
    Store { key: String, value: String },
    StoreResponse { ok: bool },
    FindValue { key: String },
    FindValueResponse(FindValueReply),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueReply {
    Value(String),
    Nodes(Vec<PeerInfo>),
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        use MessageKind as K;
        match self {
            Body::Ping => K::Ping,
            Body::PingResponse => K::PingResponse,
            Body::FindNode { .. } => K::FindNode,
            Body::FindNodeResponse { .. } => K::FindNodeResponse,
            Body::Store { .. } => K::Store,
            Body::StoreResponse { .. } => K::StoreResponse,
            Body::FindValue { .. } => K::FindValue,
            Body::FindValueResponse(_) => K::FindValueResponse,
        }
    }

    fn payload(&self) -> Result<Vec<(&'static str, String)>, CodecError> {
        let res = match self {
            Body::Ping | Body::PingResponse => vec![],
            Body::FindNode { target } => vec![("target_id", target.as_hex())],
            Body::FindNodeResponse { nodes } => vec![("nodes", encode_nodes(nodes))],
            Body::Store { key, value } => {
                vec![("key", key.clone()), ("value", value.clone())]
            }
            Body::StoreResponse { ok } => {
                vec![("ok", if *ok { "1" } else { "0" }.to_owned())]
            }
            Body::FindValue { key } => vec![("key", key.clone())],
            Body::FindValueResponse(FindValueReply::Value(value)) => {
                vec![("value", value.clone())]
            }
            Body::FindValueResponse(FindValueReply::Nodes(nodes)) => {
                vec![("nodes", encode_nodes(nodes))]
            }
        };
        for (_, value) in &res {
            if value.bytes().any(|b| b == b'|' || b == b'\n') {
                return Err(CodecError::ForbiddenByte);
            }
        }
        Ok(res)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    #[error("Frame larger than {MAX_DATAGRAM} bytes")]
    Oversized,
    #[error("Frame is not printable text")]
    NotText,
    #[error("Frame ended early")]
    Truncated,
    #[error("Unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("Bad identifier field")]
    BadId,
    #[error("Bad request id field")]
    BadRequestId,
    #[error("Bad payload pair count")]
    BadPayloadCount,
    #[error("Missing payload key {0:?}")]
    MissingKey(&'static str),
    #[error("Separator byte inside a payload value")]
    ForbiddenByte,
    #[error("Bad node list entry")]
    BadNodeEntry,
    #[error("Bad boolean flag")]
    BadFlag,
}

fn encode_nodes(nodes: &[PeerInfo]) -> String {
    let mut out = String::new();
    for (i, node) in nodes.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(
            out,
            "{}:{}:{}",
            node.addr.ip(),
            node.addr.port(),
            node.id.as_hex()
        );
    }
    out
}

fn decode_nodes(data: &str) -> Result<Vec<PeerInfo>, CodecError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    data.split(',')
        .map(|entry| {
            // The id and port cannot contain ':', the (v6) ip can: parse
            // from the right
            let mut parts = entry.rsplitn(3, ':');
            let id = parts.next().ok_or(CodecError::BadNodeEntry)?;
            let port = parts.next().ok_or(CodecError::BadNodeEntry)?;
            let ip = parts.next().ok_or(CodecError::BadNodeEntry)?;

            let id = decode_id(id)?;
            let port: u16 = port.parse().map_err(|_| CodecError::BadNodeEntry)?;
            let ip: IpAddr = ip.parse().map_err(|_| CodecError::BadNodeEntry)?;
            Ok(PeerInfo {
                id,
                addr: SocketAddr::new(ip, port),
            })
        })
        .collect()
}

fn decode_id(data: &str) -> Result<Id, CodecError> {
    if data.len() != 2 * ID_LEN {
        return Err(CodecError::BadId);
    }
    Id::from_hex(data).map_err(|_| CodecError::BadId)
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let payload = self.body.payload()?;

        let mut out = String::with_capacity(128);
        let _ = write!(
            out,
            "{}|{}|{}|{}|",
            self.body.kind().code(),
            self.sender.as_hex(),
            self.request_id,
            payload.len()
        );
        for (key, value) in &payload {
            let _ = write!(out, "{key}|{value}|");
        }

        if out.len() > MAX_DATAGRAM {
            return Err(CodecError::Oversized);
        }
        Ok(out.into_bytes())
    }

    pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
        if data.len() > MAX_DATAGRAM {
            return Err(CodecError::Oversized);
        }
        let text = std::str::from_utf8(data).map_err(|_| CodecError::NotText)?;

        let mut parts = text.split('|');
        let mut next = || parts.next().ok_or(CodecError::Truncated);

        let kind = next()?;
        let kind =
            MessageKind::from_code(kind).ok_or_else(|| CodecError::UnknownKind(kind.to_owned()))?;
        let sender = decode_id(next()?)?;
        let request_id = next()?;
        if request_id.len() != 32 {
            return Err(CodecError::BadRequestId);
        }
        let mut token = [0u8; 16];
        hex::decode_to_slice(request_id, &mut token).map_err(|_| CodecError::BadRequestId)?;

        let count: usize = next()?.parse().map_err(|_| CodecError::BadPayloadCount)?;
        if count > MAX_PAYLOAD_PAIRS {
            return Err(CodecError::BadPayloadCount);
        }
        let mut payload = Vec::with_capacity(count);
        for _ in 0..count {
            let key = next()?;
            let value = next()?;
            payload.push((key, value));
        }
        // Nothing but the trailing separator may follow
        if parts.next() != Some("") || parts.next().is_some() {
            return Err(CodecError::Truncated);
        }

        let get = |key: &'static str| {
            payload
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| *v)
                .ok_or(CodecError::MissingKey(key))
        };

        use MessageKind as K;
        let body = match kind {
            K::Ping => Body::Ping,
            K::PingResponse => Body::PingResponse,
            K::FindNode => Body::FindNode {
                target: decode_id(get("target_id")?)?,
            },
            K::FindNodeResponse => Body::FindNodeResponse {
                nodes: decode_nodes(get("nodes")?)?,
            },
            K::Store => Body::Store {
                key: get("key")?.to_owned(),
                value: get("value")?.to_owned(),
            },
            K::StoreResponse => Body::StoreResponse {
                ok: match get("ok")? {
                    "1" => true,
                    "0" => false,
                    _ => return Err(CodecError::BadFlag),
                },
            },
            K::FindValue => Body::FindValue {
                key: get("key")?.to_owned(),
            },
            K::FindValueResponse => match get("value") {
                Ok(value) => Body::FindValueResponse(FindValueReply::Value(value.to_owned())),
                Err(_) => {
                    Body::FindValueResponse(FindValueReply::Nodes(decode_nodes(get("nodes")?)?))
                }
            },
        };

        Ok(Message {
            sender,
            request_id: RequestId(token),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(body: Body) -> Message {
        Message {
            sender: Id::from_hex("aa00000000000000000000000000000000000bbb").unwrap(),
            request_id: RequestId([7; 16]),
            body,
        }
    }

    fn roundtrip(body: Body) {
        let m = msg(body);
        let encoded = m.encode().unwrap();
        assert_eq!(Message::decode(&encoded).unwrap(), m);
    }

    fn peer(id_hex: &str, addr: &str) -> PeerInfo {
        PeerInfo {
            id: Id::from_hex(id_hex).unwrap(),
            addr: addr.parse().unwrap(),
        }
    }

    #[test]
    fn frame_layout() {
        let encoded = msg(Body::Ping).encode().unwrap();
        assert_eq!(
            String::from_utf8(encoded).unwrap(),
            "0|aa00000000000000000000000000000000000bbb|07070707070707070707070707070707|0|"
        );
    }

    #[test]
    fn representative_roundtrips() {
        roundtrip(Body::Ping);
        roundtrip(Body::PingResponse);
        roundtrip(Body::FindNode {
            target: Id::from_hex("f0").unwrap(),
        });
        roundtrip(Body::FindNodeResponse {
            nodes: vec![
                peer("0a", "10.0.0.1:4000"),
                peer("0b", "[2001:db8::17]:4001"),
            ],
        });
        roundtrip(Body::FindNodeResponse { nodes: vec![] });
        roundtrip(Body::Store {
            key: "announce".into(),
            value: "10.0.0.1:4000".into(),
        });
        roundtrip(Body::StoreResponse { ok: false });
        roundtrip(Body::FindValue { key: "kq".into() });
        roundtrip(Body::FindValueResponse(FindValueReply::Value("vq".into())));
        roundtrip(Body::FindValueResponse(FindValueReply::Nodes(vec![peer(
            "0c",
            "10.0.0.2:4002",
        )])));
    }

    #[test]
    fn rejects_separator_in_values() {
        let m = msg(Body::Store {
            key: "k".into(),
            value: "a|b".into(),
        });
        assert_eq!(m.encode(), Err(CodecError::ForbiddenByte));
        let m = msg(Body::FindValue { key: "a\nb".into() });
        assert_eq!(m.encode(), Err(CodecError::ForbiddenByte));
    }

    #[test]
    fn rejects_oversized_frames() {
        let m = msg(Body::Store {
            key: "k".into(),
            value: "v".repeat(MAX_DATAGRAM),
        });
        assert_eq!(m.encode(), Err(CodecError::Oversized));
        assert_eq!(
            Message::decode(&vec![b'0'; MAX_DATAGRAM + 1]),
            Err(CodecError::Oversized)
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        let ok = msg(Body::Ping).encode().unwrap();
        let text = String::from_utf8(ok).unwrap();

        assert!(matches!(
            Message::decode(b""),
            Err(CodecError::UnknownKind(_))
        ));
        assert_eq!(
            Message::decode(text.trim_end_matches('|').as_bytes()),
            Err(CodecError::Truncated)
        );
        assert!(matches!(
            Message::decode(format!("9{}", &text[1..]).as_bytes()),
            Err(CodecError::UnknownKind(_))
        ));
        assert_eq!(
            Message::decode(format!("{text}garbage|").as_bytes()),
            Err(CodecError::Truncated)
        );
        assert_eq!(
            Message::decode("0|xyz|07070707070707070707070707070707|0|".as_bytes()),
            Err(CodecError::BadId)
        );
        assert_eq!(
            Message::decode("0|aa00000000000000000000000000000000000bbb|xx|0|".as_bytes()),
            Err(CodecError::BadRequestId)
        );
        assert_eq!(
            Message::decode(
                "6|aa00000000000000000000000000000000000bbb|07070707070707070707070707070707|1|ok|2|"
                    .as_bytes()
            ),
            Err(CodecError::BadFlag)
        );
        assert_eq!(
            Message::decode(
                "2|aa00000000000000000000000000000000000bbb|07070707070707070707070707070707|1|key|k|"
                    .as_bytes()
            ),
            Err(CodecError::MissingKey("value"))
        );
    }

    #[test]
    fn rejects_bad_node_entries() {
        let base = "5|aa00000000000000000000000000000000000bbb|07070707070707070707070707070707|1|nodes|";
        for bad in ["10.0.0.1:4000", "nonsense", "10.0.0.1:x:0a", ":4000:0a"] {
            let r = Message::decode(format!("{base}{bad}|").as_bytes());
            assert!(
                matches!(r, Err(CodecError::BadNodeEntry) | Err(CodecError::BadId)),
                "{bad} -> {r:?}"
            );
        }
    }

    #[test]
    fn unknown_payload_keys_are_ignored() {
        let text = "0|aa00000000000000000000000000000000000bbb|07070707070707070707070707070707|1|future|x|";
        assert_eq!(Message::decode(text.as_bytes()).unwrap().body, Body::Ping);
    }

    #[test]
    fn request_response_kind_pairing() {
        use MessageKind::*;
        for kind in [Ping, FindNode, Store, FindValue] {
            assert!(kind.is_request());
            let resp = kind.response_kind().unwrap();
            assert!(!resp.is_request());
            assert_eq!(resp.code(), kind.code() + 4);
        }
        assert_eq!(PingResponse.response_kind(), None);
    }
}
