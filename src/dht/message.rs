use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;

use crate::bencode::Value;

use super::error::DhtError;
use super::id::Id;
use super::krpc::{KrpcMessage, TransactionId};

const NODE_RECORD_LEN: usize = 26;
const PEER_RECORD_LEN: usize = 6;

/// How long an unanswered query's record is kept before the sweep drops it.
const PENDING_QUERY_TTL: Duration = Duration::from_secs(15 * 60);

/// A packed node record from a `nodes` field: id plus IPv4 endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub id: Id,
    pub addr: SocketAddrV4,
}

impl CompactNode {
    pub fn to_record(&self) -> [u8; NODE_RECORD_LEN] {
        let mut record = [0u8; NODE_RECORD_LEN];
        record[..20].copy_from_slice(self.id.as_bytes());
        record[20..24].copy_from_slice(&self.addr.ip().octets());
        record[24..].copy_from_slice(&self.addr.port().to_be_bytes());
        record
    }

    fn from_record(record: &[u8]) -> Result<Self, DhtError> {
        let id = Id::from_bytes(&record[..20])?;
        let ip = Ipv4Addr::new(record[20], record[21], record[22], record[23]);
        let port = u16::from_be_bytes([record[24], record[25]]);
        Ok(Self {
            id,
            addr: SocketAddrV4::new(ip, port),
        })
    }
}

fn unpack_nodes(blob: &[u8]) -> Result<Vec<CompactNode>, DhtError> {
    if blob.len() % NODE_RECORD_LEN != 0 {
        return Err(DhtError::TruncatedRecords {
            kind: "node",
            len: blob.len(),
        });
    }
    blob.chunks_exact(NODE_RECORD_LEN)
        .map(CompactNode::from_record)
        .collect()
}

fn pack_nodes(nodes: &[CompactNode]) -> Bytes {
    let mut blob = Vec::with_capacity(nodes.len() * NODE_RECORD_LEN);
    for node in nodes {
        blob.extend_from_slice(&node.to_record());
    }
    Bytes::from(blob)
}

fn unpack_peer(record: &[u8]) -> Result<SocketAddrV4, DhtError> {
    if record.len() != PEER_RECORD_LEN {
        return Err(DhtError::TruncatedRecords {
            kind: "peer",
            len: record.len(),
        });
    }
    let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
    let port = u16::from_be_bytes([record[4], record[5]]);
    Ok(SocketAddrV4::new(ip, port))
}

fn pack_peer(addr: &SocketAddrV4) -> [u8; PEER_RECORD_LEN] {
    let mut record = [0u8; PEER_RECORD_LEN];
    record[..4].copy_from_slice(&addr.ip().octets());
    record[4..].copy_from_slice(&addr.port().to_be_bytes());
    record
}

/// The four query methods in the DHT vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMethod {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl QueryMethod {
    pub fn name(&self) -> &'static str {
        match self {
            QueryMethod::Ping => "ping",
            QueryMethod::FindNode => "find_node",
            QueryMethod::GetPeers => "get_peers",
            QueryMethod::AnnouncePeer => "announce_peer",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "ping" => Some(QueryMethod::Ping),
            "find_node" => Some(QueryMethod::FindNode),
            "get_peers" => Some(QueryMethod::GetPeers),
            "announce_peer" => Some(QueryMethod::AnnouncePeer),
            _ => None,
        }
    }
}

/// The four remote fault classes and their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Generic,
    Server,
    Protocol,
    UnknownMethod,
}

impl FaultKind {
    pub fn code(&self) -> i64 {
        match self {
            FaultKind::Generic => 201,
            FaultKind::Server => 202,
            FaultKind::Protocol => 203,
            FaultKind::UnknownMethod => 204,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            201 => Some(FaultKind::Generic),
            202 => Some(FaultKind::Server),
            203 => Some(FaultKind::Protocol),
            204 => Some(FaultKind::UnknownMethod),
            _ => None,
        }
    }
}

/// A fully typed DHT message.
///
/// Replies carry no method name on the wire, so typing one needs the
/// [`QueryTracker`] record left behind when the matching query went out.
#[derive(Debug, Clone)]
pub enum DhtMessage {
    PingQuery {
        tid: TransactionId,
        id: Id,
    },
    FindNodeQuery {
        tid: TransactionId,
        id: Id,
        target: Id,
    },
    GetPeersQuery {
        tid: TransactionId,
        id: Id,
        info_hash: Id,
    },
    AnnouncePeerQuery {
        tid: TransactionId,
        id: Id,
        info_hash: Id,
        port: u16,
        token: Bytes,
    },
    PingReply {
        tid: TransactionId,
        id: Id,
    },
    FindNodeReply {
        tid: TransactionId,
        id: Id,
        nodes: Vec<CompactNode>,
    },
    GetPeersReply {
        tid: TransactionId,
        id: Id,
        token: Bytes,
        peers: Option<Vec<SocketAddrV4>>,
        nodes: Option<Vec<CompactNode>>,
    },
    AnnouncePeerReply {
        tid: TransactionId,
        id: Id,
    },
    Fault {
        tid: TransactionId,
        kind: FaultKind,
        message: String,
    },
}

impl DhtMessage {
    /// Types a decoded envelope. Replies are typed through `tracker`,
    /// consuming the pending record for their transaction id.
    pub fn from_krpc(msg: KrpcMessage, tracker: &QueryTracker) -> Result<Self, DhtError> {
        match msg {
            KrpcMessage::Query { tid, method, args } => Self::type_query(tid, &method, &args),
            KrpcMessage::Response { tid, values } => {
                let method = tracker.take(&tid).ok_or(DhtError::UnmatchedReply)?;
                Self::type_reply(tid, method, &values)
            }
            KrpcMessage::Error { tid, code, message } => {
                let kind = FaultKind::from_code(code).ok_or(DhtError::UnknownFaultCode(code))?;
                Ok(DhtMessage::Fault { tid, kind, message })
            }
        }
    }

    fn type_query(
        tid: TransactionId,
        method: &str,
        args: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let method = QueryMethod::from_name(method)
            .ok_or_else(|| DhtError::UnknownMethod(method.to_owned()))?;
        let id = field_id(args, "id")?;
        Ok(match method {
            QueryMethod::Ping => DhtMessage::PingQuery { tid, id },
            QueryMethod::FindNode => DhtMessage::FindNodeQuery {
                tid,
                id,
                target: field_id(args, "target")?,
            },
            QueryMethod::GetPeers => DhtMessage::GetPeersQuery {
                tid,
                id,
                info_hash: field_id(args, "info_hash")?,
            },
            QueryMethod::AnnouncePeer => DhtMessage::AnnouncePeerQuery {
                tid,
                id,
                info_hash: field_id(args, "info_hash")?,
                port: field_int(args, "port")? as u16,
                token: field_bytes(args, "token")?,
            },
        })
    }

    fn type_reply(
        tid: TransactionId,
        method: QueryMethod,
        values: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let id = field_id(values, "id")?;
        Ok(match method {
            QueryMethod::Ping => DhtMessage::PingReply { tid, id },
            QueryMethod::AnnouncePeer => DhtMessage::AnnouncePeerReply { tid, id },
            QueryMethod::FindNode => {
                // some peers omit the field entirely; treat that as empty
                let nodes = match values.get(b"nodes".as_slice()).and_then(|v| v.as_bytes()) {
                    Some(blob) => unpack_nodes(blob)?,
                    None => Vec::new(),
                };
                DhtMessage::FindNodeReply { tid, id, nodes }
            }
            QueryMethod::GetPeers => {
                let token = field_bytes(values, "token")?;
                let peers = values
                    .get(b"values".as_slice())
                    .map(|v| {
                        v.as_list()
                            .ok_or_else(|| DhtError::InvalidEnvelope("values is not a list".into()))?
                            .iter()
                            .map(|entry| {
                                entry
                                    .as_bytes()
                                    .ok_or_else(|| DhtError::InvalidEnvelope(
                                        "peer record is not a byte string".into(),
                                    ))
                                    .and_then(|b| unpack_peer(b))
                            })
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .transpose()?;
                let nodes = values
                    .get(b"nodes".as_slice())
                    .and_then(|v| v.as_bytes())
                    .map(|blob| unpack_nodes(blob))
                    .transpose()?;
                if peers.is_none() && nodes.is_none() {
                    return Err(DhtError::InvalidEnvelope(
                        "get_peers reply carries neither values nor nodes".into(),
                    ));
                }
                DhtMessage::GetPeersReply {
                    tid,
                    id,
                    token,
                    peers,
                    nodes,
                }
            }
        })
    }

    /// Shapes this message onto the generic envelope.
    pub fn to_krpc(&self) -> KrpcMessage {
        match self {
            DhtMessage::PingQuery { tid, id } => {
                query(tid, QueryMethod::Ping, args([("id", id_value(id))]))
            }
            DhtMessage::FindNodeQuery { tid, id, target } => query(
                tid,
                QueryMethod::FindNode,
                args([("id", id_value(id)), ("target", id_value(target))]),
            ),
            DhtMessage::GetPeersQuery { tid, id, info_hash } => query(
                tid,
                QueryMethod::GetPeers,
                args([("id", id_value(id)), ("info_hash", id_value(info_hash))]),
            ),
            DhtMessage::AnnouncePeerQuery {
                tid,
                id,
                info_hash,
                port,
                token,
            } => query(
                tid,
                QueryMethod::AnnouncePeer,
                args([
                    ("id", id_value(id)),
                    ("info_hash", id_value(info_hash)),
                    ("port", Value::Int(*port as i64)),
                    ("token", Value::Bytes(token.clone())),
                ]),
            ),
            DhtMessage::PingReply { tid, id } | DhtMessage::AnnouncePeerReply { tid, id } => {
                response(tid, args([("id", id_value(id))]))
            }
            DhtMessage::FindNodeReply { tid, id, nodes } => response(
                tid,
                args([
                    ("id", id_value(id)),
                    ("nodes", Value::Bytes(pack_nodes(nodes))),
                ]),
            ),
            DhtMessage::GetPeersReply {
                tid,
                id,
                token,
                peers,
                nodes,
            } => {
                let mut values = args([
                    ("id", id_value(id)),
                    ("token", Value::Bytes(token.clone())),
                ]);
                if let Some(peers) = peers {
                    let records = peers
                        .iter()
                        .map(|addr| Value::Bytes(Bytes::copy_from_slice(&pack_peer(addr))))
                        .collect();
                    values.insert(Bytes::from_static(b"values"), Value::List(records));
                }
                if let Some(nodes) = nodes {
                    values.insert(Bytes::from_static(b"nodes"), Value::Bytes(pack_nodes(nodes)));
                }
                response(tid, values)
            }
            DhtMessage::Fault { tid, kind, message } => KrpcMessage::Error {
                tid: tid.clone(),
                code: kind.code(),
                message: message.clone(),
            },
        }
    }
}

fn query(tid: &TransactionId, method: QueryMethod, args: BTreeMap<Bytes, Value>) -> KrpcMessage {
    KrpcMessage::Query {
        tid: tid.clone(),
        method: method.name().to_owned(),
        args,
    }
}

fn response(tid: &TransactionId, values: BTreeMap<Bytes, Value>) -> KrpcMessage {
    KrpcMessage::Response {
        tid: tid.clone(),
        values,
    }
}

fn args<const N: usize>(entries: [(&'static str, Value); N]) -> BTreeMap<Bytes, Value> {
    entries
        .into_iter()
        .map(|(key, value)| (Bytes::from_static(key.as_bytes()), value))
        .collect()
}

fn id_value(id: &Id) -> Value {
    Value::Bytes(Bytes::copy_from_slice(id.as_bytes()))
}

fn field_id(fields: &BTreeMap<Bytes, Value>, key: &str) -> Result<Id, DhtError> {
    fields
        .get(key.as_bytes())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| DhtError::InvalidEnvelope(format!("missing field {key}")))
        .and_then(|b| Id::from_bytes(b))
}

fn field_bytes(fields: &BTreeMap<Bytes, Value>, key: &str) -> Result<Bytes, DhtError> {
    fields
        .get(key.as_bytes())
        .and_then(|v| v.as_bytes())
        .cloned()
        .ok_or_else(|| DhtError::InvalidEnvelope(format!("missing field {key}")))
}

fn field_int(fields: &BTreeMap<Bytes, Value>, key: &str) -> Result<i64, DhtError> {
    fields
        .get(key.as_bytes())
        .and_then(|v| v.as_int())
        .ok_or_else(|| DhtError::InvalidEnvelope(format!("missing field {key}")))
}

/// A record of one outgoing query awaiting its reply.
#[derive(Debug, Clone, Copy)]
struct PendingQuery {
    method: QueryMethod,
    sent_at: Instant,
}

/// Remembers, per transaction id, which method an eventual reply must be
/// interpreted with. Records are consumed by the matching reply or swept
/// once they outlive the pending-query TTL.
#[derive(Debug, Default)]
pub struct QueryTracker {
    inflight: DashMap<TransactionId, PendingQuery>,
}

impl QueryTracker {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Records an outgoing query.
    pub fn record(&self, tid: TransactionId, method: QueryMethod) {
        self.inflight.insert(
            tid,
            PendingQuery {
                method,
                sent_at: Instant::now(),
            },
        );
    }

    /// Consumes the record matching `tid`, if any.
    pub fn take(&self, tid: &TransactionId) -> Option<QueryMethod> {
        self.inflight.remove(tid).map(|(_, pending)| pending.method)
    }

    /// Drops records older than the pending-query TTL.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.inflight
            .retain(|_, pending| now.duration_since(pending.sent_at) < PENDING_QUERY_TTL);
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}
