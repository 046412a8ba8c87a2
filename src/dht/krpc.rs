use std::collections::BTreeMap;

use bytes::Bytes;

use crate::bencode::{self, Value};

use super::error::DhtError;

/// Correlates a reply or error with the query it answers.
pub type TransactionId = Bytes;

/// The generic KRPC envelope: every datagram carries exactly one of these.
///
/// The envelope knows methods only as strings and payloads only as bencode
/// dictionaries; the typed vocabulary on top of it is [`super::DhtMessage`].
#[derive(Debug, Clone)]
pub enum KrpcMessage {
    /// `y = q`: a query naming its method and carrying an argument dict.
    Query {
        tid: TransactionId,
        method: String,
        args: BTreeMap<Bytes, Value>,
    },
    /// `y = r`: a reply carrying a result dict.
    Response {
        tid: TransactionId,
        values: BTreeMap<Bytes, Value>,
    },
    /// `y = e`: a remote fault carrying a numeric code and a message.
    Error {
        tid: TransactionId,
        code: i64,
        message: String,
    },
}

impl KrpcMessage {
    /// Mints the 4 random bytes correlating a query with its reply.
    pub fn new_tid() -> TransactionId {
        Bytes::copy_from_slice(&rand::random::<[u8; 4]>())
    }

    pub fn tid(&self) -> &TransactionId {
        match self {
            KrpcMessage::Query { tid, .. }
            | KrpcMessage::Response { tid, .. }
            | KrpcMessage::Error { tid, .. } => tid,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut envelope = BTreeMap::new();
        envelope.insert(Bytes::from_static(b"t"), Value::Bytes(self.tid().clone()));
        match self {
            KrpcMessage::Query { method, args, .. } => {
                envelope.insert(Bytes::from_static(b"y"), Value::string("q"));
                envelope.insert(Bytes::from_static(b"q"), Value::string(method));
                envelope.insert(Bytes::from_static(b"a"), Value::Dict(args.clone()));
            }
            KrpcMessage::Response { values, .. } => {
                envelope.insert(Bytes::from_static(b"y"), Value::string("r"));
                envelope.insert(Bytes::from_static(b"r"), Value::Dict(values.clone()));
            }
            KrpcMessage::Error { code, message, .. } => {
                envelope.insert(Bytes::from_static(b"y"), Value::string("e"));
                envelope.insert(
                    Bytes::from_static(b"e"),
                    Value::List(vec![Value::Int(*code), Value::string(message)]),
                );
            }
        }
        bencode::encode(&Value::Dict(envelope))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DhtError> {
        let value = bencode::decode(data)?;
        if value.as_dict().is_none() {
            return Err(DhtError::InvalidEnvelope("envelope is not a dict".into()));
        }

        let tid = value
            .get(b"t")
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| DhtError::InvalidEnvelope("missing transaction id".into()))?;
        let tag = value
            .get(b"y")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DhtError::InvalidEnvelope("missing message tag".into()))?;

        match tag {
            "q" => {
                let method = value
                    .get(b"q")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| DhtError::InvalidEnvelope("query without method".into()))?
                    .to_owned();
                let args = value
                    .get(b"a")
                    .and_then(|v| v.as_dict())
                    .cloned()
                    .ok_or_else(|| DhtError::InvalidEnvelope("query without arguments".into()))?;
                Ok(KrpcMessage::Query { tid, method, args })
            }
            "r" => {
                let values = value
                    .get(b"r")
                    .and_then(|v| v.as_dict())
                    .cloned()
                    .ok_or_else(|| DhtError::InvalidEnvelope("reply without result dict".into()))?;
                Ok(KrpcMessage::Response { tid, values })
            }
            "e" => {
                let detail = value
                    .get(b"e")
                    .and_then(|v| v.as_list())
                    .ok_or_else(|| DhtError::InvalidEnvelope("error without detail list".into()))?;
                let code = detail
                    .first()
                    .and_then(|v| v.as_int())
                    .ok_or_else(|| DhtError::InvalidEnvelope("error without code".into()))?;
                let message = detail
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_owned();
                Ok(KrpcMessage::Error { tid, code, message })
            }
            _ => Err(DhtError::InvalidEnvelope("unknown message tag".into())),
        }
    }
}
