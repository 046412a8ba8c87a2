use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::id::Id;

/// How long the newest issued token keeps being handed back for repeated
/// `get_peers` from the same node.
const TOKEN_REUSE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// How long an issued token stays acceptable in an `announce_peer`.
const TOKEN_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// A token handed out in a `get_peers` reply.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: Bytes,
    pub issued_at: Instant,
}

/// One known peer in the routing table.
///
/// Identity is the id alone; the address and liveness timestamps are
/// mutable bookkeeping, refreshed as the peer is re-observed.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: Id,
    pub addr: SocketAddr,
    /// When this peer last sent us a query.
    pub last_query_at: Instant,
    /// When this peer last sent us a reply.
    pub last_reply_at: Instant,
    /// Whether this peer has ever replied to us.
    pub replied: bool,
    /// Tokens issued to this peer, newest first.
    pub tokens: Vec<IssuedToken>,
}

impl Node {
    pub fn new(id: Id, addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            last_query_at: now,
            last_reply_at: now,
            replied: false,
            tokens: Vec::new(),
        }
    }

    /// Token for a `get_peers` reply: the newest issued one while it is
    /// still inside the reuse window, a fresh one otherwise. Expired tokens
    /// are pruned from the tail either way.
    pub fn grant_token(&mut self) -> Bytes {
        let now = Instant::now();
        let token = match self.tokens.first() {
            Some(front) if now.duration_since(front.issued_at) <= TOKEN_REUSE_WINDOW => {
                front.token.clone()
            }
            _ => {
                let token = fresh_token();
                self.tokens.insert(
                    0,
                    IssuedToken {
                        token: token.clone(),
                        issued_at: now,
                    },
                );
                token
            }
        };
        while let Some(last) = self.tokens.last() {
            if now.duration_since(last.issued_at) > TOKEN_LIFETIME {
                self.tokens.pop();
            } else {
                break;
            }
        }
        token
    }

    /// Whether `token` was issued to this peer and is still inside the
    /// acceptance window.
    pub fn accepts_token(&self, token: &[u8]) -> bool {
        let now = Instant::now();
        self.tokens
            .iter()
            .take_while(|t| now.duration_since(t.issued_at) <= TOKEN_LIFETIME)
            .any(|t| t.token.as_ref() == token)
    }
}

/// Four random bytes, the same shape for node tokens and one-shot tokens.
pub(crate) fn fresh_token() -> Bytes {
    Bytes::copy_from_slice(&rand::random::<[u8; 4]>())
}
