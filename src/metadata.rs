//! Content-descriptor fetching.
//!
//! When an announcement looks interesting the crawler hands the announcer
//! here. A detached task connects over TCP, performs the BitTorrent
//! handshake with the extension-protocol bit set, negotiates `ut_metadata`
//! (BEP-9), downloads the metadata piece by piece, and verifies the result
//! against the announced info-hash. Best effort only: every failure is
//! logged and forgotten, and nothing ever reaches back into the crawler.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::bencode::{self, Value};
use crate::dht::{CrawlerListener, Id};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata is transferred in 16 KiB pieces.
const PIECE_LEN: usize = 16384;

/// Upper bound on a plausible metadata dictionary.
const MAX_METADATA_LEN: usize = 1024 * 1024;

const PROTOCOL: &[u8] = b"BitTorrent protocol";
const EXTENSION_MSG: u8 = 20;
const EXT_HANDSHAKE_ID: u8 = 0;
const OUR_UT_METADATA_ID: u8 = 1;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("peer sent a malformed handshake")]
    BadHandshake,

    #[error("peer does not support metadata exchange")]
    NoMetadataExtension,

    #[error("peer rejected or garbled the metadata exchange")]
    ExchangeFailed,

    #[error("metadata does not hash to the announced info-hash")]
    HashMismatch,

    #[error("exchange timed out")]
    TimedOut,
}

/// A fetched content descriptor.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Display name from the info dictionary, when present.
    pub name: Option<String>,
    /// The raw bencoded info dictionary, hash-verified.
    pub raw: Bytes,
}

/// Spawns one detached fetch task per interesting announcement.
pub struct Fetcher {
    listener: Arc<dyn CrawlerListener>,
}

impl Fetcher {
    pub fn new(listener: Arc<dyn CrawlerListener>) -> Self {
        Self { listener }
    }

    /// Fire-and-forget fetch from one announcer.
    pub fn spawn(&self, info_hash: Id, peer: SocketAddr, peer_id: Id) {
        let listener = Arc::clone(&self.listener);
        tokio::spawn(async move {
            match fetch(info_hash, peer, peer_id).await {
                Ok(descriptor) => listener.on_metadata(&info_hash, &descriptor),
                Err(FetchError::Io(e)) => debug!("metadata fetch from {} failed: {}", peer, e),
                Err(e) => warn!("metadata fetch from {} failed: {}", peer, e),
            }
        });
    }
}

async fn fetch(info_hash: Id, peer: SocketAddr, peer_id: Id) -> Result<Descriptor, FetchError> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
        .await
        .map_err(|_| FetchError::TimedOut)??;
    timeout(EXCHANGE_TIMEOUT, exchange(&mut stream, info_hash, peer_id))
        .await
        .map_err(|_| FetchError::TimedOut)?
}

async fn exchange(
    stream: &mut TcpStream,
    info_hash: Id,
    peer_id: Id,
) -> Result<Descriptor, FetchError> {
    // plain handshake with the extension-protocol bit set
    let mut hello = Vec::with_capacity(68);
    hello.push(PROTOCOL.len() as u8);
    hello.extend_from_slice(PROTOCOL);
    let mut reserved = [0u8; 8];
    reserved[5] |= 0x10;
    hello.extend_from_slice(&reserved);
    hello.extend_from_slice(info_hash.as_bytes());
    hello.extend_from_slice(peer_id.as_bytes());
    stream.write_all(&hello).await?;

    let mut reply = [0u8; 68];
    stream.read_exact(&mut reply).await?;
    if reply[0] as usize != PROTOCOL.len() || &reply[1..20] != PROTOCOL {
        return Err(FetchError::BadHandshake);
    }
    if reply[25] & 0x10 == 0 {
        return Err(FetchError::NoMetadataExtension);
    }

    // extended handshake advertising ut_metadata
    let mut extensions = BTreeMap::new();
    extensions.insert(
        Bytes::from_static(b"ut_metadata"),
        Value::Int(OUR_UT_METADATA_ID as i64),
    );
    let mut handshake = BTreeMap::new();
    handshake.insert(Bytes::from_static(b"m"), Value::Dict(extensions));
    send_extended(
        stream,
        EXT_HANDSHAKE_ID,
        &bencode::encode(&Value::Dict(handshake)),
    )
    .await?;

    // their extended handshake names their ut_metadata id and the size
    let (their_id, metadata_len) = loop {
        let (ext, payload) = read_extended(stream).await?;
        if ext != EXT_HANDSHAKE_ID {
            continue;
        }
        let value = bencode::decode(&payload)?;
        let their_id = value
            .get(b"m")
            .and_then(|m| m.get(b"ut_metadata"))
            .and_then(|v| v.as_int())
            .filter(|&id| id > 0)
            .ok_or(FetchError::NoMetadataExtension)?;
        let len = value
            .get(b"metadata_size")
            .and_then(|v| v.as_int())
            .ok_or(FetchError::NoMetadataExtension)?;
        if len <= 0 || len as usize > MAX_METADATA_LEN {
            return Err(FetchError::ExchangeFailed);
        }
        break (their_id as u8, len as usize);
    };

    // request every piece in order and stitch them together
    let mut metadata = Vec::with_capacity(metadata_len);
    for piece in 0..metadata_len.div_ceil(PIECE_LEN) {
        let mut request = BTreeMap::new();
        request.insert(Bytes::from_static(b"msg_type"), Value::Int(MSG_REQUEST));
        request.insert(Bytes::from_static(b"piece"), Value::Int(piece as i64));
        send_extended(stream, their_id, &bencode::encode(&Value::Dict(request))).await?;

        let data = loop {
            let (ext, payload) = read_extended(stream).await?;
            if ext != OUR_UT_METADATA_ID {
                continue;
            }
            break parse_data_message(&payload, piece)?;
        };
        metadata.extend_from_slice(&data);
    }
    if metadata.len() != metadata_len {
        return Err(FetchError::ExchangeFailed);
    }

    // the metadata must hash to the info-hash that was announced
    if Sha1::digest(&metadata).as_slice() != info_hash.as_bytes() {
        return Err(FetchError::HashMismatch);
    }

    let info = bencode::decode(&metadata)?;
    let name = info
        .get(b"name")
        .and_then(|v| v.as_str())
        .map(String::from);
    Ok(Descriptor {
        name,
        raw: Bytes::from(metadata),
    })
}

/// Reads peer-wire messages until the next extension-protocol one,
/// returning its extension id and payload.
async fn read_extended(stream: &mut TcpStream) -> Result<(u8, Bytes), FetchError> {
    loop {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            continue; // keep-alive
        }
        if len > MAX_METADATA_LEN + 64 {
            return Err(FetchError::ExchangeFailed);
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        if len >= 2 && body[0] == EXTENSION_MSG {
            let payload = body.split_off(2);
            return Ok((body[1], Bytes::from(payload)));
        }
        // choke, bitfield, and friends are irrelevant here
    }
}

async fn send_extended(
    stream: &mut TcpStream,
    ext_id: u8,
    payload: &[u8],
) -> Result<(), FetchError> {
    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.extend_from_slice(&((payload.len() + 2) as u32).to_be_bytes());
    frame.push(EXTENSION_MSG);
    frame.push(ext_id);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

/// Splits a `ut_metadata` data message into its bencoded header and raw
/// piece bytes, checking it answers the piece we asked for.
fn parse_data_message(payload: &[u8], piece: usize) -> Result<Bytes, FetchError> {
    let (header, header_len) = bencode::decode_prefix(payload)?;
    match header.get(b"msg_type").and_then(|v| v.as_int()) {
        Some(MSG_DATA) => {}
        Some(MSG_REJECT) => {
            debug!("peer rejected metadata piece {}", piece);
            return Err(FetchError::ExchangeFailed);
        }
        _ => return Err(FetchError::ExchangeFailed),
    }
    if header.get(b"piece").and_then(|v| v.as_int()) != Some(piece as i64) {
        return Err(FetchError::ExchangeFailed);
    }
    Ok(Bytes::copy_from_slice(&payload[header_len..]))
}
