//! Wire protocol: message envelope and length-prefixed framing.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by
//! exactly that many bytes of UTF-8 JSON encoding an [`Envelope`]:
//!
//! ```text
//! ┌────────────┬────────────────────────────────┐
//! │ u32 BE len │ JSON envelope                  │
//! └────────────┴────────────────────────────────┘
//! ```
//!
//! The envelope carries a top-level `type` field for discriminated
//! dispatch; `payload` stays a raw JSON object and is deserialized
//! per-type by the handler that owns it. A frame whose `type` string is
//! not one of the known kinds fails decode and costs the sender the
//! connection; a known type with a malformed payload is a handler-level
//! error and keeps the session open.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame body size unless configured otherwise (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 1024 * 1024;

/// All message kinds understood by a hub node.
///
/// GOSSIP_STATE and FULL_SYNC_* are reserved: they decode without error
/// but their handlers answer with an ERROR of kind `not_implemented`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    JoinRequest,
    PeerList,
    Ping,
    Pong,
    SensorUpdate,
    GossipState,
    FullSyncRequest,
    FullSyncResponse,
    Ack,
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Matches the wire spelling.
        let s = serde_json::to_value(self).expect("message type serialisation is infallible");
        write!(f, "{}", s.as_str().unwrap_or("?"))
    }
}

/// Top-level envelope for every inter-node payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender_id: String,
    /// Milliseconds since the Unix epoch, assigned when the envelope is built.
    pub ts_ms: i64,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build an envelope with `ts_ms` stamped from the wall clock.
    pub fn new(kind: MessageType, sender_id: &str, payload: serde_json::Value) -> Self {
        Self {
            kind,
            sender_id: sender_id.to_string(),
            ts_ms: now_ms(),
            payload,
        }
    }

    /// Build an ERROR envelope of the given kind.
    pub fn error(sender_id: &str, kind: &str, detail: &str) -> Self {
        let payload = serde_json::to_value(ErrorInfo {
            kind: kind.to_string(),
            detail: detail.to_string(),
        })
        .expect("error payload serialisation is infallible");
        Self::new(MessageType::Error, sender_id, payload)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Payload schemas
// ---------------------------------------------------------------------------

/// JOIN_REQUEST payload: the sender's advertised listen address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub host: String,
    pub port: u16,
}

/// One peer in a PEER_LIST payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

/// PEER_LIST payload: every peer the sender knows, including itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<PeerInfo>,
}

/// A single sensor reading under its origin-scoped key.
///
/// `key` is `"<origin_node_id>:<sensor_id>"`; only the origin node ever
/// writes that key, so LWW contention only arises on duplicate delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEntry {
    pub key: String,
    /// Opaque JSON: number, boolean, string, or object.
    pub value: serde_json::Value,
    /// Producer-assigned, milliseconds since the Unix epoch.
    pub ts_ms: i64,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

impl SensorEntry {
    /// The `<sensor_id>` half of the key, if the key is well-formed.
    pub fn sensor_id(&self) -> Option<&str> {
        self.key.split_once(':').map(|(_, id)| id)
    }
}

/// SENSOR_UPDATE payload: a batch of entries drained from the sender's
/// replication buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorUpdate {
    pub updates: Vec<SensorEntry>,
}

/// ACK payload (reserved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ref_ts_ms: i64,
}

/// ERROR payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub detail: String,
}

/// Frozen error kinds carried in ERROR payloads and log lines.
pub mod error_kinds {
    pub const FRAME_DECODE: &str = "frame_decode";
    pub const UNKNOWN_TYPE: &str = "unknown_type";
    pub const SCHEMA_MISMATCH: &str = "schema_mismatch";
    pub const NOT_IMPLEMENTED: &str = "not_implemented";
    pub const MERGE_REJECTED: &str = "merge_rejected";
    pub const QUEUE_OVERFLOW: &str = "queue_overflow";
    pub const CONNECT_FAILED: &str = "connect_failed";
    pub const SEND_FAILED: &str = "send_failed";
    pub const CONFIG_ERROR: &str = "config_error";
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Why a frame failed to decode. Any of these costs the connection.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("connection closed mid-frame")]
    Truncated,
    #[error("frame length {len} exceeds limit {max}")]
    Oversize { len: u32, max: u32 },
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode an envelope into a length-prefixed frame.
pub fn encode_frame(envelope: &Envelope) -> Vec<u8> {
    let body = serde_json::to_vec(envelope).expect("envelope serialisation is infallible");
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(envelope)).await?;
    writer.flush().await
}

/// Read one frame from the stream.
///
/// Returns `Ok(None)` on a clean close at a frame boundary. A close
/// mid-header or mid-body is `DecodeError::Truncated`; the length prefix
/// is read with an explicit loop because a 4-byte header can arrive in
/// pieces.
pub async fn read_frame<R>(reader: &mut R, max_frame: u32) -> Result<Option<Envelope>, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(DecodeError::Truncated);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header);
    if len > max_frame {
        return Err(DecodeError::Oversize { len, max: max_frame });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DecodeError::Truncated
        } else {
            DecodeError::Io(e)
        }
    })?;

    let envelope = serde_json::from_slice(&body)?;
    Ok(Some(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_envelope() -> Envelope {
        Envelope::new(
            MessageType::SensorUpdate,
            "n1",
            serde_json::to_value(SensorUpdate {
                updates: vec![SensorEntry {
                    key: "n1:temp".into(),
                    value: json!(22),
                    ts_ms: 100,
                    origin: "n1".into(),
                    meta: None,
                }],
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let envelope = sample_envelope();
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, &envelope).await.unwrap();

        let decoded = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decoded, envelope);
    }

    #[tokio::test]
    async fn integer_values_round_trip_as_integers() {
        let envelope = sample_envelope();
        let bytes = encode_frame(&envelope);
        let text = std::str::from_utf8(&bytes[4..]).unwrap();
        // 22 must not come back as 22.0.
        assert!(text.contains("\"value\":22"), "got: {text}");
    }

    #[tokio::test]
    async fn clean_close_between_frames() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await,
            Err(DecodeError::Truncated)
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{\"type\"").await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await,
            Err(DecodeError::Truncated)
        ));
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(2 * 1024 * 1024u32).to_be_bytes())
            .await
            .unwrap();
        match read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await {
            Err(DecodeError::Oversize { len, max }) => {
                assert_eq!(len, 2 * 1024 * 1024);
                assert_eq!(max, DEFAULT_MAX_FRAME_BYTES);
            }
            other => panic!("expected oversize error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_type_string_fails_decode() {
        let body = br#"{"type":"LEAVE","sender_id":"n1","ts_ms":1,"payload":{}}"#;
        let (mut client, mut server) = tokio::io::duplex(256);
        client
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(body).await.unwrap();
        assert!(matches!(
            read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await,
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn wire_spelling_is_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&MessageType::JoinRequest).unwrap(),
            "\"JOIN_REQUEST\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::FullSyncResponse).unwrap(),
            "\"FULL_SYNC_RESPONSE\""
        );
    }

    #[test]
    fn meta_is_omitted_when_absent() {
        let entry = SensorEntry {
            key: "n1:t".into(),
            value: json!(1.5),
            ts_ms: 5,
            origin: "n1".into(),
            meta: None,
        };
        let text = serde_json::to_string(&entry).unwrap();
        assert!(!text.contains("meta"));
    }
}
