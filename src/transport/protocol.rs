//! Plugin wire protocol using rkyv for zero-copy serialization
//!
//! Every message on the socket is a single frame:
//! `[4-byte length (little-endian)][rkyv bytes]`.
//!
//! Requests carry an id so several calls can share one connection; the
//! plugin answers each with a response frame tagged with the same id.

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Status classification of a finished call
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rkyv(derive(Debug))]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    Internal,
    /// A frame exceeded the size limit
    ResourceExhausted,
    Unavailable,
    /// The plugin does not serve the requested contract version
    Unimplemented,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "Canceled",
            Code::Unknown => "Unknown",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::NotFound => "NotFound",
            Code::Internal => "Internal",
            Code::ResourceExhausted => "ResourceExhausted",
            Code::Unavailable => "Unavailable",
            Code::Unimplemented => "Unimplemented",
        }
    }

    /// Outcomes produced by the transport or the local deadline rather
    /// than by the plugin's own handler.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Code::Cancelled
                | Code::DeadlineExceeded
                | Code::ResourceExhausted
                | Code::Unavailable
        )
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call status returned by the plugin (or synthesized locally)
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[rkyv(derive(Debug))]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

/// Request from the node agent to a plugin
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct RequestFrame {
    /// Correlates the response on a shared connection
    pub id: u64,
    /// Full method path, e.g. `/v1beta1.Node/NodePrepareResources`
    pub method: String,
    /// Remaining call budget when the request was sent
    pub timeout_ms: Option<u64>,
    pub payload: Vec<u8>,
}

/// Response from a plugin
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct ResponseFrame {
    pub id: u64,
    pub status: Status,
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    pub fn ok(id: u64, payload: Vec<u8>) -> Self {
        Self {
            id,
            status: Status::ok(),
            payload,
        }
    }

    pub fn error(id: u64, status: Status) -> Self {
        Self {
            id,
            status,
            payload: Vec::new(),
        }
    }
}

/// Opaque request/response body.
///
/// The client never looks inside; JSON helpers exist for callers that
/// use JSON bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_json<T: serde::Serialize>(value: &T) -> crate::error::Result<Self> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    pub fn json<T: DeserializeOwned>(&self) -> crate::error::Result<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Message frame for wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    /// Encode a request to bytes with length prefix
    pub fn encode_request(request: &RequestFrame) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        Ok(Self::with_length(&bytes))
    }

    /// Encode a response to bytes with length prefix
    pub fn encode_response(response: &ResponseFrame) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        Ok(Self::with_length(&bytes))
    }

    /// Decode a request body (without the length prefix)
    pub fn decode_request(body: &[u8]) -> Result<RequestFrame, rkyv::rancor::Error> {
        rkyv::from_bytes::<RequestFrame, rkyv::rancor::Error>(&aligned(body))
    }

    /// Decode a response body (without the length prefix)
    pub fn decode_response(body: &[u8]) -> Result<ResponseFrame, rkyv::rancor::Error> {
        rkyv::from_bytes::<ResponseFrame, rkyv::rancor::Error>(&aligned(body))
    }

    /// Whether an encoded frame is small enough for the peer to accept
    pub fn within_limit(frame: &[u8]) -> bool {
        frame.len().saturating_sub(4) <= MAX_FRAME_LEN
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    fn with_length(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }
}

// Socket reads land in plain Vec<u8>; rkyv validation wants aligned input.
fn aligned(body: &[u8]) -> AlignedVec {
    let mut buf: AlignedVec = AlignedVec::with_capacity(body.len());
    buf.extend_from_slice(body);
    buf
}

/// Read one frame body. Returns `None` when the peer closed the stream
/// cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = MessageFrame::read_length(&len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_roundtrip() {
        let request = RequestFrame {
            id: 7,
            method: "/v1beta1.Node/NodePrepareResources".to_string(),
            timeout_ms: Some(1500),
            payload: b"{}".to_vec(),
        };
        let bytes = MessageFrame::encode_request(&request).unwrap();
        let len = MessageFrame::read_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len, bytes.len() - 4);

        let decoded = MessageFrame::decode_request(&bytes[4..]).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.method, "/v1beta1.Node/NodePrepareResources");
        assert_eq!(decoded.timeout_ms, Some(1500));
        assert_eq!(decoded.payload, b"{}");
    }

    #[test]
    fn test_response_frame_carries_status() {
        let status = Status::unimplemented("unknown service v1beta1.Node");
        let response = ResponseFrame::error(3, status);
        let bytes = MessageFrame::encode_response(&response).unwrap();
        let decoded = MessageFrame::decode_response(&bytes[4..]).unwrap();
        assert_eq!(decoded.id, 3);
        assert_eq!(decoded.status.code, Code::Unimplemented);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_garbage_body_is_rejected() {
        assert!(MessageFrame::decode_response(&[0xff, 0x01, 0x02]).is_err());
    }

    #[test]
    fn test_transport_codes() {
        assert!(Code::DeadlineExceeded.is_transport());
        assert!(Code::Unavailable.is_transport());
        assert!(Code::ResourceExhausted.is_transport());
        assert!(!Code::Unimplemented.is_transport());
        assert!(!Code::Internal.is_transport());
    }

    #[test]
    fn test_payload_json_helpers() {
        let payload = Payload::from_json(&serde_json::json!({ "granted": true })).unwrap();
        let value: serde_json::Value = payload.json().unwrap();
        assert_eq!(value["granted"], true);

        let err = Payload::from(b"not json".to_vec())
            .json::<serde_json::Value>()
            .unwrap_err();
        assert!(matches!(err, crate::error::PluginError::Codec(_)));
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_frame_size_limit() {
        assert!(MessageFrame::within_limit(&vec![0u8; MAX_FRAME_LEN + 4]));
        assert!(!MessageFrame::within_limit(&vec![0u8; MAX_FRAME_LEN + 5]));
        assert!(MessageFrame::within_limit(&[]));
    }

    #[tokio::test]
    async fn test_read_frame_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let header = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        let mut reader: &[u8] = &header;
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
