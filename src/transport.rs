//! Blocking request/response channel to the array server.
//!
//! [Transport] is a good plug in point for alternative channels.
//! The scheduler only ever needs the two blocking calls below, so tests
//! drive it with an in memory fake server and production uses [TcpTransport].

use crate::error::ArqError;
use crate::message::{decode_binary_reply, decode_reply, RequestMessage};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::debug;

// Replies above this size indicate a lost frame boundary, not a real payload.
const MAX_TRANSFER_BYTES: u32 = 1 << 30;

// Separates the JSON envelope from the binary payload inside one frame.
const BINARY_MARKER: &[u8] = b"BINARY_PAYLOAD";

/// Blocking request/response channel. One request is answered by exactly
/// one reply, there is no overlap and no statefulness beyond the connection
/// itself.
pub trait Transport {
    /// Send a request, optionally with a binary payload, and receive a
    /// string reply. Server signaled failures surface as
    /// [ArqError::ServerError].
    fn send(
        &mut self,
        request: &RequestMessage,
        payload: Option<&[u8]>,
    ) -> Result<String, ArqError>;

    /// Send a request and receive a binary reply.
    fn send_recv_bytes(
        &mut self,
        request: &RequestMessage,
        payload: Option<&[u8]>,
    ) -> Result<Vec<u8>, ArqError>;
}

/// Length prefixed TCP channel to a running array server.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Open a connection to `host:port`. A timeout of zero means no timeout.
    pub fn connect(host: &str, port: u16, timeout_secs: u64) -> Result<Self, ArqError> {
        let stream = TcpStream::connect((host, port))?;
        if timeout_secs > 0 {
            stream.set_read_timeout(Some(Duration::from_secs(timeout_secs)))?;
            stream.set_write_timeout(Some(Duration::from_secs(timeout_secs)))?;
        }
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream })
    }

    fn write_frame(&mut self, request: &RequestMessage, payload: Option<&[u8]>) -> Result<(), ArqError> {
        use nanoserde::SerJson;
        let envelope = request.serialize_json();
        debug!("sending request {}", envelope);
        let mut body = envelope.into_bytes();
        if let Some(payload) = payload {
            body.extend_from_slice(BINARY_MARKER);
            body.extend_from_slice(payload);
        }
        let len = u32::try_from(body.len())
            .map_err(|_| ArqError::parse_error("request exceeds frame size"))?;
        self.stream.write_all(&len.to_le_bytes())?;
        self.stream.write_all(&body)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Vec<u8>, ArqError> {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len);
        if len > MAX_TRANSFER_BYTES {
            return Err(ArqError::parse_error(format!("oversized reply frame of {len} bytes")));
        }
        let mut body = vec![0u8; len as usize];
        self.stream.read_exact(&mut body)?;
        Ok(body)
    }
}

impl Transport for TcpTransport {
    fn send(
        &mut self,
        request: &RequestMessage,
        payload: Option<&[u8]>,
    ) -> Result<String, ArqError> {
        self.write_frame(request, payload)?;
        let body = self.read_frame()?;
        let raw = String::from_utf8(body)
            .map_err(|e| ArqError::parse_error(format!("reply is not utf-8, {e}")))?;
        debug!("received reply {}", raw);
        decode_reply(&raw)
    }

    fn send_recv_bytes(
        &mut self,
        request: &RequestMessage,
        payload: Option<&[u8]>,
    ) -> Result<Vec<u8>, ArqError> {
        self.write_frame(request, payload)?;
        decode_binary_reply(self.read_frame()?)
    }
}
