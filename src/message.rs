//! JSON envelope of the request/reply protocol and parsing of reply payloads.

use crate::dtype::DType;
use crate::error::ArqError;
use nanoserde::{DeJson, SerJson};
use tracing::warn;

/// Request format tag for plain string commands
pub const FORMAT_STRING: &str = "STRING";
/// Request format tag for commands carrying a binary payload
pub const FORMAT_BINARY: &str = "BINARY";

/// One request envelope sent to the server.
#[derive(Debug, Clone, SerJson)]
pub struct RequestMessage {
    /// Name of the requesting user
    pub user: String,
    /// Access token, empty when authentication is disabled
    pub token: String,
    /// Server side command name
    pub cmd: String,
    /// [FORMAT_STRING] or [FORMAT_BINARY]
    pub format: String,
    /// Space delimited command arguments
    pub args: String,
}

impl RequestMessage {
    pub(crate) fn new(user: &str, token: &str, cmd: &str, args: &str, binary: bool) -> Self {
        RequestMessage {
            user: user.into(),
            token: token.into(),
            cmd: cmd.into(),
            format: if binary { FORMAT_BINARY } else { FORMAT_STRING }.into(),
            args: args.into(),
        }
    }
}

/// One reply envelope received from the server.
#[derive(Debug, DeJson)]
pub struct ReplyMessage {
    /// Reply payload
    pub msg: String,
    /// "NORMAL", "WARNING" or "ERROR"
    #[nserde(rename = "msgType")]
    pub msg_type: String,
    /// Echoed user name
    pub user: String,
}

/// Decode a raw string reply. Warnings are logged and stripped,
/// errors become [ArqError::ServerError].
pub fn decode_reply(raw: &str) -> Result<String, ArqError> {
    let reply: ReplyMessage = DeJson::deserialize_json(raw)
        .map_err(|e| ArqError::parse_error(format!("reply is not valid JSON: {raw:?}, {e}")))?;
    match reply.msg_type.as_str() {
        "NORMAL" => Ok(reply.msg),
        "WARNING" => {
            warn!("server warning: {}", reply.msg);
            Ok(reply.msg)
        }
        "ERROR" => Err(ArqError::ServerError(reply.msg.into())),
        other => Err(ArqError::parse_error(format!("unknown msgType {other:?}"))),
    }
}

/// Decode a raw binary reply. The server prefixes failed binary
/// requests with a textual marker instead of an envelope.
pub fn decode_binary_reply(raw: Vec<u8>) -> Result<Vec<u8>, ArqError> {
    if raw.starts_with(b"Error:") {
        return Err(ArqError::ServerError(
            String::from_utf8_lossy(&raw).into_owned().into(),
        ));
    }
    if let Some(stripped) = raw.strip_prefix(b"Warning:") {
        warn!("server warning: {}", String::from_utf8_lossy(stripped));
    }
    Ok(raw)
}

/// Attributes of a freshly materialized server array, parsed from a
/// "created name dtype size ndim shape itemsize" reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Server side storage name
    pub name: Box<str>,
    /// Element type
    pub dtype: DType,
    /// Element count
    pub size: u64,
    /// Rank, currently always 1
    pub ndim: u64,
    /// Dimension sizes
    pub shape: Vec<u64>,
    /// Element size in bytes
    pub itemsize: u64,
}

impl Created {
    /// Parse a created reply. Malformed replies are an error, never defaulted.
    pub fn parse(msg: &str) -> Result<Self, ArqError> {
        let fields: Vec<&str> = msg.split_whitespace().collect();
        if fields.len() != 7 || fields[0] != "created" {
            return Err(ArqError::parse_error(format!("malformed created reply {msg:?}")));
        }
        let name: Box<str> = fields[1].into();
        let dtype = DType::from_name(fields[2])?;
        let size = fields[3]
            .parse()
            .map_err(|e| ArqError::parse_error(format!("bad size in {msg:?}, {e}")))?;
        let ndim = fields[4]
            .parse()
            .map_err(|e| ArqError::parse_error(format!("bad ndim in {msg:?}, {e}")))?;
        let shape_str = fields[5];
        if !shape_str.starts_with('[') || !shape_str.ends_with(']') {
            return Err(ArqError::parse_error(format!("bad shape in {msg:?}")));
        }
        let mut shape = Vec::new();
        for dim in shape_str[1..shape_str.len() - 1].split(',') {
            let dim = dim.trim();
            if dim.is_empty() {
                continue;
            }
            shape.push(
                dim.parse()
                    .map_err(|e| ArqError::parse_error(format!("bad shape in {msg:?}, {e}")))?,
            );
        }
        let itemsize = fields[6]
            .parse()
            .map_err(|e| ArqError::parse_error(format!("bad itemsize in {msg:?}, {e}")))?;
        Ok(Created { name, dtype, size, ndim, shape, itemsize })
    }
}

#[test]
fn request_envelope_is_flat_json() {
    let req = RequestMessage::new("me", "", "create", "int64 10", false);
    let json = SerJson::serialize_json(&req);
    assert!(json.contains("\"cmd\":\"create\""));
    assert!(json.contains("\"format\":\"STRING\""));
}

#[test]
fn reply_envelope_roundtrip() {
    let msg = decode_reply(r#"{"msg":"created sv_1 int64 10 1 [10] 8","msgType":"NORMAL","user":"me"}"#)
        .unwrap();
    let created = Created::parse(&msg).unwrap();
    assert_eq!(&*created.name, "sv_1");
    assert_eq!(created.dtype, DType::Int64);
    assert_eq!(created.size, 10);
    assert_eq!(created.shape, [10]);
}

#[test]
fn error_replies_propagate() {
    let err = decode_reply(r#"{"msg":"undefined symbol","msgType":"ERROR","user":"me"}"#);
    assert!(matches!(err, Err(ArqError::ServerError(_))));
    assert!(decode_reply("not json at all").is_err());
    assert!(Created::parse("created sv_1 int64 ten 1 [10] 8").is_err());
}
