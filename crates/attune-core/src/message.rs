//! Typed message set — the closed union of control messages peers exchange.
//!
//! Every message is a JSON object with a `type` discriminator, a unique
//! `messageId`, and a `timestamp`; responses carry `responseTo`. The `type`
//! field decodes from three shapes: the numeric tag, the canonical enum
//! name, or a legacy string alias. Messages with no `type` at all fall
//! through to [`classify_legacy`], which pattern-matches on the fields
//! present. Never coerce silently — a message either parses as one kind or
//! is rejected.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::appearance::Appearance;
use crate::error::SyncError;

// ── Message kinds ─────────────────────────────────────────────────────────────

/// Kind discriminator. Declaration order defines the numeric wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    ModDataRequest = 0,
    ModDataResponse = 1,
    ComponentRequest = 2,
    ComponentResponse = 3,
    ModApplicationRequest = 4,
    ModApplicationResponse = 5,
    SyncComplete = 6,
    Error = 7,
    ChunkedMessage = 8,
    FileChunkMessage = 9,
    MemberListRequest = 10,
    MemberListResponse = 11,
    ChannelNegotiation = 12,
    ChannelNegotiationResponse = 13,
    ReconnectOffer = 14,
    ReconnectAnswer = 15,
    RecoveryRequest = 16,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::ModDataRequest),
            1 => Some(Self::ModDataResponse),
            2 => Some(Self::ComponentRequest),
            3 => Some(Self::ComponentResponse),
            4 => Some(Self::ModApplicationRequest),
            5 => Some(Self::ModApplicationResponse),
            6 => Some(Self::SyncComplete),
            7 => Some(Self::Error),
            8 => Some(Self::ChunkedMessage),
            9 => Some(Self::FileChunkMessage),
            10 => Some(Self::MemberListRequest),
            11 => Some(Self::MemberListResponse),
            12 => Some(Self::ChannelNegotiation),
            13 => Some(Self::ChannelNegotiationResponse),
            14 => Some(Self::ReconnectOffer),
            15 => Some(Self::ReconnectAnswer),
            16 => Some(Self::RecoveryRequest),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ModDataRequest => "ModDataRequest",
            Self::ModDataResponse => "ModDataResponse",
            Self::ComponentRequest => "ComponentRequest",
            Self::ComponentResponse => "ComponentResponse",
            Self::ModApplicationRequest => "ModApplicationRequest",
            Self::ModApplicationResponse => "ModApplicationResponse",
            Self::SyncComplete => "SyncComplete",
            Self::Error => "Error",
            Self::ChunkedMessage => "ChunkedMessage",
            Self::FileChunkMessage => "FileChunkMessage",
            Self::MemberListRequest => "MemberListRequest",
            Self::MemberListResponse => "MemberListResponse",
            Self::ChannelNegotiation => "ChannelNegotiation",
            Self::ChannelNegotiationResponse => "ChannelNegotiationResponse",
            Self::ReconnectOffer => "ReconnectOffer",
            Self::ReconnectAnswer => "ReconnectAnswer",
            Self::RecoveryRequest => "RecoveryRequest",
        }
    }

    /// Canonical names plus the legacy string aliases older senders emit.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ModDataRequest" => Some(Self::ModDataRequest),
            "ModDataResponse" => Some(Self::ModDataResponse),
            "ComponentRequest" => Some(Self::ComponentRequest),
            "ComponentResponse" => Some(Self::ComponentResponse),
            "ModApplicationRequest" | "apply_mods" => Some(Self::ModApplicationRequest),
            "ModApplicationResponse" => Some(Self::ModApplicationResponse),
            "SyncComplete" | "client_ready" => Some(Self::SyncComplete),
            "Error" => Some(Self::Error),
            "ChunkedMessage" => Some(Self::ChunkedMessage),
            "FileChunkMessage" => Some(Self::FileChunkMessage),
            "MemberListRequest" | "member_list_request" => Some(Self::MemberListRequest),
            "MemberListResponse" => Some(Self::MemberListResponse),
            "ChannelNegotiation" => Some(Self::ChannelNegotiation),
            "ChannelNegotiationResponse" => Some(Self::ChannelNegotiationResponse),
            "ReconnectOffer" => Some(Self::ReconnectOffer),
            "ReconnectAnswer" => Some(Self::ReconnectAnswer),
            "RecoveryRequest" => Some(Self::RecoveryRequest),
            _ => None,
        }
    }
}

// ── Bodies ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModDataRequest {
    pub player_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerInfo {
    pub player_name: String,
    pub appearance: Appearance,
    pub state_hash: String,
}

/// One file in a `ModDataResponse`. Direct transfers populate `contents`;
/// progressive and coordinated transfers announce the file with empty
/// contents and stream the bytes as chunks. The coordinated path
/// additionally pins `assigned_channel`/`chunk_count`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferredFile {
    pub game_path: String,
    pub hash: String,
    pub size_bytes: u64,
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
    pub assigned_channel: u32,
    pub chunk_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModDataResponse {
    pub player_info: PlayerInfo,
    pub files: Vec<TransferredFile>,
    /// Set on coordinated (manifest) transfers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_channels: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentRequest {
    pub component_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentResponse {
    pub component_id: String,
    #[serde(with = "base64_bytes")]
    pub file_data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModApplicationRequest {
    pub player_name: String,
    pub state_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModApplicationResponse {
    pub player_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Receipt for one fully received and verified file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileCompletionReceipt {
    pub session_id: String,
    pub file_hash: String,
    pub game_path: String,
    /// Verified byte count. The bytes themselves live in the receiver's
    /// cache, addressed by `file_hash`.
    pub received_bytes: u64,
    /// SHA-256 of the received content, upper-case hex.
    pub receiver_signature: String,
}

/// "This channel has sent and received everything it promised."
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelCompletionHighFive {
    pub channel_id: u32,
    pub completed_files: Vec<String>,
    pub ready_to_close: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncComplete {
    pub success: bool,
    pub processed_files: u64,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<FileCompletionReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_five: Option<ChannelCompletionHighFive>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorMessage {
    pub error_code: String,
    #[serde(alias = "error")]
    pub error_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_operation: Option<String>,
}

/// One slice of an oversized control message. `message_metadata` preserves
/// the logical envelope (`messageId`, `timestamp`, `responseTo`) so the
/// receiver can correlate before the body is whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkedMessage {
    pub chunk_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub original_message_type: u8,
    #[serde(with = "base64_bytes")]
    pub chunk_data: Vec<u8>,
    pub message_metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileChunkMessage {
    pub session_id: String,
    pub file_name: String,
    pub file_hash: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub channel_index: u32,
    #[serde(with = "base64_bytes", alias = "chunk")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemberListRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syncshell_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemberListResponse {
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelNegotiation {
    pub mod_count: u32,
    pub large_mod_count: u32,
    pub small_mod_count: u32,
    pub available_memory_mb: u64,
    pub total_data_mb: u64,
    pub requested_channels: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelNegotiationResponse {
    pub my_channels: u32,
    pub your_channels: u32,
    pub limiting_memory_mb: u64,
}

/// Opaque signaling blob relayed through the host after transport loss.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectOffer {
    pub peer_id: String,
    pub offer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectAnswer {
    pub peer_id: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoveryRequest {
    pub syncshell_id: String,
    pub peer_id: String,
    pub completed_files: Vec<String>,
    pub completed_hashes: Vec<String>,
}

// ── The union ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    ModDataRequest(ModDataRequest),
    ModDataResponse(ModDataResponse),
    ComponentRequest(ComponentRequest),
    ComponentResponse(ComponentResponse),
    ModApplicationRequest(ModApplicationRequest),
    ModApplicationResponse(ModApplicationResponse),
    SyncComplete(SyncComplete),
    Error(ErrorMessage),
    ChunkedMessage(ChunkedMessage),
    FileChunkMessage(FileChunkMessage),
    MemberListRequest(MemberListRequest),
    MemberListResponse(MemberListResponse),
    ChannelNegotiation(ChannelNegotiation),
    ChannelNegotiationResponse(ChannelNegotiationResponse),
    ReconnectOffer(ReconnectOffer),
    ReconnectAnswer(ReconnectAnswer),
    RecoveryRequest(RecoveryRequest),
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::ModDataRequest(_) => MessageKind::ModDataRequest,
            Body::ModDataResponse(_) => MessageKind::ModDataResponse,
            Body::ComponentRequest(_) => MessageKind::ComponentRequest,
            Body::ComponentResponse(_) => MessageKind::ComponentResponse,
            Body::ModApplicationRequest(_) => MessageKind::ModApplicationRequest,
            Body::ModApplicationResponse(_) => MessageKind::ModApplicationResponse,
            Body::SyncComplete(_) => MessageKind::SyncComplete,
            Body::Error(_) => MessageKind::Error,
            Body::ChunkedMessage(_) => MessageKind::ChunkedMessage,
            Body::FileChunkMessage(_) => MessageKind::FileChunkMessage,
            Body::MemberListRequest(_) => MessageKind::MemberListRequest,
            Body::MemberListResponse(_) => MessageKind::MemberListResponse,
            Body::ChannelNegotiation(_) => MessageKind::ChannelNegotiation,
            Body::ChannelNegotiationResponse(_) => MessageKind::ChannelNegotiationResponse,
            Body::ReconnectOffer(_) => MessageKind::ReconnectOffer,
            Body::ReconnectAnswer(_) => MessageKind::ReconnectAnswer,
            Body::RecoveryRequest(_) => MessageKind::RecoveryRequest,
        }
    }

    fn to_fields(&self) -> Result<Map<String, Value>, SyncError> {
        let value = match self {
            Body::ModDataRequest(b) => serde_json::to_value(b)?,
            Body::ModDataResponse(b) => serde_json::to_value(b)?,
            Body::ComponentRequest(b) => serde_json::to_value(b)?,
            Body::ComponentResponse(b) => serde_json::to_value(b)?,
            Body::ModApplicationRequest(b) => serde_json::to_value(b)?,
            Body::ModApplicationResponse(b) => serde_json::to_value(b)?,
            Body::SyncComplete(b) => serde_json::to_value(b)?,
            Body::Error(b) => serde_json::to_value(b)?,
            Body::ChunkedMessage(b) => serde_json::to_value(b)?,
            Body::FileChunkMessage(b) => serde_json::to_value(b)?,
            Body::MemberListRequest(b) => serde_json::to_value(b)?,
            Body::MemberListResponse(b) => serde_json::to_value(b)?,
            Body::ChannelNegotiation(b) => serde_json::to_value(b)?,
            Body::ChannelNegotiationResponse(b) => serde_json::to_value(b)?,
            Body::ReconnectOffer(b) => serde_json::to_value(b)?,
            Body::ReconnectAnswer(b) => serde_json::to_value(b)?,
            Body::RecoveryRequest(b) => serde_json::to_value(b)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            other => Err(SyncError::Protocol(format!(
                "message body serialized to non-object: {other:?}"
            ))),
        }
    }

    fn from_fields(kind: MessageKind, fields: Map<String, Value>) -> Result<Self, SyncError> {
        let value = Value::Object(fields);
        Ok(match kind {
            MessageKind::ModDataRequest => Body::ModDataRequest(serde_json::from_value(value)?),
            MessageKind::ModDataResponse => Body::ModDataResponse(serde_json::from_value(value)?),
            MessageKind::ComponentRequest => Body::ComponentRequest(serde_json::from_value(value)?),
            MessageKind::ComponentResponse => {
                Body::ComponentResponse(serde_json::from_value(value)?)
            }
            MessageKind::ModApplicationRequest => {
                Body::ModApplicationRequest(serde_json::from_value(value)?)
            }
            MessageKind::ModApplicationResponse => {
                Body::ModApplicationResponse(serde_json::from_value(value)?)
            }
            MessageKind::SyncComplete => Body::SyncComplete(serde_json::from_value(value)?),
            MessageKind::Error => Body::Error(serde_json::from_value(value)?),
            MessageKind::ChunkedMessage => Body::ChunkedMessage(serde_json::from_value(value)?),
            MessageKind::FileChunkMessage => {
                Body::FileChunkMessage(serde_json::from_value(value)?)
            }
            MessageKind::MemberListRequest => {
                Body::MemberListRequest(serde_json::from_value(value)?)
            }
            MessageKind::MemberListResponse => {
                Body::MemberListResponse(serde_json::from_value(value)?)
            }
            MessageKind::ChannelNegotiation => {
                Body::ChannelNegotiation(serde_json::from_value(value)?)
            }
            MessageKind::ChannelNegotiationResponse => {
                Body::ChannelNegotiationResponse(serde_json::from_value(value)?)
            }
            MessageKind::ReconnectOffer => Body::ReconnectOffer(serde_json::from_value(value)?),
            MessageKind::ReconnectAnswer => Body::ReconnectAnswer(serde_json::from_value(value)?),
            MessageKind::RecoveryRequest => Body::RecoveryRequest(serde_json::from_value(value)?),
        })
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub response_to: Option<String>,
    pub body: Body,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            response_to: None,
            body,
        }
    }

    /// Build a response correlated to `request`.
    pub fn reply_to(request: &Message, body: Body) -> Self {
        let mut msg = Self::new(body);
        msg.response_to = Some(request.message_id.clone());
        msg
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn to_value(&self) -> Result<Value, SyncError> {
        let mut fields = self.body.to_fields()?;
        fields.insert("type".into(), Value::from(self.kind().code()));
        fields.insert("messageId".into(), Value::from(self.message_id.clone()));
        fields.insert("timestamp".into(), Value::from(self.timestamp));
        if let Some(ref to) = self.response_to {
            fields.insert("responseTo".into(), Value::from(to.clone()));
        }
        Ok(Value::Object(fields))
    }

    pub fn from_value(value: Value) -> Result<Self, SyncError> {
        let mut fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(SyncError::Decode(format!(
                    "message is not a JSON object: {other}"
                )))
            }
        };

        let kind = match fields.remove("type") {
            Some(Value::Number(n)) => {
                let code = n
                    .as_u64()
                    .and_then(|c| u8::try_from(c).ok())
                    .ok_or_else(|| SyncError::Protocol(format!("invalid type tag {n}")))?;
                MessageKind::from_code(code)
                    .ok_or_else(|| SyncError::Protocol(format!("unknown type code {code}")))?
            }
            Some(Value::String(name)) => MessageKind::from_name(&name)
                .ok_or_else(|| SyncError::Protocol(format!("unknown type name {name:?}")))?,
            Some(other) => {
                return Err(SyncError::Protocol(format!(
                    "type field is neither number nor string: {other}"
                )))
            }
            None => classify_legacy(&fields).ok_or_else(|| {
                SyncError::Protocol("message has no type and matches no legacy shape".into())
            })?,
        };

        let message_id = match fields.remove("messageId") {
            Some(Value::String(id)) => id,
            // Legacy senders omit the id; mint one so correlation maps stay keyed.
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let timestamp = fields
            .remove("timestamp")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(now_millis);
        let response_to = match fields.remove("responseTo") {
            Some(Value::String(to)) => Some(to),
            _ => None,
        };

        Ok(Self {
            message_id,
            timestamp,
            response_to,
            body: Body::from_fields(kind, fields)?,
        })
    }
}

/// Classify a message with no `type` field by the fields it carries.
/// Rules are checked in a fixed order; the first match wins.
pub fn classify_legacy(fields: &Map<String, Value>) -> Option<MessageKind> {
    let has = |key: &str| fields.contains_key(key);

    if has("playerInfo") && has("files") {
        return Some(MessageKind::ModDataResponse);
    }
    if has("playerName")
        && !has("playerInfo")
        && !has("componentId")
        && !has("error")
        && !has("success")
        && !has("chunk")
    {
        return Some(MessageKind::ModDataRequest);
    }
    if has("componentId") && has("fileData") {
        return Some(MessageKind::ComponentResponse);
    }
    if has("componentId") {
        return Some(MessageKind::ComponentRequest);
    }
    if has("error") {
        return Some(MessageKind::Error);
    }
    if has("success") {
        return Some(MessageKind::SyncComplete);
    }
    if has("chunk") {
        return Some(MessageKind::FileChunkMessage);
    }
    None
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ── Base64 bytes on the wire ──────────────────────────────────────────────────

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &Message) -> Message {
        Message::from_value(msg.to_value().unwrap()).unwrap()
    }

    #[test]
    fn codes_cover_all_kinds() {
        for code in 0..=16u8 {
            let kind = MessageKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
            assert_eq!(MessageKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(MessageKind::from_code(17), None);
    }

    #[test]
    fn legacy_aliases_resolve() {
        assert_eq!(
            MessageKind::from_name("member_list_request"),
            Some(MessageKind::MemberListRequest)
        );
        assert_eq!(
            MessageKind::from_name("apply_mods"),
            Some(MessageKind::ModApplicationRequest)
        );
        assert_eq!(
            MessageKind::from_name("client_ready"),
            Some(MessageKind::SyncComplete)
        );
    }

    #[test]
    fn envelope_round_trip() {
        let msg = Message::new(Body::ModDataRequest(ModDataRequest {
            player_name: "Aila Swift".into(),
        }));
        let back = round_trip(&msg);
        assert_eq!(back, msg);
    }

    #[test]
    fn response_correlation_survives_round_trip() {
        let request = Message::new(Body::ComponentRequest(ComponentRequest {
            component_id: "ABCD1234ABCD1234".into(),
        }));
        let response = Message::reply_to(
            &request,
            Body::ComponentResponse(ComponentResponse {
                component_id: "ABCD1234ABCD1234".into(),
                file_data: vec![1, 2, 3],
            }),
        );
        let back = round_trip(&response);
        assert_eq!(back.response_to.as_deref(), Some(request.message_id.as_str()));
    }

    #[test]
    fn file_bytes_are_base64_on_the_wire() {
        let msg = Message::new(Body::FileChunkMessage(FileChunkMessage {
            session_id: "s".into(),
            file_name: "a.mdl".into(),
            file_hash: "AA".into(),
            chunk_index: 0,
            total_chunks: 1,
            channel_index: 0,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        }));
        let value = msg.to_value().unwrap();
        assert_eq!(value["data"], Value::from("3q2+7w=="));
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn string_type_name_accepted() {
        let json = serde_json::json!({
            "type": "ModDataRequest",
            "messageId": "m1",
            "timestamp": 1,
            "playerName": "Aila Swift",
        });
        let msg = Message::from_value(json).unwrap();
        assert_eq!(msg.kind(), MessageKind::ModDataRequest);
        assert_eq!(msg.message_id, "m1");
    }

    #[test]
    fn unknown_type_rejected() {
        let json = serde_json::json!({ "type": 99, "messageId": "m", "timestamp": 0 });
        assert!(Message::from_value(json).is_err());
        let json = serde_json::json!({ "type": "Bogus", "messageId": "m", "timestamp": 0 });
        assert!(Message::from_value(json).is_err());
    }

    // Legacy classification, per the shape rules.
    #[test]
    fn legacy_shapes_classify_deterministically() {
        let cases = [
            (
                serde_json::json!({ "playerInfo": {}, "files": [] }),
                MessageKind::ModDataResponse,
            ),
            (
                serde_json::json!({ "playerName": "Aila Swift" }),
                MessageKind::ModDataRequest,
            ),
            (
                serde_json::json!({ "componentId": "c1", "fileData": "AQID" }),
                MessageKind::ComponentResponse,
            ),
            (
                serde_json::json!({ "componentId": "c1" }),
                MessageKind::ComponentRequest,
            ),
            (
                serde_json::json!({ "error": "boom" }),
                MessageKind::Error,
            ),
            (
                serde_json::json!({ "success": true }),
                MessageKind::SyncComplete,
            ),
            (
                serde_json::json!({ "chunk": "AQID" }),
                MessageKind::FileChunkMessage,
            ),
        ];
        for (json, expected) in cases {
            let msg = Message::from_value(json.clone()).unwrap();
            assert_eq!(msg.kind(), expected, "shape {json} misclassified");
        }
    }

    #[test]
    fn legacy_error_maps_description() {
        let msg = Message::from_value(serde_json::json!({ "error": "boom" })).unwrap();
        match msg.body {
            Body::Error(e) => assert_eq!(e.error_description, "boom"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn typeless_unclassifiable_is_rejected() {
        let json = serde_json::json!({ "unrelated": 1 });
        assert!(Message::from_value(json).is_err());
    }
}
