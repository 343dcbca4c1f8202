// src/envelope.rs
// Bit-exact binary codec for ChatMessage, EncryptedEnvelope, and the typed
// payloads carried inside a ChatMessage (C3). Field numbers and wire types
// follow the schema in §4.3 exactly:
//
//   message ChatMessage {
//     string message_id = 1; string sender_id = 2; string conversation_id = 3;
//     ConversationType conv_type = 4; MessageType type = 5;
//     uint64 timestamp = 6; bytes payload = 7; uint32 version = 8;
//   }
//   message EncryptedEnvelope {
//     bytes encrypted_payload = 1; bytes nonce = 2; bytes signature = 3;
//     string sender_id = 4; uint64 timestamp = 5; uint32 version = 6;
//   }
//   message TextPayload   { string content = 1; }
//   message RevokePayload { string target_message_id = 1; string reason = 2; }

use std::io::Cursor;

use crate::error::{ChatError, Result};
use crate::wire::{
    read_length_delimited, read_string_field, read_tag, read_varint, write_bytes_field,
    write_string_field, write_varint_field, WIRE_LEN_DELIMITED, WIRE_VARINT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationType {
    Direct = 0,
    Group = 1,
}

impl ConversationType {
    fn from_u64(v: u64) -> Result<Self> {
        match v {
            0 => Ok(ConversationType::Direct),
            1 => Ok(ConversationType::Group),
            other => Err(ChatError::DecodeWire(format!("unknown conv_type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text = 0,
    Revoke = 1,
    KeyExchange = 2,
    GroupInvite = 3,
    GroupJoin = 4,
    GroupLeave = 5,
    GroupKeyUpdate = 6,
}

impl MessageType {
    fn from_u64(v: u64) -> Result<Self> {
        match v {
            0 => Ok(MessageType::Text),
            1 => Ok(MessageType::Revoke),
            2 => Ok(MessageType::KeyExchange),
            3 => Ok(MessageType::GroupInvite),
            4 => Ok(MessageType::GroupJoin),
            5 => Ok(MessageType::GroupLeave),
            6 => Ok(MessageType::GroupKeyUpdate),
            other => Err(ChatError::DecodeWire(format!("unknown message type {other}"))),
        }
    }

    /// The ASCII tag folded into the signature pre-image. Stable across
    /// versions even if the wire enum's numeric values ever need to change.
    pub fn as_tag(&self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::Revoke => "REVOKE",
            MessageType::KeyExchange => "KEY_EXCHANGE",
            MessageType::GroupInvite => "GROUP_INVITE",
            MessageType::GroupJoin => "GROUP_JOIN",
            MessageType::GroupLeave => "GROUP_LEAVE",
            MessageType::GroupKeyUpdate => "GROUP_KEY_UPDATE",
        }
    }
}

/// Builds `mid || sender_id || conv_id || ascii(ts) || type_tag || sha256(payload)`,
/// the pre-image signed over (and verified against) for every message type.
/// Binding the type tag and conversation id into the signature stops a
/// REVOKE signed for one conversation from being replayed as a TEXT in
/// another, or against a different target.
pub fn signature_preimage(
    message_id: &str,
    sender_id: &str,
    conversation_id: &str,
    timestamp: u64,
    msg_type: MessageType,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(message_id.as_bytes());
    out.extend_from_slice(sender_id.as_bytes());
    out.extend_from_slice(conversation_id.as_bytes());
    out.extend_from_slice(timestamp.to_string().as_bytes());
    out.extend_from_slice(msg_type.as_tag().as_bytes());
    out.extend_from_slice(&crate::crypto::sha256(payload));
    out
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub message_id: String,
    pub sender_id: String,
    pub conversation_id: String,
    pub conv_type: ConversationType,
    pub msg_type: MessageType,
    pub timestamp: u64,
    pub payload: Vec<u8>,
    pub version: u32,
}

impl ChatMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_string_field(&mut out, 1, &self.message_id).unwrap();
        write_string_field(&mut out, 2, &self.sender_id).unwrap();
        write_string_field(&mut out, 3, &self.conversation_id).unwrap();
        write_varint_field(&mut out, 4, self.conv_type as u64).unwrap();
        write_varint_field(&mut out, 5, self.msg_type as u64).unwrap();
        write_varint_field(&mut out, 6, self.timestamp).unwrap();
        write_bytes_field(&mut out, 7, &self.payload).unwrap();
        write_varint_field(&mut out, 8, self.version as u64).unwrap();
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);

        let mut message_id = None;
        let mut sender_id = None;
        let mut conversation_id = None;
        let mut conv_type = None;
        let mut msg_type = None;
        let mut timestamp = None;
        let mut payload = None;
        let mut version = None;

        while (cur.position() as usize) < data.len() {
            let (field, wire_type) = read_tag(&mut cur)?;
            match (field, wire_type) {
                (1, WIRE_LEN_DELIMITED) => message_id = Some(read_string_field(&mut cur)?),
                (2, WIRE_LEN_DELIMITED) => sender_id = Some(read_string_field(&mut cur)?),
                (3, WIRE_LEN_DELIMITED) => conversation_id = Some(read_string_field(&mut cur)?),
                (4, WIRE_VARINT) => conv_type = Some(ConversationType::from_u64(read_varint(&mut cur)?)?),
                (5, WIRE_VARINT) => msg_type = Some(MessageType::from_u64(read_varint(&mut cur)?)?),
                (6, WIRE_VARINT) => timestamp = Some(read_varint(&mut cur)?),
                (7, WIRE_LEN_DELIMITED) => payload = Some(read_length_delimited(&mut cur)?),
                (8, WIRE_VARINT) => version = Some(read_varint(&mut cur)? as u32),
                (f, wt) => return Err(ChatError::DecodeWire(format!("unexpected field {f} wire type {wt}"))),
            }
        }

        Ok(ChatMessage {
            message_id: message_id.ok_or_else(|| ChatError::DecodeWire("missing message_id".into()))?,
            sender_id: sender_id.ok_or_else(|| ChatError::DecodeWire("missing sender_id".into()))?,
            conversation_id: conversation_id
                .ok_or_else(|| ChatError::DecodeWire("missing conversation_id".into()))?,
            conv_type: conv_type.ok_or_else(|| ChatError::DecodeWire("missing conv_type".into()))?,
            msg_type: msg_type.ok_or_else(|| ChatError::DecodeWire("missing type".into()))?,
            timestamp: timestamp.ok_or_else(|| ChatError::DecodeWire("missing timestamp".into()))?,
            // payload may legitimately be empty bytes; default rather than require presence
            payload: payload.unwrap_or_default(),
            version: version.unwrap_or(1),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EncryptedEnvelope {
    pub encrypted_payload: Vec<u8>,
    pub nonce: Vec<u8>,
    pub signature: Vec<u8>,
    pub sender_id: String,
    pub timestamp: u64,
    pub version: u32,
}

impl EncryptedEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_bytes_field(&mut out, 1, &self.encrypted_payload).unwrap();
        write_bytes_field(&mut out, 2, &self.nonce).unwrap();
        write_bytes_field(&mut out, 3, &self.signature).unwrap();
        write_string_field(&mut out, 4, &self.sender_id).unwrap();
        write_varint_field(&mut out, 5, self.timestamp).unwrap();
        write_varint_field(&mut out, 6, self.version as u64).unwrap();
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);

        let mut encrypted_payload = None;
        let mut nonce = None;
        let mut signature = None;
        let mut sender_id = None;
        let mut timestamp = None;
        let mut version = None;

        while (cur.position() as usize) < data.len() {
            let (field, wire_type) = read_tag(&mut cur)?;
            match (field, wire_type) {
                (1, WIRE_LEN_DELIMITED) => encrypted_payload = Some(read_length_delimited(&mut cur)?),
                (2, WIRE_LEN_DELIMITED) => nonce = Some(read_length_delimited(&mut cur)?),
                (3, WIRE_LEN_DELIMITED) => signature = Some(read_length_delimited(&mut cur)?),
                (4, WIRE_LEN_DELIMITED) => sender_id = Some(read_string_field(&mut cur)?),
                (5, WIRE_VARINT) => timestamp = Some(read_varint(&mut cur)?),
                (6, WIRE_VARINT) => version = Some(read_varint(&mut cur)? as u32),
                (f, wt) => return Err(ChatError::DecodeWire(format!("unexpected field {f} wire type {wt}"))),
            }
        }

        Ok(EncryptedEnvelope {
            encrypted_payload: encrypted_payload
                .ok_or_else(|| ChatError::DecodeWire("missing encrypted_payload".into()))?,
            nonce: nonce.ok_or_else(|| ChatError::DecodeWire("missing nonce".into()))?,
            signature: signature.ok_or_else(|| ChatError::DecodeWire("missing signature".into()))?,
            sender_id: sender_id.ok_or_else(|| ChatError::DecodeWire("missing sender_id".into()))?,
            timestamp: timestamp.ok_or_else(|| ChatError::DecodeWire("missing timestamp".into()))?,
            version: version.unwrap_or(1),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TextPayload {
    pub content: String,
}

impl TextPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_string_field(&mut out, 1, &self.content).unwrap();
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let mut content = None;
        while (cur.position() as usize) < data.len() {
            let (field, wire_type) = read_tag(&mut cur)?;
            match (field, wire_type) {
                (1, WIRE_LEN_DELIMITED) => content = Some(read_string_field(&mut cur)?),
                (f, wt) => return Err(ChatError::DecodeWire(format!("unexpected field {f} wire type {wt}"))),
            }
        }
        Ok(TextPayload { content: content.unwrap_or_default() })
    }
}

#[derive(Debug, Clone)]
pub struct RevokePayload {
    pub target_message_id: String,
    pub reason: String,
}

impl RevokePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_string_field(&mut out, 1, &self.target_message_id).unwrap();
        write_string_field(&mut out, 2, &self.reason).unwrap();
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let mut target_message_id = None;
        let mut reason = None;
        while (cur.position() as usize) < data.len() {
            let (field, wire_type) = read_tag(&mut cur)?;
            match (field, wire_type) {
                (1, WIRE_LEN_DELIMITED) => target_message_id = Some(read_string_field(&mut cur)?),
                (2, WIRE_LEN_DELIMITED) => reason = Some(read_string_field(&mut cur)?),
                (f, wt) => return Err(ChatError::DecodeWire(format!("unexpected field {f} wire type {wt}"))),
            }
        }
        Ok(RevokePayload {
            target_message_id: target_message_id
                .ok_or_else(|| ChatError::DecodeWire("missing target_message_id".into()))?,
            reason: reason.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_round_trip() {
        let msg = ChatMessage {
            message_id: "a".repeat(64),
            sender_id: "b".repeat(40),
            conversation_id: "c".repeat(32),
            conv_type: ConversationType::Direct,
            msg_type: MessageType::Text,
            timestamp: 1_700_000_000_123,
            payload: TextPayload { content: "hi".into() }.encode(),
            version: 1,
        };
        let encoded = msg.encode();
        let decoded = ChatMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.message_id, msg.message_id);
        assert_eq!(decoded.timestamp, msg.timestamp);
        assert_eq!(decoded.conv_type, ConversationType::Direct);
        assert_eq!(decoded.msg_type, MessageType::Text);
        let text = TextPayload::decode(&decoded.payload).unwrap();
        assert_eq!(text.content, "hi");
    }

    #[test]
    fn envelope_round_trip() {
        let env = EncryptedEnvelope {
            encrypted_payload: vec![1, 2, 3, 4],
            nonce: vec![0u8; 12],
            signature: vec![9u8; 64],
            sender_id: "d".repeat(40),
            timestamp: 42,
            version: 1,
        };
        let encoded = env.encode();
        let decoded = EncryptedEnvelope::decode(&encoded).unwrap();
        assert_eq!(decoded.sender_id, env.sender_id);
        assert_eq!(decoded.signature, env.signature);
    }

    #[test]
    fn revoke_payload_round_trip() {
        let rp = RevokePayload { target_message_id: "e".repeat(64), reason: "mistake".into() };
        let decoded = RevokePayload::decode(&rp.encode()).unwrap();
        assert_eq!(decoded.target_message_id, rp.target_message_id);
        assert_eq!(decoded.reason, "mistake");
    }

    #[test]
    fn signature_preimage_binds_type_and_conversation() {
        let a = signature_preimage("mid", "sender", "conv-a", 42, MessageType::Text, b"hello");
        let b = signature_preimage("mid", "sender", "conv-a", 42, MessageType::Revoke, b"hello");
        let c = signature_preimage("mid", "sender", "conv-b", 42, MessageType::Text, b"hello");
        assert_ne!(a, b, "TEXT and REVOKE over identical fields must sign different pre-images");
        assert_ne!(a, c, "the same message replayed into a different conversation must sign a different pre-image");
    }
}
