//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message types and serialization for the
//! BitTorrent peer wire protocol, including the extension protocol
//! sub-framing used to fetch metadata over a magnet-bootstrapped
//! connection.
//!
//! ## Message Structure
//!
//! Every message follows the same format:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! A keep-alive message has length 0 and carries no ID or payload.
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | empty |
//! | 1 | UNCHOKE | empty |
//! | 2 | INTERESTED | empty |
//! | 3 | NOT INTERESTED | empty |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | piece availability bitmap |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |
//! | 20 | EXTENDED | extension id, bencoded payload |
//!
//! ## Extension Sub-Framing
//!
//! An EXTENDED payload starts with a one-byte extension id followed by a
//! bencoded dictionary. Metadata replies append a raw bencoded value (the
//! info dictionary) directly after the dictionary; it is decoded by
//! continuing on the same buffered reader.

use crate::bencode::{self, Value};

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::collections::BTreeMap;
use std::io::Cursor;

pub type MessageId = u8;
type MessagePayload = Vec<u8>;

#[allow(dead_code)]
pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
#[allow(dead_code)]
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
#[allow(dead_code)]
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
#[allow(dead_code)]
pub const MESSAGE_CANCEL: MessageId = 8;
pub const MESSAGE_EXTENDED: MessageId = 20;
pub const MESSAGE_KEEPALIVE: MessageId = 255; // Special value for keep-alive (length 0)

/// Extension id of the extension handshake itself.
pub const EXT_HANDSHAKE_ID: u8 = 0;

/// `msg_type` values of the ut_metadata extension.
pub const EXT_MSG_REQUEST: i64 = 0;
pub const EXT_MSG_DATA: i64 = 1;

/// Extension ids this client advertises in its extension handshake.
const LOCAL_UT_METADATA: i64 = 1;
const LOCAL_UT_PEX: i64 = 2;

#[derive(Default, Debug)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message without a payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Serialize the message with its length prefix.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let message_len = 1 + self.payload.len();

        let mut serialized: Vec<u8> = Vec::with_capacity(4 + message_len);
        serialized.write_u32::<BigEndian>(message_len as u32)?;
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);

        Ok(serialized)
    }
}

/// Deserialize a message body (everything after the length prefix).
pub fn deserialize_message(message_buf: &[u8]) -> Result<Message> {
    if message_buf.is_empty() {
        return Err(anyhow!("received empty message body from peer"));
    }

    let id: MessageId = message_buf[0];
    let payload: MessagePayload = message_buf[1..].to_vec();

    Ok(Message::new_with_payload(id, payload))
}

/// Payload of a REQUEST (or CANCEL) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPayload {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl RequestPayload {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        RequestPayload {
            index,
            begin,
            length,
        }
    }

    /// Serialize as three big-endian u32 fields.
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload: Vec<u8> = Vec::with_capacity(12);

        payload.extend_from_slice(&self.index.to_be_bytes());
        payload.extend_from_slice(&self.begin.to_be_bytes());
        payload.extend_from_slice(&self.length.to_be_bytes());

        payload
    }

    pub fn deserialize(data: &[u8]) -> Result<RequestPayload> {
        if data.len() < 12 {
            return Err(anyhow!("received invalid request payload from peer"));
        }

        let mut cursor = Cursor::new(data);

        Ok(RequestPayload {
            index: cursor.read_u32::<BigEndian>()?,
            begin: cursor.read_u32::<BigEndian>()?,
            length: cursor.read_u32::<BigEndian>()?,
        })
    }
}

/// Payload of a PIECE message: a block of data at an offset within a piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiecePayload {
    pub index: u32,
    pub begin: u32,
    pub block: Vec<u8>,
}

impl PiecePayload {
    #[allow(dead_code)]
    pub fn new(index: u32, begin: u32, block: Vec<u8>) -> Self {
        PiecePayload {
            index,
            begin,
            block,
        }
    }

    #[allow(dead_code)]
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload: Vec<u8> = Vec::with_capacity(8 + self.block.len());

        payload.extend_from_slice(&self.index.to_be_bytes());
        payload.extend_from_slice(&self.begin.to_be_bytes());
        payload.extend_from_slice(&self.block);

        payload
    }

    pub fn deserialize(data: &[u8]) -> Result<PiecePayload> {
        if data.len() < 8 {
            return Err(anyhow!("received invalid piece payload from peer"));
        }

        let mut cursor = Cursor::new(&data[..8]);
        let index = cursor.read_u32::<BigEndian>()?;
        let begin = cursor.read_u32::<BigEndian>()?;

        Ok(PiecePayload {
            index,
            begin,
            block: data[8..].to_vec(),
        })
    }
}

/// Payload of an EXTENDED message: an extension id, a bencoded dictionary,
/// and optionally a trailing bencoded value (a metadata piece).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPayload {
    pub ext_id: u8,
    pub dict: Value,
    pub trailing: Option<Value>,
}

fn dict_entry(key: &str, value: Value) -> (Vec<u8>, Value) {
    (key.as_bytes().to_vec(), value)
}

impl ExtensionPayload {
    pub fn new(ext_id: u8, dict: Value) -> Self {
        ExtensionPayload {
            ext_id,
            dict,
            trailing: None,
        }
    }

    /// Build the extension handshake advertising our local extension ids.
    pub fn handshake() -> Self {
        let extensions = Value::Dict(BTreeMap::from([
            dict_entry("ut_metadata", Value::Int(LOCAL_UT_METADATA)),
            dict_entry("ut_pex", Value::Int(LOCAL_UT_PEX)),
        ]));
        let dict = Value::Dict(BTreeMap::from([dict_entry("m", extensions)]));

        ExtensionPayload::new(EXT_HANDSHAKE_ID, dict)
    }

    /// Build a ut_metadata request for a metadata piece.
    ///
    /// # Arguments
    ///
    /// * `remote_id` - The ut_metadata id the peer advertised.
    /// * `piece` - Index of the metadata piece to request.
    ///
    pub fn metadata_request(remote_id: u8, piece: i64) -> Self {
        let dict = Value::Dict(BTreeMap::from([
            dict_entry("msg_type", Value::Int(EXT_MSG_REQUEST)),
            dict_entry("piece", Value::Int(piece)),
        ]));

        ExtensionPayload::new(remote_id, dict)
    }

    /// Serialize: extension id, bencoded dictionary, then the trailing
    /// value if present.
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload = vec![self.ext_id];
        payload.extend_from_slice(&bencode::encode(&self.dict));
        if let Some(trailing) = &self.trailing {
            payload.extend_from_slice(&bencode::encode(trailing));
        }

        payload
    }

    /// Deserialize an EXTENDED message payload.
    ///
    /// The dictionary is pulled off a buffered reader; if any bytes follow
    /// it, they are decoded as the trailing metadata value.
    pub fn deserialize(data: &[u8]) -> Result<ExtensionPayload> {
        if data.is_empty() {
            return Err(anyhow!("received empty extension payload from peer"));
        }

        let ext_id = data[0];

        let mut reader = &data[1..];
        let dict = bencode::decode_value(&mut reader)?;

        let trailing = if reader.is_empty() {
            None
        } else {
            Some(bencode::decode_value(&mut reader)?)
        };

        Ok(ExtensionPayload {
            ext_id,
            dict,
            trailing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serialize_prefixes_length() {
        let message = Message::new_with_payload(MESSAGE_HAVE, vec![0, 0, 0, 7]);
        let bytes = message.serialize().unwrap();

        assert_eq!(bytes, vec![0, 0, 0, 5, MESSAGE_HAVE, 0, 0, 0, 7]);
    }

    #[test]
    fn message_without_payload_has_length_one() {
        let bytes = Message::new(MESSAGE_INTERESTED).serialize().unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 1, MESSAGE_INTERESTED]);
    }

    #[test]
    fn deserialize_message_splits_id_and_payload() {
        let message = deserialize_message(&[MESSAGE_PIECE, 1, 2, 3]).unwrap();
        assert_eq!(message.id, MESSAGE_PIECE);
        assert_eq!(message.payload, vec![1, 2, 3]);
    }

    #[test]
    fn deserialize_message_rejects_empty_body() {
        assert!(deserialize_message(&[]).is_err());
    }

    #[test]
    fn request_payload_round_trips() {
        let request = RequestPayload::new(3, 16384, 16384);
        let decoded = RequestPayload::deserialize(&request.serialize()).unwrap();

        assert_eq!(decoded, request);
    }

    #[test]
    fn request_payload_rejects_short_input() {
        assert!(RequestPayload::deserialize(&[0; 11]).is_err());
    }

    #[test]
    fn piece_payload_round_trips() {
        let piece = PiecePayload::new(2, 32768, vec![0xAB; 64]);
        let decoded = PiecePayload::deserialize(&piece.serialize()).unwrap();

        assert_eq!(decoded, piece);
    }

    #[test]
    fn piece_payload_rejects_short_input() {
        assert!(PiecePayload::deserialize(&[0; 7]).is_err());
    }

    #[test]
    fn extension_handshake_advertises_metadata_support() {
        let payload = ExtensionPayload::handshake();
        let bytes = payload.serialize();

        assert_eq!(bytes[0], EXT_HANDSHAKE_ID);

        let decoded = ExtensionPayload::deserialize(&bytes).unwrap();
        let extensions = decoded.dict.get("m").unwrap();
        assert_eq!(
            extensions.get("ut_metadata").unwrap().as_int().unwrap(),
            LOCAL_UT_METADATA
        );
        assert_eq!(
            extensions.get("ut_pex").unwrap().as_int().unwrap(),
            LOCAL_UT_PEX
        );
        assert!(decoded.trailing.is_none());
    }

    #[test]
    fn metadata_request_carries_piece_index() {
        let payload = ExtensionPayload::metadata_request(3, 0);
        let decoded = ExtensionPayload::deserialize(&payload.serialize()).unwrap();

        assert_eq!(decoded.ext_id, 3);
        assert_eq!(
            decoded.dict.get("msg_type").unwrap().as_int().unwrap(),
            EXT_MSG_REQUEST
        );
        assert_eq!(decoded.dict.get("piece").unwrap().as_int().unwrap(), 0);
    }

    #[test]
    fn extension_payload_decodes_trailing_metadata() {
        let header = Value::Dict(BTreeMap::from([
            dict_entry("msg_type", Value::Int(EXT_MSG_DATA)),
            dict_entry("piece", Value::Int(0)),
        ]));
        let info = Value::Dict(BTreeMap::from([dict_entry(
            "name",
            Value::Bytes(b"file.txt".to_vec()),
        )]));

        let mut payload = ExtensionPayload::new(9, header);
        payload.trailing = Some(info.clone());

        let decoded = ExtensionPayload::deserialize(&payload.serialize()).unwrap();
        assert_eq!(decoded.ext_id, 9);
        assert_eq!(
            decoded.dict.get("msg_type").unwrap().as_int().unwrap(),
            EXT_MSG_DATA
        );
        assert_eq!(decoded.trailing, Some(info));
    }

    #[test]
    fn extension_payload_rejects_empty_input() {
        assert!(ExtensionPayload::deserialize(&[]).is_err());
    }
}
