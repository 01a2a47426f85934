use bencode::BencodeDeserializer;
use bt_core::constants::CHUNK_SIZE;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("bencode header: {0}")]
    Bencode(String),
    #[error("unknown ut_metadata msg_type {0}")]
    UnknownMsgType(u32),
    #[error("data message missing total_size")]
    MissingTotalSize,
    #[error("data payload length {got} does not match total_size-implied length {expected}")]
    SizeMismatch { expected: u32, got: u32 },
}

#[derive(Serialize, Deserialize)]
struct Header {
    msg_type: u32,
    piece: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    total_size: Option<u32>,
}

/// The three `ut_metadata` extension messages (BEP 9): a bencoded header dict
/// immediately followed (for `Data`) by the raw metadata-piece bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtMetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, payload: Vec<u8> },
    Reject { piece: u32 },
}

impl UtMetadataMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            UtMetadataMessage::Request { piece } => {
                let header = Header {
                    msg_type: 0,
                    piece: *piece,
                    total_size: None,
                };
                bencode::bencode_serialize_to_writer(&header, &mut out).expect("serialize header");
            }
            UtMetadataMessage::Data {
                piece,
                total_size,
                payload,
            } => {
                let header = Header {
                    msg_type: 1,
                    piece: *piece,
                    total_size: Some(*total_size),
                };
                bencode::bencode_serialize_to_writer(&header, &mut out).expect("serialize header");
                out.extend_from_slice(payload);
            }
            UtMetadataMessage::Reject { piece } => {
                let header = Header {
                    msg_type: 2,
                    piece: *piece,
                    total_size: None,
                };
                bencode::bencode_serialize_to_writer(&header, &mut out).expect("serialize header");
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut de = BencodeDeserializer::new_from_buf(buf);
        let header = Header::deserialize(&mut de).map_err(|e| WireError::Bencode(e.to_string()))?;
        let payload = de.into_remaining();

        match header.msg_type {
            0 => Ok(UtMetadataMessage::Request { piece: header.piece }),
            1 => {
                let total_size = header.total_size.ok_or(WireError::MissingTotalSize)?;
                let expected = expected_piece_length(header.piece, total_size);
                if payload.len() as u32 != expected {
                    return Err(WireError::SizeMismatch {
                        expected,
                        got: payload.len() as u32,
                    });
                }
                Ok(UtMetadataMessage::Data {
                    piece: header.piece,
                    total_size,
                    payload: payload.to_vec(),
                })
            }
            2 => Ok(UtMetadataMessage::Reject { piece: header.piece }),
            other => Err(WireError::UnknownMsgType(other)),
        }
    }
}

/// Length of piece `index` given the metadata's `total_size`: `CHUNK_SIZE` except
/// possibly the final, short piece.
pub fn expected_piece_length(index: u32, total_size: u32) -> u32 {
    total_size.saturating_sub(index * CHUNK_SIZE).min(CHUNK_SIZE)
}
