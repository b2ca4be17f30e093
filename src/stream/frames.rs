use std::io::Cursor;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Header of a framed event-stream message: two concatenated DAG-CBOR
/// values, `[header, body]`. `op` is 1 for messages (with a `t` type
/// fragment) and -1 for terminal error frames.
#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    op: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    t: Option<String>,
}

#[derive(Debug)]
pub struct MessageFrame {
    pub body: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug)]
pub enum Frame {
    Message(Option<String>, MessageFrame),
    Error(ErrorFrame),
}

impl TryFrom<&[u8]> for Frame {
    type Error = anyhow::Error;

    fn try_from(data: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(data);
        let header: FrameHeader = serde_ipld_dagcbor::from_reader(&mut reader)
            .map_err(|e| anyhow!("invalid frame header: {}", e))?;
        let body = &data[reader.position() as usize..];

        match header.op {
            1 => Ok(Frame::Message(
                header.t,
                MessageFrame {
                    body: body.to_vec(),
                },
            )),
            -1 => {
                let error: ErrorFrame = serde_ipld_dagcbor::from_slice(body)
                    .map_err(|e| anyhow!("invalid error frame body: {}", e))?;
                Ok(Frame::Error(error))
            }
            op => Err(anyhow!("unknown frame op: {}", op)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(header: &FrameHeader, body: &impl Serialize) -> Vec<u8> {
        let mut data = serde_ipld_dagcbor::to_vec(header).unwrap();
        data.extend(serde_ipld_dagcbor::to_vec(body).unwrap());
        data
    }

    #[test]
    fn decodes_message_frame() {
        #[derive(Serialize)]
        struct Body {
            seq: i64,
        }

        let data = frame_bytes(
            &FrameHeader {
                op: 1,
                t: Some("#commit".to_string()),
            },
            &Body { seq: 9 },
        );

        match Frame::try_from(&data[..]).unwrap() {
            Frame::Message(Some(t), message) => {
                assert_eq!(t, "#commit");
                // The body is the raw second value, decodable on its own.
                let body: serde_json::Value =
                    serde_ipld_dagcbor::from_slice(&message.body).unwrap();
                assert_eq!(body["seq"], 9);
            }
            other => panic!("expected message frame, got {:?}", other),
        }
    }

    #[test]
    fn decodes_error_frame() {
        let data = frame_bytes(
            &FrameHeader { op: -1, t: None },
            &ErrorFrame {
                error: Some("FutureCursor".to_string()),
                message: None,
            },
        );

        match Frame::try_from(&data[..]).unwrap() {
            Frame::Error(e) => assert_eq!(e.error.as_deref(), Some("FutureCursor")),
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(Frame::try_from(&[0xff, 0xff, 0xff][..]).is_err());
    }

    #[test]
    fn rejects_unknown_op() {
        let data = frame_bytes(&FrameHeader { op: 2, t: None }, &serde_json::json!({}));
        assert!(Frame::try_from(&data[..]).is_err());
    }
}
