use std::fmt;
use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rmp_serde::{from_slice, to_vec_named};
use serde::{Deserialize, Serialize};

use crate::error::MxError;
use crate::message::{RequestMessage, ResponseMessage};

/// A message body as it travels between control lines.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum WireMessage {
    Request(RequestMessage),
    Response(ResponseMessage),
    /// Body of a keepalive round: the server had nothing queued.
    Empty,
}

impl WireMessage {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Empty => "empty",
        }
    }
}

/// Turns message bodies into bytes and back. Framing is the stream's job.
pub trait MessageCodec: Send + Sync + fmt::Debug {
    fn encode(&self, message: &WireMessage) -> Result<Vec<u8>, MxError>;
    fn decode(&self, payload: &[u8]) -> Result<WireMessage, MxError>;
}

/// MessagePack bodies compressed with raw deflate.
#[derive(Debug, Clone)]
pub struct DeflateMsgPackCodec {
    max_message_size: usize,
}

impl DeflateMsgPackCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl MessageCodec for DeflateMsgPackCodec {
    fn encode(&self, message: &WireMessage) -> Result<Vec<u8>, MxError> {
        let packed = to_vec_named(message).map_err(|err| MxError::codec(err.to_string()))?;
        if packed.len() > self.max_message_size {
            return Err(MxError::codec(format!(
                "message of {} bytes exceeds the {} byte limit",
                packed.len(),
                self.max_message_size
            )));
        }
        let mut encoder =
            DeflateEncoder::new(Vec::with_capacity(packed.len() / 2), Compression::fast());
        encoder.write_all(&packed).map_err(|err| MxError::codec(err.to_string()))?;
        encoder.finish().map_err(|err| MxError::codec(err.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<WireMessage, MxError> {
        let limit = self.max_message_size as u64;
        let mut packed = Vec::new();
        DeflateDecoder::new(payload)
            .take(limit + 1)
            .read_to_end(&mut packed)
            .map_err(|err| MxError::codec(format!("failed to inflate message: {}", err)))?;
        if packed.len() as u64 > limit {
            return Err(MxError::codec(format!(
                "inflated message exceeds the {} byte limit",
                self.max_message_size
            )));
        }
        from_slice(&packed).map_err(|err| MxError::codec(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ServiceEndPoint;
    use rmpv::Value;

    fn request() -> RequestMessage {
        let endpoint = ServiceEndPoint::new("https://localhost:10933/", "AA").expect("endpoint");
        RequestMessage::new(
            endpoint,
            "Calculator",
            "Add",
            vec![Value::from(12), Value::from(18), Value::from("text"), Value::Nil],
        )
    }

    #[test]
    fn decodes_what_it_encodes() {
        let codec = DeflateMsgPackCodec::new(1024 * 1024);
        let message = WireMessage::Request(request());
        let bytes = codec.encode(&message).expect("encode");
        assert_eq!(codec.decode(&bytes).expect("decode"), message);

        let bytes = codec.encode(&WireMessage::Empty).expect("encode");
        assert_eq!(codec.decode(&bytes).expect("decode"), WireMessage::Empty);
    }

    #[test]
    fn rejects_oversized_messages() {
        let small = DeflateMsgPackCodec::new(64);
        let mut big = request();
        big.params = vec![Value::from("x".repeat(4096))];
        assert!(matches!(
            small.encode(&WireMessage::Request(big.clone())),
            Err(MxError::Codec { .. })
        ));

        let bytes = DeflateMsgPackCodec::new(1 << 20)
            .encode(&WireMessage::Request(big))
            .expect("encode");
        assert!(matches!(small.decode(&bytes), Err(MxError::Codec { .. })));
    }

    #[test]
    fn rejects_garbage() {
        let codec = DeflateMsgPackCodec::new(1024);
        assert!(codec.decode(&[0xff, 0x00, 0x13, 0x37]).is_err());
    }
}
