//! Framing for the control socket.
//!
//! Each frame is an 8 byte little-endian length followed by a protobuf
//! encoded [`ToDataplane`] envelope.

use bytes::Bytes;
use prost::Message as _;
use tokio_util::codec::LengthDelimitedCodec;

use crate::{Message, Result, ToDataplane};

const LENGTH_FIELD_LENGTH: usize = 8;
// ipset updates for large clusters can carry tens of thousands of members
const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_FIELD_LENGTH)
        .little_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn decode(frame: &[u8]) -> Result<Message> {
    let envelope = ToDataplane::decode(frame)?;
    Message::try_from(envelope)
}

pub fn encode(message: Message, sequence_number: u64) -> Bytes {
    let envelope = ToDataplane {
        sequence_number,
        payload: Some(message),
    };
    Bytes::from(envelope.encode_to_vec())
}

#[cfg(test)]
mod test {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::proto::{InSync, IpSetDeltaUpdate};

    #[tokio::test]
    async fn test_frames_over_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedWrite::new(client, codec());
        let mut reader = FramedRead::new(server, codec());

        let delta = Message::IpSetDeltaUpdate(IpSetDeltaUpdate {
            id: "s1".into(),
            added_members: vec!["10.0.0.2/32".into()],
            removed_members: vec![],
        });
        writer.send(encode(delta.clone(), 1)).await.unwrap();
        writer
            .send(encode(Message::InSync(InSync {}), 2))
            .await
            .unwrap();

        let first = reader.next().await.unwrap().unwrap();
        assert!(decode(&first).unwrap() == delta);
        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(decode(&second).unwrap().kind(), "in_sync");
    }

    #[test]
    fn test_length_prefix_is_little_endian_u64() {
        let mut codec = codec();
        let mut buf = bytes::BytesMut::new();
        tokio_util::codec::Encoder::encode(&mut codec, Bytes::from_static(b"abc"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..8], &3u64.to_le_bytes());
        assert_eq!(&buf[8..], b"abc");
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        let envelope = ToDataplane {
            sequence_number: 7,
            payload: None,
        };
        let err = decode(&envelope.encode_to_vec()).unwrap_err();
        assert!(matches!(err, crate::Error::EmptyPayload(7)));
    }
}
