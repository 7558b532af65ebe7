use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, ProtocolError};
use super::message::{self, Body, DecodeFn, Telegram, TypeCode};
use super::{HEADER_LEN, MAX_PAYLOAD_LEN, SIGNATURE, TRAILER_LEN};

/// Computes the two checksum bytes over `dst, src, length, type code, payload`.
///
/// Every byte contributes both its complement and its value shifted left by
/// eight; the low two bytes of the sum are emitted low byte first.
pub fn checksum(bytes: &[u8]) -> [u8; 2] {
    let total = bytes
        .iter()
        .fold(0u32, |acc, &b| acc + u32::from(b ^ 0xFF) + (u32::from(b) << 8));
    [(total & 0xFF) as u8, ((total >> 8) & 0xFF) as u8]
}

fn checksum_parts(header: [u8; 4], payload: &[u8]) -> [u8; 2] {
    let mut covered = Vec::with_capacity(header.len() + payload.len());
    covered.extend_from_slice(&header);
    covered.extend_from_slice(payload);
    checksum(&covered)
}

/// Type code to payload decoder table. Built once, then shared read-only.
#[derive(Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<u8, DecodeFn>,
}

impl DecoderRegistry {
    /// Creates a registry with no decoders
    pub fn empty() -> Self {
        DecoderRegistry {
            decoders: HashMap::new(),
        }
    }

    /// Creates a registry for text and every file-protocol telegram
    pub fn standard() -> Self {
        Self::empty()
            .with(TypeCode::Text, message::decode_text)
            .with(TypeCode::FileOpen, message::decode_file_open)
            .with(TypeCode::FileOpenResponse, message::decode_file_open_response)
            .with(TypeCode::FileClose, message::decode_file_close)
            .with(TypeCode::FileCloseResponse, message::decode_file_close_response)
            .with(TypeCode::FileWrite, message::decode_file_write)
            .with(TypeCode::FileWriteResponse, message::decode_file_write_response)
            .with(TypeCode::FileWriteNoAck, message::decode_file_write)
            .with(TypeCode::FileWriteNoAckResponse, message::decode_file_write_response)
            .with(TypeCode::FileRead, message::decode_file_read)
            .with(TypeCode::FileContent, message::decode_file_content)
    }

    /// Registers a decoder for a type code, replacing any previous one
    pub fn with(mut self, type_code: TypeCode, decoder: DecodeFn) -> Self {
        self.register(type_code.as_u8(), decoder);
        self
    }

    /// Registers a decoder for a raw type code, replacing any previous one
    pub fn register(&mut self, type_code: u8, decoder: DecodeFn) {
        self.decoders.insert(type_code, decoder);
    }

    /// Decodes a payload with the decoder registered for `type_code`
    pub fn decode(&self, type_code: u8, payload: &[u8]) -> Result<Body, ProtocolError> {
        let decoder = self
            .decoders
            .get(&type_code)
            .ok_or(ProtocolError::UnknownTypeCode(type_code))?;
        decoder(type_code, payload)
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Telegram codec for encoding/decoding framed datagrams
#[derive(Clone, Default)]
pub struct TelegramCodec {
    registry: Arc<DecoderRegistry>,
}

impl TelegramCodec {
    /// Creates a codec with the standard decoders
    pub fn new() -> Self {
        TelegramCodec::default()
    }

    /// Creates a codec with a custom decoder table
    pub fn with_registry(registry: DecoderRegistry) -> Self {
        TelegramCodec {
            registry: Arc::new(registry),
        }
    }

    /// Encodes one telegram into a standalone buffer
    pub fn encode_telegram(&self, telegram: &Telegram) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        encode_into(telegram, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes one complete datagram
    pub fn decode_datagram(&self, datagram: &[u8]) -> Result<Telegram, Error> {
        let mut buf = BytesMut::from(datagram);
        match self.decode_frame(&mut buf)? {
            Some(telegram) => Ok(telegram),
            None => Err(ProtocolError::Truncated {
                needed: frame_len(datagram).unwrap_or(HEADER_LEN + TRAILER_LEN),
                available: datagram.len(),
            }
            .into()),
        }
    }

    fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<Telegram>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = src[6];
        if length == 0 {
            // The length byte counts the type code, so zero can never be framed
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN + TRAILER_LEN,
                available: src.len(),
            });
        }
        let needed = HEADER_LEN + usize::from(length) - 1 + TRAILER_LEN;
        if src.len() < needed {
            return Ok(None);
        }

        let mut frame = src.split_to(needed);
        frame.advance(SIGNATURE.len());
        let header = [frame.get_u8(), frame.get_u8(), frame.get_u8(), frame.get_u8()];
        let [dst, src_addr, _, type_code] = header;
        let payload = frame.split_to(usize::from(length) - 1);
        let actual = [frame[0], frame[1]];

        let expected = checksum_parts(header, &payload);
        if expected != actual {
            return Err(ProtocolError::InvalidChecksum { expected, actual });
        }

        let body = self.registry.decode(type_code, &payload)?;
        Ok(Some(Telegram {
            dst,
            src: src_addr,
            body,
        }))
    }
}

fn frame_len(datagram: &[u8]) -> Option<usize> {
    let length = *datagram.get(6)?;
    Some(HEADER_LEN + usize::from(length).saturating_sub(1) + TRAILER_LEN)
}

fn encode_into(telegram: &Telegram, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = telegram.body.encode_payload();
    if payload.is_empty() {
        return Err(ProtocolError::EmptyPayload);
    }
    let type_code = telegram.type_code();
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::MalformedPayload {
            type_code,
            reason: format!("payload of {} bytes exceeds {}", payload.len(), MAX_PAYLOAD_LEN),
        });
    }

    let header = [telegram.dst, telegram.src, (payload.len() + 1) as u8, type_code];
    let crc = checksum_parts(header, &payload);

    dst.reserve(HEADER_LEN + payload.len() + TRAILER_LEN);
    dst.put_slice(&SIGNATURE);
    dst.put_slice(&header);
    dst.put_slice(&payload);
    dst.put_slice(&crc);
    Ok(())
}

impl Decoder for TelegramCodec {
    type Item = Telegram;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.decode_frame(src)?)
    }
}

impl Encoder<Telegram> for TelegramCodec {
    type Error = Error;

    fn encode(&mut self, item: Telegram, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Ok(encode_into(&item, dst)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{FileMode, FileStatus};

    fn codec() -> TelegramCodec {
        TelegramCodec::new()
    }

    #[test]
    fn test_checksum_reference_value() {
        assert_eq!(checksum(&[0, 0, 3, 0x20, 0x23, 0x46]), [0x6E, 0x91]);
    }

    #[test]
    fn test_encode_beacon() {
        let bytes = codec().encode_telegram(&Telegram::text("#F")).unwrap();
        assert_eq!(
            &bytes[..],
            &[2, 77, 108, 2, 0, 0, 3, 0x20, 0x23, 0x46, 0x6E, 0x91]
        );
    }

    #[test]
    fn test_roundtrip_variants() {
        let telegrams = vec![
            Telegram::text("#S7=H1000 3 1234").with_addresses(12, 0),
            Telegram::new(Body::FileOpen {
                mode: FileMode::CREATE_ALWAYS | FileMode::WRITE,
                name: "config.txt".into(),
            })
            .with_addresses(0, 10),
            Telegram::new(Body::FileOpenResponse {
                status: FileStatus::Ok,
                handle: 2,
                size: 250,
            }),
            Telegram::new(Body::FileWrite {
                handle: 2,
                offset: 200,
                data: Bytes::from(vec![7u8; 50]),
            }),
            Telegram::new(Body::FileContent {
                handle: 2,
                position: 100,
                data: Bytes::from_static(b"chunk"),
            }),
            Telegram::new(Body::FileCloseResponse {
                status: FileStatus::InvalidPosition,
            }),
            Telegram::new(Body::FileClose { handle: 2 }).with_addresses(0, 11),
            Telegram::new(Body::FileWriteResponse {
                status: FileStatus::Ok,
                handle: 2,
                offset: 4200,
            }),
            Telegram::new(Body::FileWriteNoAck {
                handle: 3,
                offset: 100,
                data: Bytes::from_static(b"no ack"),
            }),
            Telegram::new(Body::FileWriteNoAckResponse {
                status: FileStatus::Locked,
                handle: 3,
                offset: 100,
            }),
            Telegram::new(Body::FileRead {
                handle: 1,
                offset: 0,
                length: 65_536,
            }),
        ];

        for telegram in telegrams {
            let bytes = codec().encode_telegram(&telegram).unwrap();
            let decoded = codec().decode_datagram(&bytes).unwrap();
            assert_eq!(decoded, telegram);
        }
    }

    #[test]
    fn test_empty_payload_rejected() {
        let err = codec().encode_telegram(&Telegram::text("")).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::EmptyPayload)));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let telegram = Telegram::new(Body::FileWrite {
            handle: 1,
            offset: 0,
            data: Bytes::from(vec![0u8; 300]),
        });
        let err = codec().encode_telegram(&telegram).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::MalformedPayload { type_code: 0x44, .. })
        ));
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let bytes = codec().encode_telegram(&Telegram::text("GETALLSTATES?")).unwrap();
        for index in HEADER_LEN..bytes.len() - TRAILER_LEN {
            let mut tampered = bytes.to_vec();
            tampered[index] ^= 0x01;
            let err = codec().decode_datagram(&tampered).unwrap_err();
            assert!(matches!(
                err,
                Error::Protocol(ProtocolError::InvalidChecksum { .. })
            ));
        }
    }

    #[test]
    fn test_signature_not_validated() {
        let mut bytes = codec().encode_telegram(&Telegram::text("#F")).unwrap().to_vec();
        bytes[0] = 0xAA;
        assert_eq!(codec().decode_datagram(&bytes).unwrap(), Telegram::text("#F"));
    }

    #[test]
    fn test_unknown_type_code() {
        let telegram = Telegram::new(Body::Opaque {
            type_code: 0x50,
            payload: Bytes::from_static(&[1]),
        });
        let bytes = codec().encode_telegram(&telegram).unwrap();
        let err = codec().decode_datagram(&bytes).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnknownTypeCode(0x50))));

        let extended = TelegramCodec::with_registry(
            DecoderRegistry::standard().with(TypeCode::Reboot, message::decode_opaque),
        );
        assert_eq!(extended.decode_datagram(&bytes).unwrap(), telegram);
    }

    #[test]
    fn test_truncated_datagram() {
        let bytes = codec().encode_telegram(&Telegram::text("#S7?")).unwrap();
        let err = codec().decode_datagram(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_stream_decoder_waits_for_full_frame() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec.encode(Telegram::text("#S7?"), &mut buf).unwrap();
        codec.encode(Telegram::text("#F"), &mut buf).unwrap();

        let mut partial = buf.split_to(5);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);

        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Telegram::text("#S7?")));
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Telegram::text("#F")));
        assert!(partial.is_empty());
    }
}
