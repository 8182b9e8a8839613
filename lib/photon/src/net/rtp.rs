use crate::net::support::{ErrorType, Frame, PrimaryHandler, PrimaryOutcome, TransportResult};
use byteorder::{BigEndian, ByteOrder};

pub const RTP_HEADER_SIZE: usize = 12;

const RTP_VERSION: u8 = 2;
const CSRC_SIZE: usize = 4;
const EXTENSION_HEADER_SIZE: usize = 4;

/// Fixed RTP header fields (RFC 3550 §5.1).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn parse(data: &[u8]) -> TransportResult<RtpHeader> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(ErrorType::InvalidValue);
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(ErrorType::InvalidValue);
        }

        Ok(RtpHeader {
            version,
            padding: data[0] & 0x20 != 0,
            extension: data[0] & 0x10 != 0,
            csrc_count: data[0] & 0x0f,
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            sequence: BigEndian::read_u16(&data[2..4]),
            timestamp: BigEndian::read_u32(&data[4..8]),
            ssrc: BigEndian::read_u32(&data[8..12]),
        })
    }

    /// Offset of the payload within `data`: fixed header, CSRC list and the
    /// extension header when present.
    pub fn payload_offset(&self, data: &[u8]) -> TransportResult<usize> {
        let mut offset = RTP_HEADER_SIZE + self.csrc_count as usize * CSRC_SIZE;

        if self.extension {
            if data.len() < offset + EXTENSION_HEADER_SIZE {
                return Err(ErrorType::InvalidValue);
            }

            let words = BigEndian::read_u16(&data[offset + 2..offset + 4]) as usize;
            offset += EXTENSION_HEADER_SIZE + words * CSRC_SIZE;
        }

        if offset > data.len() {
            return Err(ErrorType::InvalidValue);
        }

        Ok(offset)
    }
}

/// Classifying primary handler: RTP datagrams become frames holding the
/// bare payload, with padding stripped. RTCP packet types are left for the
/// RTCP primary.
pub fn handler() -> PrimaryHandler {
    Box::new(move |data, flags| {
        if data.len() >= 2 && (200..=204).contains(&data[1]) {
            return Ok(PrimaryOutcome::NotHandled);
        }

        let header = match RtpHeader::parse(data) {
            Ok(header) => header,
            Err(_) => return Ok(PrimaryOutcome::NotHandled),
        };

        let offset = header.payload_offset(data)?;

        let mut end = data.len();
        if header.padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(ErrorType::InvalidValue);
            }
            end -= pad;
        }

        Ok(PrimaryOutcome::Modified(Frame::new(
            data[offset..end].to_vec(),
            flags,
        )))
    })
}
