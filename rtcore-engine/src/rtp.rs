//! RTP (Real-time Transport Protocol) packet handling
//!
//! RFC 3550 fixed header, CSRC list, one header extension block and
//! padding removal. Payloads are sliced out of the input `Bytes` without
//! copying.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{CoreError, CoreResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// RTP version carried in every packet
pub const RTP_VERSION: u8 = 2;

/// RTP header as defined in RFC 3550
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Contributing sources, at most 15
    pub csrc: Vec<u32>,
    pub extension: Option<HeaderExtension>,
}

/// RTP header extension block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    pub profile: u16,
    /// Extension body, a whole number of 32-bit words
    pub data: Bytes,
}

/// RTP packet with its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

fn parse_error(msg: impl Into<String>) -> CoreError {
    CoreError::RtpParse(msg.into())
}

impl RtpHeader {
    /// Fixed header size (12 bytes)
    pub const MIN_SIZE: usize = 12;

    /// Header with no CSRCs, extension or padding
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        RtpHeader {
            padding: false,
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
        }
    }

    /// Parse the header from the front of `buf`, advancing past it
    pub fn decode(buf: &mut Bytes) -> CoreResult<Self> {
        if buf.remaining() < Self::MIN_SIZE {
            return Err(parse_error(format!(
                "RTP header too short: {} bytes",
                buf.remaining()
            )));
        }

        // V(2) P(1) X(1) CC(4)
        let b0 = buf.get_u8();
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(parse_error(format!("Invalid RTP version: {}", version)));
        }
        let padding = b0 & 0x20 != 0;
        let has_extension = b0 & 0x10 != 0;
        let csrc_count = usize::from(b0 & 0x0F);

        // M(1) PT(7)
        let b1 = buf.get_u8();
        let marker = b1 & 0x80 != 0;
        let payload_type = b1 & 0x7F;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < csrc_count * 4 {
            return Err(parse_error("Incomplete CSRC list"));
        }
        let csrc = (0..csrc_count).map(|_| buf.get_u32()).collect();

        let extension = if has_extension {
            if buf.remaining() < 4 {
                return Err(parse_error("Incomplete extension header"));
            }
            let profile = buf.get_u16();
            let length = usize::from(buf.get_u16()) * 4;
            if buf.remaining() < length {
                return Err(parse_error("Incomplete extension data"));
            }
            Some(HeaderExtension {
                profile,
                data: buf.split_to(length),
            })
        } else {
            None
        };

        Ok(RtpHeader {
            padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
        })
    }

    /// Append the serialized header to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        let csrc_count = self.csrc.len().min(15);
        let mut b0 = (RTP_VERSION << 6) | csrc_count as u8;
        if self.padding {
            b0 |= 0x20;
        }
        if self.extension.is_some() {
            b0 |= 0x10;
        }
        buf.put_u8(b0);
        buf.put_u8((u8::from(self.marker) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for &csrc in &self.csrc[..csrc_count] {
            buf.put_u32(csrc);
        }

        if let Some(ext) = &self.extension {
            let words = (ext.data.len() + 3) / 4;
            buf.put_u16(ext.profile);
            buf.put_u16(words as u16);
            buf.put_slice(&ext.data);
            buf.put_bytes(0, words * 4 - ext.data.len());
        }
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        let ext = self
            .extension
            .as_ref()
            .map_or(0, |ext| 4 + (ext.data.len() + 3) / 4 * 4);
        Self::MIN_SIZE + self.csrc.len().min(15) * 4 + ext
    }
}

impl RtpPacket {
    /// Parse a packet, slicing the payload out of `data`
    pub fn parse(mut data: Bytes) -> CoreResult<Self> {
        let header = RtpHeader::decode(&mut data)?;

        if header.padding {
            let padding_len = match data.last() {
                Some(&len) => usize::from(len),
                None => return Err(parse_error("Padding flag set on empty payload")),
            };
            if padding_len == 0 || padding_len > data.len() {
                return Err(parse_error(format!(
                    "Invalid padding length: {}",
                    padding_len
                )));
            }
            data.truncate(data.len() - padding_len);
        }

        Ok(RtpPacket {
            header,
            payload: data,
        })
    }

    /// Serialize header and payload
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.size() + self.payload.len());
        let mut header = self.header.clone();
        // Padding is stripped on parse and never re-emitted
        header.padding = false;
        header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
