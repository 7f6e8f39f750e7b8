//! RFC 7798 - RTP Payload Format for H.265 Video (send side)
//!
//! Single NAL unit packets when a NAL fits, aggregation packets for runs of
//! small NAL units and fragmentation units for large ones.
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
use crate::h265_nalu::{
    FuHeader, NalHeader, NaluType, AP_LENGTH_FIELD_SIZE, FU_HEADER_SIZE, NAL_HEADER_SIZE,
};
use crate::rtp::{RtpHeader, RtpPacket};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

/// H.265 RTP packetizer for one stream
#[derive(Debug, Clone)]
pub struct H265Packetizer {
    /// Maximum RTP payload size
    max_payload_size: usize,
    payload_type: u8,
    ssrc: u32,
    /// Next sequence number
    sequence_number: u16,
}

impl H265Packetizer {
    pub fn new(max_payload_size: usize, payload_type: u8, ssrc: u32) -> CoreResult<Self> {
        // Room for the FU headers plus one byte of NAL data
        if max_payload_size <= NAL_HEADER_SIZE + FU_HEADER_SIZE {
            return Err(CoreError::ConfigInvalid(format!(
                "max_payload_size too small: {}",
                max_payload_size
            )));
        }
        Ok(H265Packetizer {
            max_payload_size,
            payload_type,
            ssrc,
            sequence_number: 0,
        })
    }

    /// Start numbering from `sequence_number`
    pub fn with_sequence_number(mut self, sequence_number: u16) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    /// Packetize one access unit; the last packet carries the marker bit
    pub fn packetize(&mut self, nalus: &[Bytes], timestamp: u32) -> CoreResult<Vec<RtpPacket>> {
        let payloads = self.payloads(nalus)?;
        let count = payloads.len();

        let packets = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let mut header =
                    RtpHeader::new(self.payload_type, self.sequence_number, timestamp, self.ssrc);
                header.marker = i + 1 == count;
                self.sequence_number = self.sequence_number.wrapping_add(1);
                RtpPacket { header, payload }
            })
            .collect();

        debug!(
            nalus = nalus.len(),
            packets = count,
            timestamp,
            "Packetized access unit"
        );
        Ok(packets)
    }

    /// RTP payloads for a sequence of NAL units, in order
    pub fn payloads(&self, nalus: &[Bytes]) -> CoreResult<Vec<Bytes>> {
        if let Some(short) = nalus.iter().find(|nal| nal.len() < NAL_HEADER_SIZE) {
            return Err(CoreError::ParseMalformed(format!(
                "NAL unit of {} bytes",
                short.len()
            )));
        }

        let mut payloads = Vec::with_capacity(nalus.len());
        let mut i = 0;
        while i < nalus.len() {
            let nal = &nalus[i];
            if nal.len() > self.max_payload_size {
                payloads.extend(self.fragment(nal));
                i += 1;
                continue;
            }

            let run = self.aggregation_run(&nalus[i..]);
            if run >= 2 {
                payloads.push(aggregate(&nalus[i..i + run]));
                i += run;
            } else {
                payloads.push(nal.clone());
                i += 1;
            }
        }
        Ok(payloads)
    }

    /// How many leading NAL units fit one aggregation packet
    fn aggregation_run(&self, nalus: &[Bytes]) -> usize {
        let mut size = NAL_HEADER_SIZE;
        nalus
            .iter()
            .take_while(|nal| {
                size += AP_LENGTH_FIELD_SIZE + nal.len();
                size <= self.max_payload_size
            })
            .count()
    }

    fn fragment(&self, nal: &Bytes) -> Vec<Bytes> {
        let chunk_size = self.max_payload_size - NAL_HEADER_SIZE - FU_HEADER_SIZE;
        let header = match NalHeader::parse(nal) {
            Some(header) => header,
            None => return Vec::new(),
        };
        let outer = header.with_type(NaluType::Fu.as_u8()).to_bytes();
        let body = &nal[NAL_HEADER_SIZE..];
        let count = (body.len() + chunk_size - 1) / chunk_size;

        body.chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let fu = FuHeader {
                    start: index == 0,
                    end: index + 1 == count,
                    nal_type: header.nal_type,
                };
                let mut payload =
                    BytesMut::with_capacity(NAL_HEADER_SIZE + FU_HEADER_SIZE + chunk.len());
                payload.put_slice(&outer);
                payload.put_u8(fu.to_byte());
                payload.put_slice(chunk);
                payload.freeze()
            })
            .collect()
    }
}

/// Aggregation packet; F is the OR and LayerId/TID the minimum of the parts
fn aggregate(nalus: &[Bytes]) -> Bytes {
    let headers: Vec<NalHeader> = nalus.iter().filter_map(|nal| NalHeader::parse(nal)).collect();
    let ap_header = NalHeader {
        forbidden_zero: headers.iter().any(|h| h.forbidden_zero),
        nal_type: NaluType::Ap.as_u8(),
        layer_id: headers.iter().map(|h| h.layer_id).min().unwrap_or(0),
        tid: headers.iter().map(|h| h.tid).min().unwrap_or(1),
    };

    let size = NAL_HEADER_SIZE
        + nalus
            .iter()
            .map(|nal| AP_LENGTH_FIELD_SIZE + nal.len())
            .sum::<usize>();
    let mut payload = BytesMut::with_capacity(size);
    payload.put_slice(&ap_header.to_bytes());
    for nal in nalus {
        payload.put_u16(nal.len() as u16);
        payload.put_slice(nal);
    }
    payload.freeze()
}
