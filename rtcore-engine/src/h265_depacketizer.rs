//! RFC 7798 - RTP Payload Format for H.265 Video (receive side)
//!
//! Parses one RTP payload into a [`ParsedFrame`]: single NAL unit packets,
//! aggregation packets (AP) and fragmentation units (FU). Every call is
//! independent; joining FU fragments across packets is done by
//! [`FuAssembler`](crate::fu_assembler::FuAssembler).
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
    nal_type, FuHeader, NaluType, AP_LENGTH_FIELD_SIZE, FU_HEADER_SIZE, NAL_HEADER_SIZE,
};
use crate::h265_parameter_sets::{parse_pps, parse_slice_pps_id, parse_sps, parse_vps};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// NAL metadata entries kept per packet
pub const MAX_NALUS_PER_PACKET: usize = 10;

/// Default codec tag
pub const CODEC_TAG_H265: &str = "H265";

/// Frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameType {
    /// Contains IDR, CRA or SPS
    Key,
    Delta,
}

/// How the NAL units were carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PacketizationType {
    SingleNalu,
    Ap,
    Fu,
}

/// Metadata of one NAL unit; ids are -1 when unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NaluInfo {
    pub nalu_type: u8,
    pub vps_id: i32,
    pub sps_id: i32,
    pub pps_id: i32,
}

impl NaluInfo {
    pub fn new(nalu_type: u8) -> Self {
        NaluInfo {
            nalu_type,
            vps_id: -1,
            sps_id: -1,
            pps_id: -1,
        }
    }
}

/// Depacketizer output for one RTP payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub width: u32,
    pub height: u32,
    pub codec_tag: Arc<str>,
    pub frame_type: FrameType,
    pub is_first_packet_in_frame: bool,
    pub packetization_type: PacketizationType,
    /// Outer type for single NAL and AP (48), original type for FU
    pub nalu_type: u8,
    /// At most [`MAX_NALUS_PER_PACKET`] entries
    pub nalus: Vec<NaluInfo>,
    pub payload: Bytes,
}

impl ParsedFrame {
    pub fn nalus_length(&self) -> usize {
        self.nalus.len()
    }

    pub fn is_keyframe(&self) -> bool {
        self.frame_type == FrameType::Key
    }
}

/// Byte range of one NAL unit (header included) inside a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluSlice {
    pub start: usize,
    pub end: usize,
}

impl NaluSlice {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Payload structure decided from the first header bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketClass {
    SingleNalu,
    Ap(Vec<NaluSlice>),
    Fu {
        first: bool,
        end: bool,
        original_type: u8,
    },
}

fn malformed(msg: impl Into<String>) -> CoreError {
    CoreError::ParseMalformed(msg.into())
}

impl PacketClass {
    pub fn classify(payload: &[u8]) -> CoreResult<Self> {
        let Some(&byte0) = payload.first() else {
            return Err(malformed("empty payload"));
        };

        match NaluType::from_u8(nal_type(byte0)) {
            Some(NaluType::Fu) => {
                if payload.len() < NAL_HEADER_SIZE + FU_HEADER_SIZE {
                    return Err(malformed(format!("FU packet too short: {} bytes", payload.len())));
                }
                let fu = FuHeader::parse(payload[NAL_HEADER_SIZE]);
                Ok(PacketClass::Fu {
                    first: fu.start,
                    end: fu.end,
                    original_type: fu.nal_type,
                })
            }
            Some(NaluType::Ap) => ap_slices(payload).map(PacketClass::Ap),
            _ => Ok(PacketClass::SingleNalu),
        }
    }
}

/// Walk the `[u16 size][NAL]` tuples of an aggregation packet
fn ap_slices(payload: &[u8]) -> CoreResult<Vec<NaluSlice>> {
    if payload.len() < NAL_HEADER_SIZE + AP_LENGTH_FIELD_SIZE {
        return Err(malformed(format!("AP too short: {} bytes", payload.len())));
    }

    let mut slices = Vec::new();
    let mut pos = NAL_HEADER_SIZE;
    while pos < payload.len() {
        if payload.len() - pos < AP_LENGTH_FIELD_SIZE {
            return Err(malformed("truncated AP length field"));
        }
        let size = usize::from(u16::from_be_bytes([payload[pos], payload[pos + 1]]));
        pos += AP_LENGTH_FIELD_SIZE;

        let remaining = payload.len() - pos;
        if size > remaining {
            return Err(malformed(format!(
                "AP NAL size {} exceeds remaining {} bytes",
                size, remaining
            )));
        }
        slices.push(NaluSlice {
            start: pos,
            end: pos + size,
        });
        pos += size;
    }
    Ok(slices)
}

/// H.265 RTP depacketizer
#[derive(Debug, Clone)]
pub struct H265Depacketizer {
    codec_tag: Arc<str>,
}

impl Default for H265Depacketizer {
    fn default() -> Self {
        Self::new(CODEC_TAG_H265)
    }
}

impl H265Depacketizer {
    pub fn new(codec_tag: &str) -> Self {
        H265Depacketizer {
            codec_tag: Arc::from(codec_tag),
        }
    }

    /// Parse a borrowed payload; the result owns a copy of the bytes
    pub fn parse(&self, payload: &[u8]) -> CoreResult<ParsedFrame> {
        self.parse_bytes(Bytes::copy_from_slice(payload))
    }

    /// Parse an owned payload.
    ///
    /// Only a first FU fragment is copied, since its header is rewritten;
    /// every other result shares `payload`.
    pub fn parse_bytes(&self, payload: Bytes) -> CoreResult<ParsedFrame> {
        match PacketClass::classify(&payload)? {
            PacketClass::Fu {
                first,
                original_type,
                ..
            } => Ok(self.parse_fu(payload, first, original_type)),
            PacketClass::Ap(slices) => {
                self.parse_ap_or_single(payload, &slices, PacketizationType::Ap)
            }
            PacketClass::SingleNalu => {
                let whole = NaluSlice {
                    start: 0,
                    end: payload.len(),
                };
                self.parse_ap_or_single(payload, &[whole], PacketizationType::SingleNalu)
            }
        }
    }

    fn parse_ap_or_single(
        &self,
        payload: Bytes,
        slices: &[NaluSlice],
        packetization_type: PacketizationType,
    ) -> CoreResult<ParsedFrame> {
        let mut frame = ParsedFrame {
            width: 0,
            height: 0,
            codec_tag: Arc::clone(&self.codec_tag),
            frame_type: FrameType::Delta,
            is_first_packet_in_frame: true,
            packetization_type,
            nalu_type: nal_type(payload[0]),
            nalus: Vec::with_capacity(slices.len().min(MAX_NALUS_PER_PACKET)),
            payload: Bytes::new(),
        };
        let mut elided = 0usize;

        for slice in slices {
            if slice.len() < NAL_HEADER_SIZE {
                return Err(malformed(format!("NAL unit of {} bytes", slice.len())));
            }
            let nalu_type = nal_type(payload[slice.start]);
            let body = &payload[slice.start + NAL_HEADER_SIZE..slice.end];
            let mut info = NaluInfo::new(nalu_type);

            match NaluType::from_u8(nalu_type) {
                Some(NaluType::Vps) => match parse_vps(body) {
                    Some(vps) => info.vps_id = vps.id as i32,
                    None => warn!(nalu_type, "Failed to parse VPS"),
                },
                Some(NaluType::Sps) => {
                    match parse_sps(body) {
                        Some(sps) => {
                            frame.width = sps.width;
                            frame.height = sps.height;
                            info.sps_id = sps.id as i32;
                            info.vps_id = sps.vps_id as i32;
                        }
                        None => warn!(nalu_type, "Failed to parse SPS"),
                    }
                    frame.frame_type = FrameType::Key;
                }
                Some(NaluType::Pps) => match parse_pps(body) {
                    Some(pps) => {
                        info.pps_id = pps.id as i32;
                        info.sps_id = pps.sps_id as i32;
                    }
                    None => warn!(nalu_type, "Failed to parse PPS"),
                },
                Some(
                    kind @ (NaluType::IdrWRadl
                    | NaluType::IdrNLp
                    | NaluType::Cra
                    | NaluType::TrailN
                    | NaluType::TrailR),
                ) => {
                    if kind.is_key_picture() {
                        frame.frame_type = FrameType::Key;
                    }
                    match parse_slice_pps_id(body, nalu_type) {
                        Some(pps_id) => info.pps_id = pps_id as i32,
                        None => warn!(nalu_type, "Failed to parse slice header PPS id"),
                    }
                }
                Some(NaluType::Ap | NaluType::Fu) => {
                    return Err(malformed(format!(
                        "NAL type {} nested in aggregation packet",
                        nalu_type
                    )));
                }
                _ => {}
            }

            if frame.nalus.len() < MAX_NALUS_PER_PACKET {
                frame.nalus.push(info);
            } else {
                elided += 1;
            }
        }

        if elided > 0 {
            warn!(
                elided,
                max = MAX_NALUS_PER_PACKET,
                "Too many NAL units in packet, metadata elided"
            );
        }

        frame.payload = payload;
        Ok(frame)
    }

    fn parse_fu(&self, payload: Bytes, first_fragment: bool, original_type: u8) -> ParsedFrame {
        let frame_type = match NaluType::from_u8(original_type) {
            Some(kind) if kind.is_key_picture() => FrameType::Key,
            _ => FrameType::Delta,
        };

        let mut nalus = Vec::new();
        let emitted = if first_fragment {
            let mut info = NaluInfo::new(original_type);
            if NaluType::is_vcl(original_type) {
                match parse_slice_pps_id(&payload[NAL_HEADER_SIZE + FU_HEADER_SIZE..], original_type)
                {
                    Some(pps_id) => info.pps_id = pps_id as i32,
                    None => warn!(nalu_type = original_type, "Failed to parse FU slice header PPS id"),
                }
            }
            nalus.push(info);

            // F | Type | LayerIdH, then LayerIdL | TID from the outer header
            let mut rewritten = BytesMut::from(&payload[1..]);
            rewritten[0] = (payload[0] & 0x80) | (original_type << 1) | (payload[0] & 0x01);
            rewritten[1] = (payload[1] & 0xF8) | (payload[1] & 0x07);
            rewritten.freeze()
        } else {
            payload.slice(NAL_HEADER_SIZE + FU_HEADER_SIZE..)
        };

        ParsedFrame {
            width: 0,
            height: 0,
            codec_tag: Arc::clone(&self.codec_tag),
            frame_type,
            is_first_packet_in_frame: first_fragment,
            packetization_type: PacketizationType::Fu,
            nalu_type: original_type,
            nalus,
            payload: emitted,
        }
    }
}
