//! H.265 NAL unit model
//!
//! NAL unit types, the 2-byte NAL unit header and the 1-byte FU header of
//! RFC 7798.
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


use serde::{Deserialize, Serialize};

/// NAL unit header size
pub const NAL_HEADER_SIZE: usize = 2;
/// FU header size
pub const FU_HEADER_SIZE: usize = 1;
/// AP per-NAL length prefix size
pub const AP_LENGTH_FIELD_SIZE: usize = 2;

/// H.265 NAL unit types used by the payload format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NaluType {
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    Cra = 21,
    Vps = 32,
    Sps = 33,
    Pps = 34,
    Aud = 35,
    Eos = 36,
    Eob = 37,
    Fd = 38,
    PrefixSei = 39,
    SuffixSei = 40,
    /// Aggregation packet (RFC 7798)
    Ap = 48,
    /// Fragmentation unit (RFC 7798)
    Fu = 49,
}

impl NaluType {
    /// Map a 6-bit type value; reserved and unspecified values give `None`
    pub fn from_u8(value: u8) -> Option<Self> {
        use NaluType::*;
        Some(match value {
            0 => TrailN,
            1 => TrailR,
            2 => TsaN,
            3 => TsaR,
            4 => StsaN,
            5 => StsaR,
            6 => RadlN,
            7 => RadlR,
            8 => RaslN,
            9 => RaslR,
            16 => BlaWLp,
            17 => BlaWRadl,
            18 => BlaNLp,
            19 => IdrWRadl,
            20 => IdrNLp,
            21 => Cra,
            32 => Vps,
            33 => Sps,
            34 => Pps,
            35 => Aud,
            36 => Eos,
            37 => Eob,
            38 => Fd,
            39 => PrefixSei,
            40 => SuffixSei,
            48 => Ap,
            49 => Fu,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// IDR and CRA pictures
    pub fn is_key_picture(self) -> bool {
        matches!(self, NaluType::IdrWRadl | NaluType::IdrNLp | NaluType::Cra)
    }

    /// Intra random access point, which carries `no_output_of_prior_pics_flag`
    pub fn is_irap(value: u8) -> bool {
        (16..=23).contains(&value)
    }

    /// Video coding layer types (slices)
    pub fn is_vcl(value: u8) -> bool {
        value < 32
    }
}

/// Read the type field from the first NAL header byte
pub fn nal_type(byte0: u8) -> u8 {
    (byte0 >> 1) & 0x3F
}

/// Decoded 2-byte NAL unit header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalHeader {
    pub forbidden_zero: bool,
    pub nal_type: u8,
    /// 6-bit layer id (`nuh_layer_id`)
    pub layer_id: u8,
    /// 3-bit temporal id plus one
    pub tid: u8,
}

impl NalHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let [b0, b1, ..] = *data else {
            return None;
        };
        Some(NalHeader {
            forbidden_zero: b0 & 0x80 != 0,
            nal_type: nal_type(b0),
            layer_id: ((b0 & 0x01) << 5) | (b1 >> 3),
            tid: b1 & 0x07,
        })
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [
            (u8::from(self.forbidden_zero) << 7)
                | ((self.nal_type & 0x3F) << 1)
                | ((self.layer_id >> 5) & 0x01),
            ((self.layer_id & 0x1F) << 3) | (self.tid & 0x07),
        ]
    }

    /// Same header with a different type
    pub fn with_type(self, nal_type: u8) -> Self {
        NalHeader { nal_type, ..self }
    }
}

/// FU header: `S | E | Type(6)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuHeader {
    pub start: bool,
    pub end: bool,
    pub nal_type: u8,
}

impl FuHeader {
    pub const START_BIT: u8 = 0x80;
    pub const END_BIT: u8 = 0x40;

    pub fn parse(byte: u8) -> Self {
        FuHeader {
            start: byte & Self::START_BIT != 0,
            end: byte & Self::END_BIT != 0,
            nal_type: byte & 0x3F,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = self.nal_type & 0x3F;
        if self.start {
            byte |= Self::START_BIT;
        }
        if self.end {
            byte |= Self::END_BIT;
        }
        byte
    }
}
