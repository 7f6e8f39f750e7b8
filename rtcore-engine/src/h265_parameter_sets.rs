//! H.265 parameter set and slice header id parsing
//!
//! Only the fields the depacketizer reports are decoded: ids, and for the
//! SPS the cropped picture size. Each parser takes the NAL payload after
//! the 2-byte header, still escaped.
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


use crate::h265_bitstream::RbspReader;
use crate::h265_nalu::NaluType;

/// Largest SPS id
pub const MAX_SPS_ID: u32 = 15;
/// Largest PPS id
pub const MAX_PPS_ID: u32 = 63;
/// Largest `sps_max_sub_layers_minus1`
const MAX_SUB_LAYERS_MINUS1: u32 = 6;

// profile_tier_level field sizes in bits
const GENERAL_PROFILE_BITS: usize = 88;
const GENERAL_LEVEL_BITS: usize = 8;
const SUB_LAYER_PROFILE_BITS: usize = 88;
const SUB_LAYER_LEVEL_BITS: usize = 8;

/// Video parameter set fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpsState {
    pub id: u32,
}

/// Sequence parameter set fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsState {
    pub vps_id: u32,
    pub id: u32,
    pub chroma_format_idc: u32,
    pub separate_colour_plane: bool,
    /// Cropped width
    pub width: u32,
    /// Cropped height
    pub height: u32,
}

/// Picture parameter set fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsState {
    pub id: u32,
    pub sps_id: u32,
}

pub fn parse_vps(data: &[u8]) -> Option<VpsState> {
    let mut reader = RbspReader::new(data);
    // vps_video_parameter_set_id
    let id = reader.read_bits(4)?;
    Some(VpsState { id })
}

pub fn parse_sps(data: &[u8]) -> Option<SpsState> {
    let mut reader = RbspReader::new(data);

    let vps_id = reader.read_bits(4)?;
    let max_sub_layers_minus1 = reader.read_bits(3)?;
    if max_sub_layers_minus1 > MAX_SUB_LAYERS_MINUS1 {
        return None;
    }
    // sps_temporal_id_nesting_flag
    reader.skip_bits(1)?;

    skip_profile_tier_level(&mut reader, max_sub_layers_minus1)?;

    let id = reader.read_ue()?;
    if id > MAX_SPS_ID {
        return None;
    }
    let chroma_format_idc = reader.read_ue()?;
    if chroma_format_idc > 3 {
        return None;
    }
    let separate_colour_plane = chroma_format_idc == 3 && reader.read_bit()?;

    let mut width = reader.read_ue()?;
    let mut height = reader.read_ue()?;

    // conformance_window_flag
    if reader.read_bit()? {
        let left = reader.read_ue()?;
        let right = reader.read_ue()?;
        let top = reader.read_ue()?;
        let bottom = reader.read_ue()?;

        let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
        let sub_width = if matches!(chroma_array_type, 1 | 2) { 2 } else { 1 };
        let sub_height = if chroma_array_type == 1 { 2 } else { 1 };

        let crop_x = left.checked_add(right)?.checked_mul(sub_width)?;
        let crop_y = top.checked_add(bottom)?.checked_mul(sub_height)?;
        width = width.checked_sub(crop_x)?;
        height = height.checked_sub(crop_y)?;
    }

    Some(SpsState {
        vps_id,
        id,
        chroma_format_idc,
        separate_colour_plane,
        width,
        height,
    })
}

fn skip_profile_tier_level(reader: &mut RbspReader, max_sub_layers_minus1: u32) -> Option<()> {
    reader.skip_bits(GENERAL_PROFILE_BITS + GENERAL_LEVEL_BITS)?;

    let sub_layers = max_sub_layers_minus1 as usize;
    let mut present = Vec::with_capacity(sub_layers);
    for _ in 0..sub_layers {
        let profile_present = reader.read_bit()?;
        let level_present = reader.read_bit()?;
        present.push((profile_present, level_present));
    }
    if sub_layers > 0 {
        // reserved_zero_2bits up to eight entries
        reader.skip_bits(2 * (8 - sub_layers))?;
    }
    for (profile_present, level_present) in present {
        if profile_present {
            reader.skip_bits(SUB_LAYER_PROFILE_BITS)?;
        }
        if level_present {
            reader.skip_bits(SUB_LAYER_LEVEL_BITS)?;
        }
    }
    Some(())
}

pub fn parse_pps(data: &[u8]) -> Option<PpsState> {
    let mut reader = RbspReader::new(data);
    let id = reader.read_ue()?;
    if id > MAX_PPS_ID {
        return None;
    }
    let sps_id = reader.read_ue()?;
    if sps_id > MAX_SPS_ID {
        return None;
    }
    Some(PpsState { id, sps_id })
}

/// `slice_pic_parameter_set_id` from a slice segment header
pub fn parse_slice_pps_id(data: &[u8], nal_type: u8) -> Option<u32> {
    let mut reader = RbspReader::new(data);
    // first_slice_segment_in_pic_flag
    reader.skip_bits(1)?;
    if NaluType::is_irap(nal_type) {
        // no_output_of_prior_pics_flag
        reader.skip_bits(1)?;
    }
    let pps_id = reader.read_ue()?;
    (pps_id <= MAX_PPS_ID).then_some(pps_id)
}
