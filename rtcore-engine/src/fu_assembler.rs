//! Fragmentation unit reassembly
//!
//! Joins the per-packet FU slices produced by the depacketizer back into
//! complete NAL units for one stream.
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
use crate::h265_depacketizer::{PacketizationType, ParsedFrame};
use bytes::{Bytes, BytesMut};
use tracing::warn;

/// Partial NAL unit being reassembled
#[derive(Debug)]
struct PendingNalu {
    nalu_type: u8,
    data: BytesMut,
}

/// Default cap on a reassembled NAL unit
pub const DEFAULT_MAX_NAL_SIZE: usize = 4 * 1024 * 1024;

/// Per-stream FU reassembly buffer
#[derive(Debug)]
pub struct FuAssembler {
    pending: Option<PendingNalu>,
    max_nal_size: usize,
}

impl Default for FuAssembler {
    fn default() -> Self {
        Self::with_max_nal_size(DEFAULT_MAX_NAL_SIZE)
    }
}

impl FuAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assembler that gives up on NAL units larger than `max_nal_size` bytes
    pub fn with_max_nal_size(max_nal_size: usize) -> Self {
        FuAssembler {
            pending: None,
            max_nal_size,
        }
    }

    /// Whether a start fragment is waiting for its end
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed one depacketized FU packet.
    ///
    /// `end_bit` is the FU header E flag. Returns the complete NAL unit
    /// once the end fragment arrives. A continuation with no start, or one
    /// whose type differs from the start, drops the partial NAL and is an
    /// error, as is a partial NAL outgrowing the size cap. Non-FU frames
    /// abandon any partial NAL and yield nothing.
    pub fn push(&mut self, frame: &ParsedFrame, end_bit: bool) -> CoreResult<Option<Bytes>> {
        if frame.packetization_type != PacketizationType::Fu {
            if let Some(pending) = self.pending.take() {
                warn!(
                    nalu_type = pending.nalu_type,
                    bytes = pending.data.len(),
                    "Dropping incomplete FU NAL unit"
                );
            }
            return Ok(None);
        }

        if frame.is_first_packet_in_frame {
            if let Some(pending) = self.pending.take() {
                warn!(
                    nalu_type = pending.nalu_type,
                    bytes = pending.data.len(),
                    "FU start before previous end, dropping partial NAL unit"
                );
            }
            if frame.payload.len() > self.max_nal_size {
                return Err(CoreError::ParseMalformed(format!(
                    "FU start of {} bytes exceeds {}",
                    frame.payload.len(),
                    self.max_nal_size
                )));
            }
            let mut data = BytesMut::with_capacity((frame.payload.len() * 4).min(self.max_nal_size));
            data.extend_from_slice(&frame.payload);
            self.pending = Some(PendingNalu {
                nalu_type: frame.nalu_type,
                data,
            });
        } else {
            let Some(pending) = self.pending.as_mut() else {
                return Err(CoreError::ParseMalformed(
                    "FU continuation without start".to_string(),
                ));
            };
            if pending.nalu_type != frame.nalu_type {
                let expected = pending.nalu_type;
                self.pending = None;
                return Err(CoreError::ParseMalformed(format!(
                    "FU type changed from {} to {}",
                    expected, frame.nalu_type
                )));
            }
            if pending.data.len() + frame.payload.len() > self.max_nal_size {
                let size = pending.data.len() + frame.payload.len();
                warn!(
                    nalu_type = pending.nalu_type,
                    size,
                    max = self.max_nal_size,
                    "FU NAL unit too large, dropping partial NAL unit"
                );
                self.pending = None;
                return Err(CoreError::ParseMalformed(format!(
                    "FU NAL unit of {} bytes exceeds {}",
                    size, self.max_nal_size
                )));
            }
            pending.data.extend_from_slice(&frame.payload);
        }

        if end_bit {
            Ok(self.pending.take().map(|pending| pending.data.freeze()))
        } else {
            Ok(None)
        }
    }

    /// Drop any partial NAL unit
    pub fn reset(&mut self) {
        self.pending = None;
    }
}
