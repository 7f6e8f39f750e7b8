//! Real-time media core
//!
//! Three independent subsystems behind one runtime:
//! - Binary-spectrum echo delay estimation for acoustic echo control
//! - H.265 RTP depacketization (RFC 7798), FU reassembly and packetization
//! - Bitrate allocation across registered media senders
//!
//! [`CoreRuntime`] runs the audio and video paths as tokio tasks and
//! delivers their results as [`CoreEvent`]s.
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


pub mod error;
pub mod ring_buffer;
pub mod binary_spectrum;
pub mod delay_estimator;
pub mod rtp;
pub mod h265_nalu;
pub mod h265_bitstream;
pub mod h265_parameter_sets;
pub mod h265_depacketizer;
pub mod fu_assembler;
pub mod h265_packetizer;
pub mod bitrate_allocator;
pub mod runtime;

// Re-export main types
pub use error::{CoreError, CoreResult};
pub use ring_buffer::RingBuffer;
pub use delay_estimator::{quantize_spectrum, DelayEstimator, QuantizedSpectrum};
pub use rtp::{RtpHeader, RtpPacket};
pub use h265_nalu::{NalHeader, NaluType};
pub use h265_depacketizer::{
    FrameType, H265Depacketizer, NaluInfo, PacketizationType, ParsedFrame,
};
pub use fu_assembler::FuAssembler;
pub use h265_packetizer::H265Packetizer;
pub use bitrate_allocator::{BitrateAllocator, BitrateObserver, ObserverConfig, ObserverId};
pub use runtime::{AudioPipeline, CoreEvent, CoreRuntime, VideoPipeline};
pub use rtcore_config::CoreConfig;
