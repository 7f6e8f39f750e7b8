//! Core runtime
//!
//! Owns the three subsystems and routes inputs to outputs. The audio
//! pipeline (far-end buffering plus delay estimation) and the video
//! pipeline (RTP parsing, depacketization, FU reassembly) each run in their
//! own tokio task fed by a bounded channel. The bitrate allocator is shared
//! and driven synchronously from the caller's bandwidth-estimation thread.
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


use crate::bitrate_allocator::BitrateAllocator;
use crate::delay_estimator::{DelayEstimator, MAX_FAR_Q};
use crate::error::{CoreError, CoreResult};
use crate::fu_assembler::FuAssembler;
use crate::h265_depacketizer::{H265Depacketizer, PacketizationType, ParsedFrame};
use crate::h265_nalu::{FuHeader, NAL_HEADER_SIZE};
use crate::ring_buffer::RingBuffer;
use crate::rtp::RtpPacket;
use bytes::Bytes;
use rtcore_config::{CoreConfig, DelayConfig, DepacketizerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Runtime output
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// Delay estimate for one near-end block
    Delay { delay_blocks: i32, at: Instant },
    /// One depacketized RTP payload
    Frame {
        ssrc: u32,
        sequence_number: u16,
        rtp_timestamp: u32,
        marker: bool,
        frame: ParsedFrame,
    },
    /// NAL unit completed from FU fragments
    Nal {
        ssrc: u32,
        rtp_timestamp: u32,
        nal: Bytes,
    },
    /// Packet dropped; `ssrc` is unknown if the RTP header was unreadable
    Dropped {
        ssrc: Option<u32>,
        reason: CoreError,
    },
}

/// Far-end buffering in front of the delay estimator
pub struct AudioPipeline {
    estimator: DelayEstimator,
    far_spectra: RingBuffer<u16>,
    far_q: RingBuffer<i32>,
    far_block: Vec<u16>,
    /// A far block has been read at least once
    primed: bool,
}

impl AudioPipeline {
    pub fn new(config: &DelayConfig) -> CoreResult<Self> {
        let estimator = DelayEstimator::new(
            config.spectrum_size,
            config.history_size,
            config.enable_alignment,
        )?;
        Ok(AudioPipeline {
            estimator,
            far_spectra: RingBuffer::new(config.spectrum_size * config.far_buffer_blocks)?,
            far_q: RingBuffer::new(config.far_buffer_blocks)?,
            far_block: vec![0; config.spectrum_size],
            primed: false,
        })
    }

    fn check_size(&self, spectrum: &[u16]) -> CoreResult<()> {
        let expected = self.estimator.spectrum_size();
        if spectrum.len() != expected {
            return Err(CoreError::SizeMismatch {
                expected,
                actual: spectrum.len(),
            });
        }
        Ok(())
    }

    /// Queue one far-end block, flushing the oldest if the buffer is full
    pub fn push_far(&mut self, spectrum: &[u16], far_q: i32) -> CoreResult<()> {
        self.check_size(spectrum)?;
        if !(0..=MAX_FAR_Q).contains(&far_q) {
            return Err(CoreError::QDomainOutOfRange(far_q));
        }

        let block = spectrum.len();
        if self.far_spectra.available_write() < block {
            self.far_spectra.move_read(block as isize)?;
            self.far_q.move_read(1)?;
            debug!("Far-end buffer full, flushed oldest block");
        }
        self.far_spectra.write(spectrum)?;
        self.far_q.write(&[far_q])?;
        Ok(())
    }

    /// Pair a near-end block with the next far-end block and estimate.
    ///
    /// On underrun the last far block is reused. Returns `None` until any
    /// far-end audio has arrived.
    pub fn process_near(&mut self, spectrum: &[u16], vad_active: bool) -> CoreResult<Option<i32>> {
        self.check_size(spectrum)?;

        let block = spectrum.len();
        if self.far_spectra.available_read() < block {
            if !self.primed {
                return Ok(None);
            }
            self.far_spectra.move_read(-(block as isize))?;
            self.far_q.move_read(-1)?;
            trace!("Far-end underrun, reusing last block");
        }

        self.far_spectra.read(&mut self.far_block)?;
        let mut far_q = [0i32];
        self.far_q.read(&mut far_q)?;
        self.primed = true;

        self.estimator
            .try_estimate(&self.far_block, spectrum, far_q[0], vad_active)
            .map(Some)
    }

    pub fn estimator(&self) -> &DelayEstimator {
        &self.estimator
    }

    /// Far-end blocks waiting for a near-end partner
    pub fn buffered_blocks(&self) -> usize {
        self.far_q.available_read()
    }
}

/// Unfinished FU NAL unit of one SSRC
struct FuStream {
    assembler: FuAssembler,
    /// Packet counter value when last fed
    last_fed: u64,
}

/// RTP ingress for the H.265 stream
pub struct VideoPipeline {
    depacketizer: H265Depacketizer,
    payload_type: u8,
    max_nal_size: usize,
    max_fu_streams: usize,
    /// Only SSRCs with an unfinished FU NAL unit, at most `max_fu_streams`
    fu_streams: HashMap<u32, FuStream>,
    packets: u64,
}

impl VideoPipeline {
    pub fn new(config: &DepacketizerConfig) -> Self {
        VideoPipeline {
            depacketizer: H265Depacketizer::new(&config.codec_tag),
            payload_type: config.payload_type,
            max_nal_size: config.max_nal_size,
            max_fu_streams: config.max_fu_streams,
            fu_streams: HashMap::new(),
            packets: 0,
        }
    }

    /// Parse one RTP packet into zero or more events
    pub fn handle_packet(&mut self, data: Bytes) -> Vec<CoreEvent> {
        let packet = match RtpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "Dropping unparsable RTP packet");
                return vec![CoreEvent::Dropped {
                    ssrc: None,
                    reason: e,
                }];
            }
        };

        let header = packet.header;
        let ssrc = header.ssrc;
        if header.payload_type != self.payload_type {
            trace!(ssrc, payload_type = header.payload_type, "Ignoring non-H.265 payload type");
            return Vec::new();
        }

        let end_bit = packet
            .payload
            .get(NAL_HEADER_SIZE)
            .map_or(false, |&byte| FuHeader::parse(byte).end);

        let frame = match self.depacketizer.parse_bytes(packet.payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(
                    ssrc,
                    sequence_number = header.sequence_number,
                    error = %e,
                    "Dropping malformed H.265 payload"
                );
                return vec![CoreEvent::Dropped {
                    ssrc: Some(ssrc),
                    reason: e,
                }];
            }
        };

        self.packets += 1;
        let assembled = if frame.packetization_type == PacketizationType::Fu {
            self.push_fragment(ssrc, &frame, end_bit)
        } else {
            // Abandons any unfinished NAL unit of this SSRC
            match self.fu_streams.remove(&ssrc) {
                Some(mut stream) => stream.assembler.push(&frame, end_bit),
                None => Ok(None),
            }
        };

        let mut events = Vec::with_capacity(2);
        events.push(CoreEvent::Frame {
            ssrc,
            sequence_number: header.sequence_number,
            rtp_timestamp: header.timestamp,
            marker: header.marker,
            frame,
        });
        match assembled {
            Ok(Some(nal)) => events.push(CoreEvent::Nal {
                ssrc,
                rtp_timestamp: header.timestamp,
                nal,
            }),
            Ok(None) => {}
            Err(e) => {
                debug!(ssrc, error = %e, "FU reassembly failed");
                events.push(CoreEvent::Dropped {
                    ssrc: Some(ssrc),
                    reason: e,
                });
            }
        }
        events
    }

    fn push_fragment(
        &mut self,
        ssrc: u32,
        frame: &ParsedFrame,
        end_bit: bool,
    ) -> CoreResult<Option<Bytes>> {
        if !self.fu_streams.contains_key(&ssrc) {
            if !frame.is_first_packet_in_frame {
                return Err(CoreError::ParseMalformed(
                    "FU continuation without start".to_string(),
                ));
            }
            if self.fu_streams.len() >= self.max_fu_streams {
                self.evict_stalest();
            }
        }

        let (packets, max_nal_size) = (self.packets, self.max_nal_size);
        let stream = self.fu_streams.entry(ssrc).or_insert_with(|| FuStream {
            assembler: FuAssembler::with_max_nal_size(max_nal_size),
            last_fed: packets,
        });
        stream.last_fed = packets;
        let result = stream.assembler.push(frame, end_bit);
        if !stream.assembler.is_pending() {
            self.fu_streams.remove(&ssrc);
        }
        result
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .fu_streams
            .iter()
            .min_by_key(|(_, stream)| stream.last_fed)
            .map(|(&ssrc, _)| ssrc);
        if let Some(ssrc) = stalest {
            self.fu_streams.remove(&ssrc);
            warn!(
                ssrc,
                max_streams = self.max_fu_streams,
                "Too many FU streams, dropping stalest partial NAL unit"
            );
        }
    }

    /// Streams with an unfinished FU NAL unit
    pub fn stream_count(&self) -> usize {
        self.fu_streams.len()
    }
}

enum AudioInput {
    Far { spectrum: Vec<u16>, far_q: i32 },
    Near { spectrum: Vec<u16>, vad: bool },
}

/// Running core: pipeline tasks plus the shared allocator
pub struct CoreRuntime {
    audio_tx: mpsc::Sender<AudioInput>,
    rtp_tx: mpsc::Sender<Bytes>,
    events: mpsc::Receiver<CoreEvent>,
    allocator: Arc<BitrateAllocator>,
    audio_task: JoinHandle<()>,
    video_task: JoinHandle<()>,
}

impl CoreRuntime {
    /// Validate `config` and spawn the pipelines on the current tokio runtime.
    ///
    /// Events are delivered through a bounded channel; a consumer that stops
    /// reading eventually back-pressures the inputs.
    pub fn start(config: CoreConfig) -> CoreResult<Self> {
        config.validate()?;

        let audio = AudioPipeline::new(&config.delay)?;
        let video = VideoPipeline::new(&config.depacketizer);
        let allocator = Arc::new(BitrateAllocator::new(&config.allocator));

        let capacity = config.runtime.channel_capacity;
        let (audio_tx, audio_rx) = mpsc::channel(capacity);
        let (rtp_tx, rtp_rx) = mpsc::channel(capacity);
        let (event_tx, events) = mpsc::channel(capacity);

        let audio_task = tokio::spawn(run_audio(audio, audio_rx, event_tx.clone()));
        let video_task = tokio::spawn(run_video(video, rtp_rx, event_tx));

        info!(
            spectrum_size = config.delay.spectrum_size,
            history_size = config.delay.history_size,
            payload_type = config.depacketizer.payload_type,
            channel_capacity = capacity,
            "Core runtime started"
        );

        Ok(CoreRuntime {
            audio_tx,
            rtp_tx,
            events,
            allocator,
            audio_task,
            video_task,
        })
    }

    pub async fn push_far_spectrum(&self, spectrum: Vec<u16>, far_q: i32) -> CoreResult<()> {
        self.audio_tx
            .send(AudioInput::Far { spectrum, far_q })
            .await
            .map_err(|_| CoreError::ChannelClosed("audio"))
    }

    pub async fn push_near_spectrum(&self, spectrum: Vec<u16>, vad: bool) -> CoreResult<()> {
        self.audio_tx
            .send(AudioInput::Near { spectrum, vad })
            .await
            .map_err(|_| CoreError::ChannelClosed("audio"))
    }

    pub async fn push_rtp(&self, packet: Bytes) -> CoreResult<()> {
        self.rtp_tx
            .send(packet)
            .await
            .map_err(|_| CoreError::ChannelClosed("rtp"))
    }

    /// Next output event; `None` once both pipelines have stopped
    pub async fn next_event(&mut self) -> Option<CoreEvent> {
        self.events.recv().await
    }

    /// Output event if one is ready
    pub fn try_next_event(&mut self) -> Option<CoreEvent> {
        self.events.try_recv().ok()
    }

    /// Bandwidth estimate update, applied synchronously
    pub fn on_network_changed(&self, target_bps: u32, fraction_loss: u8, rtt_ms: i64) {
        self.allocator
            .on_network_changed(target_bps, fraction_loss, rtt_ms);
    }

    pub fn allocator(&self) -> Arc<BitrateAllocator> {
        Arc::clone(&self.allocator)
    }

    /// Close the inputs and wait for both pipelines to finish.
    ///
    /// Undelivered events are discarded.
    pub async fn shutdown(self) {
        let CoreRuntime {
            audio_tx,
            rtp_tx,
            events,
            audio_task,
            video_task,
            ..
        } = self;
        drop(audio_tx);
        drop(rtp_tx);
        // Unblocks a pipeline waiting on a full event channel
        drop(events);

        for (name, task) in [("audio", audio_task), ("video", video_task)] {
            if let Err(e) = task.await {
                warn!(pipeline = name, error = %e, "Pipeline task failed");
            }
        }
        info!("Core runtime stopped");
    }
}

async fn run_audio(
    mut pipeline: AudioPipeline,
    mut inputs: mpsc::Receiver<AudioInput>,
    events: mpsc::Sender<CoreEvent>,
) {
    while let Some(input) = inputs.recv().await {
        match input {
            AudioInput::Far { spectrum, far_q } => {
                if let Err(e) = pipeline.push_far(&spectrum, far_q) {
                    debug!(error = %e, "Rejected far-end block");
                }
            }
            AudioInput::Near { spectrum, vad } => match pipeline.process_near(&spectrum, vad) {
                Ok(Some(delay_blocks)) => {
                    let event = CoreEvent::Delay {
                        delay_blocks,
                        at: Instant::now(),
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => trace!("No far-end audio yet"),
                Err(e) => debug!(error = %e, "Rejected near-end block"),
            },
        }
    }
    debug!("Audio pipeline stopped");
}

async fn run_video(
    mut pipeline: VideoPipeline,
    mut inputs: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<CoreEvent>,
) {
    'packets: while let Some(packet) = inputs.recv().await {
        for event in pipeline.handle_packet(packet) {
            if events.send(event).await.is_err() {
                break 'packets;
            }
        }
    }
    debug!(streams = pipeline.stream_count(), "Video pipeline stopped");
}
