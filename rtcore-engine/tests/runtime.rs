//! Core runtime end to end

use bytes::Bytes;
use rtcore_config::CoreConfig;
use rtcore_engine::bitrate_allocator::BitrateObserver;
use rtcore_engine::{CoreEvent, CoreRuntime, FrameType, H265Packetizer, PacketizationType};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_test::assert_ok;

fn nal(nal_type: u8, len: usize) -> Bytes {
    let mut data = vec![nal_type << 1, 0x01];
    data.extend((0..len - 2).map(|i| (i * 7 % 251) as u8 | 0x01));
    Bytes::from(data)
}

async fn next(runtime: &mut CoreRuntime) -> CoreEvent {
    timeout(Duration::from_secs(5), runtime.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_runtime_start_rejects_invalid_config() {
    let mut config = CoreConfig::default();
    config.delay.spectrum_size = 40;
    assert!(CoreRuntime::start(config).is_err());
}

#[tokio::test]
async fn test_runtime_routes_audio_and_video() {
    rtcore_logging::init_console_logging("rtcore-engine-test", "warn");
    let mut runtime = CoreRuntime::start(CoreConfig::default()).unwrap();

    // No far-end audio yet, so no estimate
    assert_ok!(runtime.push_near_spectrum(vec![100; 65], true).await);
    assert_ok!(runtime.push_far_spectrum(vec![100; 65], 0).await);
    for _ in 0..3 {
        assert_ok!(runtime.push_near_spectrum(vec![100; 65], true).await);
    }

    let access_unit = vec![nal(32, 20), nal(33, 30), nal(34, 8), nal(19, 5000)];
    let mut packetizer = H265Packetizer::new(1200, 96, 0xCAFE).unwrap();
    let packets = packetizer.packetize(&access_unit, 90_000).unwrap();
    assert_eq!(packets.len(), 6);
    for packet in &packets {
        assert_ok!(runtime.push_rtp(packet.serialize()).await);
    }
    assert_ok!(runtime.push_rtp(Bytes::from_static(&[0x80])).await);

    let mut delays = Vec::new();
    let mut frames = Vec::new();
    let mut nals = Vec::new();
    let mut dropped = 0;
    while delays.len() < 3 || frames.len() < 6 || nals.is_empty() || dropped == 0 {
        match next(&mut runtime).await {
            CoreEvent::Delay { delay_blocks, .. } => delays.push(delay_blocks),
            CoreEvent::Frame { ssrc, frame, .. } => {
                assert_eq!(ssrc, 0xCAFE);
                frames.push(frame);
            }
            CoreEvent::Nal { ssrc, rtp_timestamp, nal } => {
                assert_eq!(ssrc, 0xCAFE);
                assert_eq!(rtp_timestamp, 90_000);
                nals.push(nal);
            }
            CoreEvent::Dropped { ssrc, .. } => {
                assert_eq!(ssrc, None);
                dropped += 1;
            }
        }
    }

    assert_eq!(delays, vec![0, 0, 0]);
    assert_eq!(frames[0].packetization_type, PacketizationType::Ap);
    assert_eq!(frames[0].nalus_length(), 3);
    assert_eq!(frames[0].frame_type, FrameType::Key);
    assert!(frames[1..].iter().all(|f| f.packetization_type == PacketizationType::Fu));
    assert_eq!(nals, vec![access_unit[3].clone()]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_runtime_drives_allocator() {
    #[derive(Default)]
    struct Encoder {
        bitrate: AtomicU32,
    }
    impl BitrateObserver for Encoder {
        fn on_network_changed(&self, bitrate_bps: u32, _fraction_loss: u8, _rtt_ms: i64) {
            self.bitrate.store(bitrate_bps, Ordering::SeqCst);
        }
    }

    let runtime = CoreRuntime::start(CoreConfig::default()).unwrap();
    let audio = Arc::new(Encoder::default());
    let video = Arc::new(Encoder::default());
    let allocator = runtime.allocator();
    allocator.add_observer(1, audio.clone(), 30_000, 64_000, true, 32_000);
    allocator.add_observer(2, video.clone(), 150_000, 2_500_000, false, 300_000);

    runtime.on_network_changed(1_000_000, 5, 40);
    assert_eq!(audio.bitrate.load(Ordering::SeqCst), 64_000);
    assert_eq!(video.bitrate.load(Ordering::SeqCst), 936_000);
    assert_eq!(allocator.network_state().map(|n| n.target_bps), Some(1_000_000));

    runtime.shutdown().await;
}
