//! Invariants checked over seeded random inputs

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rtcore_config::AllocatorConfig;
use rtcore_engine::delay_estimator::MAX_HISTOGRAM;
use rtcore_engine::h265_depacketizer::{PacketClass, MAX_NALUS_PER_PACKET};
use rtcore_engine::{
    BitrateAllocator, BitrateObserver, DelayEstimator, FuAssembler, H265Depacketizer,
    H265Packetizer, PacketizationType,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const ROUNDS: usize = 200;

fn random_nal(rng: &mut StdRng, len: usize) -> Vec<u8> {
    let nal_type: u8 = rng.gen_range(0..=40);
    let mut nal = vec![(nal_type << 1) | rng.gen_range(0..=1), rng.gen()];
    nal.extend((0..len - 2).map(|_| rng.gen::<u8>()));
    nal
}

#[test]
fn test_single_nal_payload_unchanged() {
    let mut rng = StdRng::seed_from_u64(7);
    let depacketizer = H265Depacketizer::default();

    for _ in 0..ROUNDS {
        let len = rng.gen_range(2..300);
        let input = Bytes::from(random_nal(&mut rng, len));
        let frame = depacketizer.parse_bytes(input.clone()).unwrap();
        assert_eq!(frame.packetization_type, PacketizationType::SingleNalu);
        assert_eq!(frame.payload, input);
    }
}

#[test]
fn test_aggregation_round_trip() {
    let mut rng = StdRng::seed_from_u64(11);
    let depacketizer = H265Depacketizer::default();

    for _ in 0..ROUNDS {
        let count = rng.gen_range(1..16);
        let nals: Vec<Vec<u8>> = (0..count)
            .map(|_| {
                let len = rng.gen_range(2..40);
                random_nal(&mut rng, len)
            })
            .collect();

        let mut ap = vec![0x60, 0x01];
        for nal in &nals {
            ap.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            ap.extend_from_slice(nal);
        }

        let frame = depacketizer.parse(&ap).unwrap();
        assert_eq!(frame.nalus_length(), count.min(MAX_NALUS_PER_PACKET));

        let PacketClass::Ap(slices) = PacketClass::classify(&frame.payload).unwrap() else {
            panic!("payload is no longer an aggregation packet");
        };
        assert_eq!(slices.len(), count);
        for (slice, nal) in slices.iter().zip(&nals) {
            assert_eq!(&frame.payload[slice.start..slice.end], &nal[..]);
        }
    }
}

#[test]
fn test_fragmentation_reassembles_original_nal() {
    let mut rng = StdRng::seed_from_u64(13);
    let depacketizer = H265Depacketizer::default();

    for _ in 0..ROUNDS {
        let max_payload = rng.gen_range(4..400);
        let packetizer = H265Packetizer::new(max_payload, 96, 1).unwrap();
        let len = rng.gen_range(max_payload + 1..max_payload * 8 + 2);
        let nal = Bytes::from(random_nal(&mut rng, len));

        let payloads = packetizer.payloads(&[nal.clone()]).unwrap();
        assert!(payloads.len() >= 2);

        let mut assembler = FuAssembler::new();
        let mut output = None;
        for (i, payload) in payloads.iter().enumerate() {
            assert!(payload.len() <= max_payload);
            let end_bit = payload[2] & 0x40 != 0;
            assert_eq!(end_bit, i + 1 == payloads.len());

            let frame = depacketizer.parse_bytes(payload.clone()).unwrap();
            assert_eq!(frame.packetization_type, PacketizationType::Fu);
            if let Some(nal) = assembler.push(&frame, end_bit).unwrap() {
                output = Some(nal);
            }
        }
        assert_eq!(output, Some(nal));
    }
}

#[test]
fn test_delay_estimate_bounded() {
    let mut rng = StdRng::seed_from_u64(17);

    for _ in 0..10 {
        let history_size = rng.gen_range(1..60);
        let mut estimator = DelayEstimator::new(65, history_size, rng.gen()).unwrap();

        for _ in 0..ROUNDS {
            let far: Vec<u16> = (0..65).map(|_| rng.gen_range(0..4000)).collect();
            let near: Vec<u16> = (0..65).map(|_| rng.gen_range(0..4000)).collect();
            let delay = estimator.estimate(&far, &near, rng.gen_range(0..=15), rng.gen_bool(0.9));

            assert!(delay >= 0);
            assert!((delay as usize) < history_size);
            assert!(estimator.last_delay() < history_size);
            assert!(estimator.histogram().iter().all(|&h| h <= MAX_HISTOGRAM));
        }
    }
}

#[derive(Default)]
struct Sink {
    bitrate: AtomicU32,
}

impl BitrateObserver for Sink {
    fn on_network_changed(&self, bitrate_bps: u32, _fraction_loss: u8, _rtt_ms: i64) {
        self.bitrate.store(bitrate_bps, Ordering::SeqCst);
    }
}

struct Registered {
    sink: Arc<Sink>,
    min: u32,
    max: u32,
}

fn register(rng: &mut StdRng, allocator: &BitrateAllocator, enforce: bool) -> Vec<Registered> {
    (0..rng.gen_range(1..7))
        .map(|id| {
            let min = rng.gen_range(0..300_000);
            let max = rng.gen_range(min..2_000_000);
            let sink = Arc::new(Sink::default());
            allocator.add_observer(id, sink.clone(), min, max, enforce, 0);
            Registered { sink, min, max }
        })
        .collect()
}

#[test]
fn test_allocation_conserved_and_bounded() {
    let mut rng = StdRng::seed_from_u64(19);

    for _ in 0..ROUNDS {
        let allocator = BitrateAllocator::new(&AllocatorConfig::default());
        let observers = register(&mut rng, &allocator, false);

        for _ in 0..5 {
            let target = rng.gen_range(0..3_000_000);
            allocator.on_network_changed(target, 0, 100);

            let mut total = 0u64;
            for observer in &observers {
                let awarded = observer.sink.bitrate.load(Ordering::SeqCst);
                assert!(
                    awarded == 0 || (observer.min..=observer.max).contains(&awarded),
                    "awarded {} outside [{}, {}]",
                    awarded,
                    observer.min,
                    observer.max
                );
                total += u64::from(awarded);
            }
            assert!(total <= u64::from(target));
        }
    }
}

#[test]
fn test_enforced_low_rate_awards_minimums() {
    let mut rng = StdRng::seed_from_u64(23);

    for _ in 0..ROUNDS {
        let allocator = BitrateAllocator::new(&AllocatorConfig::default());
        let observers = register(&mut rng, &allocator, true);
        let sum_min: u64 = observers.iter().map(|o| u64::from(o.min)).sum();

        let target = rng.gen_range(0..=sum_min) as u32;
        allocator.on_network_changed(target, 0, 100);

        let total: u64 = observers
            .iter()
            .map(|o| u64::from(o.sink.bitrate.load(Ordering::SeqCst)))
            .sum();
        assert_eq!(total, sum_min);
    }
}
