//! Echo-path delay estimation
//!
//! Fixed-point binary-spectrum estimator recovering the far-end to near-end
//! delay, in blocks, used to align the echo canceller's reference signal.
//! Each far-end block is binarized against its running mean and kept in a
//! history of `history_size` words. Each near-end block is binarized the
//! same way and compared against every history slot; the lag whose smoothed
//! bit-count is lowest votes into a histogram, and the histogram peak is the
//! reported delay.
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


use crate::binary_spectrum::{
    bit_count, mean_estimator, MeanSpectrum, BAND_LAST, BIT_COUNT_MEAN_FACTOR,
};
use crate::error::{CoreError, CoreResult};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Consecutive active frames required before the histogram is updated
pub const VAD_COUNT_THRESHOLD: u32 = 25;
/// Histogram bin ceiling
pub const MAX_HISTOGRAM: u16 = 600;
/// Histogram increment at the current bit-count minimum
pub const HISTOGRAM_INCREMENT: u16 = 3;
/// Largest accepted far-end Q-domain
pub const MAX_FAR_Q: i32 = 15;
/// Q-domain of the smoothed bit counts
pub const BIT_COUNT_Q: u32 = 9;

/// Far-end spectra kept for aligned read-back
#[derive(Debug, Clone)]
struct FarHistory {
    spectra: Vec<u16>,
    q_domains: Vec<i32>,
    /// Slot written by the latest `estimate` call
    position: usize,
}

impl FarHistory {
    fn new(spectrum_size: usize, history_size: usize) -> Self {
        FarHistory {
            spectra: vec![0; spectrum_size * history_size],
            q_domains: vec![0; history_size],
            // The first write wraps to slot 0
            position: history_size - 1,
        }
    }

    fn push(&mut self, spectrum: &[u16], far_q: i32) {
        let history_size = self.q_domains.len();
        self.position = (self.position + 1) % history_size;
        let start = self.position * spectrum.len();
        self.spectra[start..start + spectrum.len()].copy_from_slice(spectrum);
        self.q_domains[self.position] = far_q;
    }

    fn slot(&self, index: usize, spectrum_size: usize) -> (&[u16], i32) {
        let start = index * spectrum_size;
        (
            &self.spectra[start..start + spectrum_size],
            self.q_domains[index],
        )
    }

    fn reset(&mut self) {
        let history_size = self.q_domains.len();
        self.spectra.iter_mut().for_each(|v| *v = 0);
        self.q_domains.iter_mut().for_each(|q| *q = 0);
        self.position = history_size - 1;
    }
}

/// Binary-spectrum delay estimator
#[derive(Debug, Clone)]
pub struct DelayEstimator {
    spectrum_size: usize,
    history_size: usize,
    far_mean: MeanSpectrum,
    near_mean: MeanSpectrum,
    /// Newest first
    binary_far_history: VecDeque<u32>,
    /// Q9 smoothed bit counts per candidate lag
    mean_bit_counts: Vec<i32>,
    histogram: Vec<u16>,
    vad_counter: u32,
    last_delay: usize,
    far_history: Option<FarHistory>,
}

impl DelayEstimator {
    /// Create an estimator for spectra of `spectrum_size` bins and delays
    /// below `history_size` blocks.
    pub fn new(
        spectrum_size: usize,
        history_size: usize,
        enable_alignment: bool,
    ) -> CoreResult<Self> {
        if spectrum_size <= BAND_LAST {
            return Err(CoreError::ConfigInvalid(format!(
                "spectrum_size must exceed {}, got {}",
                BAND_LAST, spectrum_size
            )));
        }
        if history_size == 0 {
            return Err(CoreError::ConfigInvalid(
                "history_size must be positive".to_string(),
            ));
        }

        debug!(
            spectrum_size,
            history_size, enable_alignment, "Creating delay estimator"
        );

        Ok(DelayEstimator {
            spectrum_size,
            history_size,
            far_mean: MeanSpectrum::new(spectrum_size),
            near_mean: MeanSpectrum::new(spectrum_size),
            binary_far_history: VecDeque::from(vec![0u32; history_size]),
            mean_bit_counts: vec![0; history_size],
            histogram: vec![0; history_size],
            vad_counter: 0,
            last_delay: 0,
            far_history: enable_alignment.then(|| FarHistory::new(spectrum_size, history_size)),
        })
    }

    /// Process one block pair and return the delay in blocks, or `-1` if
    /// the inputs are rejected. A rejected call leaves all state unchanged.
    pub fn estimate(
        &mut self,
        far_spectrum: &[u16],
        near_spectrum: &[u16],
        far_q: i32,
        vad_active: bool,
    ) -> i32 {
        match self.try_estimate(far_spectrum, near_spectrum, far_q, vad_active) {
            Ok(delay) => delay,
            Err(e) => {
                debug!(error = %e, "Delay estimate rejected");
                -1
            }
        }
    }

    /// Fallible form of [`estimate`](Self::estimate)
    pub fn try_estimate(
        &mut self,
        far_spectrum: &[u16],
        near_spectrum: &[u16],
        far_q: i32,
        vad_active: bool,
    ) -> CoreResult<i32> {
        self.check_spectrum(far_spectrum)?;
        self.check_spectrum(near_spectrum)?;
        if !(0..=MAX_FAR_Q).contains(&far_q) {
            return Err(CoreError::QDomainOutOfRange(far_q));
        }

        if let Some(history) = self.far_history.as_mut() {
            history.push(far_spectrum, far_q);
        }

        self.far_mean.update(far_spectrum);
        self.near_mean.update(near_spectrum);

        let binary_far = self.far_mean.binarize(far_spectrum);
        let binary_near = self.near_mean.binarize(near_spectrum);
        self.binary_far_history.pop_back();
        self.binary_far_history.push_front(binary_far);

        for (binary_history, mean) in self
            .binary_far_history
            .iter()
            .zip(self.mean_bit_counts.iter_mut())
        {
            let count = bit_count(binary_near, *binary_history);
            debug_assert!(count <= 32);
            // At most 32 << 9, well inside i32
            let scaled = (count << BIT_COUNT_Q) as i32;
            mean_estimator(scaled, BIT_COUNT_MEAN_FACTOR, mean);
        }

        let min_position = self.min_bit_count_position();

        if vad_active {
            if self.vad_counter >= VAD_COUNT_THRESHOLD {
                self.update_histogram(min_position);
            } else {
                self.vad_counter += 1;
            }
        } else {
            self.vad_counter = 0;
        }

        trace!(
            delay_blocks = self.last_delay,
            min_position,
            vad_counter = self.vad_counter,
            "Delay estimate"
        );

        Ok(self.last_delay as i32)
    }

    fn check_spectrum(&self, spectrum: &[u16]) -> CoreResult<()> {
        if spectrum.len() != self.spectrum_size {
            return Err(CoreError::SizeMismatch {
                expected: self.spectrum_size,
                actual: spectrum.len(),
            });
        }
        Ok(())
    }

    /// Lowest index wins on ties
    fn min_bit_count_position(&self) -> usize {
        let mut min_position = 0;
        let mut min_value = i32::MAX;
        for (i, &value) in self.mean_bit_counts.iter().enumerate() {
            if value < min_value {
                min_value = value;
                min_position = i;
            }
        }
        min_position
    }

    fn update_histogram(&mut self, min_position: usize) {
        let bin = &mut self.histogram[min_position];
        *bin = (*bin + HISTOGRAM_INCREMENT).min(MAX_HISTOGRAM);

        // Decay every bin and pick the largest survivor, earliest lag first
        let mut max_value = 0;
        self.last_delay = 0;
        for (i, bin) in self.histogram.iter_mut().enumerate() {
            *bin = bin.saturating_sub(1);
            if *bin > max_value {
                max_value = *bin;
                self.last_delay = i;
            }
        }
    }

    /// Far-end spectrum and Q-domain that line up with the current near end.
    ///
    /// The returned view is valid until the next `estimate` call.
    pub fn aligned_farend(&self) -> CoreResult<(&[u16], i32)> {
        let history = self
            .far_history
            .as_ref()
            .ok_or(CoreError::DelayUnavailable)?;
        let index =
            (history.position + self.history_size - self.last_delay) % self.history_size;
        Ok(history.slot(index, self.spectrum_size))
    }

    /// Zero all histories, means and counters
    pub fn reset(&mut self) {
        self.far_mean.reset();
        self.near_mean.reset();
        self.binary_far_history.iter_mut().for_each(|b| *b = 0);
        self.mean_bit_counts.iter_mut().for_each(|m| *m = 0);
        self.histogram.iter_mut().for_each(|h| *h = 0);
        self.vad_counter = 0;
        self.last_delay = 0;
        if let Some(history) = self.far_history.as_mut() {
            history.reset();
        }
        debug!("Delay estimator reset");
    }

    /// Currently reported delay in blocks
    pub fn last_delay(&self) -> usize {
        self.last_delay
    }

    pub fn histogram(&self) -> &[u16] {
        &self.histogram
    }

    pub fn vad_counter(&self) -> u32 {
        self.vad_counter
    }

    pub fn history_size(&self) -> usize {
        self.history_size
    }

    pub fn spectrum_size(&self) -> usize {
        self.spectrum_size
    }

    pub fn alignment_enabled(&self) -> bool {
        self.far_history.is_some()
    }

    /// Quantize float spectra and estimate.
    ///
    /// Far and near are scaled independently; the far Q-domain is passed on.
    pub fn estimate_float(
        &mut self,
        far_spectrum: &[f32],
        near_spectrum: &[f32],
        fft_size: usize,
        vad_active: bool,
    ) -> CoreResult<i32> {
        let far = quantize_spectrum(far_spectrum, fft_size)?;
        let near = quantize_spectrum(near_spectrum, fft_size)?;
        self.try_estimate(&far.values, &near.values, far.q_domain, vad_active)
    }
}

/// Fixed-point spectrum with its Q-domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizedSpectrum {
    pub values: Vec<u16>,
    pub q_domain: i32,
}

/// Convert a float magnitude spectrum to `u16` with a power-of-two scale.
///
/// The scale is `2^s / fft_size` with `s = 14 - floor(log2(max / fft_size + 1))`.
pub fn quantize_spectrum(spectrum: &[f32], fft_size: usize) -> CoreResult<QuantizedSpectrum> {
    if fft_size == 0 {
        return Err(CoreError::ConfigInvalid(
            "fft_size must be positive".to_string(),
        ));
    }

    let fft = fft_size as f32;
    let max_value = spectrum.iter().copied().fold(0.0f32, f32::max);
    let scaling_log = 14 - (max_value / fft + 1.0).log2().floor() as i32;
    if !(0..16).contains(&scaling_log) {
        return Err(CoreError::ConfigInvalid(format!(
            "spectrum peak {} outside fixed-point range (scaling {})",
            max_value, scaling_log
        )));
    }

    let scale = (1u32 << scaling_log) as f32 / fft;
    let values = spectrum
        .iter()
        .map(|&x| (x * scale).round().clamp(0.0, f32::from(u16::MAX)) as u16)
        .collect();

    Ok(QuantizedSpectrum {
        values,
        q_domain: scaling_log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spectrum(value: u16) -> Vec<u16> {
        vec![value; 65]
    }

    /// Pseudo-random spectrum, different for every seed
    fn patterned(seed: u32) -> Vec<u16> {
        (0..65u32)
            .map(|k| {
                let mut h = k.wrapping_mul(0x9E37_79B1) ^ seed.wrapping_mul(0x85EB_CA77);
                h ^= h >> 15;
                h = h.wrapping_mul(0x2C1B_3C6D);
                h ^= h >> 12;
                (h >> 20) as u16
            })
            .collect()
    }

    #[test]
    fn test_new_rejects_bad_config() {
        assert!(matches!(
            DelayEstimator::new(43, 100, true),
            Err(CoreError::ConfigInvalid(_))
        ));
        assert!(DelayEstimator::new(65, 0, true).is_err());
        assert!(DelayEstimator::new(44, 1, false).is_ok());
    }

    #[test]
    fn test_size_mismatch_returns_sentinel_and_keeps_state() {
        let mut estimator = DelayEstimator::new(65, 100, true).unwrap();
        for _ in 0..30 {
            estimator.estimate(&spectrum(100), &spectrum(100), 0, true);
        }
        let counter = estimator.vad_counter();
        let histogram = estimator.histogram().to_vec();

        assert_eq!(estimator.estimate(&[0u16; 64], &spectrum(1), 0, true), -1);
        assert_eq!(estimator.estimate(&spectrum(1), &spectrum(1), 16, true), -1);
        assert_eq!(estimator.estimate(&spectrum(1), &spectrum(1), -1, true), -1);

        assert_eq!(estimator.vad_counter(), counter);
        assert_eq!(estimator.histogram(), &histogram[..]);
        assert!(matches!(
            estimator.try_estimate(&spectrum(1), &[0u16; 10], 0, true),
            Err(CoreError::SizeMismatch { expected: 65, actual: 10 })
        ));
    }

    #[test]
    fn test_vad_gating() {
        let mut estimator = DelayEstimator::new(65, 10, false).unwrap();
        for _ in 0..VAD_COUNT_THRESHOLD {
            estimator.estimate(&spectrum(5), &spectrum(5), 0, true);
        }
        assert_eq!(estimator.vad_counter(), VAD_COUNT_THRESHOLD);
        assert!(estimator.histogram().iter().all(|&h| h == 0));

        // An inactive frame resets the counter
        estimator.estimate(&spectrum(5), &spectrum(5), 0, false);
        assert_eq!(estimator.vad_counter(), 0);
    }

    #[test]
    fn test_histogram_votes_after_threshold() {
        let mut estimator = DelayEstimator::new(65, 10, false).unwrap();
        for _ in 0..VAD_COUNT_THRESHOLD + 4 {
            estimator.estimate(&spectrum(5), &spectrum(5), 0, true);
        }
        // Four voting frames, each +3 then -1
        assert_eq!(estimator.histogram()[0], 8);
        assert_eq!(estimator.last_delay(), 0);
    }

    #[test]
    fn test_histogram_saturates() {
        let mut estimator = DelayEstimator::new(65, 4, false).unwrap();
        for _ in 0..VAD_COUNT_THRESHOLD as usize + 1000 {
            estimator.estimate(&spectrum(7), &spectrum(7), 0, true);
            assert!(estimator.histogram().iter().all(|&h| h <= MAX_HISTOGRAM));
        }
        assert_eq!(estimator.histogram()[0], MAX_HISTOGRAM - 1);
    }

    #[test]
    fn test_detects_known_lag() {
        let lag = 5;
        let mut estimator = DelayEstimator::new(65, 20, true).unwrap();
        let far: Vec<Vec<u16>> = (0..400).map(patterned).collect();

        let mut delay = 0;
        for n in 0..far.len() {
            let near = if n >= lag { far[n - lag].clone() } else { spectrum(0) };
            delay = estimator.estimate(&far[n], &near, 3, true);
            assert!(delay >= 0 && (delay as usize) < 20);
        }
        assert_eq!(delay as usize, lag);

        // The aligned far end is the block that produced the current near end
        let (aligned, q) = estimator.aligned_farend().unwrap();
        assert_eq!(aligned, &far[far.len() - 1 - lag][..]);
        assert_eq!(q, 3);
    }

    #[test]
    fn test_aligned_farend_unavailable_without_alignment() {
        let estimator = DelayEstimator::new(65, 10, false).unwrap();
        assert_eq!(estimator.aligned_farend(), Err(CoreError::DelayUnavailable));
        assert!(!estimator.alignment_enabled());
    }

    #[test]
    fn test_far_history_starts_at_slot_zero() {
        let mut estimator = DelayEstimator::new(65, 10, true).unwrap();
        estimator.estimate(&spectrum(42), &spectrum(1), 7, false);
        let (aligned, q) = estimator.aligned_farend().unwrap();
        assert_eq!(aligned, &spectrum(42)[..]);
        assert_eq!(q, 7);
    }

    #[test]
    fn test_reset() {
        let mut estimator = DelayEstimator::new(65, 10, true).unwrap();
        for _ in 0..40 {
            estimator.estimate(&spectrum(9), &spectrum(9), 0, true);
        }
        estimator.reset();
        assert_eq!(estimator.vad_counter(), 0);
        assert_eq!(estimator.last_delay(), 0);
        assert!(estimator.histogram().iter().all(|&h| h == 0));
        let (aligned, _) = estimator.aligned_farend().unwrap();
        assert!(aligned.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_quantize_spectrum_scaling() {
        // max / fft + 1 = 1.5, floor(log2) = 0, scale 2^14 / 128
        let quantized = quantize_spectrum(&[64.0, 1.0, 0.0], 128).unwrap();
        assert_eq!(quantized.q_domain, 14);
        assert_eq!(quantized.values, vec![8192, 128, 0]);

        // max / fft + 1 = 9, floor(log2) = 3
        let quantized = quantize_spectrum(&[1024.0], 128).unwrap();
        assert_eq!(quantized.q_domain, 11);
        assert_eq!(quantized.values, vec![16384]);
    }

    #[test]
    fn test_quantize_spectrum_rejects_out_of_range() {
        assert!(quantize_spectrum(&[1.0], 0).is_err());
        assert!(quantize_spectrum(&[1.0e12], 128).is_err());
    }

    #[test]
    fn test_estimate_float() {
        let mut estimator = DelayEstimator::new(65, 10, true).unwrap();
        let far = vec![100.0f32; 65];
        let delay = estimator.estimate_float(&far, &far, 128, true).unwrap();
        assert_eq!(delay, 0);
        let (_, q) = estimator.aligned_farend().unwrap();
        assert_eq!(q, 14);
    }
}
