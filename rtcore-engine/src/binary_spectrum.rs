//! Binary spectrum primitives for echo-path delay estimation
//!
//! A spectrum is reduced to a 32-bit word with one bit per band bin,
//! set when the bin exceeds its running mean. Two such words are compared
//! by counting differing bits.
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


pub use rtcore_config::{BAND_FIRST, BAND_LAST};

// One bit per band bin must fit a u32
const _: () = assert!(BAND_LAST - BAND_FIRST < 32);

/// Smoothing shift for per-bin spectrum means
pub const SPECTRUM_MEAN_FACTOR: u32 = 6;
/// Smoothing shift for Q9 bit-count means
pub const BIT_COUNT_MEAN_FACTOR: u32 = 9;

/// Update `mean` toward `new_value` by `(new_value - mean) >> factor`.
///
/// The shift rounds toward zero for negative differences so the mean can
/// settle exactly on a constant input from either side.
pub fn mean_estimator(new_value: i32, factor: u32, mean: &mut i32) {
    let diff = new_value - *mean;
    let step = if diff < 0 {
        -((-diff) >> factor)
    } else {
        diff >> factor
    };
    *mean += step;
}

/// Bit `k - BAND_FIRST` is set iff `spectrum[k] > threshold[k]`
pub fn binary_spectrum(spectrum: &[u16], threshold: &[i32]) -> u32 {
    (BAND_FIRST..=BAND_LAST)
        .filter(|&k| i32::from(spectrum[k]) > threshold[k])
        .fold(0u32, |acc, k| acc | (1 << (k - BAND_FIRST)))
}

/// Number of bins in which two binary spectra differ
pub fn bit_count(a: u32, b: u32) -> u32 {
    (a ^ b).count_ones()
}

/// Per-bin running mean of a spectrum stream
#[derive(Debug, Clone)]
pub struct MeanSpectrum {
    values: Vec<i32>,
}

impl MeanSpectrum {
    pub fn new(spectrum_size: usize) -> Self {
        MeanSpectrum {
            values: vec![0; spectrum_size],
        }
    }

    /// Fold `spectrum` into the band-bin means.
    ///
    /// Bins outside the band are never read, so they are not tracked.
    pub fn update(&mut self, spectrum: &[u16]) {
        for k in BAND_FIRST..=BAND_LAST {
            mean_estimator(
                i32::from(spectrum[k]),
                SPECTRUM_MEAN_FACTOR,
                &mut self.values[k],
            );
        }
    }

    /// Binarize `spectrum` against the current means
    pub fn binarize(&self, spectrum: &[u16]) -> u32 {
        binary_spectrum(spectrum, &self.values)
    }

    pub fn values(&self) -> &[i32] {
        &self.values
    }

    pub fn reset(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0);
    }
}
