//! Error types for the real-time core
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


use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the real-time core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Truncated payload, AP size overflow, or AP/FU nested inside an AP.
    /// The frame is dropped by the caller.
    #[error("Malformed payload: {0}")]
    ParseMalformed(String),

    /// RTP fixed header could not be parsed
    #[error("RTP packet parse error: {0}")]
    RtpParse(String),

    /// Construction-time configuration rejected; no instance is produced
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Spectrum length differs from the construction-time size
    #[error("Spectrum size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Far-end Q-domain outside [0, 15]
    #[error("Far-end Q-domain out of range: {0}")]
    QDomainOutOfRange(i32),

    /// Aligned far-end spectrum requested while alignment is disabled
    #[error("Aligned far-end spectrum unavailable")]
    DelayUnavailable,

    /// Ring buffer request larger than its capacity
    #[error("Buffer error: {0}")]
    Buffer(String),

    /// Runtime input channel already closed
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl From<rtcore_config::ConfigError> for CoreError {
    fn from(err: rtcore_config::ConfigError) -> Self {
        CoreError::ConfigInvalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::SizeMismatch { expected: 65, actual: 64 };
        assert_eq!(err.to_string(), "Spectrum size mismatch: expected 65, got 64");

        let err = CoreError::ParseMalformed("AP size overflow".to_string());
        assert!(err.to_string().contains("AP size overflow"));
    }
}
