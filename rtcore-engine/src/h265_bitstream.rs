//! RBSP bit reader
//!
//! Removes emulation prevention bytes and reads fixed-width and Exp-Golomb
//! fields MSB first. All reads return `None` past the end of data.
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


/// Strip `0x03` from every `00 00 03` sequence
pub fn rbsp_unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

/// MSB-first reader over an unescaped RBSP
#[derive(Debug, Clone)]
pub struct RbspReader {
    data: Vec<u8>,
    bit_pos: usize,
}

impl RbspReader {
    /// Reader over escaped NAL payload bytes
    pub fn new(escaped: &[u8]) -> Self {
        RbspReader {
            data: rbsp_unescape(escaped),
            bit_pos: 0,
        }
    }

    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.bit_pos
    }

    pub fn read_bit(&mut self) -> Option<bool> {
        let byte = *self.data.get(self.bit_pos / 8)?;
        let bit = (byte >> (7 - self.bit_pos % 8)) & 1;
        self.bit_pos += 1;
        Some(bit == 1)
    }

    /// `u(n)` for `n <= 32`
    pub fn read_bits(&mut self, n: u32) -> Option<u32> {
        if n > 32 || (n as usize) > self.remaining_bits() {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..n {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Some(value as u32)
    }

    pub fn skip_bits(&mut self, n: usize) -> Option<()> {
        if n > self.remaining_bits() {
            return None;
        }
        self.bit_pos += n;
        Some(())
    }

    /// `ue(v)`; more than 31 leading zeros is rejected
    pub fn read_ue(&mut self) -> Option<u32> {
        let mut leading_zeros = 0u32;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return None;
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Some(((1u64 << leading_zeros) - 1 + u64::from(suffix)) as u32)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    //! Bitstream writer for building parameter sets in tests

    #[derive(Default)]
    pub struct BitWriter {
        bytes: Vec<u8>,
        bit_pos: usize,
    }

    impl BitWriter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn bits(&mut self, n: u32, value: u32) -> &mut Self {
            for i in (0..n).rev() {
                if self.bit_pos % 8 == 0 {
                    self.bytes.push(0);
                }
                if (value >> i) & 1 == 1 {
                    let last = self.bytes.len() - 1;
                    self.bytes[last] |= 0x80 >> (self.bit_pos % 8);
                }
                self.bit_pos += 1;
            }
            self
        }

        pub fn ue(&mut self, value: u32) -> &mut Self {
            let coded = u64::from(value) + 1;
            let len = 64 - coded.leading_zeros();
            self.bits(len - 1, 0);
            for i in (0..len).rev() {
                self.bits(1, ((coded >> i) & 1) as u32);
            }
            self
        }

        /// Stop bit plus zero alignment, then emulation prevention
        pub fn finish(&mut self) -> Vec<u8> {
            self.bits(1, 1);
            while self.bit_pos % 8 != 0 {
                self.bits(1, 0);
            }
            escape(&self.bytes)
        }
    }

    pub fn escape(rbsp: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(rbsp.len() + 4);
        let mut zeros = 0;
        for &byte in rbsp {
            if zeros >= 2 && byte <= 0x03 {
                out.push(0x03);
                zeros = 0;
            }
            zeros = if byte == 0 { zeros + 1 } else { 0 };
            out.push(byte);
        }
        out
    }
}
