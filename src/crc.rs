//! CRC-8-CCITT (x^8 + x^2 + x + 1), the checksum the controller computes over
//! a flash range. MSB first, initial value 0, no reflection, no final XOR.

const POLY: u8 = 0x07;

/// Running CRC register, so data can be fed in chunks as it arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc8(u8);

impl Crc8 {
    pub const fn new() -> Self {
        Crc8(0)
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.0 ^= byte;
            for _ in 0..8 {
                self.0 = if self.0 & 0x80 != 0 {
                    (self.0 << 1) ^ POLY
                } else {
                    self.0 << 1
                };
            }
        }
    }

    pub const fn value(&self) -> u8 {
        self.0
    }
}

pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = Crc8::new();
    crc.update(data);
    crc.value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn check_value() {
        // CRC-8/SMBUS check value
        assert_eq!(crc8(b"123456789"), 0xF4);
    }

    #[test]
    fn chunked_equals_whole() {
        let data: Vec<u8> = (0..=255u8).rev().collect();
        let mut crc = Crc8::new();
        for chunk in data.chunks(7) {
            crc.update(chunk);
        }
        assert_eq!(crc.value(), crc8(&data));
    }

    #[test]
    fn blank_page() {
        let mut crc = Crc8::new();
        crc.update(&[0xFF; 128]);
        let mut again = Crc8::new();
        again.update(&[0xFF; 64]);
        again.update(&[0xFF; 64]);
        assert_eq!(crc, again);
    }
}
