//! GFF firmware container decoding.
//!
//! A GFF file is a 256 byte header starting with `GMI GFF V1.0`, followed by a
//! bitstream of prefix-coded nibbles. Two nibbles make one output byte, high
//! nibble first.

use thiserror::Error;

pub const SIGNATURE: &[u8] = b"GMI GFF V1.0";
pub const HEADER_SIZE: usize = 256;

/// Zero bits a code may start with before the stream is considered malformed.
const MAX_ZERO_RUN: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GffError {
    #[error("file is too small for a GFF image ({0} bytes)")]
    TooSmall(usize),
    #[error("GFF signature not found")]
    SignatureMismatch,
    #[error("malformed GFF bitstream near payload byte {position}")]
    Decode { position: usize },
}

/// Read cursor over a byte buffer, MSB first.
#[derive(Debug, Clone)]
pub struct BitStream<'a> {
    data: &'a [u8],
    pos: usize,
    mask: u8,
}

impl<'a> BitStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BitStream {
            data,
            pos: 0,
            mask: 0x80,
        }
    }

    /// True while an unread bit is left in the current byte or later bytes remain.
    pub fn has_data(&self) -> bool {
        (self.mask != 0 && self.pos < self.data.len()) || self.pos + 1 < self.data.len()
    }

    /// No bytes remain after the one under the cursor.
    fn on_last_byte(&self) -> bool {
        self.pos + 1 >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_bit(&mut self) -> Option<bool> {
        if self.mask == 0 {
            if self.pos + 1 >= self.data.len() {
                return None;
            }
            self.pos += 1;
            self.mask = 0x80;
        }
        let bit = *self.data.get(self.pos)? & self.mask != 0;
        self.mask >>= 1;
        Some(bit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symbol {
    Nibble(u8),
    End,
    Invalid,
}

fn decode_nibble(stream: &mut BitStream<'_>) -> Symbol {
    let mut zeros = 0;
    while zeros < MAX_ZERO_RUN {
        match stream.read_bit() {
            None => return Symbol::End,
            Some(true) => break,
            Some(false) => zeros += 1,
        }
    }
    if zeros == MAX_ZERO_RUN {
        // trailing padding of the last byte
        return if stream.on_last_byte() {
            Symbol::End
        } else {
            Symbol::Invalid
        };
    }

    let mut next = || stream.read_bit();
    let nibble = match zeros {
        0 => Some(0x0),
        1 => next().map(|b| if b { 0xF } else { 0x1 }),
        2 => next().map(|b| if b { 0x8 } else { 0x2 }),
        3 => next().map(|b| if b { 0x7 } else { 0xC }),
        4 => match next() {
            Some(true) => next().map(|b| if b { 0x9 } else { 0x4 }),
            Some(false) => match next() {
                Some(true) => next().map(|b| if b { 0x5 } else { 0xA }),
                Some(false) => next().map(|b| if b { 0xB } else { 0x3 }),
                None => None,
            },
            None => None,
        },
        _ => match (next(), next()) {
            (Some(true), Some(true)) => Some(0xD),
            (Some(true), Some(false)) => Some(0xE),
            (Some(false), Some(true)) => Some(0x6),
            _ => None,
        },
    };
    nibble.map_or(Symbol::Invalid, Symbol::Nibble)
}

/// Walk the whole payload, handing every decoded byte to `emit`.
fn walk<F: FnMut(u8)>(payload: &[u8], mut emit: F) -> Result<usize, GffError> {
    let mut stream = BitStream::new(payload);
    let mut count = 0;
    while stream.has_data() {
        let high = match decode_nibble(&mut stream) {
            Symbol::Nibble(n) => n,
            Symbol::End => return Ok(count),
            Symbol::Invalid => {
                return Err(GffError::Decode {
                    position: stream.position(),
                });
            }
        };
        let Symbol::Nibble(low) = decode_nibble(&mut stream) else {
            return Err(GffError::Decode {
                position: stream.position(),
            });
        };
        emit((high << 4) | low);
        count += 1;
    }
    Ok(count)
}

/// Decode a GFF payload (the bytes after the header).
pub fn decode(payload: &[u8]) -> Result<Vec<u8>, GffError> {
    let mut output = Vec::with_capacity(payload.len() * 2);
    walk(payload, |b| output.push(b))?;
    Ok(output)
}

/// Size `decode` would produce, or 0 if it would fail.
pub fn compute_decoded_size(payload: &[u8]) -> usize {
    walk(payload, |_| ()).unwrap_or(0)
}

pub fn is_gff(raw: &[u8]) -> bool {
    raw.starts_with(SIGNATURE)
}

/// Check the header of a complete GFF file and decode its payload.
pub fn decode_file(raw: &[u8]) -> Result<Vec<u8>, GffError> {
    if !is_gff(raw) {
        return Err(GffError::SignatureMismatch);
    }
    if raw.len() < HEADER_SIZE {
        return Err(GffError::TooSmall(raw.len()));
    }
    let payload = &raw[HEADER_SIZE..];
    let output = decode(payload)?;
    log::debug!(
        "GFF payload {} bytes decoded to {} bytes",
        payload.len(),
        output.len()
    );
    Ok(output)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Canonical code for every nibble, as written on the wire.
    const CODES: [&str; 16] = [
        "1",        // 0
        "010",      // 1
        "0010",     // 2
        "00001000", // 3
        "0000110",  // 4
        "00001011", // 5
        "00000101", // 6
        "00011",    // 7
        "0011",     // 8
        "0000111",  // 9
        "00001010", // A
        "00001001", // B
        "00010",    // C
        "00000111", // D
        "00000110", // E
        "011",      // F
    ];

    /// Reference encoder, zero padded to a whole byte.
    pub(crate) fn encode_reference(data: &[u8]) -> Vec<u8> {
        let bits: String = data
            .iter()
            .flat_map(|b| [CODES[(b >> 4) as usize], CODES[(b & 0xF) as usize]])
            .collect();
        bits.as_bytes()
            .chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .chain(std::iter::repeat(&b'0'))
                    .take(8)
                    .fold(0u8, |acc, &c| (acc << 1) | (c == b'1') as u8)
            })
            .collect()
    }

    pub(crate) fn gff_file(data: &[u8]) -> Vec<u8> {
        let mut raw = SIGNATURE.to_vec();
        raw.resize(HEADER_SIZE, 0);
        raw.extend(encode_reference(data));
        raw
    }

    #[test]
    fn decodes_documented_scenario() {
        let raw = gff_file(&[0xAB, 0xCD]);
        assert_eq!(&raw[HEADER_SIZE..], &[0x0A, 0x09, 0x10, 0x38]);
        assert_eq!(decode_file(&raw).unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn every_nibble_code_round_trips() {
        let data: Vec<u8> = (0..=255u8).collect();
        let payload = encode_reference(&data);
        assert_eq!(decode(&payload).unwrap(), data);
        assert_eq!(compute_decoded_size(&payload), data.len());
    }

    #[test]
    fn empty_payload_is_empty_image() {
        assert_eq!(decode(&[]).unwrap(), Vec::<u8>::new());
        assert_eq!(compute_decoded_size(&[]), 0);
    }

    #[test]
    fn zero_run_on_last_byte_ends_stream() {
        // "11" -> 0x00, then six padding zeros
        assert_eq!(decode(&[0xC0]).unwrap(), vec![0x00]);
        assert_eq!(decode(&[0x00]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn zero_run_before_last_byte_is_an_error() {
        assert!(matches!(decode(&[0x00, 0x80]), Err(GffError::Decode { .. })));
    }

    #[test]
    fn error_code_is_rejected() {
        // z = 5 followed by "00"
        assert!(matches!(decode(&[0x04]), Err(GffError::Decode { .. })));
        assert_eq!(compute_decoded_size(&[0x04]), 0);
    }

    #[test]
    fn end_marker_as_low_nibble_is_an_error() {
        // "1" decodes a high nibble, the rest of the stream is padding
        assert!(decode(&[0x80, 0x00]).is_err());
        assert!(decode(&[0x80]).is_err());
    }

    #[test]
    fn truncated_code_is_an_error() {
        // 0, then z = 4, "1", "0", "1" and the final bit is missing
        assert!(decode(&[0x85]).is_err());
    }

    #[test]
    fn decoded_size_agrees_with_decode() {
        let mut seed = 0x1234_5678u32;
        for len in 0..64 {
            let payload: Vec<u8> = (0..len)
                .map(|_| {
                    seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                    (seed >> 16) as u8
                })
                .collect();
            let expected = decode(&payload).map(|v| v.len()).unwrap_or(0);
            assert_eq!(compute_decoded_size(&payload), expected, "{:02x?}", payload);
        }
    }

    #[test]
    fn header_checks() {
        assert_eq!(
            decode_file(b"GMI GFF V1.0 short"),
            Err(GffError::TooSmall(18))
        );
        assert_eq!(decode_file(&[0u8; 300]), Err(GffError::SignatureMismatch));
    }
}
