//! Firmware file formats
use std::borrow::Cow;
use std::path::Path;
use std::str;

use anyhow::Result;

use crate::gff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    Gff,
    PlainHex,
    IntelHex,
    Binary,
}

/// Load a flash image. GFF containers are decoded; a GFF file whose payload
/// does not decode is used as a raw image.
pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::Gff => match gff::decode_file(&raw) {
            Ok(image) => Ok(image),
            Err(e) => {
                log::warn!("{}: {}, using the file as a raw image", p.display(), e);
                Ok(raw)
            }
        },
        FirmwareFormat::PlainHex => read_hex(str::from_utf8(&raw)?),
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::Binary => Ok(raw),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    if gff::is_gff(raw) {
        return FirmwareFormat::Gff;
    }
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ext == "gff" {
        return FirmwareFormat::Gff;
    }
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    let text = |extra: &[u8]| {
        !raw.is_empty()
            && raw.iter().all(|&c| {
                (c as char).is_ascii_hexdigit() || c == b'\n' || c == b'\r' || extra.contains(&c)
            })
    };
    if raw.first() == Some(&b':') && text(b":") {
        FirmwareFormat::IntelHex
    } else if text(b"") {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

pub fn read_hex(data: &str) -> Result<Vec<u8>> {
    let digits: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(hex::decode(digits)?)
}

/// Intel HEX to a flash image starting at address 0; gaps read as erased flash.
pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;

                records.push((offset, value.into()));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    merge_sections(records)
}

fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<Vec<u8>> {
    sections.sort(); // order by start address

    let end_address = sections
        .iter()
        .map(|(addr, sect)| *addr as usize + sect.len())
        .max()
        .ok_or_else(|| anyhow::format_err!("no data records"))?;

    let mut binary = vec![0xFFu8; end_address];
    for (addr, sect) in sections {
        let start = addr as usize;
        binary[start..start + sect.len()].copy_from_slice(&sect);
    }
    Ok(binary)
}
