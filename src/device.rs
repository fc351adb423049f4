//! SPI flash chip definitions, identified by JEDEC id.
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::InstructionKind;

/// How the status register is unlocked before WRSR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unprotect {
    #[default]
    Wren,
    Ewsr,
}

impl Unprotect {
    pub fn instruction_kind(self) -> InstructionKind {
        match self {
            Unprotect::Wren => InstructionKind::WriteAfterWren,
            Unprotect::Ewsr => InstructionKind::WriteAfterEwsr,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vendor {
    pub vendor: String,
    pub chips: Vec<FlashChip>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashChip {
    pub name: String,
    pub jedec_id: u32,
    #[serde(deserialize_with = "parse_size")]
    pub size: u32,
    #[serde(default)]
    pub unprotect: Unprotect,
}

impl ::std::fmt::Display for FlashChip {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}({:06x})", self.name, self.jedec_id)
    }
}

pub struct ChipDB {
    vendors: Vec<Vendor>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        Ok(ChipDB {
            vendors: vec![serde_yaml::from_str(include_str!("../devices/flash.yaml"))?],
        })
    }

    pub fn find(&self, jedec_id: u32) -> Option<&FlashChip> {
        self.chips().find(|c| c.jedec_id == jedec_id)
    }

    pub fn chips(&self) -> impl Iterator<Item = &FlashChip> {
        self.vendors.iter().flat_map(|v| v.chips.iter())
    }
}

/// Parse `0x..`, plain decimal, or decimal with a K/KB/KiB/M/MB/MiB suffix.
pub fn parse_size_str(s: &str) -> Result<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return Ok(u32::from_str_radix(hex, 16)?);
    }
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let multiplier = match unit.trim() {
        "" => 1,
        "K" | "KB" | "KiB" => 1024,
        "M" | "MB" | "MiB" => 1024 * 1024,
        other => anyhow::bail!("unknown size unit {:?} in {:?}", other, s),
    };
    digits
        .parse::<u32>()?
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::format_err!("size {:?} overflows", s))
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u32),
        Str(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Int(n) => Ok(n),
        Raw::Str(s) => parse_size_str(&s).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(parse_size_str("512KiB").unwrap(), 512 * 1024);
        assert_eq!(parse_size_str("256K").unwrap(), 256 * 1024);
        assert_eq!(parse_size_str("1MiB").unwrap(), 1024 * 1024);
        assert_eq!(parse_size_str("0x80000").unwrap(), 0x80000);
        assert_eq!(parse_size_str("4096").unwrap(), 4096);
        assert!(parse_size_str("12 parsecs").is_err());
        assert!(parse_size_str("0xZZ").is_err());
        assert!(parse_size_str("8192M").is_err());
    }

    #[test]
    fn database_loads() {
        let db = ChipDB::load().unwrap();
        let chip = db.find(0xEF3013).unwrap();
        assert_eq!(chip.name, "W25X40");
        assert_eq!(chip.size, 512 * 1024);
        assert_eq!(chip.unprotect, Unprotect::Wren);
        assert!(db.find(0x123456).is_none());
    }

    #[test]
    fn sst_parts_use_ewsr() {
        let db = ChipDB::load().unwrap();
        let chip = db.find(0xBF258D).unwrap();
        assert_eq!(chip.unprotect.instruction_kind(), InstructionKind::WriteAfterEwsr);
    }

    #[test]
    fn ids_are_unique() {
        let db = ChipDB::load().unwrap();
        let mut ids: Vec<_> = db.chips().map(|c| c.jedec_id).collect();
        let n = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), n);
    }
}
