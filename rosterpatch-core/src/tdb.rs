//! EA TDB database codec.
//!
//! A TDB file is a directory of 4-character table tags followed by table
//! blocks. Each table carries a 20-byte header, a 16-byte record-info
//! block, a field-name hash, then 16-byte field definitions and the
//! bit-packed record data. String fields are byte-aligned within a
//! record; integer fields are bit-packed LSB-first.
//!
//! Field tags are resolved to a closed [`FieldCode`] enum at parse time,
//! so a misspelled tag in caller code fails to compile instead of
//! silently matching nothing. Tags the roster tables do not use are kept
//! as `Unknown` and still round-trip.

use std::collections::HashMap;

use crate::{PatchError, Result};

pub const MAGIC: &[u8; 4] = b"DB\x00\x08";

const HEADER_LEN: usize = 20;
const RECORD_INFO_LEN: usize = 16;
const FIELD_DEF_LEN: usize = 16;

macro_rules! field_codes {
    ($($variant:ident => $tag:literal,)+) => {
        /// Known field tags across the roster tables.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum FieldCode {
            $($variant,)+
            Unknown([u8; 4]),
        }

        impl FieldCode {
            pub fn from_tag(tag: [u8; 4]) -> FieldCode {
                match &tag {
                    $($tag => FieldCode::$variant,)+
                    _ => FieldCode::Unknown(tag),
                }
            }

            pub fn tag(&self) -> [u8; 4] {
                match self {
                    $(FieldCode::$variant => *$tag,)+
                    FieldCode::Unknown(tag) => *tag,
                }
            }
        }
    };
}

field_codes! {
    // Shared / join keys
    Index => b"INDX",
    PlayerId => b"ID__",
    TableRef => b"TBLE",

    // SPBT player bios
    FirstName => b"FNME",
    LastName => b"LNME",
    Jersey => b"JERS",
    Handedness => b"HAND",
    Team => b"TEAM",
    PositionCode => b"POS_",
    Weight => b"WEIG",
    Height => b"HEIG",

    // SPAI skater attributes
    Balance => b"BALA",
    PenaltyDiscipline => b"PENA",
    ShotAccuracy => b"SACC",
    WristAccuracy => b"WACC",
    Faceoffs => b"FACE",
    Acceleration => b"ACCE",
    Speed => b"SPEE",
    Potential => b"POTE",
    Deking => b"DEKG",
    Checking => b"CHKG",
    Toughness => b"TOUG",
    Fighting => b"FIGH",
    PuckControl => b"PUCK",
    Agility => b"AGIL",
    Hero => b"HERO",
    Aggression => b"AGGR",
    Pressure => b"PRES",
    Passing => b"PASS",
    Endurance => b"ENDU",
    Injury => b"INJU",
    SlapPower => b"SPOW",
    WristPower => b"WPOW",

    // SGAI goalie attributes
    Breakaway => b"BRKA",
    ReboundControl => b"REBC",
    ShotRecovery => b"SREC",
    PokeCheck => b"POKE",
    Intensity => b"INTE",
    FiveHole => b"5HOL",
    GloveHigh => b"GSH_",
    StickHigh => b"SSH_",
    GloveLow => b"GSL_",
    StickLow => b"SSL_",

    // ROST roster slots
    Captain => b"CAPT",
    Dressed => b"DRES",
    Line1Center => b"L1C_",
    Line2Center => b"L2C_",
    Line3Center => b"L3C_",
    Line4Center => b"L4C_",
    Line1LeftWing => b"L1LW",
    Line2LeftWing => b"L2LW",
    Line3LeftWing => b"L3LW",
    Line4LeftWing => b"L4LW",
    Line1RightWing => b"L1RW",
    Line2RightWing => b"L2RW",
    Line3RightWing => b"L3RW",
    Line4RightWing => b"L4RW",
    Pair1LeftDefense => b"31LD",
    Pair2LeftDefense => b"32LD",
    Pair3LeftDefense => b"33LD",
    Pair1RightDefense => b"31RD",
    Pair2RightDefense => b"32RD",
    Pair3RightDefense => b"33RD",
    Goalie1 => b"G1__",
    Goalie2 => b"G2__",
    Hero1 => b"H1__",
    Hero2 => b"H2__",
    Hero3 => b"H3__",
    Hero4 => b"H4__",
    Hero5 => b"H5__",
    Shootout1 => b"S1__",
    Shootout2 => b"S2__",
    Shootout3 => b"S3__",
    Shootout4 => b"S4__",
    Shootout5 => b"S5__",

    // STEA team identity
    TeamName => b"NAME",
    TeamCity => b"CITY",
}

/// Every ROST line/unit flag, in directory order. Writers clear all of
/// these before setting the ones a slot earns.
pub const LINE_FLAGS: [FieldCode; 30] = [
    FieldCode::Line1Center,
    FieldCode::Line2Center,
    FieldCode::Line3Center,
    FieldCode::Line4Center,
    FieldCode::Line1LeftWing,
    FieldCode::Line2LeftWing,
    FieldCode::Line3LeftWing,
    FieldCode::Line4LeftWing,
    FieldCode::Line1RightWing,
    FieldCode::Line2RightWing,
    FieldCode::Line3RightWing,
    FieldCode::Line4RightWing,
    FieldCode::Pair1LeftDefense,
    FieldCode::Pair2LeftDefense,
    FieldCode::Pair3LeftDefense,
    FieldCode::Pair1RightDefense,
    FieldCode::Pair2RightDefense,
    FieldCode::Pair3RightDefense,
    FieldCode::Goalie1,
    FieldCode::Goalie2,
    FieldCode::Hero1,
    FieldCode::Hero2,
    FieldCode::Hero3,
    FieldCode::Hero4,
    FieldCode::Hero5,
    FieldCode::Shootout1,
    FieldCode::Shootout2,
    FieldCode::Shootout3,
    FieldCode::Shootout4,
    FieldCode::Shootout5,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Binary,
    SInt,
    UInt,
    Float,
    Other(u32),
}

impl FieldType {
    fn from_raw(raw: u32) -> FieldType {
        match raw {
            0 => FieldType::Str,
            1 => FieldType::Binary,
            2 => FieldType::SInt,
            3 => FieldType::UInt,
            4 => FieldType::Float,
            other => FieldType::Other(other),
        }
    }

    fn is_string(self) -> bool {
        self == FieldType::Str
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub code: FieldCode,
    pub field_type: FieldType,
    pub bit_offset: usize,
    pub bit_width: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(u32),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Option<u32> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Int(_) => None,
        }
    }
}

/// A parsed record: field code to value.
pub type Record = HashMap<FieldCode, Value>;

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub fields: Vec<Field>,
    pub record_size: usize,
    /// Allocated record slots (maxRecords).
    pub capacity: usize,
    /// Valid record count (currentRecords); the game reads only these.
    pub num_records: usize,
    header_offset: usize,
    data_offset: usize,
    raw_data: Vec<u8>,
}

impl Table {
    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.capacity {
            return Err(PatchError::IndexOutOfRange {
                table: self.name.clone(),
                index,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn field(&self, code: FieldCode) -> Option<&Field> {
        self.fields.iter().find(|f| f.code == code)
    }

    pub fn read_record(&self, index: usize) -> Result<Record> {
        self.check_index(index)?;
        let rec = &self.raw_data[index * self.record_size..(index + 1) * self.record_size];

        let mut out = Record::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = if field.field_type.is_string() {
                let byte_off = field.bit_offset / 8;
                let byte_len = field.bit_width / 8;
                let raw = &rec[byte_off..(byte_off + byte_len).min(rec.len())];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                Value::Str(String::from_utf8_lossy(&raw[..end]).into_owned())
            } else {
                Value::Int(read_bits(rec, field.bit_offset, field.bit_width))
            };
            out.insert(field.code, value);
        }
        Ok(out)
    }

    /// Partial update: only the supplied fields change, everything else
    /// in the record keeps its stored bits.
    pub fn write_record(&mut self, index: usize, values: &[(FieldCode, Value)]) -> Result<()> {
        self.check_index(index)?;
        let rec_start = index * self.record_size;

        for (code, value) in values {
            let field = match self.fields.iter().find(|f| f.code == *code) {
                Some(f) => f.clone(),
                None => continue,
            };
            let rec = &mut self.raw_data[rec_start..rec_start + self.record_size];

            if field.field_type.is_string() {
                let byte_off = field.bit_offset / 8;
                let byte_len = field.bit_width / 8;
                let text = value.as_str().unwrap_or("");
                let bytes = text.as_bytes();
                for i in 0..byte_len {
                    rec[byte_off + i] = if i < bytes.len() { bytes[i] } else { 0 };
                }
                // Field width includes the terminator; force it.
                if byte_len > 0 && bytes.len() >= byte_len {
                    rec[byte_off + byte_len - 1] = 0;
                }
            } else {
                let v = value.as_int().unwrap_or(0);
                write_bits(rec, field.bit_offset, field.bit_width, v);
            }
        }
        Ok(())
    }

    /// All record indices (within `num_records`) where the integer field
    /// matches `value`.
    pub fn find_records(&self, code: FieldCode, value: u32) -> Result<Vec<usize>> {
        let field = self
            .field(code)
            .ok_or_else(|| PatchError::MissingTable(format!(
                "table {} has no field {:?}",
                self.name, code
            )))?
            .clone();

        let mut out = Vec::new();
        for index in 0..self.num_records.min(self.capacity) {
            let rec =
                &self.raw_data[index * self.record_size..(index + 1) * self.record_size];
            if read_bits(rec, field.bit_offset, field.bit_width) == value {
                out.push(index);
            }
        }
        Ok(out)
    }

    pub fn find_record(&self, code: FieldCode, value: u32) -> Result<Option<usize>> {
        Ok(self.find_records(code, value)?.into_iter().next())
    }
}

fn read_bits(rec: &[u8], bit_offset: usize, bit_width: usize) -> u32 {
    let mut value = 0u32;
    for i in 0..bit_width.min(32) {
        let bit_pos = bit_offset + i;
        let byte_idx = bit_pos / 8;
        if byte_idx < rec.len() && rec[byte_idx] & (1 << (bit_pos % 8)) != 0 {
            value |= 1 << i;
        }
    }
    value
}

fn write_bits(rec: &mut [u8], bit_offset: usize, bit_width: usize, value: u32) {
    let max_val = if bit_width >= 32 {
        u32::MAX
    } else {
        (1u32 << bit_width) - 1
    };
    let value = value.min(max_val);

    for i in 0..bit_width.min(32) {
        let bit_pos = bit_offset + i;
        let byte_idx = bit_pos / 8;
        if byte_idx >= rec.len() {
            break;
        }
        let mask = 1u8 << (bit_pos % 8);
        if value & (1 << i) != 0 {
            rec[byte_idx] |= mask;
        } else {
            rec[byte_idx] &= !mask;
        }
    }
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[derive(Debug, Clone)]
pub struct TdbFile {
    raw: Vec<u8>,
    tables: Vec<Table>,
}

impl TdbFile {
    pub fn parse(data: &[u8]) -> Result<TdbFile> {
        if data.len() < HEADER_LEN || &data[..4] != MAGIC {
            return Err(PatchError::InvalidContainer(
                "missing TDB magic".to_string(),
            ));
        }

        let num_tables = read_u32_le(data, 16) as usize;
        // 4-byte directory hash sits between the header and the entries.
        let dir_start = HEADER_LEN + 4;
        let dir_end = dir_start + num_tables * 8;
        if dir_end > data.len() {
            return Err(PatchError::InvalidContainer(
                "TDB directory truncated".to_string(),
            ));
        }

        let mut tables = Vec::with_capacity(num_tables);
        for i in 0..num_tables {
            let pos = dir_start + i * 8;
            let name = String::from_utf8_lossy(&data[pos..pos + 4])
                .trim_end_matches('\0')
                .to_string();
            // Table offsets are relative to the end of the directory.
            let offset = dir_end + read_u32_le(data, pos + 4) as usize;
            if let Some(table) = Self::parse_table(data, offset, name) {
                tables.push(table);
            }
        }

        Ok(TdbFile {
            raw: data.to_vec(),
            tables,
        })
    }

    fn parse_table(data: &[u8], offset: usize, name: String) -> Option<Table> {
        if offset + HEADER_LEN + RECORD_INFO_LEN + 4 > data.len() {
            return None;
        }

        let record_size = read_u32_le(data, offset + 8) as usize;

        let info = offset + HEADER_LEN;
        let capacity = read_u16_le(data, info) as usize;
        let num_records = read_u16_le(data, info + 2) as usize;
        let num_fields = read_u32_le(data, info + 8) as usize;

        // Skip the 4-byte field-name hash.
        let mut pos = info + RECORD_INFO_LEN + 4;

        let mut fields = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            if pos + FIELD_DEF_LEN > data.len() {
                return None;
            }
            let field_type = FieldType::from_raw(read_u32_le(data, pos));
            let bit_offset = read_u32_le(data, pos + 4) as usize;
            let tag = [data[pos + 8], data[pos + 9], data[pos + 10], data[pos + 11]];
            let bit_width = read_u32_le(data, pos + 12) as usize;
            fields.push(Field {
                code: FieldCode::from_tag(tag),
                field_type,
                bit_offset,
                bit_width,
            });
            pos += FIELD_DEF_LEN;
        }

        let data_offset = pos;
        let data_len = capacity.checked_mul(record_size)?;
        if data_offset + data_len > data.len() {
            return None;
        }

        Some(Table {
            name,
            fields,
            record_size,
            capacity,
            num_records,
            header_offset: offset,
            data_offset,
            raw_data: data[data_offset..data_offset + data_len].to_vec(),
        })
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| PatchError::MissingTable(name.to_string()))
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| PatchError::MissingTable(name.to_string()))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Write record data back at the original offsets and refresh both
    /// record-count words in each table header. Everything the parser
    /// did not touch round-trips byte-for-byte.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.raw.clone();
        for table in &self.tables {
            let end = table.data_offset + table.capacity * table.record_size;
            if end <= out.len() {
                out[table.data_offset..end].copy_from_slice(&table.raw_data);
            }
            let counts = table.header_offset + HEADER_LEN;
            if counts + 4 <= out.len() {
                out[counts..counts + 2]
                    .copy_from_slice(&(table.capacity as u16).to_le_bytes());
                out[counts + 2..counts + 4]
                    .copy_from_slice(&(table.num_records as u16).to_le_bytes());
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders for tiny synthetic TDB images used across the crate's
    //! tests.

    use super::*;

    pub struct FieldSpec {
        pub tag: [u8; 4],
        pub field_type: u32,
        pub bit_offset: u32,
        pub bit_width: u32,
    }

    pub struct TableSpec {
        pub name: [u8; 4],
        pub record_size: u32,
        pub capacity: u16,
        pub num_records: u16,
        pub fields: Vec<FieldSpec>,
        pub data: Vec<u8>,
    }

    pub fn build_tdb(tables: &[TableSpec]) -> Vec<u8> {
        let dir_start = HEADER_LEN + 4;
        let dir_end = dir_start + tables.len() * 8;

        let mut blocks: Vec<Vec<u8>> = Vec::new();
        for spec in tables {
            let mut block = Vec::new();
            block.extend_from_slice(&0u32.to_le_bytes()); // crc
            block.extend_from_slice(&0u32.to_le_bytes());
            block.extend_from_slice(&spec.record_size.to_le_bytes());
            block.extend_from_slice(&(spec.capacity as u32).to_le_bytes());
            block.extend_from_slice(&0u32.to_le_bytes());

            block.extend_from_slice(&spec.capacity.to_le_bytes());
            block.extend_from_slice(&spec.num_records.to_le_bytes());
            block.extend_from_slice(&0u32.to_le_bytes()); // marker
            block.extend_from_slice(&(spec.fields.len() as u32).to_le_bytes());
            block.extend_from_slice(&0u32.to_le_bytes());

            block.extend_from_slice(&0u32.to_le_bytes()); // field hash

            for f in &spec.fields {
                block.extend_from_slice(&f.field_type.to_le_bytes());
                block.extend_from_slice(&f.bit_offset.to_le_bytes());
                block.extend_from_slice(&f.tag);
                block.extend_from_slice(&f.bit_width.to_le_bytes());
            }

            let mut data = spec.data.clone();
            data.resize(spec.capacity as usize * spec.record_size as usize, 0);
            block.extend_from_slice(&data);
            blocks.push(block);
        }

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // data size, unused here
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(tables.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // directory hash

        let mut rel = 0u32;
        for (spec, block) in tables.iter().zip(&blocks) {
            out.extend_from_slice(&spec.name);
            out.extend_from_slice(&rel.to_le_bytes());
            rel += block.len() as u32;
        }
        assert_eq!(out.len(), dir_end);

        for block in &blocks {
            out.extend_from_slice(block);
        }
        out
    }
}
