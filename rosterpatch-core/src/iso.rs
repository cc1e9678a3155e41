//! Minimal ISO 9660 navigation over any `Read + Seek` source.
//!
//! Just enough of the format to find a file by path, locate its
//! directory record for size patching, and measure the sector gap before
//! the next file. Malformed descriptors yield `None` rather than errors;
//! only I/O failures propagate.

use std::io::{Read, Seek, SeekFrom};

use crate::Result;

pub const SECTOR_SIZE: u64 = 2048;

/// The Primary Volume Descriptor sits at sector 16; its root directory
/// record starts 156 bytes in.
const PVD_SECTOR: u64 = 16;
const ROOT_RECORD_OFFSET: usize = 156;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEntry {
    pub lba: u32,
    pub size: u32,
    pub is_dir: bool,
}

/// A located file plus the byte budget available before the next file's
/// first sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLocation {
    pub lba: u32,
    pub size: u32,
    pub max_size: u64,
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

struct DirRecord {
    name: String,
    lba: u32,
    size: u32,
    is_dir: bool,
    /// Offset of the record within its directory extent.
    record_pos: usize,
}

/// Walk one directory extent, collecting named records. Zero-length
/// records mean "skip to the next sector boundary". The `.` / `..`
/// pseudo-entries (single-byte names 0 and 1) are dropped.
fn read_directory<R: Read + Seek>(
    reader: &mut R,
    dir_lba: u32,
    dir_size: u32,
) -> Result<Vec<DirRecord>> {
    reader.seek(SeekFrom::Start(dir_lba as u64 * SECTOR_SIZE))?;
    let mut data = vec![0u8; dir_size as usize];
    reader.read_exact(&mut data)?;

    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let rec_len = data[pos] as usize;
        if rec_len == 0 {
            let next_sector = (pos / SECTOR_SIZE as usize + 1) * SECTOR_SIZE as usize;
            if next_sector >= data.len() {
                break;
            }
            pos = next_sector;
            continue;
        }
        if pos + rec_len > data.len() || rec_len < 34 {
            break;
        }

        let name_len = data[pos + 32] as usize;
        if name_len > 0 && pos + 33 + name_len <= data.len() {
            let raw_name = &data[pos + 33..pos + 33 + name_len];
            if !(name_len == 1 && (raw_name[0] == 0 || raw_name[0] == 1)) {
                let name = String::from_utf8_lossy(raw_name)
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .to_ascii_uppercase();
                records.push(DirRecord {
                    name,
                    lba: read_u32_le(&data, pos + 2),
                    size: read_u32_le(&data, pos + 10),
                    is_dir: data[pos + 25] & 0x02 != 0,
                    record_pos: pos,
                });
            }
        }

        pos += rec_len;
    }

    Ok(records)
}

/// Root directory extent from the PVD, or `None` when this is not an
/// ISO 9660 image.
fn read_root<R: Read + Seek>(reader: &mut R) -> Result<Option<(u32, u32)>> {
    reader.seek(SeekFrom::Start(PVD_SECTOR * SECTOR_SIZE))?;
    let mut pvd = vec![0u8; SECTOR_SIZE as usize];
    if reader.read_exact(&mut pvd).is_err() {
        return Ok(None);
    }
    // Descriptor type 1 = primary; bytes 1..6 are "CD001".
    if pvd[0] != 1 || &pvd[1..6] != b"CD001" {
        return Ok(None);
    }
    let root = &pvd[ROOT_RECORD_OFFSET..ROOT_RECORD_OFFSET + 34];
    Ok(Some((read_u32_le(root, 2), read_u32_le(root, 10))))
}

/// Descend to the directory holding the last path component. Returns the
/// parent directory extent, or `None` when any component is missing or
/// is not a directory.
fn walk_to_parent<R: Read + Seek>(
    reader: &mut R,
    path: &[&str],
) -> Result<Option<(u32, u32)>> {
    let (mut lba, mut size) = match read_root(reader)? {
        Some(root) => root,
        None => return Ok(None),
    };

    for component in &path[..path.len() - 1] {
        let upper = component.to_ascii_uppercase();
        let records = read_directory(reader, lba, size)?;
        match records.iter().find(|r| r.name == upper) {
            Some(rec) if rec.is_dir => {
                lba = rec.lba;
                size = rec.size;
            }
            _ => return Ok(None),
        }
    }
    Ok(Some((lba, size)))
}

/// Find a file by path components, case-insensitive, `;1` version
/// suffixes stripped.
pub fn find_file<R: Read + Seek>(
    reader: &mut R,
    path: &[&str],
) -> Result<Option<FileEntry>> {
    if path.is_empty() {
        return Ok(None);
    }
    let (dir_lba, dir_size) = match walk_to_parent(reader, path)? {
        Some(dir) => dir,
        None => return Ok(None),
    };

    let target = path[path.len() - 1].to_ascii_uppercase();
    let records = read_directory(reader, dir_lba, dir_size)?;
    Ok(records.iter().find(|r| r.name == target).map(|r| FileEntry {
        lba: r.lba,
        size: r.size,
        is_dir: r.is_dir,
    }))
}

/// Read a file's bytes in full.
pub fn read_file<R: Read + Seek>(reader: &mut R, path: &[&str]) -> Result<Option<Vec<u8>>> {
    let entry = match find_file(reader, path)? {
        Some(e) if !e.is_dir => e,
        _ => return Ok(None),
    };
    reader.seek(SeekFrom::Start(entry.lba as u64 * SECTOR_SIZE))?;
    let mut buf = vec![0u8; entry.size as usize];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

/// Absolute byte offset of a file's directory record. Both stored size
/// fields live at fixed offsets within it: little-endian at +10,
/// big-endian at +14.
pub fn find_dir_record_offset<R: Read + Seek>(
    reader: &mut R,
    path: &[&str],
) -> Result<Option<u64>> {
    if path.is_empty() {
        return Ok(None);
    }
    let (dir_lba, dir_size) = match walk_to_parent(reader, path)? {
        Some(dir) => dir,
        None => return Ok(None),
    };

    let target = path[path.len() - 1].to_ascii_uppercase();
    let records = read_directory(reader, dir_lba, dir_size)?;
    Ok(records
        .iter()
        .find(|r| r.name == target)
        .map(|r| dir_lba as u64 * SECTOR_SIZE + r.record_pos as u64))
}

/// Find a file and the writable budget at its location: the sectors up
/// to the next file in the same directory, or the file's own
/// sector-aligned size when it is the last one.
pub fn find_file_with_gap<R: Read + Seek>(
    reader: &mut R,
    path: &[&str],
) -> Result<Option<FileLocation>> {
    if path.is_empty() {
        return Ok(None);
    }
    let (dir_lba, dir_size) = match walk_to_parent(reader, path)? {
        Some(dir) => dir,
        None => return Ok(None),
    };

    let target = path[path.len() - 1].to_ascii_uppercase();
    let mut records = read_directory(reader, dir_lba, dir_size)?;
    records.sort_by_key(|r| r.lba);

    for (i, rec) in records.iter().enumerate() {
        if rec.name != target {
            continue;
        }
        let max_size = match records.get(i + 1) {
            Some(next) if next.lba > rec.lba => {
                (next.lba - rec.lba) as u64 * SECTOR_SIZE
            }
            _ => (rec.size as u64).div_ceil(SECTOR_SIZE) * SECTOR_SIZE,
        };
        return Ok(Some(FileLocation {
            lba: rec.lba,
            size: rec.size,
            max_size,
        }));
    }
    Ok(None)
}
