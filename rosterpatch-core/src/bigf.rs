//! BIGF archive codec.
//!
//! The container used for `DB.VIV`: a 16-byte header (`BIGF`, total size,
//! file count, header size), then one directory entry per file of
//! big-endian offset + size followed by a NUL-terminated name, then the
//! file data blocks. Oddly the total size is little-endian while the
//! count and header size are big-endian; the retail archives really are
//! laid out that way.

use crate::{PatchError, Result};

pub const MAGIC: &[u8; 4] = b"BIGF";

/// Data blocks are aligned to 128 bytes when an archive is rebuilt.
const DATA_ALIGN: usize = 128;

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    /// Byte offset of this entry's directory record within the archive.
    pub dir_pos: usize,
}

fn read_u32_be(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub fn parse(archive: &[u8]) -> Result<Vec<Entry>> {
    if archive.len() < 16 || &archive[..4] != MAGIC {
        return Err(PatchError::InvalidContainer(
            "missing BIGF magic".to_string(),
        ));
    }

    let num_files = read_u32_be(archive, 8) as usize;
    let mut entries = Vec::with_capacity(num_files);
    let mut pos = 16usize;

    for _ in 0..num_files {
        if pos + 8 > archive.len() {
            return Err(PatchError::InvalidContainer(
                "BIGF directory truncated".to_string(),
            ));
        }
        let dir_pos = pos;
        let offset = read_u32_be(archive, pos) as usize;
        let size = read_u32_be(archive, pos + 4) as usize;
        pos += 8;

        let name_start = pos;
        while pos < archive.len() && archive[pos] != 0 {
            pos += 1;
        }
        if pos >= archive.len() {
            return Err(PatchError::InvalidContainer(
                "unterminated BIGF entry name".to_string(),
            ));
        }
        let name = String::from_utf8_lossy(&archive[name_start..pos]).into_owned();
        pos += 1;

        if offset.checked_add(size).map_or(true, |end| end > archive.len()) {
            return Err(PatchError::InvalidContainer(format!(
                "BIGF entry '{}' range {}+{} exceeds archive of {} bytes",
                name,
                offset,
                size,
                archive.len()
            )));
        }

        entries.push(Entry {
            name,
            offset,
            size,
            dir_pos,
        });
    }

    Ok(entries)
}

fn find_entry<'a>(entries: &'a [Entry], name: &str) -> Option<&'a Entry> {
    entries.iter().find(|e| e.name.eq_ignore_ascii_case(name))
}

/// Extract a file's bytes by name (case-insensitive).
pub fn extract(archive: &[u8], name: &str) -> Result<Vec<u8>> {
    let entries = parse(archive)?;
    let entry = find_entry(&entries, name)
        .ok_or_else(|| PatchError::MissingEntry(name.to_string()))?;
    Ok(archive[entry.offset..entry.offset + entry.size].to_vec())
}

/// Overwrite a file's data at its original offset, zero-padding the
/// remainder of the allocation. Sibling offsets never move and the
/// directory keeps the original size, so the surrounding container is
/// byte-identical apart from the payload itself. Fails without touching
/// the archive when the new data does not fit.
pub fn replace_in_place(archive: &mut [u8], name: &str, new_data: &[u8]) -> Result<()> {
    let entries = parse(archive)?;
    let entry = find_entry(&entries, name)
        .ok_or_else(|| PatchError::MissingEntry(name.to_string()))?;

    if new_data.len() > entry.size {
        return Err(PatchError::EntryTooLarge {
            name: entry.name.clone(),
            new_len: new_data.len(),
            available: entry.size,
        });
    }

    archive[entry.offset..entry.offset + new_data.len()].copy_from_slice(new_data);
    archive[entry.offset + new_data.len()..entry.offset + entry.size].fill(0);
    Ok(())
}

/// Rebuild a whole archive, replacing one member. All other members are
/// carried over byte-for-byte; data blocks land on 128-byte boundaries.
/// Used only when a member outgrows its in-place allocation, since the
/// resulting archive usually differs in size from the original.
pub fn rebuild_with(archive: &[u8], name: &str, new_data: &[u8]) -> Result<Vec<u8>> {
    let entries = parse(archive)?;
    if find_entry(&entries, name).is_none() {
        return Err(PatchError::MissingEntry(name.to_string()));
    }

    let mut header_size = 16usize;
    for entry in &entries {
        header_size += 8 + entry.name.len() + 1;
    }

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[0u8; 12]);

    let contents: Vec<&[u8]> = entries
        .iter()
        .map(|e| {
            if e.name.eq_ignore_ascii_case(name) {
                new_data
            } else {
                &archive[e.offset..e.offset + e.size]
            }
        })
        .collect();

    let mut dir_positions = Vec::with_capacity(entries.len());
    for (entry, data) in entries.iter().zip(&contents) {
        dir_positions.push(out.len());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(entry.name.as_bytes());
        out.push(0);
    }

    let pad = (DATA_ALIGN - out.len() % DATA_ALIGN) % DATA_ALIGN;
    out.resize(out.len() + pad, 0);

    for (i, data) in contents.iter().enumerate() {
        let file_offset = out.len() as u32;
        out.extend_from_slice(data);
        out[dir_positions[i]..dir_positions[i] + 4]
            .copy_from_slice(&file_offset.to_be_bytes());
        if i + 1 < contents.len() {
            let pad = (DATA_ALIGN - out.len() % DATA_ALIGN) % DATA_ALIGN;
            out.resize(out.len() + pad, 0);
        }
    }

    let total = out.len() as u32;
    out[4..8].copy_from_slice(&total.to_le_bytes());
    out[8..12].copy_from_slice(&(entries.len() as u32).to_be_bytes());
    out[12..16].copy_from_slice(&(header_size as u32).to_be_bytes());

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_test_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut header_size = 16;
        for (name, _) in files {
            header_size += 8 + name.len() + 1;
        }

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&[0u8; 12]);

        let mut dir_positions = Vec::new();
        for (name, data) in files {
            dir_positions.push(out.len());
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }

        for (i, (_, data)) in files.iter().enumerate() {
            let off = out.len() as u32;
            out.extend_from_slice(data);
            out[dir_positions[i]..dir_positions[i] + 4]
                .copy_from_slice(&off.to_be_bytes());
        }

        let total = out.len() as u32;
        out[4..8].copy_from_slice(&total.to_le_bytes());
        out[8..12].copy_from_slice(&(files.len() as u32).to_be_bytes());
        out[12..16].copy_from_slice(&(header_size as u32).to_be_bytes());
        out
    }

    #[test]
    fn parse_reads_all_entries() {
        let archive = build_test_archive(&[("a.tdb", b"AAAA"), ("b.tdb", b"BBBBBB")]);
        let entries = parse(&archive).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.tdb");
        assert_eq!(entries[0].size, 4);
        assert_eq!(entries[1].name, "b.tdb");
        assert_eq!(entries[1].size, 6);
    }

    #[test]
    fn parse_rejects_bad_magic() {
        assert!(parse(b"NOTBIGF something").is_err());
    }

    #[test]
    fn parse_rejects_out_of_range_entry() {
        let mut archive = build_test_archive(&[("a.tdb", b"AAAA")]);
        // Corrupt the entry size to run past the archive end.
        let entries = parse(&archive).unwrap();
        let dir_pos = entries[0].dir_pos;
        archive[dir_pos + 4..dir_pos + 8].copy_from_slice(&0xFFFFu32.to_be_bytes());
        assert!(parse(&archive).is_err());
    }

    #[test]
    fn extract_is_case_insensitive() {
        let archive = build_test_archive(&[("NHL2007.TDB", b"payload")]);
        assert_eq!(extract(&archive, "nhl2007.tdb").unwrap(), b"payload");
        assert!(matches!(
            extract(&archive, "missing.tdb"),
            Err(PatchError::MissingEntry(_))
        ));
    }

    #[test]
    fn replace_in_place_keeps_siblings_and_pads() {
        let archive = build_test_archive(&[("a.tdb", b"AAAAAA"), ("b.tdb", b"BBBB")]);
        let mut patched = archive.clone();
        replace_in_place(&mut patched, "a.tdb", b"XY").unwrap();

        let entries = parse(&patched).unwrap();
        assert_eq!(
            &patched[entries[0].offset..entries[0].offset + 6],
            b"XY\x00\x00\x00\x00"
        );
        // Sibling bytes and every directory field are untouched.
        assert_eq!(
            &patched[entries[1].offset..entries[1].offset + 4],
            b"BBBB"
        );
        assert_eq!(entries[1].offset, parse(&archive).unwrap()[1].offset);
    }

    #[test]
    fn replace_in_place_oversize_fails_without_mutation() {
        let archive = build_test_archive(&[("a.tdb", b"AAAA")]);
        let mut patched = archive.clone();
        let err = replace_in_place(&mut patched, "a.tdb", b"TOO LARGE DATA").unwrap_err();
        assert!(matches!(err, PatchError::EntryTooLarge { .. }));
        assert_eq!(patched, archive);
    }

    #[test]
    fn rebuild_aligns_data_and_preserves_other_members() {
        let archive = build_test_archive(&[("a.tdb", b"AAAA"), ("b.tdb", b"BBBB")]);
        let rebuilt = rebuild_with(&archive, "a.tdb", &vec![0x55u8; 300]).unwrap();

        let entries = parse(&rebuilt).unwrap();
        assert_eq!(entries[0].size, 300);
        assert_eq!(entries[0].offset % 128, 0);
        assert_eq!(entries[1].offset % 128, 0);
        assert_eq!(extract(&rebuilt, "b.tdb").unwrap(), b"BBBB");
        assert_eq!(extract(&rebuilt, "a.tdb").unwrap(), vec![0x55u8; 300]);
    }
}
