//! RefPack (QFS) block compression, as used by the EA archive stack.
//!
//! Stream layout: `0x10 0xFB` magic, 3-byte big-endian decompressed size,
//! then a command stream. Commands are 2, 3 or 4 bytes for back-reference
//! copies (each carrying 0-3 attached literals), `0xE0..=0xFB` for bulk
//! literal runs in multiples of 4, and `0xFC..=0xFF` as the stop code with
//! 0-3 trailing literals.

use crate::{PatchError, Result};

const MAGIC: [u8; 2] = [0x10, 0xFB];

// Match-finder limits. Offsets above 0x20000 and lengths above 1028 are
// not representable in any command form.
const MAX_OFFSET: usize = 0x20000;
const MAX_MATCH: usize = 1028;
const MAX_CHAIN: usize = 128;
const HASH_BITS: u32 = 16;
const HASH_SIZE: usize = 1 << HASH_BITS;

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 5 || data[0] != MAGIC[0] || data[1] != MAGIC[1] {
        return Err(PatchError::CorruptBlock(
            "missing RefPack 0x10 0xFB header".to_string(),
        ));
    }

    let expected =
        ((data[2] as usize) << 16) | ((data[3] as usize) << 8) | data[4] as usize;
    let mut out: Vec<u8> = Vec::with_capacity(expected);
    let mut pos = 5usize;

    while pos < data.len() {
        let b0 = data[pos];
        let num_literal;
        let num_copy;
        let copy_offset;

        if b0 < 0x80 {
            // 2-byte command
            if pos + 2 > data.len() {
                return Err(PatchError::CorruptBlock(
                    "truncated 2-byte copy command".to_string(),
                ));
            }
            let b1 = data[pos + 1] as usize;
            pos += 2;
            num_literal = (b0 & 0x03) as usize;
            num_copy = (((b0 & 0x1C) >> 2) + 3) as usize;
            copy_offset = (((b0 as usize & 0x60) << 3) | b1) + 1;
        } else if b0 < 0xC0 {
            // 3-byte command
            if pos + 3 > data.len() {
                return Err(PatchError::CorruptBlock(
                    "truncated 3-byte copy command".to_string(),
                ));
            }
            let b1 = data[pos + 1] as usize;
            let b2 = data[pos + 2] as usize;
            pos += 3;
            num_literal = (b1 & 0xC0) >> 6;
            num_copy = (b0 as usize & 0x3F) + 4;
            copy_offset = ((b1 & 0x3F) << 8) + b2 + 1;
        } else if b0 < 0xE0 {
            // 4-byte command
            if pos + 4 > data.len() {
                return Err(PatchError::CorruptBlock(
                    "truncated 4-byte copy command".to_string(),
                ));
            }
            let b1 = data[pos + 1] as usize;
            let b2 = data[pos + 2] as usize;
            let b3 = data[pos + 3] as usize;
            pos += 4;
            num_literal = (b0 & 0x03) as usize;
            num_copy = ((b0 as usize & 0x0C) << 6) + b3 + 5;
            copy_offset = ((b0 as usize & 0x10) << 12) + (b1 << 8) + b2 + 1;
        } else if b0 < 0xFC {
            // Bulk literal run, length a multiple of 4
            num_literal = (((b0 & 0x1F) as usize) << 2) + 4;
            num_copy = 0;
            copy_offset = 0;
            pos += 1;
        } else {
            // Stop code with 0-3 trailing literals
            num_literal = (b0 & 0x03) as usize;
            num_copy = 0;
            copy_offset = 0;
            pos += 1;
        }

        if num_literal > 0 {
            if pos + num_literal > data.len() {
                return Err(PatchError::CorruptBlock(
                    "literal run extends past end of stream".to_string(),
                ));
            }
            out.extend_from_slice(&data[pos..pos + num_literal]);
            pos += num_literal;
        }

        if num_copy > 0 {
            if copy_offset > out.len() {
                return Err(PatchError::CorruptBlock(format!(
                    "back-reference offset {} before start of output (have {})",
                    copy_offset,
                    out.len()
                )));
            }
            // Overlapping copies are legal; copy byte by byte.
            let mut src = out.len() - copy_offset;
            for _ in 0..num_copy {
                let b = out[src];
                out.push(b);
                src += 1;
            }
        }

        if b0 >= 0xFC {
            break;
        }
    }

    out.truncate(expected);
    Ok(out)
}

/// True when a match of this length/offset fits in some command form.
fn is_encodable(length: usize, offset: usize) -> bool {
    if length <= 10 && offset <= 1024 {
        return true;
    }
    if (4..=67).contains(&length) && offset <= 16384 {
        return true;
    }
    (5..=MAX_MATCH).contains(&length) && offset <= MAX_OFFSET
}

fn emit_copy(out: &mut Vec<u8>, literals: &[u8], length: usize, offset: usize) {
    let nl = literals.len();
    debug_assert!(nl <= 3);

    if length <= 10 && offset <= 1024 {
        let b0 = (nl as u8)
            | ((((length - 3) & 0x07) as u8) << 2)
            | ((((offset - 1) >> 3) & 0x60) as u8);
        out.push(b0);
        out.push(((offset - 1) & 0xFF) as u8);
    } else if length <= 67 && offset <= 16384 {
        out.push(0x80 | ((length - 4) & 0x3F) as u8);
        out.push(((nl as u8) << 6) | (((offset - 1) >> 8) & 0x3F) as u8);
        out.push(((offset - 1) & 0xFF) as u8);
    } else {
        let b0 = 0xC0
            | nl as u8
            | ((((length - 5) >> 6) & 0x0C) as u8)
            | ((((offset - 1) >> 12) & 0x10) as u8);
        out.push(b0);
        out.push((((offset - 1) >> 8) & 0xFF) as u8);
        out.push(((offset - 1) & 0xFF) as u8);
        out.push(((length - 5) & 0xFF) as u8);
    }

    out.extend_from_slice(literals);
}

/// Flush bulk literal runs, keeping 0-3 pending bytes for the next copy
/// or stop command. Returns the new run start.
fn flush_literals(out: &mut Vec<u8>, data: &[u8], mut lit_start: usize, pos: usize) -> usize {
    while pos - lit_start > 3 {
        let mut chunk = (pos - lit_start).min(112);
        chunk &= !3;
        if chunk < 4 {
            break;
        }
        out.push(0xE0 + ((chunk - 4) >> 2) as u8);
        out.extend_from_slice(&data[lit_start..lit_start + chunk]);
        lit_start += chunk;
    }
    lit_start
}

struct MatchFinder<'a> {
    data: &'a [u8],
    head: Vec<i32>,
    chain: Vec<i32>,
    inserted: Vec<bool>,
}

impl<'a> MatchFinder<'a> {
    fn new(data: &'a [u8]) -> Self {
        MatchFinder {
            data,
            head: vec![-1; HASH_SIZE],
            chain: vec![-1; data.len()],
            inserted: vec![false; data.len()],
        }
    }

    fn hash(&self, p: usize) -> usize {
        let d = self.data;
        (((d[p] as usize) << 8) ^ ((d[p + 1] as usize) << 4) ^ d[p + 2] as usize)
            & (HASH_SIZE - 1)
    }

    fn insert(&mut self, p: usize) {
        if p + 2 >= self.data.len() || self.inserted[p] {
            return;
        }
        self.inserted[p] = true;
        let h = self.hash(p);
        self.chain[p] = self.head[h];
        self.head[h] = p as i32;
    }

    /// Longest match at `p` over the hash chain. Returns (offset, length),
    /// or (0, 0) when nothing of length 3+ exists.
    fn find(&self, p: usize) -> (usize, usize) {
        let data = self.data;
        let size = data.len();
        if p + 2 >= size {
            return (0, 0);
        }

        let mut cand = self.head[self.hash(p)];
        let mut best_len = 2usize;
        let mut best_off = 0usize;
        let mut depth = 0usize;

        while cand >= 0 && depth < MAX_CHAIN {
            let c = cand as usize;
            let off = p - c;
            if off > MAX_OFFSET {
                break;
            }
            if data[c] == data[p] && data[c + 1] == data[p + 1] && data[c + 2] == data[p + 2] {
                let limit = MAX_MATCH.min(size - p);
                let mut ml = 3usize;
                while ml < limit && data[c + ml] == data[p + ml] {
                    ml += 1;
                }
                if ml > best_len {
                    best_len = ml;
                    best_off = off;
                    if ml >= MAX_MATCH {
                        break;
                    }
                }
            }
            cand = self.chain[c];
            depth += 1;
        }

        if best_len < 3 {
            (0, 0)
        } else {
            (best_off, best_len)
        }
    }
}

/// Compress with hash-chain LZ77 and lazy match evaluation. Always
/// succeeds; the worst case degrades to literal runs.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let size = data.len();
    let mut out = Vec::with_capacity(size / 2 + 16);

    out.extend_from_slice(&MAGIC);
    out.push(((size >> 16) & 0xFF) as u8);
    out.push(((size >> 8) & 0xFF) as u8);
    out.push((size & 0xFF) as u8);

    if size == 0 {
        out.push(0xFC);
        return out;
    }

    let mut finder = MatchFinder::new(data);
    let mut pos = 0usize;
    let mut lit_start = 0usize;

    while pos < size {
        let (offset, length) = finder.find(pos);

        if length < 3 || !is_encodable(length, offset) {
            finder.insert(pos);
            pos += 1;
            continue;
        }

        // Lazy matching: if the next position holds a strictly better
        // match, take the current byte as a literal instead.
        if length < MAX_MATCH && pos + 3 < size {
            finder.insert(pos);
            let (next_off, next_len) = finder.find(pos + 1);
            if next_len > length + 1 && is_encodable(next_len, next_off) {
                pos += 1;
                continue;
            }
        }

        lit_start = flush_literals(&mut out, data, lit_start, pos);
        emit_copy(&mut out, &data[lit_start..pos], length, offset);

        let insert_end = (pos + length).min(size.saturating_sub(2));
        for i in pos..insert_end {
            finder.insert(i);
        }
        pos += length;
        lit_start = pos;
    }

    lit_start = flush_literals(&mut out, data, lit_start, size);

    let trail = size - lit_start;
    out.push(0xFC + trail as u8);
    out.extend_from_slice(&data[lit_start..]);

    out
}
