//! NHL '94 SNES cartridge patcher.
//!
//! The SNES release stores the same roster data as the Genesis one but
//! little-endian and behind LoROM banking. A pointer table at ROM
//! address `$9CA5E7` (file offset `0xE25E7` on a headerless dump) holds
//! one 4-byte entry per team; only the low two bytes are used, the bank
//! is hardwired to `$9C`. A team block opens with a 2-byte LE header
//! size; player records follow the header as LE length-prefixed names
//! plus the same 8 stat bytes the Genesis cartridge uses. The roster
//! ends with the terminator `0x02 0x00` (an empty string).
//!
//! Dumps may carry a 512-byte SMC copier header, detected by
//! `size % 0x8000 == 512` and added to every file offset.

use log::{info, warn};

use crate::genesis::{self, GenPlayer};
use crate::roster::{self, Position, RosterOrder, SlotCapacity, TeamRoster};
use crate::{PatchError, PatchReport, PatchSettings, ProgressHandle, Result, TeamReport};

pub const TEAM_COUNT: usize = 28;

const POINTER_TABLE_FILE_OFFSET: usize = 0xE25E7;
const POINTER_SIZE: usize = 4;
const BANK: u32 = 0x9C;

const SMC_HEADER_SIZE: usize = 512;

/// Standard headerless dump size; expanded images are larger.
const ROM_SIZE_STANDARD: usize = 649_728;

const STATS_SIZE: usize = 8;

/// Byte within a team block holding the player counts: high nibble
/// forwards, low nibble defensemen. Goalies are always two and not
/// encoded.
const PLAYER_COUNT_OFFSET: usize = 17;

/// The 26 league slots plus the two All-Star teams.
pub const TEAM_ORDER: [&str; TEAM_COUNT] = [
    "Anaheim",
    "Boston",
    "Buffalo",
    "Calgary",
    "Chicago",
    "Dallas",
    "Detroit",
    "Edmonton",
    "Florida",
    "Hartford",
    "Los Angeles",
    "Montreal",
    "New Jersey",
    "NY Islanders",
    "NY Rangers",
    "Ottawa",
    "Philadelphia",
    "Pittsburgh",
    "Quebec",
    "San Jose",
    "St. Louis",
    "Tampa Bay",
    "Toronto",
    "Vancouver",
    "Washington",
    "Winnipeg",
    "All-Star East",
    "All-Star West",
];

/// Both cartridges carry the same 1993-94 league, so the slot table is
/// shared; the All-Star slots are never mapped.
pub fn team_slot(abbrev: &str) -> Option<usize> {
    genesis::team_slot(abbrev)
}

/// 512-byte copier header offset, or zero for a clean dump.
pub fn header_offset(rom: &[u8]) -> usize {
    if rom.len() % 0x8000 == SMC_HEADER_SIZE {
        SMC_HEADER_SIZE
    } else {
        0
    }
}

fn snes_to_file_offset(rom_addr: u32) -> usize {
    let section = ((rom_addr - 0x80_0000) >> 16) as usize;
    section * 0x8000 + (rom_addr as usize % 0x8000)
}

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn team_pointer(rom: &[u8], team: usize) -> Result<usize> {
    if team >= TEAM_COUNT {
        return Err(PatchError::IndexOutOfRange {
            table: "team pointer table".to_string(),
            index: team,
            capacity: TEAM_COUNT,
        });
    }
    let smc = header_offset(rom);
    let ptr_off = smc + POINTER_TABLE_FILE_OFFSET + team * POINTER_SIZE;
    if ptr_off + 2 > rom.len() {
        return Err(PatchError::InvalidContainer(
            "pointer table past end of image".to_string(),
        ));
    }
    let addr = (BANK << 16) | ((rom[ptr_off + 1] as u32) << 8) | rom[ptr_off] as u32;
    let file_off = smc + snes_to_file_offset(addr);
    if file_off + 2 > rom.len() {
        return Err(PatchError::InvalidContainer(format!(
            "team {} pointer ${:06X} past end of image",
            team, addr
        )));
    }
    Ok(file_off)
}

/// Goalie/forward/defense slot counts from the team header byte.
/// Implausible values fall back to the stock (2, 14, 7) layout.
pub fn team_player_counts(rom: &[u8], team: usize) -> (usize, usize, usize) {
    const DEFAULT: (usize, usize, usize) = (2, 14, 7);
    let base = match team_pointer(rom, team) {
        Ok(base) => base,
        Err(_) => return DEFAULT,
    };
    let count_off = base + PLAYER_COUNT_OFFSET;
    if count_off >= rom.len() {
        return DEFAULT;
    }
    let forwards = (rom[count_off] >> 4) as usize;
    let defense = (rom[count_off] & 0x0F) as usize;
    if forwards < 3 || defense < 2 {
        return DEFAULT;
    }
    (2, forwards, defense)
}

fn player_records_start(rom: &[u8], team_base: usize) -> usize {
    team_base + read_u16_le(rom, team_base) as usize
}

/// File offset and byte length of a team's player region, terminator
/// included.
pub fn team_player_region(rom: &[u8], team: usize) -> Result<(usize, usize)> {
    let base = team_pointer(rom, team)?;
    let start = player_records_start(rom, base);
    let mut offset = start;

    while offset + 2 <= rom.len() {
        let length = read_u16_le(rom, offset) as usize;
        if length < 3 {
            offset += 2;
            return Ok((start, offset - start));
        }
        if offset + length + STATS_SIZE > rom.len() {
            return Err(PatchError::CorruptBlock(format!(
                "team {} player record at 0x{:X} runs past end of image",
                team, offset
            )));
        }
        offset += length + STATS_SIZE;
    }

    Err(PatchError::CorruptBlock(format!(
        "team {} player region has no terminator",
        team
    )))
}

/// Player names and raw stat bytes currently in a team slot.
pub fn read_team_roster(rom: &[u8], team: usize) -> Result<Vec<(String, [u8; STATS_SIZE])>> {
    let (start, len) = team_player_region(rom, team)?;
    let mut offset = start;
    let end = start + len;
    let mut players = Vec::new();

    while offset + 2 <= end {
        let length = read_u16_le(rom, offset) as usize;
        if length < 3 {
            break;
        }
        let name = String::from_utf8_lossy(&rom[offset + 2..offset + length])
            .trim_end_matches('\0')
            .to_string();
        offset += length;
        let mut stats = [0u8; STATS_SIZE];
        stats.copy_from_slice(&rom[offset..offset + STATS_SIZE]);
        offset += STATS_SIZE;
        players.push((name, stats));
    }

    Ok(players)
}

/// Write a team's player records in place with LE lengths and the
/// `0x02 0x00` terminator, zero-filling to the region end. Returns how
/// many players fit.
pub fn write_team_region(rom: &mut [u8], team: usize, players: &[GenPlayer]) -> Result<usize> {
    let (start, region_len) = team_player_region(rom, team)?;
    let end = start + region_len;
    let mut offset = start;
    let mut written = 0;

    for player in players {
        let max_name_len = (end - offset).saturating_sub(2 + STATS_SIZE + 2);
        if max_name_len < 1 {
            break;
        }

        let name_bytes: Vec<u8> = player
            .name
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .take(max_name_len)
            .collect();

        let total_len = (name_bytes.len() + 2) as u16;
        rom[offset..offset + 2].copy_from_slice(&total_len.to_le_bytes());
        offset += 2;
        rom[offset..offset + name_bytes.len()].copy_from_slice(&name_bytes);
        offset += name_bytes.len();
        rom[offset..offset + STATS_SIZE].copy_from_slice(&genesis::encode_stats(player));
        offset += STATS_SIZE;
        written += 1;
    }

    rom[offset] = 0x02;
    rom[offset + 1] = 0x00;
    offset += 2;
    rom[offset..end].fill(0);

    Ok(written)
}

/// Refresh the counts byte for the players actually written.
pub fn write_team_counts(
    rom: &mut [u8],
    team: usize,
    forwards: usize,
    defense: usize,
) -> Result<()> {
    let base = team_pointer(rom, team)?;
    let count_off = base + PLAYER_COUNT_OFFSET;
    if count_off >= rom.len() {
        return Err(PatchError::CorruptBlock(format!(
            "team {} counts byte past end of image",
            team
        )));
    }
    rom[count_off] = ((forwards.min(15) << 4) | defense.min(15)) as u8;
    Ok(())
}

/// Fast validation checks the stripped size and first pointer; deep
/// validation parses every team's player region.
pub fn validate(rom: &[u8], deep: bool) -> bool {
    let stripped = rom.len() - header_offset(rom);
    if stripped < ROM_SIZE_STANDARD {
        return false;
    }
    if team_pointer(rom, 0).is_err() {
        return false;
    }
    if !deep {
        return true;
    }
    (0..TEAM_COUNT).all(|team| match team_player_region(rom, team) {
        Ok((_, len)) => len >= 2,
        Err(_) => false,
    })
}

const LINE_SLOTS: [Position; 3] = [Position::LW, Position::C, Position::RW];

pub fn patch(
    settings: &PatchSettings,
    rosters: &[TeamRoster],
    progress: &ProgressHandle,
) -> Result<PatchReport> {
    progress.set(0.0, "validating image");
    let mut rom = std::fs::read(&settings.input_path)?;
    if !validate(&rom, false) {
        return Err(PatchError::InvalidContainer(
            "not an NHL '94 SNES image".to_string(),
        ));
    }
    if header_offset(&rom) != 0 {
        info!("SMC copier header detected");
    }

    let mut report = PatchReport::default();
    let total = rosters.len().max(1);

    for (i, team) in rosters.iter().enumerate() {
        progress.check_cancelled()?;
        progress.set(
            i as f32 / total as f32,
            &format!("writing {}", team.team),
        );

        let slot = match team_slot(&team.team) {
            Some(slot) => slot,
            None => {
                warn!("no cartridge slot for team {}, skipping", team.team);
                continue;
            }
        };

        // Capacity comes from the slot being replaced; the line table
        // in the team header references players by absolute index and
        // assumes the goalies-first stream order.
        let (goalies, forwards, defense) = team_player_counts(&rom, slot);
        let selected = roster::select_roster(
            &team.players,
            SlotCapacity {
                goalies,
                forwards,
                defense,
            },
            RosterOrder::GoaliesFirst,
            LINE_SLOTS,
        );
        let records: Vec<GenPlayer> = selected.players.iter().map(genesis::map_player).collect();
        let written = write_team_region(&mut rom, slot, &records)?;

        let in_region = &selected.players[..written.min(selected.players.len())];
        let f_written = in_region.iter().filter(|p| p.position.is_forward()).count();
        let d_written = in_region.iter().filter(|p| p.position == Position::D).count();
        write_team_counts(&mut rom, slot, f_written, d_written)?;

        info!(
            "team {} -> slot {} ({}): {} players",
            team.team, slot, TEAM_ORDER[slot], written
        );
        report.push_team(TeamReport {
            slot,
            name: TEAM_ORDER[slot].to_string(),
            players_written: written,
            goalies: in_region.iter().filter(|p| p.position.is_goalie()).count(),
            forwards: f_written,
            defense: d_written,
        });
    }

    progress.set(1.0, "saving image");
    std::fs::write(&settings.output_path, &rom)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::test_support::full_squad;

    // Low two pointer bytes for the synthetic team block; bank $9C puts
    // the block at file offset 0x1C * 0x8000 + 0x0100.
    const TEAM_PTR: u16 = 0x8100;
    const TEAM_FILE_OFFSET: usize = 0x1C * 0x8000 + 0x0100;
    const TEAM_HEADER_SIZE: u16 = 0x20;

    fn push_record(rom: &mut [u8], at: &mut usize, name: &str, stats: [u8; 8]) {
        let len = (name.len() + 2) as u16;
        rom[*at..*at + 2].copy_from_slice(&len.to_le_bytes());
        rom[*at + 2..*at + 2 + name.len()].copy_from_slice(name.as_bytes());
        *at += len as usize;
        rom[*at..*at + 8].copy_from_slice(&stats);
        *at += 8;
    }

    fn build_test_rom(region_players: usize, smc_header: bool) -> Vec<u8> {
        let smc = if smc_header { SMC_HEADER_SIZE } else { 0 };
        // Expanded 1 MB image so the pointer table offset is in range.
        let mut rom = vec![0u8; 0x100000 + smc];

        for team in 0..TEAM_COUNT {
            let off = smc + POINTER_TABLE_FILE_OFFSET + team * POINTER_SIZE;
            rom[off..off + 2].copy_from_slice(&TEAM_PTR.to_le_bytes());
        }

        let base = smc + TEAM_FILE_OFFSET;
        rom[base..base + 2].copy_from_slice(&TEAM_HEADER_SIZE.to_le_bytes());
        // Counts byte: 12 forwards, 6 defensemen.
        rom[base + PLAYER_COUNT_OFFSET] = 0xC6;

        let mut at = base + TEAM_HEADER_SIZE as usize;
        for i in 0..region_players {
            push_record(&mut rom, &mut at, &format!("PLACEHOLDER {:02}", i), [0x22; 8]);
        }
        rom[at] = 0x02;
        rom[at + 1] = 0x00;

        rom
    }

    #[test]
    fn header_detection_follows_size_remainder() {
        assert_eq!(header_offset(&build_test_rom(1, false)), 0);
        assert_eq!(header_offset(&build_test_rom(1, true)), SMC_HEADER_SIZE);
    }

    #[test]
    fn region_scan_honors_smc_header() {
        for smc in [false, true] {
            let rom = build_test_rom(2, smc);
            let (start, len) = team_player_region(&rom, 0).unwrap();
            let smc_off = if smc { SMC_HEADER_SIZE } else { 0 };
            assert_eq!(start, smc_off + TEAM_FILE_OFFSET + TEAM_HEADER_SIZE as usize);
            assert_eq!(len, 2 * 24 + 2);
        }
    }

    #[test]
    fn counts_byte_reads_with_fallback() {
        let mut rom = build_test_rom(1, false);
        assert_eq!(team_player_counts(&rom, 0), (2, 12, 6));

        // Garbage counts fall back to the stock layout.
        let base = TEAM_FILE_OFFSET;
        rom[base + PLAYER_COUNT_OFFSET] = 0x01;
        assert_eq!(team_player_counts(&rom, 0), (2, 14, 7));
    }

    #[test]
    fn roster_round_trips_little_endian_lengths() {
        let mut rom = build_test_rom(3, false);
        let squad = full_squad();
        let selected = roster::select_roster(
            &squad,
            SlotCapacity {
                goalies: 2,
                forwards: 12,
                defense: 6,
            },
            RosterOrder::GoaliesFirst,
            LINE_SLOTS,
        );
        let records: Vec<GenPlayer> =
            selected.players.iter().map(genesis::map_player).collect();
        let written = write_team_region(&mut rom, 0, &records).unwrap();
        assert!(written >= 2);

        let read_back = read_team_roster(&rom, 0).unwrap();
        assert_eq!(read_back.len(), written);
        // Goalies lead the stream on this cartridge.
        assert!(read_back[0].0.starts_with('G'));
        assert_eq!(read_back[0].0, records[0].name);
    }

    #[test]
    fn counts_byte_refresh() {
        let mut rom = build_test_rom(1, false);
        write_team_counts(&mut rom, 0, 11, 5).unwrap();
        assert_eq!(team_player_counts(&rom, 0), (2, 11, 5));
    }

    #[test]
    fn validate_checks_stripped_size_and_regions() {
        assert!(!validate(&vec![0u8; 0x8000], false));
        let rom = build_test_rom(1, false);
        assert!(validate(&rom, true));
        let headered = build_test_rom(1, true);
        assert!(validate(&headered, true));
    }

    #[test]
    fn all_star_slots_are_never_mapped() {
        assert_eq!(team_slot("BOS"), Some(1));
        assert!(TEAM_ORDER[26].starts_with("All-Star"));
        assert_eq!(team_slot("ASE"), None);
        assert_eq!(team_slot("ASW"), None);
    }
}
