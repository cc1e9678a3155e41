//! NHL '94 Sega Genesis cartridge patcher.
//!
//! The ROM is a flat big-endian (68000) image. A pointer table at
//! `0x030E` holds one absolute 4-byte address per team; each team block
//! opens with six 2-byte section offsets relative to the block base
//! (player records, palettes, strings, lines, ratings, goalie counts).
//! Player records are variable length: a 2-byte BE length word that
//! includes itself, the ASCII name, then 8 stat bytes (BCD jersey + 7
//! nibble-packed attribute bytes). A length word below 3 ends the
//! roster.
//!
//! Everything is patched in place so no pointer ever moves. After the
//! roster writes the header checksum at `0x18E` is recomputed and the
//! in-ROM verification routine is stubbed with RTS so edited images
//! still boot on hardware that checks either.

use log::{debug, info, warn};

use crate::roster::{
    self, FetchedPlayer, Handedness, Position, RosterOrder, SelectedRoster, SlotCapacity,
    TeamRoster, UnitAssignments,
};
use crate::scale::scale;
use crate::{PatchError, PatchReport, PatchSettings, ProgressHandle, Result, TeamReport};

pub const TEAM_COUNT: usize = 26;

const POINTER_TABLE_OFFSET: usize = 0x030E;
const POINTER_SIZE: usize = 4;

/// Jersey BCD byte plus 7 attribute bytes.
const STATS_SIZE: usize = 8;

/// Original cartridge size; expanded dumps are larger.
const ROM_SIZE_STANDARD: usize = 0x100000;

/// Start of the word-sum region for the header checksum at 0x18E.
const CHECKSUM_DATA_START: usize = 0x200;
const CHECKSUM_OFFSET: usize = 0x18E;

/// The checksum verification routine starts at this even address.
/// Overwriting its first word with RTS (0x4E75) makes it return
/// immediately.
const CHECKSUM_BYPASS_OFFSET: usize = 0x0FFACA;

/// Team order of the 26 cartridge slots, 1993-94 season.
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
];

/// Modern team abbreviation to cartridge slot, including provider
/// variants and relocated franchises (Carolina lands on Hartford,
/// Colorado on Quebec). Expansion teams without a 1994 slot return
/// `None`.
pub fn team_slot(abbrev: &str) -> Option<usize> {
    let slot = match abbrev.to_ascii_uppercase().as_str() {
        "ANA" => 0,
        "BOS" => 1,
        "BUF" => 2,
        "CGY" => 3,
        "CHI" => 4,
        "DAL" => 5,
        "DET" => 6,
        "EDM" => 7,
        "FLA" => 8,
        "CAR" => 9,
        "LAK" | "LA" => 10,
        "MTL" => 11,
        "NJD" | "NJ" => 12,
        "NYI" => 13,
        "NYR" => 14,
        "OTT" => 15,
        "PHI" => 16,
        "PIT" => 17,
        "COL" => 18,
        "SJS" | "SJ" => 19,
        "STL" => 20,
        "TBL" | "TB" => 21,
        "TOR" => 22,
        "VAN" => 23,
        "WSH" => 24,
        "WPG" => 25,
        _ => return None,
    };
    Some(slot)
}

/// Absolute file offsets of a team block's six sections.
#[derive(Debug, Clone, Copy)]
pub struct SectionOffsets {
    pub players: usize,
    pub palettes: usize,
    pub strings: usize,
    pub lines: usize,
    pub ratings: usize,
    pub goalies: usize,
}

fn read_u16_be(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn write_u16_be(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn team_pointer(rom: &[u8], team: usize) -> Result<usize> {
    if team >= TEAM_COUNT {
        return Err(PatchError::IndexOutOfRange {
            table: "team pointer table".to_string(),
            index: team,
            capacity: TEAM_COUNT,
        });
    }
    let ptr_off = POINTER_TABLE_OFFSET + team * POINTER_SIZE;
    if ptr_off + POINTER_SIZE > rom.len() {
        return Err(PatchError::InvalidContainer(
            "pointer table past end of image".to_string(),
        ));
    }
    let addr = u32::from_be_bytes([
        rom[ptr_off],
        rom[ptr_off + 1],
        rom[ptr_off + 2],
        rom[ptr_off + 3],
    ]) as usize;
    // File offset equals the 68000 address, no banking on Genesis.
    if addr + 0x0C > rom.len() {
        return Err(PatchError::InvalidContainer(format!(
            "team {} pointer 0x{:X} past end of image",
            team, addr
        )));
    }
    Ok(addr)
}

pub fn section_offsets(rom: &[u8], team: usize) -> Result<SectionOffsets> {
    let base = team_pointer(rom, team)?;
    Ok(SectionOffsets {
        players: base + read_u16_be(rom, base) as usize,
        palettes: base + read_u16_be(rom, base + 2) as usize,
        strings: base + read_u16_be(rom, base + 4) as usize,
        lines: base + read_u16_be(rom, base + 6) as usize,
        ratings: base + read_u16_be(rom, base + 8) as usize,
        goalies: base + read_u16_be(rom, base + 0xA) as usize,
    })
}

/// File offset and byte length of a team's player region, sentinel
/// included. The length is what an in-place rewrite has to fit in.
pub fn team_player_region(rom: &[u8], team: usize) -> Result<(usize, usize)> {
    let start = section_offsets(rom, team)?.players;
    let mut offset = start;

    while offset + 2 <= rom.len() {
        let length = read_u16_be(rom, offset) as usize;
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
        "team {} player region has no sentinel",
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
        let length = read_u16_be(rom, offset) as usize;
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

/// Attribute block on the cartridge's 0-6 nibble scale.
#[derive(Debug, Clone, Copy)]
pub struct GenAttributes {
    pub speed: u32,
    pub agility: u32,
    pub shot_power: u32,
    pub shot_accuracy: u32,
    pub stick_handling: u32,
    pub pass_accuracy: u32,
    pub off_awareness: u32,
    pub def_awareness: u32,
    pub checking: u32,
    pub endurance: u32,
    pub roughness: u32,
    pub aggression: u32,
}

/// Player record ready to write.
#[derive(Debug, Clone)]
pub struct GenPlayer {
    pub name: String,
    pub jersey_number: u32,
    /// 0-14; real pounds map through `(lbs - 140) / 8`.
    pub weight_class: u32,
    /// 0 = left, 1 = right.
    pub handedness: u32,
    pub attributes: GenAttributes,
}

fn position_defaults(pos: Position) -> GenAttributes {
    match pos {
        Position::C => GenAttributes {
            speed: 3,
            agility: 3,
            shot_power: 3,
            shot_accuracy: 3,
            stick_handling: 3,
            pass_accuracy: 3,
            off_awareness: 3,
            def_awareness: 2,
            checking: 2,
            endurance: 3,
            roughness: 2,
            aggression: 2,
        },
        Position::LW | Position::RW => GenAttributes {
            speed: 3,
            agility: 3,
            shot_power: 3,
            shot_accuracy: 3,
            stick_handling: 3,
            pass_accuracy: 2,
            off_awareness: 3,
            def_awareness: 2,
            checking: 3,
            endurance: 3,
            roughness: 3,
            aggression: 3,
        },
        Position::D => GenAttributes {
            speed: 2,
            agility: 2,
            shot_power: 2,
            shot_accuracy: 2,
            stick_handling: 2,
            pass_accuracy: 3,
            off_awareness: 2,
            def_awareness: 4,
            checking: 4,
            endurance: 3,
            roughness: 3,
            aggression: 3,
        },
        Position::G => GenAttributes {
            speed: 2,
            agility: 4,
            shot_power: 2,
            shot_accuracy: 2,
            stick_handling: 3,
            pass_accuracy: 2,
            off_awareness: 2,
            def_awareness: 3,
            checking: 1,
            endurance: 4,
            roughness: 1,
            aggression: 1,
        },
    }
}

fn map_weight(pounds: u32) -> u32 {
    if pounds == 0 {
        return 7;
    }
    (pounds.saturating_sub(140) / 8).min(14)
}

fn map_attributes(player: &FetchedPlayer) -> GenAttributes {
    let base = position_defaults(player.position);
    if player.stats.is_empty() {
        return base;
    }

    if player.position.is_goalie() {
        let svp = player.stat("SV%");
        let gaa = if player.stats.contains_key("GAA") {
            player.stat("GAA")
        } else {
            3.0
        };
        return GenAttributes {
            agility: scale(svp, 0.880, 0.930, 6),
            def_awareness: scale(3.5 - gaa, 0.0, 1.5, 6),
            ..base
        };
    }

    let goals = player.stat("G");
    let assists = player.stat("A");
    let points = player.stat("PTS");
    let plus_minus = player.stat("+/-");
    let pim = player.stat("PIM");

    let off_rating = scale(points, 0.0, 90.0, 6);
    let boost = u32::from(points > 50.0);

    GenAttributes {
        speed: (base.speed + boost).min(6),
        agility: (base.agility + boost).min(6),
        shot_power: scale(goals, 0.0, 40.0, 6),
        shot_accuracy: scale(goals, 0.0, 40.0, 6),
        stick_handling: off_rating,
        pass_accuracy: scale(assists, 0.0, 55.0, 6),
        off_awareness: off_rating,
        def_awareness: scale(plus_minus + 30.0, 0.0, 70.0, 6),
        roughness: scale(pim, 0.0, 80.0, 6),
        aggression: scale(pim, 0.0, 80.0, 6),
        ..base
    }
}

/// Map a fetched player to a cartridge record.
pub fn map_player(player: &FetchedPlayer) -> GenPlayer {
    GenPlayer {
        name: player.name.chars().take(14).collect(),
        jersey_number: player.jersey_number.clamp(1, 99),
        weight_class: map_weight(player.weight),
        handedness: match player.handedness {
            Handedness::L => 0,
            Handedness::R => 1,
        },
        attributes: map_attributes(player),
    }
}

fn encode_nibble(high: u32, low: u32) -> u8 {
    ((high.min(6) << 4) | low.min(6)) as u8
}

pub(crate) fn encode_stats(player: &GenPlayer) -> [u8; STATS_SIZE] {
    let a = &player.attributes;
    let jersey = player.jersey_number.clamp(1, 99);
    [
        (((jersey / 10) << 4) | (jersey % 10)) as u8,
        ((player.weight_class.min(14) << 4) | a.agility.min(6)) as u8,
        encode_nibble(a.speed, a.off_awareness),
        encode_nibble(a.def_awareness, a.shot_power),
        encode_nibble(a.checking, player.handedness),
        encode_nibble(a.stick_handling, a.shot_accuracy),
        encode_nibble(a.endurance, a.roughness),
        encode_nibble(a.pass_accuracy, a.aggression),
    ]
}

/// Write a team's player records in place. Names are truncated to the
/// remaining space, the sentinel is always written and the region is
/// zero-filled to its original end so its size never changes. Returns
/// how many players fit.
pub fn write_team_region(rom: &mut [u8], team: usize, players: &[GenPlayer]) -> Result<usize> {
    let (start, region_len) = team_player_region(rom, team)?;
    let end = start + region_len;
    let mut offset = start;
    let mut written = 0;

    for player in players {
        // 2 length bytes + name + stats, leaving room for the sentinel.
        let max_name_len = (end - offset).saturating_sub(2 + STATS_SIZE + 2);
        if max_name_len < 1 {
            debug!("team {} region full after {} players", team, written);
            break;
        }

        let name_bytes: Vec<u8> = player
            .name
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .take(max_name_len)
            .collect();

        write_u16_be(rom, offset, (name_bytes.len() + 2) as u16);
        offset += 2;
        rom[offset..offset + name_bytes.len()].copy_from_slice(&name_bytes);
        offset += name_bytes.len();
        rom[offset..offset + STATS_SIZE].copy_from_slice(&encode_stats(player));
        offset += STATS_SIZE;
        written += 1;
    }

    write_u16_be(rom, offset, 0);
    offset += 2;
    rom[offset..end].fill(0);

    Ok(written)
}

/// Ten 6-byte line units (goalie, LD, RD, LW, C, RW as 1-based roster
/// indices, 0 = empty): four even-strength lines, two power-play units,
/// two penalty-kill units and two extra-attacker units with the goalie
/// slot left empty. Padded to 64 bytes.
const LINES_TABLE_SIZE: usize = 64;
const LINE_UNIT_SIZE: usize = 6;

fn build_lines_table(
    roster: &SelectedRoster,
    units: &UnitAssignments,
    written: usize,
) -> [u8; LINES_TABLE_SIZE] {
    // 1-based stream index, or 0 when the slot is empty or the player
    // did not fit in the region.
    let slot = |idx: Option<usize>| -> u8 {
        match idx {
            Some(i) if i < written => (i + 1) as u8,
            _ => 0,
        }
    };
    // Forward of a given natural position on an even-strength line.
    let line_forward = |line: usize, pos: Position| -> Option<usize> {
        roster
            .line_slots
            .iter()
            .position(|&p| p == pos)
            .and_then(|j| units.forward_lines[line][j])
    };

    let starter = units.goalies[0];
    let mut table = [0u8; LINES_TABLE_SIZE];
    let mut unit = 0;
    let mut push = |g: Option<usize>, pair: [Option<usize>; 2], fwd: [Option<usize>; 3]| {
        let base = unit * LINE_UNIT_SIZE;
        table[base] = slot(g);
        table[base + 1] = slot(pair[0]);
        table[base + 2] = slot(pair[1]);
        table[base + 3] = slot(fwd[0]);
        table[base + 4] = slot(fwd[1]);
        table[base + 5] = slot(fwd[2]);
        unit += 1;
    };

    // Even-strength lines, third pair shared by lines 3 and 4.
    for line in 0..4 {
        push(
            starter,
            units.defense_pairs[line.min(2)],
            [
                line_forward(line, Position::LW),
                line_forward(line, Position::C),
                line_forward(line, Position::RW),
            ],
        );
    }

    // Power play: top unit from the precomputed list, second unit from
    // line 2 plus the second pair.
    let pp_f = |i: usize| units.power_play.get(i).copied();
    let pp_d = |i: usize| units.power_play.get(3 + i).copied();
    push(
        starter,
        [pp_d(0), pp_d(1)],
        [pp_f(1), pp_f(0), pp_f(2)],
    );
    push(
        starter,
        units.defense_pairs[1],
        [
            line_forward(1, Position::LW),
            line_forward(1, Position::C),
            line_forward(1, Position::RW),
        ],
    );

    // Penalty kill: two forwards and the top pair, then the third line's
    // first two forwards with the second pair.
    let pk_f = |i: usize| units.penalty_kill.get(i).copied();
    let pk_d = |i: usize| units.penalty_kill.get(2 + i).copied();
    push(starter, [pk_d(0), pk_d(1)], [pk_f(0), pk_f(1), None]);
    push(
        starter,
        units.defense_pairs[1],
        [
            line_forward(2, Position::LW),
            line_forward(2, Position::C),
            None,
        ],
    );

    // Extra attacker: goalie pulled, top skaters stay out.
    for line in 0..2 {
        push(
            None,
            units.defense_pairs[line],
            [
                line_forward(line, Position::LW),
                line_forward(line, Position::C),
                line_forward(line, Position::RW),
            ],
        );
    }

    table
}

/// Rewrite the goalie-count section and the lines table to describe
/// exactly the players that fit in the region.
pub fn write_team_header(
    rom: &mut [u8],
    team: usize,
    roster: &SelectedRoster,
    units: &UnitAssignments,
    written: usize,
) -> Result<()> {
    let sections = section_offsets(rom, team)?;

    let in_region = &roster.players[..written.min(roster.players.len())];
    let goalies = in_region.iter().filter(|p| p.position.is_goalie()).count();
    let forwards = in_region.iter().filter(|p| p.position.is_forward()).count();
    let defense = in_region.iter().filter(|p| p.position == Position::D).count();

    if sections.goalies + 2 > rom.len() || sections.lines + LINES_TABLE_SIZE > rom.len() {
        return Err(PatchError::CorruptBlock(format!(
            "team {} header sections past end of image",
            team
        )));
    }

    rom[sections.goalies] = goalies.min(0xFF) as u8;
    rom[sections.goalies + 1] = ((forwards.min(15) << 4) | defense.min(15)) as u8;

    let table = build_lines_table(roster, units, written);
    rom[sections.lines..sections.lines + LINES_TABLE_SIZE].copy_from_slice(&table);
    Ok(())
}

/// Stub the in-ROM checksum verification with RTS so an edited image
/// boots.
pub fn disable_checksum(rom: &mut [u8]) {
    if CHECKSUM_BYPASS_OFFSET + 2 <= rom.len() {
        rom[CHECKSUM_BYPASS_OFFSET] = 0x4E;
        rom[CHECKSUM_BYPASS_OFFSET + 1] = 0x75;
    }
}

/// Recompute the header checksum at 0x18E: the 16-bit sum of all BE
/// words from 0x200 to the end of the image.
pub fn update_header_checksum(rom: &mut [u8]) {
    if rom.len() < CHECKSUM_DATA_START {
        return;
    }
    let mut checksum = 0u16;
    let mut i = CHECKSUM_DATA_START;
    while i < rom.len() {
        let word = if i + 1 < rom.len() {
            u16::from_be_bytes([rom[i], rom[i + 1]])
        } else {
            (rom[i] as u16) << 8
        };
        checksum = checksum.wrapping_add(word);
        i += 2;
    }
    write_u16_be(rom, CHECKSUM_OFFSET, checksum);
}

/// Fast validation checks the size and pointer table; deep validation
/// also parses every team's player region.
pub fn validate(rom: &[u8], deep: bool) -> bool {
    if rom.len() < ROM_SIZE_STANDARD {
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

const CAPACITY: SlotCapacity = SlotCapacity {
    goalies: 2,
    forwards: 14,
    defense: 7,
};

const LINE_SLOTS: [Position; 3] = [Position::C, Position::LW, Position::RW];

pub fn patch(
    settings: &PatchSettings,
    rosters: &[TeamRoster],
    progress: &ProgressHandle,
) -> Result<PatchReport> {
    progress.set(0.0, "validating image");
    let mut rom = std::fs::read(&settings.input_path)?;
    if !validate(&rom, false) {
        return Err(PatchError::InvalidContainer(
            "not an NHL '94 Genesis image".to_string(),
        ));
    }

    disable_checksum(&mut rom);

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

        let selected = roster::select_roster(
            &team.players,
            CAPACITY,
            RosterOrder::ForwardsFirst,
            LINE_SLOTS,
        );
        let records: Vec<GenPlayer> = selected.players.iter().map(map_player).collect();
        let written = write_team_region(&mut rom, slot, &records)?;
        let units = roster::assign_units(&selected);
        write_team_header(&mut rom, slot, &selected, &units, written)?;

        info!(
            "team {} -> slot {} ({}): {} players",
            team.team, slot, TEAM_ORDER[slot], written
        );
        let in_region = &selected.players[..written.min(selected.players.len())];
        report.push_team(TeamReport {
            slot,
            name: TEAM_ORDER[slot].to_string(),
            players_written: written,
            goalies: in_region.iter().filter(|p| p.position.is_goalie()).count(),
            forwards: in_region.iter().filter(|p| p.position.is_forward()).count(),
            defense: in_region.iter().filter(|p| p.position == Position::D).count(),
        });
    }

    progress.set(1.0, "finalizing image");
    update_header_checksum(&mut rom);
    std::fs::write(&settings.output_path, &rom)?;
    Ok(report)
}
