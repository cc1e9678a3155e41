//! NHL 07 PSP disc patcher.
//!
//! The roster data sits three containers deep: the ISO 9660 image holds
//! `PSP_GAME/USRDIR/DB/DB.VIV`, a BIGF archive whose members are
//! RefPack-compressed TDB databases. The master database
//! (`nhl2007.tdb`) carries every table the game reads; `nhlbioatt.tdb`
//! and `nhlrost.tdb` are split copies kept consistent when they still
//! fit after recompression.
//!
//! Roster slots live in `ROST` and reference players through the `PLAY`
//! join table: `ROST.INDX == PLAY.INDX`, `PLAY.ID__ ==
//! SPBT/SPAI/SGAI.INDX`. A slot is a goalie slot exactly when its
//! player id has a `SGAI` record, so incoming goalies must land on
//! goalie slots for their attributes to reach the right table.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info, warn};

use crate::roster::{
    self, FetchedPlayer, Handedness, Position, RosterOrder, SelectedRoster, SlotCapacity,
    TeamRoster, UnitAssignments,
};
use crate::scale::{clamp_attr, scale};
use crate::tdb::{FieldCode, TdbFile, Value, LINE_FLAGS};
use crate::{bigf, iso, refpack};
use crate::{PatchError, PatchReport, PatchSettings, ProgressHandle, Result, TeamReport};

const DB_VIV_PATH: [&str; 4] = ["PSP_GAME", "USRDIR", "DB", "DB.VIV"];

const TDB_MASTER: &str = "nhl2007.tdb";
const TDB_BIOATT: &str = "nhlbioatt.tdb";
const TDB_ROSTER: &str = "nhlrost.tdb";

const COPY_CHUNK: usize = 4 * 1024 * 1024;

/// Display names for the 30 league slots plus the two All-Star slots.
pub const TEAM_NAMES: [&str; 32] = [
    "Anaheim",
    "Atlanta",
    "Boston",
    "Buffalo",
    "Calgary",
    "Carolina",
    "Chicago",
    "Colorado",
    "Columbus",
    "Dallas",
    "Detroit",
    "Edmonton",
    "Florida",
    "Los Angeles",
    "Minnesota",
    "Montreal",
    "Nashville",
    "New Jersey",
    "NY Islanders",
    "NY Rangers",
    "Ottawa",
    "Philadelphia",
    "Phoenix",
    "Pittsburgh",
    "St. Louis",
    "San Jose",
    "Tampa Bay",
    "Toronto",
    "Vancouver",
    "Washington",
    "East All-Star",
    "West All-Star",
];

/// Modern team abbreviation to 2006-07 slot. Relocated and expansion
/// franchises reuse the nearest slot: Winnipeg takes Atlanta, Utah and
/// Arizona take Phoenix, Vegas and Seattle take the All-Star slots.
pub fn team_slot(abbrev: &str) -> Option<usize> {
    let slot = match abbrev.to_ascii_uppercase().as_str() {
        "ANA" => 0,
        "ATL" | "WPG" => 1,
        "BOS" => 2,
        "BUF" => 3,
        "CGY" => 4,
        "CAR" => 5,
        "CHI" => 6,
        "COL" => 7,
        "CBJ" => 8,
        "DAL" => 9,
        "DET" => 10,
        "EDM" => 11,
        "FLA" => 12,
        "LAK" | "LA" => 13,
        "MIN" => 14,
        "MTL" => 15,
        "NSH" => 16,
        "NJD" | "NJ" => 17,
        "NYI" => 18,
        "NYR" => 19,
        "OTT" => 20,
        "PHI" => 21,
        "PHX" | "ARI" | "UTA" => 22,
        "PIT" => 23,
        "STL" => 24,
        "SJS" | "SJ" => 25,
        "TBL" | "TB" => 26,
        "TOR" => 27,
        "VAN" => 28,
        "WSH" => 29,
        "SEA" => 30,
        "VGK" => 31,
        _ => return None,
    };
    Some(slot)
}

fn position_code(pos: Position) -> u32 {
    match pos {
        Position::C => 0,
        Position::LW => 1,
        Position::RW => 2,
        Position::D => 3,
        Position::G => 4,
    }
}

/// Skater attributes on the game's 0-63 scale, in `SPAI` field order.
#[derive(Debug, Clone, Copy)]
pub struct SkaterAttributes {
    pub balance: u32,
    pub penalty: u32,
    pub shot_accuracy: u32,
    pub wrist_accuracy: u32,
    pub faceoffs: u32,
    pub acceleration: u32,
    pub speed: u32,
    pub potential: u32,
    pub deking: u32,
    pub checking: u32,
    pub toughness: u32,
    pub fighting: u32,
    pub puck_control: u32,
    pub agility: u32,
    pub hero: u32,
    pub aggression: u32,
    pub pressure: u32,
    pub passing: u32,
    pub endurance: u32,
    pub injury: u32,
    pub slap_power: u32,
    pub wrist_power: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct GoalieAttributes {
    pub breakaway: u32,
    pub rebound_ctrl: u32,
    pub shot_recovery: u32,
    pub speed: u32,
    pub poke_check: u32,
    pub intensity: u32,
    pub potential: u32,
    pub toughness: u32,
    pub fighting: u32,
    pub agility: u32,
    pub five_hole: u32,
    pub passing: u32,
    pub endurance: u32,
    pub glove_high: u32,
    pub stick_high: u32,
    pub glove_low: u32,
    pub stick_low: u32,
}

fn skater_defaults(pos: Position) -> SkaterAttributes {
    match pos {
        Position::C => SkaterAttributes {
            balance: 35,
            penalty: 30,
            shot_accuracy: 35,
            wrist_accuracy: 35,
            faceoffs: 40,
            acceleration: 35,
            speed: 35,
            potential: 35,
            deking: 35,
            checking: 30,
            toughness: 25,
            fighting: 1,
            puck_control: 35,
            agility: 35,
            hero: 30,
            aggression: 25,
            pressure: 30,
            passing: 38,
            endurance: 35,
            injury: 35,
            slap_power: 30,
            wrist_power: 30,
        },
        Position::LW | Position::RW => SkaterAttributes {
            balance: 33,
            penalty: 30,
            shot_accuracy: 35,
            wrist_accuracy: 33,
            faceoffs: 20,
            acceleration: 35,
            speed: 35,
            potential: 35,
            deking: 33,
            checking: 33,
            toughness: 30,
            fighting: 1,
            puck_control: 33,
            agility: 35,
            hero: 30,
            aggression: 30,
            pressure: 30,
            passing: 30,
            endurance: 35,
            injury: 35,
            slap_power: 33,
            wrist_power: 33,
        },
        Position::D | Position::G => SkaterAttributes {
            balance: 38,
            penalty: 30,
            shot_accuracy: 25,
            wrist_accuracy: 25,
            faceoffs: 15,
            acceleration: 30,
            speed: 30,
            potential: 30,
            deking: 25,
            checking: 40,
            toughness: 35,
            fighting: 1,
            puck_control: 28,
            agility: 30,
            hero: 28,
            aggression: 33,
            pressure: 35,
            passing: 33,
            endurance: 38,
            injury: 35,
            slap_power: 35,
            wrist_power: 25,
        },
    }
}

fn goalie_defaults() -> GoalieAttributes {
    GoalieAttributes {
        breakaway: 35,
        rebound_ctrl: 35,
        shot_recovery: 35,
        speed: 25,
        poke_check: 30,
        intensity: 35,
        potential: 35,
        toughness: 25,
        fighting: 0,
        agility: 40,
        five_hole: 35,
        passing: 25,
        endurance: 40,
        glove_high: 35,
        stick_high: 35,
        glove_low: 35,
        stick_low: 35,
    }
}

fn map_skater_stats(player: &FetchedPlayer) -> SkaterAttributes {
    let base = skater_defaults(player.position);
    if player.stats.is_empty() {
        return base;
    }

    let goals = player.stat("G");
    let assists = player.stat("A");
    let points = player.stat("PTS");
    let plus_minus = player.stat("+/-");
    let pim = player.stat("PIM");
    let shots = player.stat("SOG");
    let faceoff_pct = player.stat("FO%");
    let is_defenseman = player.position == Position::D;

    let off_rating = scale(points, 0.0, 90.0, 63);
    let goal_rating = scale(goals, 0.0, 40.0, 63);
    let assist_rating = scale(assists, 0.0, 55.0, 63);

    let shoot_pct = if shots > 0.0 { goals / shots * 100.0 } else { 10.0 };
    let accuracy_rating = scale(shoot_pct, 5.0, 20.0, 63);

    let def_rating = scale(plus_minus + 30.0, 0.0, 70.0, 63);
    let tough_rating = scale(pim, 0.0, 80.0, 63);

    let speed_boost = if points > 50.0 {
        5
    } else if points > 30.0 {
        3
    } else {
        0
    };

    SkaterAttributes {
        balance: clamp_attr(base.balance as i32 + if is_defenseman { 3 } else { 0 }, 63),
        penalty: base.penalty,
        shot_accuracy: goal_rating.max(accuracy_rating),
        wrist_accuracy: clamp_attr(goal_rating as i32 - 2, 63).max(accuracy_rating),
        faceoffs: if faceoff_pct > 0.0 {
            scale(faceoff_pct, 30.0, 60.0, 63)
        } else {
            base.faceoffs
        },
        acceleration: clamp_attr(base.acceleration as i32 + speed_boost, 63),
        speed: clamp_attr(base.speed as i32 + speed_boost, 63),
        potential: clamp_attr(off_rating as i32 + 5, 63),
        deking: off_rating,
        checking: if is_defenseman { def_rating } else { base.checking },
        toughness: tough_rating,
        fighting: ((pim / 40.0) as u32).min(3),
        puck_control: off_rating,
        agility: clamp_attr(base.agility as i32 + speed_boost, 63),
        hero: off_rating,
        aggression: tough_rating,
        pressure: def_rating,
        passing: assist_rating,
        endurance: clamp_attr(base.endurance as i32 + if points > 40.0 { 3 } else { 0 }, 63),
        injury: base.injury,
        slap_power: goal_rating,
        wrist_power: clamp_attr(goal_rating as i32 - 3, 63),
    }
}

fn map_goalie_stats(player: &FetchedPlayer) -> GoalieAttributes {
    if player.stats.is_empty() {
        return goalie_defaults();
    }

    let svp = player.stat("SV%");
    let gaa = if player.stats.contains_key("GAA") {
        player.stat("GAA")
    } else {
        3.0
    };
    let wins = player.stat("W");

    let save_rating = scale(svp, 0.880, 0.930, 63);
    let gaa_rating = scale(3.5 - gaa, 0.0, 1.5, 63);
    let win_bonus = ((wins / 4.0) as i32).min(10);

    GoalieAttributes {
        breakaway: clamp_attr(gaa_rating as i32 + win_bonus, 63),
        rebound_ctrl: save_rating,
        shot_recovery: clamp_attr(save_rating as i32 - 3, 63),
        speed: clamp_attr(25 + win_bonus, 63),
        poke_check: gaa_rating,
        intensity: clamp_attr(save_rating as i32 - 5 + win_bonus, 63),
        potential: clamp_attr(save_rating as i32 + win_bonus, 63),
        toughness: 25,
        fighting: 0,
        agility: save_rating,
        five_hole: save_rating,
        passing: 25,
        endurance: clamp_attr(35 + win_bonus, 63),
        glove_high: save_rating,
        stick_high: clamp_attr(save_rating as i32 - 2, 63),
        glove_low: save_rating,
        stick_low: clamp_attr(save_rating as i32 - 2, 63),
    }
}

#[derive(Debug, Clone)]
pub enum Attributes {
    Skater(SkaterAttributes),
    Goalie(GoalieAttributes),
}

/// Player record ready to write to the bio and attribute tables.
#[derive(Debug, Clone)]
pub struct PspPlayer {
    pub first_name: String,
    pub last_name: String,
    pub position: Position,
    pub jersey_number: u32,
    /// 0 = left, 1 = right.
    pub handedness: u32,
    /// Raw pounds.
    pub weight: u32,
    /// Inches above 5'6", the 5-bit height encoding.
    pub height: u32,
    pub attributes: Attributes,
}

pub fn map_player(player: &FetchedPlayer) -> PspPlayer {
    let mut parts = player.name.splitn(2, ' ');
    let first_name: String = parts.next().unwrap_or("").chars().take(19).collect();
    let last_name: String = parts.next().unwrap_or("").chars().take(19).collect();

    let attributes = if player.position.is_goalie() {
        Attributes::Goalie(map_goalie_stats(player))
    } else {
        Attributes::Skater(map_skater_stats(player))
    };

    PspPlayer {
        first_name,
        last_name,
        position: player.position,
        jersey_number: player.jersey_number.clamp(1, 99),
        handedness: match player.handedness {
            Handedness::L => 0,
            Handedness::R => 1,
        },
        weight: if player.weight > 0 { player.weight } else { 190 },
        height: if player.height > 0 {
            (player.height.saturating_sub(66)).min(31)
        } else {
            16
        },
        attributes,
    }
}

fn write_player_bio(
    tdb: &mut TdbFile,
    record_idx: usize,
    player: &PspPlayer,
    team_index: usize,
) -> Result<()> {
    let mut values = vec![
        (FieldCode::FirstName, Value::Str(player.first_name.clone())),
        (FieldCode::LastName, Value::Str(player.last_name.clone())),
        (FieldCode::Jersey, Value::Int(player.jersey_number)),
        (FieldCode::Handedness, Value::Int(player.handedness)),
        (FieldCode::Team, Value::Int(team_index as u32)),
        (
            FieldCode::PositionCode,
            Value::Int(position_code(player.position)),
        ),
    ];
    if player.weight > 0 {
        values.push((FieldCode::Weight, Value::Int(player.weight)));
    }
    if player.height > 0 {
        values.push((FieldCode::Height, Value::Int(player.height)));
    }
    tdb.table_mut("SPBT")?.write_record(record_idx, &values)
}

fn write_skater_attrs(tdb: &mut TdbFile, record_idx: usize, a: &SkaterAttributes) -> Result<()> {
    let values = [
        (FieldCode::Balance, Value::Int(a.balance)),
        (FieldCode::PenaltyDiscipline, Value::Int(a.penalty)),
        (FieldCode::ShotAccuracy, Value::Int(a.shot_accuracy)),
        (FieldCode::WristAccuracy, Value::Int(a.wrist_accuracy)),
        (FieldCode::Faceoffs, Value::Int(a.faceoffs)),
        (FieldCode::Acceleration, Value::Int(a.acceleration)),
        (FieldCode::Speed, Value::Int(a.speed)),
        (FieldCode::Potential, Value::Int(a.potential)),
        (FieldCode::Deking, Value::Int(a.deking)),
        (FieldCode::Checking, Value::Int(a.checking)),
        (FieldCode::Toughness, Value::Int(a.toughness)),
        (FieldCode::Fighting, Value::Int(a.fighting)),
        (FieldCode::PuckControl, Value::Int(a.puck_control)),
        (FieldCode::Agility, Value::Int(a.agility)),
        (FieldCode::Hero, Value::Int(a.hero)),
        (FieldCode::Aggression, Value::Int(a.aggression)),
        (FieldCode::Pressure, Value::Int(a.pressure)),
        (FieldCode::Passing, Value::Int(a.passing)),
        (FieldCode::Endurance, Value::Int(a.endurance)),
        (FieldCode::Injury, Value::Int(a.injury)),
        (FieldCode::SlapPower, Value::Int(a.slap_power)),
        (FieldCode::WristPower, Value::Int(a.wrist_power)),
    ];
    tdb.table_mut("SPAI")?.write_record(record_idx, &values)
}

fn write_goalie_attrs(tdb: &mut TdbFile, record_idx: usize, a: &GoalieAttributes) -> Result<()> {
    let values = [
        (FieldCode::Breakaway, Value::Int(a.breakaway)),
        (FieldCode::ReboundControl, Value::Int(a.rebound_ctrl)),
        (FieldCode::ShotRecovery, Value::Int(a.shot_recovery)),
        (FieldCode::Speed, Value::Int(a.speed)),
        (FieldCode::PokeCheck, Value::Int(a.poke_check)),
        (FieldCode::Intensity, Value::Int(a.intensity)),
        (FieldCode::Potential, Value::Int(a.potential)),
        (FieldCode::Toughness, Value::Int(a.toughness)),
        (FieldCode::Fighting, Value::Int(a.fighting)),
        (FieldCode::Agility, Value::Int(a.agility)),
        (FieldCode::FiveHole, Value::Int(a.five_hole)),
        (FieldCode::Passing, Value::Int(a.passing)),
        (FieldCode::Endurance, Value::Int(a.endurance)),
        (FieldCode::GloveHigh, Value::Int(a.glove_high)),
        (FieldCode::StickHigh, Value::Int(a.stick_high)),
        (FieldCode::GloveLow, Value::Int(a.glove_low)),
        (FieldCode::StickLow, Value::Int(a.stick_low)),
    ];
    tdb.table_mut("SGAI")?.write_record(record_idx, &values)
}

const CENTER_FLAGS: [FieldCode; 4] = [
    FieldCode::Line1Center,
    FieldCode::Line2Center,
    FieldCode::Line3Center,
    FieldCode::Line4Center,
];
const LEFT_WING_FLAGS: [FieldCode; 4] = [
    FieldCode::Line1LeftWing,
    FieldCode::Line2LeftWing,
    FieldCode::Line3LeftWing,
    FieldCode::Line4LeftWing,
];
const RIGHT_WING_FLAGS: [FieldCode; 4] = [
    FieldCode::Line1RightWing,
    FieldCode::Line2RightWing,
    FieldCode::Line3RightWing,
    FieldCode::Line4RightWing,
];
const LEFT_DEFENSE_FLAGS: [FieldCode; 3] = [
    FieldCode::Pair1LeftDefense,
    FieldCode::Pair2LeftDefense,
    FieldCode::Pair3LeftDefense,
];
const RIGHT_DEFENSE_FLAGS: [FieldCode; 3] = [
    FieldCode::Pair1RightDefense,
    FieldCode::Pair2RightDefense,
    FieldCode::Pair3RightDefense,
];

/// One even-strength flag per roster stream index, derived from the
/// whole team's unit assignments.
fn unit_flags(roster: &SelectedRoster, units: &UnitAssignments) -> HashMap<usize, FieldCode> {
    let mut flags = HashMap::new();

    for (line, slots) in units.forward_lines.iter().enumerate() {
        for (j, assigned) in slots.iter().enumerate() {
            if let Some(idx) = assigned {
                let flag = match roster.line_slots[j] {
                    Position::LW => LEFT_WING_FLAGS[line],
                    Position::RW => RIGHT_WING_FLAGS[line],
                    _ => CENTER_FLAGS[line],
                };
                flags.insert(*idx, flag);
            }
        }
    }
    for (pair, sides) in units.defense_pairs.iter().enumerate() {
        if let Some(idx) = sides[0] {
            flags.insert(idx, LEFT_DEFENSE_FLAGS[pair]);
        }
        if let Some(idx) = sides[1] {
            flags.insert(idx, RIGHT_DEFENSE_FLAGS[pair]);
        }
    }
    if let Some(idx) = units.goalies[0] {
        flags.insert(idx, FieldCode::Goalie1);
    }
    if let Some(idx) = units.goalies[1] {
        flags.insert(idx, FieldCode::Goalie2);
    }

    flags
}

fn roster_slot_values(
    player: &PspPlayer,
    captain: u32,
    flag: Option<FieldCode>,
) -> Vec<(FieldCode, Value)> {
    let mut values = vec![
        (FieldCode::Jersey, Value::Int(player.jersey_number)),
        (FieldCode::Captain, Value::Int(captain)),
        (FieldCode::Dressed, Value::Int(1)),
    ];
    for f in LINE_FLAGS {
        values.push((f, Value::Int(u32::from(Some(f) == flag))));
    }
    values
}

/// Split-TDB capacities can be smaller than the master's; writes past
/// them are skipped, not fatal.
fn allow_smaller_capacity(result: Result<()>) -> Result<()> {
    match result {
        Err(PatchError::IndexOutOfRange { table, index, .. }) => {
            debug!("split table {} has no record {}, skipping", table, index);
            Ok(())
        }
        other => other,
    }
}

fn copy_image(
    input: &Path,
    output: &Path,
    progress: &ProgressHandle,
) -> Result<()> {
    let total = std::fs::metadata(input)?.len();
    let mut src = File::open(input)?;
    let mut dst = File::create(output)?;
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;

    loop {
        progress.check_cancelled()?;
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        copied += n as u64;
        if total > 0 {
            progress.set(
                copied as f32 / total as f32 * 0.3,
                &format!("copying image ({} MB)", copied / (1024 * 1024)),
            );
        }
    }
    Ok(())
}

fn load_tdb(viv: &[u8], name: &str) -> Result<Option<TdbFile>> {
    match bigf::extract(viv, name) {
        Ok(compressed) => {
            let raw = refpack::decompress(&compressed)?;
            Ok(Some(TdbFile::parse(&raw)?))
        }
        Err(PatchError::MissingEntry(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// `INDX` to record-index map for a bio or attribute table.
fn index_map(tdb: &TdbFile, table: &str) -> Result<HashMap<u32, usize>> {
    let table = tdb.table(table)?;
    let mut map = HashMap::new();
    for i in 0..table.num_records {
        let rec = table.read_record(i)?;
        if let Some(indx) = rec.get(&FieldCode::Index).and_then(Value::as_int) {
            if indx > 0 {
                map.insert(indx, i);
            }
        }
    }
    Ok(map)
}

/// Fast validation checks that the image resolves `DB.VIV` and that it
/// is a BIGF archive; deep validation also decompresses the master
/// database and checks its tables.
pub fn validate(path: &Path, deep: bool) -> Result<bool> {
    let mut file = File::open(path)?;
    let viv = match iso::read_file(&mut file, &DB_VIV_PATH)? {
        Some(viv) => viv,
        None => return Ok(false),
    };
    if viv.len() < 4 || &viv[..4] != bigf::MAGIC {
        return Ok(false);
    }
    if !deep {
        return Ok(true);
    }
    let master = match load_tdb(&viv, TDB_MASTER)? {
        Some(master) => master,
        None => return Ok(false),
    };
    Ok(["SPBT", "ROST", "PLAY"].iter().all(|t| master.has_table(t)))
}

const CAPACITY: SlotCapacity = SlotCapacity {
    goalies: 2,
    forwards: 14,
    defense: 7,
};

const LINE_SLOTS: [Position; 3] = [Position::C, Position::LW, Position::RW];

struct RosterSlot {
    rost_idx: usize,
    player_id: u32,
    bio_idx: usize,
}

pub fn patch(
    settings: &PatchSettings,
    rosters: &[TeamRoster],
    progress: &ProgressHandle,
) -> Result<PatchReport> {
    if settings.input_path != settings.output_path {
        copy_image(&settings.input_path, &settings.output_path, progress)?;
    }

    progress.set(0.3, "loading DB.VIV");
    let mut image = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&settings.output_path)?;
    let viv = iso::read_file(&mut image, &DB_VIV_PATH)?.ok_or_else(|| {
        PatchError::MissingEntry("PSP_GAME/USRDIR/DB/DB.VIV".to_string())
    })?;

    progress.set(0.32, "parsing databases");
    let mut master = load_tdb(&viv, TDB_MASTER)?
        .ok_or_else(|| PatchError::MissingEntry(TDB_MASTER.to_string()))?;
    let mut bioatt = load_tdb(&viv, TDB_BIOATT)?;
    let mut roster_split = load_tdb(&viv, TDB_ROSTER)?;

    for table in ["SPBT", "ROST", "PLAY"] {
        if !master.has_table(table) {
            return Err(PatchError::MissingTable(format!(
                "{} in {}",
                table, TDB_MASTER
            )));
        }
    }

    // Join maps. PLAY resolves a roster slot to a player id; the INDX
    // maps resolve a player id to its bio/attribute record.
    let play = master.table("PLAY")?;
    let mut play_by_indx: HashMap<u32, u32> = HashMap::new();
    for i in 0..play.num_records {
        let rec = play.read_record(i)?;
        if let (Some(indx), Some(id)) = (
            rec.get(&FieldCode::Index).and_then(Value::as_int),
            rec.get(&FieldCode::PlayerId).and_then(Value::as_int),
        ) {
            play_by_indx.insert(indx, id);
        }
    }
    let spbt_by_id = index_map(&master, "SPBT")?;
    let spai_by_id = if master.has_table("SPAI") {
        index_map(&master, "SPAI")?
    } else {
        HashMap::new()
    };
    let sgai_by_id = if master.has_table("SGAI") {
        index_map(&master, "SGAI")?
    } else {
        HashMap::new()
    };

    let mut report = PatchReport::default();
    let total = rosters.len().max(1);

    for (ti, team) in rosters.iter().enumerate() {
        progress.check_cancelled()?;
        progress.set(
            0.35 + ti as f32 / total as f32 * 0.25,
            &format!("writing {}", team.team),
        );

        let slot = match team_slot(&team.team) {
            Some(slot) => slot,
            None => {
                warn!("no roster slot for team {}, skipping", team.team);
                continue;
            }
        };

        // Existing slots for this team, classified by whether the
        // current occupant is a goalie.
        let team_rost_indices = master.table("ROST")?.find_records(FieldCode::Team, slot as u32)?;
        let mut goalie_slots: Vec<RosterSlot> = Vec::new();
        let mut skater_slots: Vec<RosterSlot> = Vec::new();
        for &rost_idx in &team_rost_indices {
            let rec = master.table("ROST")?.read_record(rost_idx)?;
            let rost_indx = match rec.get(&FieldCode::Index).and_then(Value::as_int) {
                Some(indx) => indx,
                None => continue,
            };
            let player_id = match play_by_indx.get(&rost_indx) {
                Some(&id) => id,
                None => continue,
            };
            let bio_idx = match spbt_by_id.get(&player_id) {
                Some(&idx) => idx,
                None => continue,
            };
            let slot_info = RosterSlot {
                rost_idx,
                player_id,
                bio_idx,
            };
            if sgai_by_id.contains_key(&player_id) {
                goalie_slots.push(slot_info);
            } else {
                skater_slots.push(slot_info);
            }
        }

        let selected = roster::select_roster(
            &team.players,
            CAPACITY,
            RosterOrder::GoaliesFirst,
            LINE_SLOTS,
        );
        let units = roster::assign_units(&selected);
        let flags = unit_flags(&selected, &units);

        // Pair each incoming player with a compatible slot; players
        // beyond the slot supply are dropped.
        let mut next_goalie = 0;
        let mut next_skater = 0;
        let mut used_rost: Vec<usize> = Vec::new();
        let mut written = 0;
        let mut goalies_written = 0;
        let mut forwards_written = 0;
        let mut defense_written = 0;

        for (stream_idx, player) in selected.players.iter().enumerate() {
            let slot_info = if player.position.is_goalie() {
                let s = goalie_slots.get(next_goalie);
                next_goalie += 1;
                s
            } else {
                let s = skater_slots.get(next_skater);
                next_skater += 1;
                s
            };
            let slot_info = match slot_info {
                Some(s) => s,
                None => {
                    debug!(
                        "no {} slot left for {} on {}",
                        if player.position.is_goalie() { "goalie" } else { "skater" },
                        player.name,
                        team.team
                    );
                    continue;
                }
            };

            let record = map_player(player);
            write_player_bio(&mut master, slot_info.bio_idx, &record, slot)?;
            if let Some(split) = bioatt.as_mut() {
                if split.has_table("SPBT") {
                    allow_smaller_capacity(write_player_bio(
                        split,
                        slot_info.bio_idx,
                        &record,
                        slot,
                    ))?;
                }
            }

            match &record.attributes {
                Attributes::Goalie(attrs) => {
                    if let Some(&sgai_idx) = sgai_by_id.get(&slot_info.player_id) {
                        write_goalie_attrs(&mut master, sgai_idx, attrs)?;
                        if let Some(split) = bioatt.as_mut() {
                            if split.has_table("SGAI") {
                                allow_smaller_capacity(write_goalie_attrs(
                                    split, sgai_idx, attrs,
                                ))?;
                            }
                        }
                    }
                }
                Attributes::Skater(attrs) => {
                    if let Some(&spai_idx) = spai_by_id.get(&slot_info.player_id) {
                        write_skater_attrs(&mut master, spai_idx, attrs)?;
                        if let Some(split) = bioatt.as_mut() {
                            if split.has_table("SPAI") {
                                allow_smaller_capacity(write_skater_attrs(
                                    split, spai_idx, attrs,
                                ))?;
                            }
                        }
                    }
                }
            }

            let captain = if units.captain == Some(stream_idx) {
                2
            } else if units.alternates.contains(&stream_idx) {
                1
            } else {
                0
            };
            let rost_values =
                roster_slot_values(&record, captain, flags.get(&stream_idx).copied());
            master
                .table_mut("ROST")?
                .write_record(slot_info.rost_idx, &rost_values)?;
            if let Some(split) = roster_split.as_mut() {
                if split.has_table("ROST") {
                    allow_smaller_capacity(
                        split
                            .table_mut("ROST")?
                            .write_record(slot_info.rost_idx, &rost_values),
                    )?;
                }
            }

            used_rost.push(slot_info.rost_idx);
            written += 1;
            match player.position {
                Position::G => goalies_written += 1,
                Position::D => defense_written += 1,
                _ => forwards_written += 1,
            }
        }

        // Undress the slots the new roster does not fill; the records
        // stay in the image.
        let undress = [(FieldCode::Dressed, Value::Int(0))];
        for &rost_idx in &team_rost_indices {
            if used_rost.contains(&rost_idx) {
                continue;
            }
            master.table_mut("ROST")?.write_record(rost_idx, &undress)?;
            if let Some(split) = roster_split.as_mut() {
                if split.has_table("ROST") {
                    allow_smaller_capacity(
                        split.table_mut("ROST")?.write_record(rost_idx, &undress),
                    )?;
                }
            }
        }

        info!(
            "team {} -> slot {} ({}): {} players",
            team.team, slot, TEAM_NAMES[slot], written
        );
        report.push_team(TeamReport {
            slot,
            name: TEAM_NAMES[slot].to_string(),
            players_written: written,
            goalies: goalies_written,
            forwards: forwards_written,
            defense: defense_written,
        });
    }

    // Recompress each modified database into the archive. The split
    // copies are skipped when they no longer fit; the master has every
    // table the game reads, so the archive stays playable.
    progress.set(0.6, "recompressing databases");
    let entry_names: Vec<String> = bigf::parse(&viv)?.into_iter().map(|e| e.name).collect();
    let original_name = |wanted: &str| -> String {
        entry_names
            .iter()
            .find(|n| n.eq_ignore_ascii_case(wanted))
            .cloned()
            .unwrap_or_else(|| wanted.to_string())
    };

    let mut new_viv = viv.clone();
    let mut members: Vec<(String, &TdbFile, bool)> =
        vec![(original_name(TDB_MASTER), &master, true)];
    if let Some(split) = bioatt.as_ref() {
        members.push((original_name(TDB_BIOATT), split, false));
    }
    if let Some(split) = roster_split.as_ref() {
        members.push((original_name(TDB_ROSTER), split, false));
    }

    for (i, (name, tdb, required)) in members.iter().enumerate() {
        progress.check_cancelled()?;
        progress.set(
            0.6 + i as f32 / members.len() as f32 * 0.3,
            &format!("compressing {}", name),
        );
        let compressed = refpack::compress(&tdb.serialize());
        match bigf::replace_in_place(&mut new_viv, name, &compressed) {
            Ok(()) => {}
            Err(PatchError::EntryTooLarge { .. }) if !*required => {
                warn!("{} no longer fits its allocation, leaving it unchanged", name);
            }
            Err(PatchError::EntryTooLarge { .. }) => {
                // The master must go in even if the archive has to grow.
                info!("{} outgrew its allocation, rebuilding the archive", name);
                new_viv = bigf::rebuild_with(&new_viv, name, &compressed)?;
            }
            Err(e) => return Err(e),
        }
    }

    progress.set(0.9, "writing DB.VIV");
    let location = iso::find_file_with_gap(&mut image, &DB_VIV_PATH)?.ok_or_else(|| {
        PatchError::MissingEntry("PSP_GAME/USRDIR/DB/DB.VIV".to_string())
    })?;
    if new_viv.len() as u64 > location.max_size {
        return Err(PatchError::CapacityExceeded {
            context: "DB.VIV sector budget".to_string(),
            wanted: new_viv.len(),
            capacity: location.max_size as usize,
        });
    }

    image.seek(SeekFrom::Start(location.lba as u64 * iso::SECTOR_SIZE))?;
    image.write_all(&new_viv)?;
    if new_viv.len() < location.size as usize {
        let padding = vec![0u8; location.size as usize - new_viv.len()];
        image.write_all(&padding)?;
    }

    if new_viv.len() != location.size as usize {
        if let Some(record_offset) = iso::find_dir_record_offset(&mut image, &DB_VIV_PATH)? {
            let new_size = new_viv.len() as u32;
            image.seek(SeekFrom::Start(record_offset + 10))?;
            image.write_all(&new_size.to_le_bytes())?;
            image.seek(SeekFrom::Start(record_offset + 14))?;
            image.write_all(&new_size.to_be_bytes())?;
        }
    }
    image.flush()?;

    progress.set(1.0, "complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso::test_support::{build_iso, IsoFile};
    use crate::roster::test_support::{goalie, skater};
    use crate::tdb::test_support::{build_tdb, FieldSpec, TableSpec};
    use crate::Target;

    fn int_fields(tags: &[(&[u8; 4], u32)]) -> (Vec<FieldSpec>, u32) {
        let mut fields = Vec::new();
        let mut bit = 0u32;
        for (tag, width) in tags {
            fields.push(FieldSpec {
                tag: **tag,
                field_type: 3,
                bit_offset: bit,
                bit_width: *width,
            });
            bit += width;
        }
        (fields, bit.div_ceil(8))
    }

    /// Master database with four roster slots on team 2: player ids
    /// 100 (a goalie, present in SGAI) and 101-103 (skaters in SPAI).
    fn build_master_tdb() -> Vec<u8> {
        // SPBT: INDX + bios. Strings are byte-aligned.
        let (mut spbt_fields, _) = int_fields(&[
            (b"INDX", 16),
            (b"JERS", 7),
            (b"HAND", 1),
            (b"TEAM", 6),
            (b"POS_", 3),
            (b"WEIG", 9),
            (b"HEIG", 5),
        ]);
        spbt_fields.push(FieldSpec {
            tag: *b"FNME",
            field_type: 0,
            bit_offset: 8 * 8,
            bit_width: 8 * 8,
        });
        spbt_fields.push(FieldSpec {
            tag: *b"LNME",
            field_type: 0,
            bit_offset: 16 * 8,
            bit_width: 8 * 8,
        });
        let spbt_record_size = 24u32;
        let mut spbt_data = Vec::new();
        for id in 100u16..104 {
            let mut rec = vec![0u8; spbt_record_size as usize];
            rec[..2].copy_from_slice(&id.to_le_bytes());
            spbt_data.extend_from_slice(&rec);
        }

        let skater_tags: Vec<(&[u8; 4], u32)> = vec![
            (b"INDX", 16),
            (b"BALA", 6),
            (b"PENA", 6),
            (b"SACC", 6),
            (b"WACC", 6),
            (b"FACE", 6),
            (b"ACCE", 6),
            (b"SPEE", 6),
            (b"POTE", 6),
            (b"DEKG", 6),
            (b"CHKG", 6),
            (b"TOUG", 6),
            (b"FIGH", 6),
            (b"PUCK", 6),
            (b"AGIL", 6),
            (b"HERO", 6),
            (b"AGGR", 6),
            (b"PRES", 6),
            (b"PASS", 6),
            (b"ENDU", 6),
            (b"INJU", 6),
            (b"SPOW", 6),
            (b"WPOW", 6),
        ];
        let (spai_fields, spai_record_size) = int_fields(&skater_tags);
        let mut spai_data = Vec::new();
        for id in [101u16, 102, 103] {
            let mut rec = vec![0u8; spai_record_size as usize];
            rec[..2].copy_from_slice(&id.to_le_bytes());
            spai_data.extend_from_slice(&rec);
        }

        let goalie_tags: Vec<(&[u8; 4], u32)> = vec![
            (b"INDX", 16),
            (b"BRKA", 6),
            (b"REBC", 6),
            (b"SREC", 6),
            (b"SPEE", 6),
            (b"POKE", 6),
            (b"INTE", 6),
            (b"POTE", 6),
            (b"TOUG", 6),
            (b"FIGH", 6),
            (b"AGIL", 6),
            (b"5HOL", 6),
            (b"PASS", 6),
            (b"ENDU", 6),
            (b"GSH_", 6),
            (b"SSH_", 6),
            (b"GSL_", 6),
            (b"SSL_", 6),
        ];
        let (sgai_fields, sgai_record_size) = int_fields(&goalie_tags);
        let mut sgai_data = vec![0u8; sgai_record_size as usize];
        sgai_data[..2].copy_from_slice(&100u16.to_le_bytes());

        let mut rost_tags: Vec<(&[u8; 4], u32)> = vec![
            (b"INDX", 16),
            (b"TEAM", 6),
            (b"JERS", 7),
            (b"CAPT", 2),
            (b"DRES", 1),
        ];
        let flag_tags: Vec<[u8; 4]> = LINE_FLAGS.iter().map(|f| f.tag()).collect();
        for tag in &flag_tags {
            rost_tags.push((tag, 1));
        }
        let (rost_fields, rost_record_size) = int_fields(&rost_tags);
        let mut rost_data = Vec::new();
        for indx in 1u16..5 {
            let mut rec = vec![0u8; rost_record_size as usize];
            rec[..2].copy_from_slice(&indx.to_le_bytes());
            // TEAM = 2, DRES = 1 in the packed bits after INDX.
            rec[2] = 0b0000_0010;
            rost_set_dressed(&mut rec);
            rost_data.extend_from_slice(&rec);
        }

        let (play_fields, play_record_size) =
            int_fields(&[(b"INDX", 16), (b"ID__", 16), (b"TBLE", 4)]);
        let mut play_data = Vec::new();
        for indx in 1u16..5 {
            let mut rec = vec![0u8; play_record_size as usize];
            rec[..2].copy_from_slice(&indx.to_le_bytes());
            rec[2..4].copy_from_slice(&(99 + indx).to_le_bytes());
            play_data.extend_from_slice(&rec);
        }

        build_tdb(&[
            TableSpec {
                name: *b"SPBT",
                record_size: spbt_record_size,
                capacity: 4,
                num_records: 4,
                fields: spbt_fields,
                data: spbt_data,
            },
            TableSpec {
                name: *b"SPAI",
                record_size: spai_record_size,
                capacity: 3,
                num_records: 3,
                fields: spai_fields,
                data: spai_data,
            },
            TableSpec {
                name: *b"SGAI",
                record_size: sgai_record_size,
                capacity: 1,
                num_records: 1,
                fields: sgai_fields,
                data: sgai_data,
            },
            TableSpec {
                name: *b"ROST",
                record_size: rost_record_size,
                capacity: 4,
                num_records: 4,
                fields: rost_fields,
                data: rost_data,
            },
            TableSpec {
                name: *b"PLAY",
                record_size: play_record_size,
                capacity: 4,
                num_records: 4,
                fields: play_fields,
                data: play_data,
            },
        ])
    }

    // DRES is bit 31 of the ROST record (16 INDX + 6 TEAM + 7 JERS + 2
    // CAPT), so byte 3 bit 7.
    fn rost_set_dressed(rec: &mut [u8]) {
        rec[3] |= 0x80;
    }

    fn build_viv(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut header_size = 16;
        for (name, _) in files {
            header_size += 8 + name.len() + 1;
        }
        let mut out = Vec::new();
        out.extend_from_slice(bigf::MAGIC);
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
            out[dir_positions[i]..dir_positions[i] + 4].copy_from_slice(&off.to_be_bytes());
        }
        let total = out.len() as u32;
        out[4..8].copy_from_slice(&total.to_le_bytes());
        out[8..12].copy_from_slice(&(files.len() as u32).to_be_bytes());
        out[12..16].copy_from_slice(&(header_size as u32).to_be_bytes());
        out
    }

    fn build_test_iso(slack: usize) -> Vec<u8> {
        let master = build_master_tdb();
        let mut compressed = refpack::compress(&master);
        // Leave room so the recompressed database still fits in place.
        compressed.resize(compressed.len() + slack, 0);
        let viv = build_viv(&[("nhl2007.tdb", &compressed)]);
        build_iso(&[IsoFile {
            path: &DB_VIV_PATH,
            data: &viv,
        }])
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rosterpatch-{}-{}", std::process::id(), name))
    }

    fn boston_roster() -> TeamRoster {
        TeamRoster {
            team: "BOS".to_string(),
            players: vec![
                goalie(1, "TIM NETMINDER", 0.925),
                skater(2, "ALEX CENTER", Position::C, 95.0),
                skater(3, "LEFT WINGER", Position::LW, 70.0),
                skater(4, "BLUE LINER", Position::D, 40.0),
            ],
        }
    }

    #[test]
    fn map_player_encodes_bio_fields() {
        let mut p = skater(7, "JOE FORWARD", Position::RW, 60.0);
        p.weight = 0;
        p.height = 74;
        p.handedness = Handedness::L;
        let record = map_player(&p);
        assert_eq!(record.first_name, "JOE");
        assert_eq!(record.last_name, "FORWARD");
        assert_eq!(record.weight, 190);
        assert_eq!(record.height, 8);
        assert_eq!(record.handedness, 0);
        assert!(matches!(record.attributes, Attributes::Skater(_)));
    }

    #[test]
    fn unit_flags_cover_goalies_lines_and_pairs() {
        let squad = crate::roster::test_support::full_squad();
        let selected =
            roster::select_roster(&squad, CAPACITY, RosterOrder::GoaliesFirst, LINE_SLOTS);
        let units = roster::assign_units(&selected);
        let flags = unit_flags(&selected, &units);

        assert_eq!(flags.get(&0), Some(&FieldCode::Goalie1));
        assert_eq!(flags.get(&1), Some(&FieldCode::Goalie2));
        // First forward after the goalies is the first-line player in
        // the first line slot (a center here).
        assert_eq!(flags.get(&2), Some(&FieldCode::Line1Center));
        // Defense pairs follow the forwards.
        let first_d = 2 + selected.forward_count();
        assert_eq!(flags.get(&first_d), Some(&FieldCode::Pair1LeftDefense));
        assert_eq!(flags.get(&(first_d + 1)), Some(&FieldCode::Pair1RightDefense));
    }

    #[test]
    fn patch_round_trips_through_all_three_containers() {
        let input = temp_path("psp-in.iso");
        let output = temp_path("psp-out.iso");
        std::fs::write(&input, build_test_iso(2048)).unwrap();

        let settings = PatchSettings {
            target: Target::Psp,
            input_path: input.clone(),
            output_path: output.clone(),
        };
        let progress = ProgressHandle::new();
        let report = patch(&settings, &[boston_roster()], &progress).unwrap();
        assert_eq!(report.teams_patched, 1);
        assert_eq!(report.players_patched, 4);

        // Re-open the output and walk back down to the tables.
        let mut patched = File::open(&output).unwrap();
        let viv = iso::read_file(&mut patched, &DB_VIV_PATH).unwrap().unwrap();
        let master = load_tdb(&viv, TDB_MASTER).unwrap().unwrap();

        let spbt = master.table("SPBT").unwrap();
        // Player id 100 is the goalie slot; record 0 in SPBT.
        let bio = spbt.read_record(0).unwrap();
        assert_eq!(
            bio.get(&FieldCode::FirstName).and_then(|v| v.as_str()),
            Some("TIM")
        );
        assert_eq!(
            bio.get(&FieldCode::PositionCode).and_then(Value::as_int),
            Some(4)
        );

        // The goalie keeps the G1 starter flag; the best skater is
        // captain.
        let rost = master.table("ROST").unwrap();
        let goalie_slot = rost.read_record(0).unwrap();
        assert_eq!(
            goalie_slot.get(&FieldCode::Goalie1).and_then(Value::as_int),
            Some(1)
        );
        assert_eq!(
            goalie_slot.get(&FieldCode::Dressed).and_then(Value::as_int),
            Some(1)
        );
        let captain_slot = rost.read_record(1).unwrap();
        assert_eq!(
            captain_slot.get(&FieldCode::Captain).and_then(Value::as_int),
            Some(2)
        );

        let sgai = master.table("SGAI").unwrap();
        let attrs = sgai.read_record(0).unwrap();
        // SV% .925 scales to 57 of 63.
        assert_eq!(
            attrs.get(&FieldCode::GloveHigh).and_then(Value::as_int),
            Some(57)
        );

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
    }

    #[test]
    fn rebuilt_archive_updates_both_directory_size_fields() {
        let input = temp_path("psp-tight-in.iso");
        let output = temp_path("psp-tight-out.iso");
        // No slack: the rewritten names compress worse than the zeroed
        // originals, so the in-place replace fails and the archive is
        // rebuilt at a different size.
        std::fs::write(&input, build_test_iso(0)).unwrap();

        let mut original = File::open(&input).unwrap();
        let original_size = iso::find_file(&mut original, &DB_VIV_PATH)
            .unwrap()
            .unwrap()
            .size;

        let settings = PatchSettings {
            target: Target::Psp,
            input_path: input.clone(),
            output_path: output.clone(),
        };
        let progress = ProgressHandle::new();
        patch(&settings, &[boston_roster()], &progress).unwrap();

        let mut patched = File::open(&output).unwrap();
        let viv = iso::read_file(&mut patched, &DB_VIV_PATH).unwrap().unwrap();
        assert_ne!(viv.len() as u32, original_size);
        assert!(load_tdb(&viv, TDB_MASTER).unwrap().is_some());

        // The directory record stores the size twice; a same-slot
        // rewrite must refresh both byte orders.
        let record_offset = iso::find_dir_record_offset(&mut patched, &DB_VIV_PATH)
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 4];
        patched.seek(SeekFrom::Start(record_offset + 10)).unwrap();
        patched.read_exact(&mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), viv.len() as u32);
        patched.seek(SeekFrom::Start(record_offset + 14)).unwrap();
        patched.read_exact(&mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf), viv.len() as u32);

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
    }

    #[test]
    fn validate_fast_and_deep() {
        let input = temp_path("psp-validate.iso");
        std::fs::write(&input, build_test_iso(512)).unwrap();
        assert!(validate(&input, false).unwrap());
        assert!(validate(&input, true).unwrap());
        std::fs::remove_file(&input).ok();

        let garbage = temp_path("psp-garbage.iso");
        std::fs::write(&garbage, vec![0u8; 40 * 2048]).unwrap();
        assert!(!validate(&garbage, false).unwrap());
        std::fs::remove_file(&garbage).ok();
    }

    #[test]
    fn cancellation_stops_between_teams() {
        let input = temp_path("psp-cancel-in.iso");
        let output = temp_path("psp-cancel-out.iso");
        std::fs::write(&input, build_test_iso(1024)).unwrap();

        let settings = PatchSettings {
            target: Target::Psp,
            input_path: input.clone(),
            output_path: output.clone(),
        };
        let progress = ProgressHandle::new();
        progress.cancel();
        let result = patch(&settings, &[boston_roster()], &progress);
        assert!(matches!(result, Err(PatchError::Cancelled)));

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
    }
}
