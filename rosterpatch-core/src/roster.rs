//! Fetched-roster model and the pure selection logic shared by every
//! target: ranking, forward-line construction, special-team units and
//! captaincy. Everything here is deterministic; ties keep input order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    C,
    LW,
    RW,
    D,
    G,
}

impl Position {
    pub fn is_forward(self) -> bool {
        matches!(self, Position::C | Position::LW | Position::RW)
    }

    pub fn is_goalie(self) -> bool {
        self == Position::G
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Handedness {
    #[default]
    L,
    R,
}

/// A player as delivered by the roster-file provider. Stats are keyed by
/// the provider's column names (`"G"`, `"A"`, `"PTS"`, `"+/-"`, `"PIM"`,
/// `"SV%"`, `"GAA"`, `"SOG"`, `"FO%"`, `"W"`); absent keys read as zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPlayer {
    pub id: u32,
    pub name: String,
    pub position: Position,
    #[serde(default)]
    pub jersey_number: u32,
    /// Pounds; zero means unknown.
    #[serde(default)]
    pub weight: u32,
    /// Inches; zero means unknown.
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub handedness: Handedness,
    #[serde(default)]
    pub stats: HashMap<String, f64>,
}

impl FetchedPlayer {
    pub fn stat(&self, key: &str) -> f64 {
        self.stats.get(key).copied().unwrap_or(0.0)
    }

    /// Ranking key: points for skaters, a save-percentage proxy for
    /// goalies (scaled so it dominates the same way points do).
    pub fn rank_key(&self) -> f64 {
        if self.position.is_goalie() {
            self.stat("SV%") * 1000.0
        } else {
            self.stat("PTS")
        }
    }
}

/// One team's fetched roster, keyed by provider abbreviation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRoster {
    pub team: String,
    pub players: Vec<FetchedPlayer>,
}

/// Slot budget read from the target container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCapacity {
    pub goalies: usize,
    pub forwards: usize,
    pub defense: usize,
}

impl SlotCapacity {
    pub fn total(&self) -> usize {
        self.goalies + self.forwards + self.defense
    }
}

/// Stream order the target container expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterOrder {
    /// Forwards, defense, goalies (Genesis cartridge).
    ForwardsFirst,
    /// Goalies, forwards, defense (SNES cartridge and the disc target).
    GoaliesFirst,
}

/// Finalized roster in container stream order.
#[derive(Debug, Clone)]
pub struct SelectedRoster {
    pub players: Vec<FetchedPlayer>,
    pub line_slots: [Position; 3],
}

impl SelectedRoster {
    pub fn goalie_count(&self) -> usize {
        self.players.iter().filter(|p| p.position.is_goalie()).count()
    }

    pub fn forward_count(&self) -> usize {
        self.players.iter().filter(|p| p.position.is_forward()).count()
    }

    pub fn defense_count(&self) -> usize {
        self.players
            .iter()
            .filter(|p| p.position == Position::D)
            .count()
    }
}

/// Indices of `players` matching `pred`, best rank first. Stable: equal
/// keys keep provider order.
fn ranked_indices(players: &[FetchedPlayer], pred: impl Fn(&FetchedPlayer) -> bool) -> Vec<usize> {
    let mut v: Vec<usize> = (0..players.len()).filter(|&i| pred(&players[i])).collect();
    v.sort_by(|&a, &b| players[b].rank_key().total_cmp(&players[a].rank_key()));
    v
}

/// Pick and order a roster for a container.
///
/// Four forward lines are filled slot by slot in `line_slots` order,
/// taking the line-th best player of the slot's natural position and
/// backfilling an exhausted position from the best remaining forward of
/// any type. Remaining forward slots, the defense group and the goalie
/// group are filled by rank. If the groups cannot exhaust the capacity,
/// leftover players of any position are appended by rank; the result
/// never exceeds `capacity.total()`.
pub fn select_roster(
    players: &[FetchedPlayer],
    capacity: SlotCapacity,
    order: RosterOrder,
    line_slots: [Position; 3],
) -> SelectedRoster {
    let centers = ranked_indices(players, |p| p.position == Position::C);
    let left_wings = ranked_indices(players, |p| p.position == Position::LW);
    let right_wings = ranked_indices(players, |p| p.position == Position::RW);
    let defensemen = ranked_indices(players, |p| p.position == Position::D);
    let goalie_pool = ranked_indices(players, |p| p.position.is_goalie());
    let all_forwards = ranked_indices(players, |p| p.position.is_forward());

    let by_position = |pos: Position| -> &Vec<usize> {
        match pos {
            Position::LW => &left_wings,
            Position::RW => &right_wings,
            _ => &centers,
        }
    };

    let mut used = vec![false; players.len()];

    let mut forwards: Vec<usize> = Vec::new();
    for _line in 0..4 {
        for slot_pos in line_slots {
            if forwards.len() >= capacity.forwards {
                break;
            }
            let pick = by_position(slot_pos)
                .iter()
                .find(|&&i| !used[i])
                .or_else(|| all_forwards.iter().find(|&&i| !used[i]))
                .copied();
            if let Some(i) = pick {
                used[i] = true;
                forwards.push(i);
            }
        }
    }
    // Extra forwards beyond the four lines, best remaining first.
    for &i in &all_forwards {
        if forwards.len() >= capacity.forwards {
            break;
        }
        if !used[i] {
            used[i] = true;
            forwards.push(i);
        }
    }

    let defense: Vec<usize> = defensemen.iter().take(capacity.defense).copied().collect();
    let goalies: Vec<usize> = goalie_pool.iter().take(capacity.goalies).copied().collect();
    for &i in defense.iter().chain(&goalies) {
        used[i] = true;
    }

    let mut selected: Vec<usize> = match order {
        RosterOrder::ForwardsFirst => {
            forwards.iter().chain(&defense).chain(&goalies).copied().collect()
        }
        RosterOrder::GoaliesFirst => {
            goalies.iter().chain(&forwards).chain(&defense).copied().collect()
        }
    };

    // Leftovers by rank until the container is full.
    for i in ranked_indices(players, |_| true) {
        if selected.len() >= capacity.total() {
            break;
        }
        if !used[i] {
            used[i] = true;
            selected.push(i);
        }
    }
    selected.truncate(capacity.total());

    SelectedRoster {
        players: selected.into_iter().map(|i| players[i].clone()).collect(),
        line_slots,
    }
}

/// Line and special-team units derived from a finalized roster. All
/// indices point into `SelectedRoster::players`.
#[derive(Debug, Clone, Default)]
pub struct UnitAssignments {
    /// Four even-strength lines, in `line_slots` order.
    pub forward_lines: [[Option<usize>; 3]; 4],
    /// Three defense pairs, left then right.
    pub defense_pairs: [[Option<usize>; 2]; 3],
    pub goalies: [Option<usize>; 2],
    /// Top three forwards plus top defense pair.
    pub power_play: Vec<usize>,
    /// Next-best two forwards plus top defense pair.
    pub penalty_kill: Vec<usize>,
    pub captain: Option<usize>,
    pub alternates: Vec<usize>,
}

pub fn assign_units(roster: &SelectedRoster) -> UnitAssignments {
    let mut units = UnitAssignments::default();

    let forwards: Vec<usize> = roster
        .players
        .iter()
        .enumerate()
        .filter(|(_, p)| p.position.is_forward())
        .map(|(i, _)| i)
        .collect();
    let defense: Vec<usize> = roster
        .players
        .iter()
        .enumerate()
        .filter(|(_, p)| p.position == Position::D)
        .map(|(i, _)| i)
        .collect();
    let goalies: Vec<usize> = roster
        .players
        .iter()
        .enumerate()
        .filter(|(_, p)| p.position.is_goalie())
        .map(|(i, _)| i)
        .collect();

    for (n, chunk) in forwards.chunks(3).take(4).enumerate() {
        for (s, &idx) in chunk.iter().enumerate() {
            units.forward_lines[n][s] = Some(idx);
        }
    }
    for (n, chunk) in defense.chunks(2).take(3).enumerate() {
        for (s, &idx) in chunk.iter().enumerate() {
            units.defense_pairs[n][s] = Some(idx);
        }
    }
    for (n, &idx) in goalies.iter().take(2).enumerate() {
        units.goalies[n] = Some(idx);
    }

    units.power_play = forwards
        .iter()
        .take(3)
        .chain(defense.iter().take(2))
        .copied()
        .collect();
    units.penalty_kill = forwards
        .iter()
        .skip(3)
        .take(2)
        .chain(defense.iter().take(2))
        .copied()
        .collect();

    // Captain and alternates: the three best skaters in stream order.
    let mut skaters = roster
        .players
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.position.is_goalie())
        .map(|(i, _)| i);
    units.captain = skaters.next();
    units.alternates = skaters.take(2).collect();

    units
}


#[cfg(test)]
mod tests {
    use super::test_support::{full_squad, goalie, skater};
    use super::*;

    const CART_CAPACITY: SlotCapacity = SlotCapacity {
        goalies: 2,
        forwards: 14,
        defense: 7,
    };
    const SLOTS_CLR: [Position; 3] = [Position::C, Position::LW, Position::RW];

    #[test]
    fn selection_is_deterministic() {
        let squad = full_squad();
        let a = select_roster(&squad, CART_CAPACITY, RosterOrder::GoaliesFirst, SLOTS_CLR);
        let b = select_roster(&squad, CART_CAPACITY, RosterOrder::GoaliesFirst, SLOTS_CLR);
        let ids_a: Vec<u32> = a.players.iter().map(|p| p.id).collect();
        let ids_b: Vec<u32> = b.players.iter().map(|p| p.id).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn goalies_first_puts_netminders_at_the_front() {
        let squad = full_squad();
        let roster = select_roster(&squad, CART_CAPACITY, RosterOrder::GoaliesFirst, SLOTS_CLR);
        assert_eq!(roster.players[0].position, Position::G);
        assert_eq!(roster.players[1].position, Position::G);
        // Best save percentage starts.
        assert_eq!(roster.players[0].name, "G1");
        assert!(roster.players[2].position.is_forward());
    }

    #[test]
    fn forwards_first_puts_goalies_last() {
        let squad = full_squad();
        let roster = select_roster(&squad, CART_CAPACITY, RosterOrder::ForwardsFirst, SLOTS_CLR);
        let n = roster.players.len();
        assert!(roster.players[0].position.is_forward());
        assert_eq!(roster.players[n - 1].position, Position::G);
        assert_eq!(roster.players[n - 2].position, Position::G);
    }

    #[test]
    fn first_line_is_best_at_each_position() {
        let squad = full_squad();
        let roster = select_roster(&squad, CART_CAPACITY, RosterOrder::ForwardsFirst, SLOTS_CLR);
        assert_eq!(roster.players[0].name, "C1");
        assert_eq!(roster.players[1].name, "LW1");
        assert_eq!(roster.players[2].name, "RW1");
        assert_eq!(roster.players[3].name, "C2");
    }

    #[test]
    fn exhausted_position_backfills_from_best_remaining_forward() {
        // Only one center: lines 2-4 take wings at the center slot.
        let squad = vec![
            skater(1, "C1", Position::C, 90.0),
            skater(2, "LW1", Position::LW, 80.0),
            skater(3, "LW2", Position::LW, 75.0),
            skater(4, "LW3", Position::LW, 70.0),
            skater(5, "RW1", Position::RW, 65.0),
            skater(6, "RW2", Position::RW, 60.0),
        ];
        let roster = select_roster(&squad, CART_CAPACITY, RosterOrder::ForwardsFirst, SLOTS_CLR);
        let names: Vec<&str> = roster.players.iter().map(|p| p.name.as_str()).collect();
        // Line 1 natural, line 2 center slot backfilled by LW2 (the best
        // remaining forward at that point).
        assert_eq!(names[0], "C1");
        assert_eq!(names[1], "LW1");
        assert_eq!(names[2], "RW1");
        assert_eq!(names[3], "LW2");
        assert_eq!(roster.players.len(), 6);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let squad = full_squad();
        let tight = SlotCapacity {
            goalies: 1,
            forwards: 3,
            defense: 1,
        };
        let roster = select_roster(&squad, tight, RosterOrder::GoaliesFirst, SLOTS_CLR);
        assert_eq!(roster.players.len(), 5);
        assert_eq!(roster.goalie_count(), 1);
        assert_eq!(roster.forward_count(), 3);
        assert_eq!(roster.defense_count(), 1);
    }

    #[test]
    fn seven_players_into_five_slots() {
        let squad = vec![
            skater(1, "C1", Position::C, 50.0),
            skater(2, "LW1", Position::LW, 45.0),
            skater(3, "RW1", Position::RW, 40.0),
            skater(4, "C2", Position::C, 35.0),
            skater(5, "D1", Position::D, 30.0),
            skater(6, "D2", Position::D, 25.0),
            goalie(7, "G1", 0.910),
        ];
        let capacity = SlotCapacity {
            goalies: 1,
            forwards: 3,
            defense: 1,
        };
        let roster = select_roster(&squad, capacity, RosterOrder::GoaliesFirst, SLOTS_CLR);
        assert_eq!(roster.players.len(), 5);
        let names: Vec<&str> = roster.players.iter().map(|p| p.name.as_str()).collect();
        // The weakest center and defenseman are cut.
        assert!(!names.contains(&"C2"));
        assert!(!names.contains(&"D2"));
    }

    #[test]
    fn short_squad_leaves_slots_unfilled_without_padding() {
        let squad = vec![
            skater(1, "C1", Position::C, 50.0),
            goalie(2, "G1", 0.9),
        ];
        let roster = select_roster(&squad, CART_CAPACITY, RosterOrder::GoaliesFirst, SLOTS_CLR);
        assert_eq!(roster.players.len(), 2);
    }

    #[test]
    fn leftovers_fill_unused_capacity_by_rank() {
        // Ten defensemen against a 3-defense budget, with forward and
        // goalie slots open: leftover defensemen spill in by rank.
        let mut squad: Vec<FetchedPlayer> = (0..10)
            .map(|i| skater(i + 1, &format!("D{}", i + 1), Position::D, 50.0 - i as f64))
            .collect();
        squad.push(goalie(11, "G1", 0.9));
        let capacity = SlotCapacity {
            goalies: 2,
            forwards: 3,
            defense: 3,
        };
        let roster = select_roster(&squad, capacity, RosterOrder::GoaliesFirst, SLOTS_CLR);
        assert_eq!(roster.players.len(), 8);
        let names: Vec<&str> = roster.players.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names[0], "G1");
        assert_eq!(names[1], "D1");
        // Spilled leftovers keep descending rank.
        assert_eq!(names[4..], ["D4", "D5", "D6", "D7"]);
    }

    #[test]
    fn units_follow_stream_order() {
        let squad = full_squad();
        let roster = select_roster(&squad, CART_CAPACITY, RosterOrder::GoaliesFirst, SLOTS_CLR);
        let units = assign_units(&roster);

        assert_eq!(units.goalies[0], Some(0));
        assert_eq!(units.goalies[1], Some(1));
        // First line is the first three forwards in stream order.
        assert_eq!(units.forward_lines[0], [Some(2), Some(3), Some(4)]);
        assert_eq!(units.power_play.len(), 5);
        assert_eq!(units.penalty_kill.len(), 4);
        // PP is the top three forwards plus the top pair.
        assert_eq!(units.power_play[..3], [2, 3, 4]);
        assert_eq!(units.power_play[3], units.defense_pairs[0][0].unwrap());
    }

    #[test]
    fn captaincy_goes_to_the_top_skaters() {
        let squad = full_squad();
        let roster = select_roster(&squad, CART_CAPACITY, RosterOrder::GoaliesFirst, SLOTS_CLR);
        let units = assign_units(&roster);
        // Goalies lead the stream but never wear the C.
        assert_eq!(units.captain, Some(2));
        assert_eq!(units.alternates, vec![3, 4]);
    }

    #[test]
    fn roster_file_json_round_trips() {
        // The shape the CLI reads from --rosters. Optional bio fields
        // and stats may be absent.
        let json = r#"[
            {
                "team": "BOS",
                "players": [
                    {
                        "id": 17,
                        "name": "MILAN LUCIC",
                        "position": "LW",
                        "jersey_number": 17,
                        "weight": 236,
                        "height": 75,
                        "handedness": "L",
                        "stats": { "G": 30.0, "A": 32.0, "PTS": 62.0 }
                    },
                    { "id": 40, "name": "TUUKKA RASK", "position": "G" }
                ]
            }
        ]"#;
        let rosters: Vec<TeamRoster> = serde_json::from_str(json).unwrap();
        assert_eq!(rosters.len(), 1);
        assert_eq!(rosters[0].team, "BOS");
        assert_eq!(rosters[0].players[0].stat("PTS"), 62.0);
        let g = &rosters[0].players[1];
        assert_eq!(g.position, Position::G);
        assert_eq!(g.weight, 0);
        assert_eq!(g.handedness, Handedness::L);

        let back = serde_json::to_string(&rosters).unwrap();
        let again: Vec<TeamRoster> = serde_json::from_str(&back).unwrap();
        assert_eq!(again[0].players.len(), 2);
    }
}
