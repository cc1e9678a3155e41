//! Roster patching engine for a family of hockey game images: the
//! NHL '94 Genesis and SNES cartridges and the NHL 07 PSP disc. Fetched
//! real-world rosters are mapped onto each image's native containers
//! in place, never growing or shifting the surrounding structure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod bigf;
pub mod genesis;
pub mod iso;
pub mod psp;
pub mod refpack;
pub mod roster;
pub mod scale;
pub mod snes;
pub mod tdb;

use roster::TeamRoster;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid container: {0}")]
    InvalidContainer(String),
    #[error("corrupt block: {0}")]
    CorruptBlock(String),
    #[error("entry not found: {0}")]
    MissingEntry(String),
    #[error("table or field not found: {0}")]
    MissingTable(String),
    #[error("'{name}' is {new_len} bytes but only {available} are allocated")]
    EntryTooLarge {
        name: String,
        new_len: usize,
        available: usize,
    },
    #[error("{context}: {wanted} exceeds capacity {capacity}")]
    CapacityExceeded {
        context: String,
        wanted: usize,
        capacity: usize,
    },
    #[error("record {index} out of range for table {table} (capacity {capacity})")]
    IndexOutOfRange {
        table: String,
        index: usize,
        capacity: usize,
    },
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Genesis,
    Snes,
    Psp,
}

impl std::str::FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Target, String> {
        match s.to_ascii_lowercase().as_str() {
            "genesis" => Ok(Target::Genesis),
            "snes" => Ok(Target::Snes),
            "psp" => Ok(Target::Psp),
            other => Err(format!(
                "unknown target '{}' (expected genesis, snes or psp)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSettings {
    pub target: Target,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamReport {
    pub slot: usize,
    pub name: String,
    pub players_written: usize,
    pub goalies: usize,
    pub forwards: usize,
    pub defense: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchReport {
    pub teams_patched: usize,
    pub players_patched: usize,
    pub teams: Vec<TeamReport>,
}

impl PatchReport {
    pub(crate) fn push_team(&mut self, team: TeamReport) {
        self.teams_patched += 1;
        self.players_patched += team.players_written;
        self.teams.push(team);
    }
}

/// Shared progress state, safe to poll from another thread while a patch
/// job runs. The fraction is stored as f32 bits in an atomic; the
/// message sits behind a mutex since it changes rarely.
#[derive(Debug, Default)]
pub struct ProgressHandle {
    fraction_bits: AtomicU32,
    message: Mutex<String>,
    cancelled: AtomicBool,
}

impl ProgressHandle {
    pub fn new() -> Arc<ProgressHandle> {
        Arc::new(ProgressHandle::default())
    }

    pub fn set(&self, fraction: f32, message: &str) {
        self.fraction_bits
            .store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        if let Ok(mut m) = self.message.lock() {
            if *m != message {
                m.clear();
                m.push_str(message);
            }
        }
    }

    pub fn fraction(&self) -> f32 {
        f32::from_bits(self.fraction_bits.load(Ordering::Relaxed))
    }

    pub fn message(&self) -> String {
        self.message
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Cooperative cancellation point; patchers call this between teams.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PatchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Validate an input image without patching. `deep` decompresses and
/// parses the inner databases where the target has them; the fast path
/// only checks sizes and headers.
pub fn validate_input(settings: &PatchSettings, deep: bool) -> Result<bool> {
    match settings.target {
        Target::Genesis => {
            let data = std::fs::read(&settings.input_path)?;
            Ok(genesis::validate(&data, deep))
        }
        Target::Snes => {
            let data = std::fs::read(&settings.input_path)?;
            Ok(snes::validate(&data, deep))
        }
        Target::Psp => psp::validate(&settings.input_path, deep),
    }
}

/// Run a whole patch job: validate, plan, apply, finalize. A failed or
/// cancelled job removes its partial output file.
pub fn run(
    settings: &PatchSettings,
    rosters: &[TeamRoster],
    progress: &ProgressHandle,
) -> Result<PatchReport> {
    info!(
        "patching {:?} image {} -> {}",
        settings.target,
        settings.input_path.display(),
        settings.output_path.display()
    );

    let result = match settings.target {
        Target::Genesis => genesis::patch(settings, rosters, progress),
        Target::Snes => snes::patch(settings, rosters, progress),
        Target::Psp => psp::patch(settings, rosters, progress),
    };

    match &result {
        Ok(report) => {
            info!(
                "patched {} teams, {} players",
                report.teams_patched, report.players_patched
            );
        }
        Err(err) => {
            warn!("patch failed: {}", err);
            if settings.output_path != settings.input_path
                && settings.output_path.exists()
            {
                let _ = std::fs::remove_file(&settings.output_path);
            }
        }
    }

    result
}

/// Run a patch job on a background thread. The returned handle can be
/// polled for progress and used to cancel; join the thread for the
/// result.
pub fn spawn_patch_job(
    settings: PatchSettings,
    rosters: Vec<TeamRoster>,
) -> (Arc<ProgressHandle>, JoinHandle<Result<PatchReport>>) {
    let progress = ProgressHandle::new();
    let worker_progress = Arc::clone(&progress);
    let handle = std::thread::spawn(move || run(&settings, &rosters, &worker_progress));
    (progress, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parses_case_insensitively() {
        assert_eq!("Genesis".parse::<Target>().unwrap(), Target::Genesis);
        assert_eq!("SNES".parse::<Target>().unwrap(), Target::Snes);
        assert_eq!("psp".parse::<Target>().unwrap(), Target::Psp);
        assert!("n64".parse::<Target>().is_err());
    }

    #[test]
    fn progress_handle_round_trips_fraction_and_message() {
        let progress = ProgressHandle::new();
        progress.set(0.25, "writing Boston");
        assert!((progress.fraction() - 0.25).abs() < f32::EPSILON);
        assert_eq!(progress.message(), "writing Boston");

        progress.set(7.0, "done");
        assert!((progress.fraction() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn cancellation_is_sticky_and_typed() {
        let progress = ProgressHandle::new();
        assert!(progress.check_cancelled().is_ok());
        progress.cancel();
        assert!(progress.is_cancelled());
        assert!(matches!(
            progress.check_cancelled(),
            Err(PatchError::Cancelled)
        ));
    }
}
