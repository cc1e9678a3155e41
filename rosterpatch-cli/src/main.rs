use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::error;
use rosterpatch_core::roster::TeamRoster;
use rosterpatch_core::{spawn_patch_job, validate_input, PatchSettings, Target};

#[derive(Parser)]
#[command(name = "rosterpatch", version, about = "Patch hockey game images with current rosters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Patch an image, writing the result to a new file.
    Patch {
        /// Image to patch.
        input: PathBuf,
        /// Target platform: genesis, snes or psp.
        #[arg(short, long)]
        target: Target,
        /// Roster JSON, a list of teams with their players.
        #[arg(short, long)]
        rosters: PathBuf,
        /// Where to write the patched image.
        #[arg(short, long)]
        output: PathBuf,
        /// Write a JSON patch report here.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Validate an image without writing anything.
    Check {
        /// Image to inspect.
        input: PathBuf,
        /// Target platform: genesis, snes or psp.
        #[arg(short, long)]
        target: Target,
        /// Also decompress and parse the inner databases.
        #[arg(long)]
        deep: bool,
    },
}

fn load_rosters(path: &Path) -> Result<Vec<TeamRoster>, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    serde_json::from_reader(file).map_err(|e| format!("bad roster file {}: {}", path.display(), e))
}

fn run_patch(
    settings: PatchSettings,
    rosters: Vec<TeamRoster>,
    report_path: Option<PathBuf>,
) -> ExitCode {
    let bar = ProgressBar::new(100);
    if let Ok(style) =
        ProgressStyle::with_template("{bar:40.cyan/blue} {percent:>3}% {msg}")
    {
        bar.set_style(style);
    }

    let (progress, handle) = spawn_patch_job(settings, rosters);
    while !handle.is_finished() {
        bar.set_position((progress.fraction() * 100.0) as u64);
        bar.set_message(progress.message());
        std::thread::sleep(Duration::from_millis(100));
    }

    let result = match handle.join() {
        Ok(result) => result,
        Err(_) => {
            bar.abandon_with_message("patch worker panicked");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(report) => {
            bar.finish_with_message(format!(
                "patched {} teams, {} players",
                report.teams_patched, report.players_patched
            ));
            if let Some(path) = report_path {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => {
                        if let Err(e) = std::fs::write(&path, json) {
                            error!("cannot write report {}: {}", path.display(), e);
                            return ExitCode::FAILURE;
                        }
                    }
                    Err(e) => {
                        error!("cannot serialize report: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            bar.abandon_with_message(format!("patch failed: {}", e));
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_check(settings: PatchSettings, deep: bool) -> ExitCode {
    match validate_input(&settings, deep) {
        Ok(true) => {
            println!("{}: ok", settings.input_path.display());
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("{}: not a recognized image", settings.input_path.display());
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Patch {
            input,
            target,
            rosters,
            output,
            report,
        } => {
            let roster_list = match load_rosters(&rosters) {
                Ok(list) => list,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            let settings = PatchSettings {
                target,
                input_path: input,
                output_path: output,
            };
            run_patch(settings, roster_list, report)
        }
        Command::Check { input, target, deep } => {
            let settings = PatchSettings {
                target,
                input_path: input.clone(),
                output_path: input,
            };
            run_check(settings, deep)
        }
    }
}
