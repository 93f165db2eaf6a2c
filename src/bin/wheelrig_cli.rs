//! Offline tool for the rig's data directory.
//!
//! Examples:
//!   wheelrig-cli matrix M042 2afc
//!   wheelrig-cli calibrate 48.5 droid3
//!   wheelrig-cli status M042 2afc
//!   wheelrig-cli summary data/M042/20250102/093000
//!
//! The data root defaults to `$WHEELRIG_HOME`, then the current directory;
//! override with `--root <dir>`.

use std::path::PathBuf;
use std::process;

use chrono::Local;
use wheelrig::config::{load_pump_calibration, write_pump_calibration, ResponseMatrix};
use wheelrig::event_log::SessionSummary;
use wheelrig::policy::TaskKind;
use wheelrig::prng::TaskRng;
use wheelrig::reward::read_pump_log;
use wheelrig::storage::{AnimalStore, RigLayout, SessionDir};

fn usage() -> ! {
    eprintln!("Usage: wheelrig-cli [--root <dir>] <command> [args]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  matrix <animal> <task>          Write a random counterbalanced response matrix");
    eprintln!("  calibrate <ms_per_ul> [droid]   Record a pump calibration");
    eprintln!("  status <animal> <task>          Show stage and history for an animal");
    eprintln!("  summary <session_dir>           Summarize a finished session");
    eprintln!("  paths                           Show the data layout");
    process::exit(1);
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    process::exit(1);
}

fn parse_args() -> (PathBuf, Vec<String>) {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let mut root = std::env::var_os("WHEELRIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    if args.len() >= 2 && args[0] == "--root" {
        root = PathBuf::from(&args[1]);
        args.drain(0..2);
    }

    if args.is_empty() {
        usage();
    }

    (root, args)
}

fn nth(args: &[String], i: usize) -> &str {
    args.get(i).map(String::as_str).unwrap_or_else(|| usage())
}

fn parse_task(name: &str) -> TaskKind {
    TaskKind::from_short_name(name).unwrap_or_else(|| fail(format!("unknown task {name:?}")))
}

fn matrix(layout: &RigLayout, animal: &str, task: TaskKind) {
    let path = layout.response_matrix_path(animal);
    if path.exists() {
        fail(format!("{} already exists", path.display()));
    }
    let file = ResponseMatrix::counterbalanced(task, &mut TaskRng::from_entropy());
    file.save(&path).unwrap_or_else(|e| fail(e));
    println!("wrote {}", path.display());
    let mut pairs: Vec<_> = file.pre_reversal.0.iter().collect();
    pairs.sort_by_key(|(class, _)| class.as_str());
    for (class, response) in pairs {
        println!("  {class} -> {response}");
    }
}

fn calibrate(layout: &RigLayout, ms_per_ul: f64, droid: &str) {
    if !(ms_per_ul > 0.0) {
        fail("ms_per_ul must be positive");
    }
    let path = write_pump_calibration(&layout.calibration_dir(), droid, ms_per_ul, Local::now().date_naive())
        .unwrap_or_else(|e| fail(e));
    println!("wrote {}", path.display());
}

fn status(layout: &RigLayout, animal: &str, task: TaskKind) {
    let store = AnimalStore::open(layout, animal).unwrap_or_else(|e| fail(e));
    let sessions = store.sessions();
    println!("animal: {animal} ({} sessions)", sessions.len());
    println!("first day: {}", store.is_first_day());
    match store.latest_metadata(None) {
        Some(meta) => {
            println!(
                "last session: {} {} {} stage {} (advance: {})",
                meta.date, meta.start, meta.procedure, meta.curr_stage, meta.stage_advance
            );
            println!(
                "  trials {} | correct {} | incorrect {} | omission {}",
                meta.trials,
                meta.trial_statistics.correct,
                meta.trial_statistics.incorrect,
                meta.trial_statistics.omission
            );
            println!("  ending: {:?} | ready for experiment: {}", meta.ending_criteria, meta.ready_for_experiment);
            let next = if meta.procedure == task.procedure() {
                meta.next_stage().min(task.max_stage())
            } else {
                0
            };
            println!("next {task} session starts at stage {next}");
        }
        None => println!("no metadata; next {task} session starts at stage 0"),
    }
}

fn summary(layout: &RigLayout, path: PathBuf) {
    if !path.is_dir() {
        fail(format!("{} is not a session directory", path.display()));
    }
    let dir = SessionDir::from_path(path);
    let ms_per_ul = load_pump_calibration(&layout.calibration_dir()).unwrap_or_else(|e| fail(e));
    let pumps = match dir.pump_log_path() {
        p if p.exists() => read_pump_log(&p).unwrap_or_else(|e| fail(e)),
        _ => Vec::new(),
    };
    if let Some(meta) = dir.read_metadata() {
        println!(
            "{} {} {} stage {} ({:?})",
            meta.animal_id, meta.date, meta.procedure, meta.curr_stage, meta.ending_criteria
        );
    }
    println!("{}", SessionSummary::from_logs(&dir.read_trials(), &pumps, ms_per_ul));
}

fn paths(layout: &RigLayout) {
    println!("Data root: {}", layout.base().display());
    println!("Rig settings: {}", layout.rig_settings_path().display());
    for task in TaskKind::ALL {
        println!("{task} prefs: {}", layout.task_prefs_path(task).display());
    }
    println!("Animal data: {}", layout.data_dir().display());
    println!("Pump calibration: {}", layout.calibration_dir().display());
}

fn main() {
    let (root, args) = parse_args();
    let layout = RigLayout::new(root);
    let arg = |i: usize| nth(&args, i);

    match arg(0) {
        "matrix" => matrix(&layout, arg(1), parse_task(arg(2))),
        "calibrate" => {
            let ms_per_ul: f64 = arg(1)
                .parse()
                .unwrap_or_else(|_| fail("ms_per_ul must be a number"));
            let droid = args.get(2).map(String::as_str).unwrap_or("droid");
            calibrate(&layout, ms_per_ul, droid);
        }
        "status" => status(&layout, arg(1), parse_task(arg(2))),
        "summary" => summary(&layout, PathBuf::from(arg(1))),
        "paths" => paths(&layout),
        _ => usage(),
    }
}
