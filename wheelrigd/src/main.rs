//! Wheelrig Daemon - Session driver for the wheel-turning rig
//!
//! Asks the operator for animal, experimenter and task, bootstraps the session
//! from the animal's history, then runs trials until `stop` is typed, Ctrl-C
//! is pressed, or a continuation check ends the session. On stop the stage
//! decision and metadata are written and a summary is printed.
//!
//! Storage locations (override with `WHEELRIG_HOME`):
//! - Linux: ~/.local/share/wheelrig/
//! - Windows: %APPDATA%\wheelrig\
//! - MacOS: ~/Library/Application Support/wheelrig/
//!
//! Flags:
//! - `--animal <id>`, `--experimenter <name>`, `--task <2afc|gonogo|detection>`
//! - `--droid <name>` rig name written to metadata (default `droid`)
//! - `--seed <n>` reproducible trial scheduling
//! - `--sync` record the imaging sync input, `--camera` emit camera triggers
//! - `--idle` no simulated animal; the wheel stays still

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wheelrig::error::RigError;
use wheelrig::policy::TaskKind;
use wheelrig::prng::TaskRng;
use wheelrig::psychometric::GridFit;
use wheelrig::recorder::{self, RecorderHandle};
use wheelrig::session::{Session, SessionBootstrap, SessionContext};

mod paths;
mod rig;

use paths::AppPaths;
use rig::{AnimalModel, ClockedInput, DryRig, LoggedPin, SimulatedAnimal};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unknown task {0:?} (expected 2afc, gonogo or detection)")]
    UnknownTask(String),
    #[error("stdin closed before {0} was entered")]
    InputClosed(&'static str),
    #[error("bad value for {flag}: {value:?}")]
    BadFlag { flag: &'static str, value: String },
    #[error("{0} thread panicked")]
    Join(&'static str),
    #[error(transparent)]
    Rig(#[from] RigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ═══════════════════════════════════════════════════════════════════════════
// Options
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Options {
    animal: Option<String>,
    experimenter: Option<String>,
    task: Option<String>,
    droid: Option<String>,
    seed: Option<u64>,
    sync: bool,
    camera: bool,
    idle: bool,
}

impl Options {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, DriverError> {
        let mut opts = Options::default();
        while let Some(arg) = args.next() {
            let mut value = |flag: &'static str| {
                args.next().ok_or(DriverError::BadFlag {
                    flag,
                    value: String::new(),
                })
            };
            match arg.as_str() {
                "--animal" => opts.animal = Some(value("--animal")?),
                "--experimenter" => opts.experimenter = Some(value("--experimenter")?),
                "--task" => opts.task = Some(value("--task")?),
                "--droid" => opts.droid = Some(value("--droid")?),
                "--seed" => {
                    let raw = value("--seed")?;
                    opts.seed = Some(raw.parse().map_err(|_| DriverError::BadFlag {
                        flag: "--seed",
                        value: raw,
                    })?);
                }
                "--sync" => opts.sync = true,
                "--camera" => opts.camera = true,
                "--idle" => opts.idle = true,
                other => {
                    return Err(DriverError::BadFlag {
                        flag: "argument",
                        value: other.to_string(),
                    })
                }
            }
        }
        Ok(opts)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Operator prompts
// ═══════════════════════════════════════════════════════════════════════════

type StdinLines = Lines<BufReader<Stdin>>;

async fn prompt(lines: &mut StdinLines, what: &'static str) -> Result<String, DriverError> {
    loop {
        println!("{what}:");
        match lines.next_line().await? {
            Some(line) if !line.trim().is_empty() => return Ok(line.trim().to_string()),
            Some(_) => continue,
            None => return Err(DriverError::InputClosed(what)),
        }
    }
}

async fn wait_for_start(lines: &mut StdinLines) -> Result<(), DriverError> {
    println!("type 'start' to begin the session");
    loop {
        match lines.next_line().await? {
            Some(line) if line.trim().eq_ignore_ascii_case("start") => return Ok(()),
            Some(_) => println!("type 'start' to begin the session"),
            None => return Err(DriverError::InputClosed("start")),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = Options::parse(std::env::args().skip(1))?;
    let paths = AppPaths::new()?;
    info!("rig data under {}", paths.base().display());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let animal = match opts.animal {
        Some(a) => a,
        None => prompt(&mut lines, "animal id").await?,
    };
    let experimenter = match opts.experimenter {
        Some(e) => e,
        None => prompt(&mut lines, "experimenter").await?,
    };
    let task_name = match opts.task {
        Some(t) => t,
        None => prompt(&mut lines, "task (2afc, gonogo, detection)").await?,
    };
    let task = TaskKind::from_short_name(&task_name).ok_or(DriverError::UnknownTask(task_name))?;
    let droid = opts.droid.unwrap_or_else(|| "droid".to_string());

    // Configuration problems stop here, before anything is written.
    let ctx = SessionContext::load(paths.layout(), &animal, task, &experimenter, &droid)?;
    let boot = SessionBootstrap::from_history(&ctx);
    info!(
        animal = %animal,
        task = %task,
        stage = boot.stage,
        first_day = boot.first_day,
        bias_correction = ?boot.bias_correction,
        pump_ms = boot.pump_duration_ms,
        "session prepared"
    );

    wait_for_start(&mut lines).await?;

    let dir = ctx.store.create_session(Local::now())?;
    let dry = DryRig::new();
    let settings = ctx.settings.clone();
    let base = &settings.base_params;

    let mut recorders: Vec<RecorderHandle> = vec![recorder::spawn_position_recorder(
        dry.encoder.clone(),
        Arc::clone(&dry.clock),
        base.rotary_rate,
        &dir.rotary_log_path(),
    )?];
    if opts.sync {
        let input = ClockedInput::new(Arc::clone(&dry.clock), base.sync_rate);
        // Sample well above the pulse rate so no edge is missed.
        recorders.push(recorder::spawn_sync_recorder(
            Box::new(input),
            Arc::clone(&dry.clock),
            base.sync_rate * 4.0,
            &dir.sync_log_path(),
        )?);
    }
    if opts.camera {
        recorders.push(recorder::spawn_trigger_pulses(
            Box::new(LoggedPin::new("trigger_camera", &settings)),
            Arc::clone(&dry.clock),
            base.camera_trigger_rate,
            &dir.camera_log_path(),
        )?);
    }
    let animal_sim = if opts.idle {
        None
    } else {
        let rng = opts.seed.map(|s| TaskRng::new(s ^ 0x5eed)).unwrap_or_else(TaskRng::from_entropy);
        Some(SimulatedAnimal::spawn(
            dry.encoder.clone(),
            Arc::clone(&dry.clock),
            AnimalModel::default(),
            rng,
        )?)
    };

    let mut session = Session::start(ctx, boot, dir, dry.hardware(&settings), opts.seed)?;
    session.mark_recorders(opts.sync, opts.camera);
    println!("session running; type 'stop' to end after the current trial");

    let stop = Arc::new(AtomicBool::new(false));
    let mut runner = {
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || {
            let ending = session.run(&stop);
            (session, ending)
        })
    };

    let mut stdin_open = true;
    let (session, ending) = loop {
        tokio::select! {
            res = &mut runner => break res?,
            line = lines.next_line(), if stdin_open => match line? {
                Some(l) if l.trim().eq_ignore_ascii_case("stop") => {
                    info!("stop requested; finishing the current trial");
                    stop.store(true, Ordering::SeqCst);
                }
                Some(_) => println!("type 'stop' to end the session"),
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C: finishing the current trial");
                stop.store(true, Ordering::SeqCst);
            }
        }
    };
    match &ending {
        Ok(criteria) => info!(?criteria, "session ended"),
        Err(e) => error!("session loop failed: {e}"),
    }

    for handle in recorders {
        let name = handle.name();
        if let Err(e) = handle.stop() {
            warn!("{name} failed: {e}");
        }
    }
    if let Some(sim) = animal_sim {
        let moves = sim.stop()?;
        info!(moves, "simulated animal stopped");
    }

    let meta = session.finish(&GridFit::default(), Local::now())?;
    println!("{}", session.summary());
    if meta.stage_advance {
        info!("{animal} advances to stage {}", meta.next_stage());
    } else {
        info!("{animal} stays at stage {}", meta.curr_stage);
    }
    ending?;
    Ok(())
}
