// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::Level;
use uuid::Uuid;

use genstudio::config::{self, Config};
use genstudio::{
    Entry, EntryParams, EntryState, ErrorBuilder, FsResourceStore, JobQueue, JsonFileGateway,
    QueueEvent, ResourcePhase, ResourceStore, ResourceVersion, Studio, StudioParts,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Service unavailable - the model could not be made ready
    pub const SERVICE_UNAVAILABLE: i32 = 69;
}

/// Progress bar helpers for consistent indicators
mod progress {
    use colored::Colorize;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    /// Percent bar for downloads and renders
    pub fn bar(message: &str) -> ProgressBar {
        let pb = ProgressBar::new(100);
        let style = ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% | {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");
        pb.set_style(style);
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn finish_success(pb: &ProgressBar, message: &str) {
        pb.finish_and_clear();
        println!("{} {}", "[OK]".green(), message);
    }

    pub fn finish_error(pb: &ProgressBar, message: &str) {
        pb.finish_and_clear();
        println!("{} {}", "[X]".red(), message);
    }
}

/// genstudio - Local image generation queue
#[derive(Parser)]
#[command(name = "genstudio")]
#[command(version = VERSION)]
#[command(about = "Fetch a diffusion model once, then render a durable queue of prompts.")]
#[command(long_about = "genstudio - Local image generation queue\n\n\
    Queue a prompt:      genstudio add \"a lighthouse at dusk\"\n\
    Render the queue:    genstudio run\n\
    See what's queued:   genstudio list\n\
    Download the model:  genstudio fetch\n\
    Pick a model:        genstudio models --select sd-1-5")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose mode: debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show model readiness and queue summary
    #[command(alias = "s")]
    Status,

    /// List every entry in display order
    #[command(alias = "ls")]
    List,

    /// Queue a new prompt
    ///
    /// Examples:
    ///   genstudio add "a red kite over dunes"
    ///   genstudio add "portrait" --seed 42 --steps 30
    Add {
        prompt: String,
        #[arg(short, long, default_value = "")]
        negative: String,
        #[arg(long)]
        seed: Option<u32>,
        #[arg(long, default_value_t = EntryParams::DEFAULT_STEPS)]
        steps: u32,
        #[arg(short, long, default_value_t = EntryParams::DEFAULT_GUIDANCE)]
        guidance: f32,
        /// Start from an existing image
        #[arg(long)]
        image: Option<PathBuf>,
        /// How far to move away from --image (0.0 to 1.0)
        #[arg(long, default_value_t = EntryParams::DEFAULT_STRENGTH)]
        strength: f32,
    },

    /// Cancel a queued job
    Cancel { id: String },

    /// Move a queued job to the front of the queue
    Prioritize { id: String },

    /// Delete an entry and its image
    #[command(alias = "rm")]
    Remove { id: String },

    /// Queue a new-seed variant of a finished entry
    Variant {
        id: String,
        /// Insert an editable copy pinned to the same seed instead
        #[arg(long)]
        edit: bool,
    },

    /// Download and prepare the model without rendering
    Fetch {
        /// Model key from `genstudio models`
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Prepare the model and render the queue until it is empty
    Run {
        /// Keep waiting for new jobs after the queue drains
        #[arg(long)]
        watch: bool,
    },

    /// List available models
    Models {
        /// Make this model the default
        #[arg(long)]
        select: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = dispatch(cli.command) {
        eprintln!("{} {:#}", "[X]".red(), e);
        std::process::exit(exit_codes::ERROR);
    }
}

fn dispatch(command: Commands) -> Result<()> {
    let home = config::get_config_dir()?;
    let mut config = config::load_config()?;

    match command {
        Commands::Status => show_status(&config, &home),
        Commands::List => list_entries(&open_queue(&config, &home)?),
        Commands::Add {
            prompt,
            negative,
            seed,
            steps,
            guidance,
            image,
            strength,
        } => {
            if prompt.trim().is_empty() {
                bail!("Prompt must not be empty");
            }
            let params = EntryParams {
                prompt,
                negative_prompt: negative,
                seed,
                steps,
                guidance,
                source_image: image,
                strength,
            };
            let queue = open_queue(&config, &home)?;
            let token = queue.enqueue(Entry::new(params))?;
            println!(
                "{} Queued {} at position {}",
                "[OK]".green(),
                short_id(token.id).cyan(),
                token.position + 1
            );
            Ok(())
        }
        Commands::Cancel { id } => {
            let queue = open_queue(&config, &home)?;
            let id = queue.resolve_id(&id)?;
            if queue.cancel(id)? {
                println!("{} Cancelled {}", "[OK]".green(), short_id(id));
            } else {
                println!("{} {} already finished", "[!]".yellow(), short_id(id));
            }
            Ok(())
        }
        Commands::Prioritize { id } => {
            let queue = open_queue(&config, &home)?;
            let id = queue.resolve_id(&id)?;
            if !queue.reprioritize(id) {
                bail!("{} is not queued", short_id(id));
            }
            println!("{} {} moved to the front", "[OK]".green(), short_id(id));
            Ok(())
        }
        Commands::Remove { id } => {
            let queue = open_queue(&config, &home)?;
            let id = queue.resolve_id(&id)?;
            let entry = queue.delete(id)?;
            println!(
                "{} Removed {} ({})",
                "[OK]".green(),
                short_id(id),
                truncate(&entry.params().prompt, 40)
            );
            Ok(())
        }
        Commands::Variant { id, edit } => {
            let queue = open_queue(&config, &home)?;
            let id = queue.resolve_id(&id)?;
            if edit {
                let copy = queue.insert_editable_prototype(id)?;
                println!("{} Editable copy {}", "[OK]".green(), short_id(copy).cyan());
            } else {
                let token = queue.random_variant(id)?;
                println!(
                    "{} Queued variant {} at position {}",
                    "[OK]".green(),
                    short_id(token.id).cyan(),
                    token.position + 1
                );
            }
            Ok(())
        }
        Commands::Fetch { model } => {
            if let Some(model) = model {
                config.model = Some(model);
            }
            run_async(fetch(config, home))
        }
        Commands::Run { watch } => run_async(run_queue(config, home, watch)),
        Commands::Models { select } => {
            if let Some(key) = select {
                if ResourceVersion::find(&key).is_none() {
                    bail!("Unknown model '{}'", key);
                }
                config.model = Some(key.clone());
                config::save_config(&config)?;
                println!("{} Default model set to {}", "[OK]".green(), key.cyan());
            }
            list_models(&config, &home);
            Ok(())
        }
    }
}

fn run_async<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(future)
}

fn open_queue(config: &Config, home: &Path) -> Result<JobQueue> {
    let gateway = Arc::new(JsonFileGateway::new(config.state_file(home)));
    JobQueue::open(gateway, config.output_dir(home))
}

fn short_id(id: Uuid) -> String {
    id.to_string()[..8].to_string()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

fn state_label(state: EntryState) -> String {
    match state {
        EntryState::Queued => "queued".yellow().to_string(),
        EntryState::Rendering { step, total } => format!("rendering {}/{}", step, total).cyan().to_string(),
        EntryState::Done => "done".green().to_string(),
        EntryState::Cancelled => "cancelled".dimmed().to_string(),
        EntryState::Error => "error".red().to_string(),
        EntryState::Blocked => "blocked".red().to_string(),
        EntryState::Creating => "template".dimmed().to_string(),
        EntryState::Cloning { .. } => "editable".blue().to_string(),
    }
}

fn show_status(config: &Config, home: &Path) -> Result<()> {
    let version = config.resource_version()?;
    let store = FsResourceStore::new(config.documents_root(home));
    let queue = open_queue(config, home)?;

    println!();
    println!("{}", "=== genstudio status ===".bold());
    println!();
    println!(
        "  Model:    {} ({}x{})",
        version.display_name.cyan(),
        version.image_size,
        version.image_size
    );
    if store.is_ready(&version) {
        println!("  Files:    {}", "ready".green());
    } else {
        println!("  Files:    {} (run `genstudio fetch`)", "not downloaded".yellow());
    }

    let entries = queue.entries();
    let count = |f: fn(&EntryState) -> bool| entries.iter().filter(|e| f(&e.state())).count();
    println!("  Queued:   {}", queue.queued_ids().len());
    println!("  Done:     {}", count(|s| *s == EntryState::Done));
    println!(
        "  Failed:   {}",
        count(|s| matches!(s, EntryState::Error | EntryState::Blocked))
    );
    println!("  Output:   {}", config.output_dir(home).display());
    println!();
    Ok(())
}

fn list_entries(queue: &JobQueue) -> Result<()> {
    let queued = queue.queued_ids();
    let entries = queue.entries();
    if entries.iter().all(|e| e.state() == EntryState::Creating) {
        println!("Nothing queued. Try: genstudio add \"a lighthouse at dusk\"");
        return Ok(());
    }

    for entry in entries.iter().filter(|e| e.state() != EntryState::Creating) {
        let position = queued
            .iter()
            .position(|id| *id == entry.id())
            .map(|p| format!("#{}", p + 1))
            .unwrap_or_default();
        println!(
            "{}  {:<20} {:>4}  seed {:<10}  {}",
            short_id(entry.id()).cyan(),
            state_label(entry.state()),
            position,
            entry.generated_seed(),
            truncate(&entry.params().prompt, 50)
        );
    }
    Ok(())
}

fn list_models(config: &Config, home: &Path) {
    let store = FsResourceStore::new(config.documents_root(home));
    println!();
    for version in ResourceVersion::catalog() {
        let selected = if version.key == config.model_key() { "*" } else { " " };
        let ready = if store.is_ready(&version) {
            "downloaded".green().to_string()
        } else {
            String::new()
        };
        println!(
            " {} {:<14} {:<28} {:>4}px  {}",
            selected,
            version.key.cyan(),
            version.display_name,
            version.image_size,
            ready
        );
    }
    println!();
}

fn resource_error(phase: &ResourcePhase) -> String {
    let builder = match phase {
        ResourcePhase::DownloadError { cause } => ErrorBuilder::new("Model download failed")
            .cause(cause.clone())
            .fix("Check your network connection")
            .fix("Retry: genstudio fetch"),
        ResourcePhase::InitializingError { cause } => {
            ErrorBuilder::new("Model could not be initialized")
                .cause(cause.clone())
                .fix("Check `engine_program` in ~/.genstudio/config.json")
                .fix("Run with -v for engine output")
        }
        other => ErrorBuilder::new("Model is not available").cause(other.to_string()),
    };
    builder.build()
}

/// Follow the resource to a settled phase, drawing a progress bar.
async fn acquire(studio: &Studio) -> ResourcePhase {
    let mut phases = studio.resources().subscribe();
    let pb = progress::bar("Preparing model");
    loop {
        let phase = phases.borrow_and_update().clone();
        match &phase {
            ResourcePhase::Downloading { progress } => {
                pb.set_message("Downloading");
                pb.set_position((progress * 100.0) as u64);
            }
            ResourcePhase::Expanding => pb.set_message("Expanding archive"),
            ResourcePhase::Initializing => pb.set_message("Loading model"),
            ResourcePhase::Ready { .. } => {
                progress::finish_success(&pb, "Model ready");
                return phase;
            }
            p if p.is_error() || matches!(p, ResourcePhase::ShutDown) => {
                progress::finish_error(&pb, &p.to_string());
                return phase;
            }
            _ => {}
        }
        if phases.changed().await.is_err() {
            pb.finish_and_clear();
            return studio.resources().phase();
        }
    }
}

async fn fetch(config: Config, home: PathBuf) -> Result<()> {
    let parts = StudioParts::from_config(&config, &home)?;
    let studio = Studio::new(parts)?;
    studio.start_acquisition();

    let phase = acquire(&studio).await;
    studio.shutdown().await;
    if !phase.is_ready() {
        eprintln!("{}", resource_error(&phase));
        std::process::exit(exit_codes::SERVICE_UNAVAILABLE);
    }
    Ok(())
}

async fn run_queue(config: Config, home: PathBuf, watch: bool) -> Result<()> {
    let parts = StudioParts::from_config(&config, &home)?;
    let studio = Studio::start(parts)?;

    let interrupted = Arc::new(Notify::new());
    let handler_notify = Arc::clone(&interrupted);
    let _ = ctrlc::set_handler(move || {
        handler_notify.notify_one();
    });

    let mut events = studio.queue().events();
    let settled = tokio::select! {
        phase = acquire(&studio) => Some(phase),
        _ = interrupted.notified() => None,
    };
    let Some(phase) = settled else {
        studio.shutdown().await;
        return Ok(());
    };
    if !phase.is_ready() {
        studio.shutdown().await;
        eprintln!("{}", resource_error(&phase));
        std::process::exit(exit_codes::SERVICE_UNAVAILABLE);
    }

    let pb = progress::bar("Waiting for jobs");
    let mut idle_check = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = interrupted.notified() => {
                pb.finish_and_clear();
                println!("{} Stopping; the current job stays queued", "[!]".yellow());
                break;
            }
            event = events.recv() => match event {
                Ok(QueueEvent::Progress { id, step, total }) => {
                    pb.set_message(format!("Rendering {}", short_id(id)));
                    pb.set_position(u64::from(step) * 100 / u64::from(total.max(1)));
                }
                Ok(QueueEvent::StateChanged { id, state }) if state.is_terminal() => {
                    pb.println(format!("  {} {}", short_id(id).cyan(), state_label(state)));
                    pb.set_position(0);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = idle_check.tick() => {
                if !watch && studio.queue().is_idle() {
                    progress::finish_success(&pb, "Queue empty");
                    break;
                }
            }
        }
    }

    studio.shutdown().await;
    Ok(())
}
