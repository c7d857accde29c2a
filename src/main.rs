//! Slicebridge CLI
//!
//! Entry point for the `slicebridge` command-line tool.

use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use slicebridge::config::{BridgeConfig, DEFAULT_CONFIG_PATH};
use slicebridge::job::{self, SliceJob, SliceJobOutcome};
use slicebridge::resolve::PropertyResolver;
use slicebridge::scene::{loader, Scene, ScanOrder};
use slicebridge::transport::{JsonLineSink, MessageSink};

/// Exit code for cancelled jobs.
const EXIT_CODE_CANCELLED: i32 = 80;

#[derive(Parser)]
#[command(name = "slicebridge")]
#[command(about = "Settings resolution and engine payload bridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Explain which stack governs a setting key
    Resolve {
        /// The setting key to resolve
        key: String,

        /// Path to the bridge config file (default: bridge.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Dump the resolved global settings list
    Settings {
        /// Path to the bridge config file (default: bridge.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Build the engine payload for a scene and write it out
    Slice {
        /// Path to the scene file
        scene: PathBuf,

        /// Path to the bridge config file (default: bridge.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Write envelopes to this file instead of stdout
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },
}

/// Minimal stderr logger behind the `log` facade.
struct StderrLogger {
    max_level: log::LevelFilter,
}

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

fn init_logger() {
    let max_level = match std::env::var("SLICEBRIDGE_LOG").as_deref() {
        Ok("debug") => log::LevelFilter::Debug,
        Ok("info") => log::LevelFilter::Info,
        _ => log::LevelFilter::Warn,
    };
    let logger = Box::new(StderrLogger { max_level });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(max_level);
    }
}

fn main() {
    init_logger();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(message) => {
            eprintln!("Error: {}", message);
            process::exit(1);
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<BridgeConfig, String> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    BridgeConfig::load(&path).map_err(|e| e.to_string())
}

fn run(cli: Cli) -> Result<i32, String> {
    match cli.command {
        Commands::Resolve { key, config, json } => {
            let topology = load_config(config)?
                .build_topology()
                .map_err(|e| e.to_string())?;

            let mut resolver = PropertyResolver::new(topology);
            resolver.set_key(&key);

            let target = resolver.target_stack().map(|s| s.id().to_string());
            if json {
                let report = serde_json::json!({
                    "key": key,
                    "target_stack": target,
                    "should_show_revert": resolver.should_show_revert(),
                    "should_show_inherit": resolver.should_show_inherit(),
                    "warnings": resolver
                        .warnings()
                        .iter()
                        .map(|w| w.to_string())
                        .collect::<Vec<_>>(),
                });
                println!("{}", serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?);
            } else {
                match target {
                    Some(stack) => println!("{} -> {}", key, stack),
                    None => println!("{} -> (unresolved)", key),
                }
                println!("revert:  {}", resolver.should_show_revert());
                println!("inherit: {}", resolver.should_show_inherit());
                for warning in resolver.warnings() {
                    println!("warning: {}", warning);
                }
            }
            Ok(0)
        }

        Commands::Settings { config, json } => {
            let topology = load_config(config)?
                .build_topology()
                .map_err(|e| e.to_string())?;
            let global = topology
                .global_stack()
                .ok_or_else(|| "no global stack configured".to_string())?;

            let settings = job::collect_global_settings(&global);
            if json {
                let map: serde_json::Map<String, serde_json::Value> = settings
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::Value::Object(map))
                        .map_err(|e| e.to_string())?
                );
            } else {
                for (key, value) in settings {
                    println!("{} = {}", key, value);
                }
            }
            Ok(0)
        }

        Commands::Slice { scene, config, out } => {
            let topology = load_config(config)?
                .build_topology()
                .map_err(|e| e.to_string())?;

            let tree = loader::load_scene(&scene).map_err(|e| e.to_string())?;
            let scene = Arc::new(Scene::new(tree));

            let sink: Arc<dyn MessageSink> = match out {
                Some(path) => {
                    let file = File::create(&path).map_err(|e| e.to_string())?;
                    Arc::new(JsonLineSink::new(file))
                }
                None => Arc::new(JsonLineSink::new(std::io::stdout())),
            };

            let slice_job = SliceJob::new(scene, topology, Box::new(ScanOrder), sink);
            let handle = job::spawn(slice_job).map_err(|e| e.to_string())?;

            let token = handle.token();
            if let Err(e) = ctrlc::set_handler(move || token.cancel()) {
                log::warn!("Failed to install Ctrl-C handler: {}", e);
            }

            let report = handle.wait().map_err(|e| e.to_string())?;
            match report.outcome {
                SliceJobOutcome::Sent {
                    group_count,
                    object_count,
                    settings_sent,
                } => {
                    eprintln!(
                        "Slice payload sent: {} group(s), {} object(s), {} setting(s)",
                        group_count, object_count, settings_sent
                    );
                    if let Some(fingerprint) = &report.payload_fingerprint {
                        eprintln!("Payload fingerprint: {}", fingerprint);
                    }
                    Ok(0)
                }
                SliceJobOutcome::NothingToSlice => {
                    eprintln!("Nothing to slice.");
                    Ok(0)
                }
                SliceJobOutcome::Cancelled => {
                    eprintln!("Slice job cancelled.");
                    Ok(EXIT_CODE_CANCELLED)
                }
            }
        }
    }
}
