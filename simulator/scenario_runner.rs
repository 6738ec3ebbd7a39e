// Scenario Runner - Load and execute settlement risk scenarios
//
// Usage:
//   cargo run --bin scenario_runner scenarios/baseline.yaml
//   cargo run --bin scenario_runner scenarios/  (runs every .yaml/.yml/.json file in directory)
//   cargo run --bin scenario_runner scenarios/outage.yaml --seed stress-1 --runs 500 --json-out out/

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::{info, LevelFilter};
use serde::Deserialize;
use simple_logger::SimpleLogger;

use settle_risk::{BatchProgress, Orchestrator, ScenarioSpec};

#[derive(Parser)]
#[command(name = "scenario_runner")]
#[command(about = "Monte Carlo simulation of card authorization and blockchain settlement risk")]
#[command(version)]
struct Cli {
    /// Scenario file or a directory of scenario files
    path: PathBuf,

    /// Override the scenario seed
    #[arg(long)]
    seed: Option<String>,

    /// Override the number of runs
    #[arg(long)]
    runs: Option<u32>,

    /// Upper bound on worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Write `<name>.result.json` and `<name>.scenario.json` into this directory
    #[arg(long)]
    json_out: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// YAML scenario file format
#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    meta: ScenarioMeta,

    scenario: ScenarioSpec,
}

#[derive(Debug, Default, Deserialize)]
struct ScenarioMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("Failed to initialise logging: {}", e);
    }

    let path = cli.path.as_path();
    let scenarios = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        find_scenarios(path)
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    };

    if scenarios.is_empty() {
        eprintln!("No scenario files found in {}", path.display());
        std::process::exit(1);
    }

    if scenarios.len() > 1 {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║  SCENARIO RUNNER - Multiple Scenarios                 ║");
        println!("╚════════════════════════════════════════════════════════╝\n");
        println!("Found {} scenario(s) to run\n", scenarios.len());
    }

    let mut failures = 0;
    for (i, scenario_path) in scenarios.iter().enumerate() {
        if scenarios.len() > 1 {
            println!("\n{}/{} Running: {}\n", i + 1, scenarios.len(), scenario_path.display());
        }
        if let Err(e) = run_scenario_file(scenario_path, &cli) {
            eprintln!("Scenario {} failed: {}", scenario_path.display(), e);
            failures += 1;
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
}

fn find_scenarios(dir: &Path) -> Vec<PathBuf> {
    let mut scenarios = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if matches!(ext, Some("yaml") | Some("yml") | Some("json")) {
                scenarios.push(path);
            }
        }
    }
    scenarios.sort();
    scenarios
}

/// YAML files carry metadata plus a `scenario` block; JSON files are bare
/// scenario exports.
fn load_scenario(path: &Path) -> Result<(ScenarioMeta, ScenarioSpec), Box<dyn Error>> {
    let content = fs::read_to_string(path)?;
    if path.extension().and_then(|s| s.to_str()) == Some("json") {
        return Ok((ScenarioMeta::default(), ScenarioSpec::from_json(&content)?));
    }
    let file: ScenarioFile = serde_yaml::from_str(&content)?;
    Ok((file.meta, file.scenario))
}

fn run_scenario_file(path: &Path, cli: &Cli) -> Result<(), Box<dyn Error>> {
    println!("Loading scenario from: {}", path.display());
    let (meta, mut spec) = load_scenario(path)?;

    if let Some(seed) = &cli.seed {
        spec.seed = seed.clone();
    }
    if let Some(runs) = cli.runs {
        spec.runs = runs;
    }
    spec.validate()?;

    let name = meta.name.clone().unwrap_or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("scenario")
            .to_string()
    });

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  {}{}║", name, " ".repeat(54_usize.saturating_sub(name.len())));
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(desc) = &meta.description {
        println!("{}\n", desc);
    }
    if let Some(hypothesis) = &meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    println!("Configuration:");
    println!("  {}", spec.summary());
    println!("\nStarting simulation...\n");

    let mut orchestrator = match cli.workers {
        Some(workers) => Orchestrator::with_max_workers(workers),
        None => Orchestrator::new(),
    };

    let mut next_report = 0.1;
    let result = orchestrator.run(&spec, |progress: BatchProgress| {
        let fraction = progress.fraction();
        if fraction + 1e-9 >= next_report {
            println!(
                "  {:>3.0}% ({}/{} runs)",
                fraction * 100.0,
                progress.completed_runs,
                progress.total_runs
            );
            while next_report <= fraction + 1e-9 {
                next_report += 0.1;
            }
        }
    })?;

    result.print_summary();

    if let Some(dir) = &cli.json_out {
        fs::create_dir_all(dir)?;
        let stem = name.replace(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '_', "_");
        let result_path = dir.join(format!("{}.result.json", stem));
        let scenario_path = dir.join(format!("{}.scenario.json", stem));
        fs::write(&result_path, result.to_json()?)?;
        fs::write(&scenario_path, spec.to_json()?)?;
        info!(
            "wrote {} and {}",
            result_path.display(),
            scenario_path.display()
        );
    }

    println!("\n✓ Scenario complete!\n");
    Ok(())
}
