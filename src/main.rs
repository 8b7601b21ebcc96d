mod config;
mod detectors;
mod error;
mod extract;
mod logger;
mod pipeline;
mod sandbox;
mod score;
mod state;
mod store;

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use tracing::warn;

use crate::config::{ConfigArgs, EvalConfig};
use crate::detectors::smells::detect_test_smells;
use crate::sandbox::workspace::ProductionModule;
use crate::state::{EvaluationBatch, EvaluationRecord};
use crate::store::{BatchRepository, FsRepository};

#[derive(Parser)]
#[command(
    name = "suitegrade",
    version,
    about = "Run, measure and rank LLM-generated Python test suites."
)]
struct Cli {
    #[arg(long, global = true, default_value = "info", help = "Log level (RUST_LOG wins)")]
    log_level: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Evaluate the latest generation batch and save the results
    Evaluate(EvaluateArgs),
    /// Show the top-scoring candidate of an evaluation
    Best(BestArgs),
    /// Print the smell report for one test file as JSON
    Smells {
        #[arg(help = "Python test file")]
        file: PathBuf,
    },
    /// List the free functions of the production module
    Functions(ConfigArgs),
}

#[derive(Args, Debug, Default)]
struct EvaluateArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, default_value_t = false, help = "Print only the saved batch as JSON")]
    json_only: bool,
}

#[derive(Args, Debug)]
struct BestArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, help = "Evaluation batch id (defaults to the latest)")]
    batch: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    logger::init(&cli.log_level);

    match cli.command {
        Some(CliCommand::Evaluate(args)) => evaluate(&args),
        Some(CliCommand::Best(args)) => best(&args),
        Some(CliCommand::Smells { file }) => smells(&file),
        Some(CliCommand::Functions(args)) => functions(&args),
        None => evaluate(&EvaluateArgs::default()),
    }
}

fn repository(cfg: &EvalConfig) -> FsRepository {
    FsRepository::new(&cfg.tests_dir, &cfg.results_dir)
}

fn evaluate(args: &EvaluateArgs) -> Result<(), Box<dyn Error>> {
    let cfg = EvalConfig::from_args(&args.config)?;
    let repo = repository(&cfg);
    let (id, batch) = pipeline::run_latest(&cfg, &repo)?;

    if args.json_only {
        println!("{}", serde_json::to_string_pretty(&batch)?);
    } else {
        print_summary(&id, &batch, &cfg);
    }
    Ok(())
}

fn best(args: &BestArgs) -> Result<(), Box<dyn Error>> {
    let cfg = EvalConfig::from_args(&args.config)?;
    let repo = repository(&cfg);

    let (id, batch) = match &args.batch {
        Some(id) => (id.clone(), repo.load_evaluation(id)?),
        None => repo.latest_evaluation()?,
    };

    let Some((cid, rec)) = batch.best() else {
        println!("evaluation {id} has no records");
        return Ok(());
    };

    println!("evaluation: {id}");
    println!("best: {cid}");
    print_record(rec);

    // The generation batch is not linked to the evaluation, so the raw
    // text is only shown when the newest batch still holds this candidate.
    match repo.latest_generation() {
        Ok(generation) => {
            if let Some(text) = generation.raw_text(&cid) {
                println!("generated text ({}):", generation.id);
                println!("{text}");
            }
        }
        Err(e) => warn!(error = %e, "generation batch unavailable"),
    }
    Ok(())
}

fn smells(file: &Path) -> Result<(), Box<dyn Error>> {
    let source = fs::read_to_string(file)?;
    let report = detect_test_smells(&source);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn functions(args: &ConfigArgs) -> Result<(), Box<dyn Error>> {
    let cfg = EvalConfig::from_args(args)?;
    let production = ProductionModule::locate(&cfg.project_root, &cfg.production_file)?;
    for name in production.functions()? {
        println!("{name}");
    }
    Ok(())
}

fn print_summary(id: &str, batch: &EvaluationBatch, cfg: &EvalConfig) {
    println!("evaluation: {id}");
    println!("candidates: {}", batch.len());

    let ranking = batch.ranking();
    if !ranking.is_empty() {
        println!("ranking:");
        for (cid, rec) in &ranking {
            println!(
                "  [{:>5.2}] {} ({}, coverage {})",
                rec.score,
                cid,
                rec.status.as_str(),
                rec.coverage.label()
            );
        }
    }

    println!(
        "results written to: {}",
        cfg.results_dir.join(format!("{id}.json")).display()
    );
}

fn print_record(rec: &EvaluationRecord) {
    println!("score: {:.2}", rec.score);
    println!("status: {}", rec.status.as_str());
    println!("coverage: {}", rec.coverage.label());
    println!(
        "functions tested: {}/{}",
        rec.functions_tested, rec.total_functions
    );
    if !rec.assert_types.is_empty() {
        println!("assertions: {}", rec.assert_types.join(", "));
    }
    println!("edge cases: {}", if rec.edge_case_found { "yes" } else { "no" });
    if !rec.test_smells.is_empty() {
        let smells: Vec<String> = rec
            .test_smells
            .iter()
            .map(|(k, n)| format!("{}={n}", k.as_str()))
            .collect();
        println!("smells: {}", smells.join(", "));
    }
    if !rec.stderr.trim().is_empty() {
        println!("stderr:");
        println!("{}", rec.stderr.trim_end());
    }
}
