#![forbid(unsafe_code)]

//! One-shot decision gate: read an evaluation snapshot, run one
//! promotion evaluation cycle, and emit a machine-readable report.
//!
//! Exit codes: 0 = continue or promote, 2 = manual review required,
//! 1 = invalid input or evaluation error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use frankenlab_engine::experiment_config::ExperimentConfig;
use frankenlab_engine::metrics_aggregator::VariantAggregate;
use frankenlab_engine::promotion::{
    DecisionAction, PromotionDecision, PromotionStateMachine, SplitRewrite,
};

const REPORT_SCHEMA_VERSION: &str = "frankenlab.decision-gate-report.v1";

#[derive(Debug)]
struct CliArgs {
    input_path: PathBuf,
    out_path: Option<PathBuf>,
    summary: bool,
    print_help: bool,
}

/// Input snapshot: the experiment config plus both variants' current
/// aggregates, as exported by the engine or a dashboard.
#[derive(Debug, Deserialize)]
struct EvaluationSnapshot {
    config: ExperimentConfig,
    aggregate_a: VariantAggregate,
    aggregate_b: VariantAggregate,
    #[serde(default)]
    custom_values_a: BTreeMap<String, f64>,
    #[serde(default)]
    custom_values_b: BTreeMap<String, f64>,
    evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct DecisionGateReport {
    schema_version: String,
    generated_at_utc: String,
    input_path: String,
    experiment_id: String,
    state: String,
    decision: PromotionDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    split_rewrite: Option<SplitRewrite>,
}

fn main() {
    match run() {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(error) => {
            eprintln!("{error:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.print_help {
        print_help();
        return Ok(0);
    }

    let snapshot = load_snapshot(&args.input_path)?;
    snapshot
        .config
        .validate()
        .with_context(|| format!("invalid config in {}", args.input_path.display()))?;

    let mut machine = PromotionStateMachine::new();
    let outcome = machine.evaluate_cycle(
        &snapshot.config,
        &snapshot.aggregate_a,
        &snapshot.aggregate_b,
        &snapshot.custom_values_a,
        &snapshot.custom_values_b,
        snapshot.evaluated_at,
    )?;

    let report = DecisionGateReport {
        schema_version: REPORT_SCHEMA_VERSION.to_string(),
        generated_at_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        input_path: args.input_path.display().to_string(),
        experiment_id: snapshot.config.id.as_str().to_string(),
        state: machine.state().to_string(),
        decision: outcome.decision,
        split_rewrite: outcome.split_rewrite,
    };

    let json = serde_json::to_string_pretty(&report)?;
    if let Some(out_path) = &args.out_path {
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(out_path, json.as_bytes())?;
    } else {
        println!("{json}");
    }

    if args.summary {
        println!("decision_gate.schema_version={}", report.schema_version);
        println!("decision_gate.experiment_id={}", report.experiment_id);
        println!("decision_gate.state={}", report.state);
        println!("decision_gate.action={}", report.decision.action);
        println!("decision_gate.reason={}", report.decision.reason);
    }

    let exit_code = match report.decision.action {
        DecisionAction::Continue | DecisionAction::PromoteB | DecisionAction::PromoteA => 0,
        DecisionAction::RequireManualReview => 2,
    };
    Ok(exit_code)
}

fn load_snapshot(path: &Path) -> Result<EvaluationSnapshot> {
    let bytes = fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("cannot parse {}", path.display()))
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs> {
    let mut input_path = None;
    let mut out_path = None;
    let mut summary = false;
    let mut print_help = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--input" => {
                let Some(value) = args.next() else {
                    bail!("--input requires a path");
                };
                input_path = Some(PathBuf::from(value));
            }
            "--out" => {
                let Some(value) = args.next() else {
                    bail!("--out requires a path");
                };
                out_path = Some(PathBuf::from(value));
            }
            "--summary" => summary = true,
            "-h" | "--help" => print_help = true,
            other if !other.starts_with('-') && input_path.is_none() => {
                input_path = Some(PathBuf::from(other));
            }
            other => bail!("unknown argument `{other}`"),
        }
    }

    if print_help {
        return Ok(CliArgs {
            input_path: PathBuf::new(),
            out_path: None,
            summary: false,
            print_help: true,
        });
    }

    let Some(input_path) = input_path else {
        bail!("usage: frankenlab_decision_gate --input <snapshot.json> [--out <report.json>] [--summary]");
    };
    Ok(CliArgs {
        input_path,
        out_path,
        summary,
        print_help,
    })
}

fn print_help() {
    println!("frankenlab_decision_gate --input <snapshot.json> [--out <report.json>] [--summary]");
    println!();
    println!("Runs one promotion evaluation cycle over an exported snapshot");
    println!("(experiment config plus both variant aggregates) and prints a");
    println!("versioned JSON report. Exit code 2 means manual review.");
}
