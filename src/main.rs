mod annotated_type;
mod checkers;
mod dataflow;
mod defaults;
mod dependent;
mod diagnostics;
mod engine;
mod factory;
mod hierarchy;
mod input;
mod ir;
mod options;
mod qualifier;
mod telemetry;
#[cfg(test)]
mod test_harness;
mod type_hierarchy;
mod type_system;
mod visitor;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::KeyValue;
use serde_json::json;
use serde_sarif::sarif::{
    Artifact, Invocation, PropertyBag, ReportingDescriptor, Result as SarifResult, Run,
    SCHEMA_URL, Sarif, Tool, ToolComponent,
};
use tracing::info;

use crate::checkers::BUILTIN_CHECKERS;
use crate::engine::{AnalysisContext, Engine};
use crate::input::load_inputs;
use crate::options::{CheckerOptions, DEFAULT_MAX_BLOCK_VISITS, DEFAULT_WIDEN_AFTER};
use crate::telemetry::{Telemetry, current_trace_id, init_logging, with_span};

/// CLI arguments for qualcheck execution.
#[derive(Parser, Debug)]
#[command(
    name = "qualcheck",
    about = "Pluggable type-qualifier checking with flow-sensitive refinement, reported as SARIF.",
    version
)]
struct Cli {
    /// Compilation unit JSON file, or a directory of them.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Stub file with annotated library signatures.
    #[arg(long = "stub", value_name = "PATH")]
    stubs: Vec<PathBuf>,
    /// Built-in checker to run; repeat or separate with commas.
    #[arg(long = "checker", value_name = "NAME", value_delimiter = ',')]
    checkers: Vec<String>,
    /// Declarative qualifier hierarchy to run as an additional checker.
    #[arg(long = "hierarchy", value_name = "PATH")]
    hierarchies: Vec<PathBuf>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
    /// OTLP HTTP endpoint receiving trace spans.
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
    #[arg(long)]
    conservative_defaults: bool,
    #[arg(long)]
    conservative_bytecode_defaults: bool,
    #[arg(long)]
    assume_side_effect_free: bool,
    #[arg(long)]
    side_effects_unrefine_aliases: bool,
    #[arg(long = "suppress-warnings", value_name = "KEY", value_delimiter = ',')]
    suppress_warnings: Vec<String>,
    #[arg(long, value_name = "N", default_value_t = DEFAULT_WIDEN_AFTER)]
    widen_after: usize,
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_BLOCK_VISITS)]
    max_block_visits: usize,
}

impl Cli {
    fn checker_options(&self) -> CheckerOptions {
        CheckerOptions {
            conservative_defaults: self.conservative_defaults,
            conservative_bytecode_defaults: self.conservative_bytecode_defaults,
            assume_side_effect_free: self.assume_side_effect_free,
            side_effects_unrefine_aliases: self.side_effects_unrefine_aliases,
            suppress_warnings: self.suppress_warnings.clone(),
            widen_after: self.widen_after,
            max_block_visits: self.max_block_visits,
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging();
    let errors = run(cli)?;
    Ok(if errors > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Returns the number of error diagnostics.
fn run(cli: Cli) -> Result<usize> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }
    for path in cli.stubs.iter().chain(&cli.hierarchies) {
        if !path.exists() {
            anyhow::bail!("file not found: {}", path.display());
        }
    }
    if cli.checkers.is_empty() && cli.hierarchies.is_empty() {
        anyhow::bail!(
            "no checker selected; use --checker ({}) or --hierarchy",
            BUILTIN_CHECKERS.join(", ")
        );
    }

    let telemetry = match cli.otel.as_ref() {
        Some(endpoint) => Some(Arc::new(Telemetry::new(endpoint.clone())?)),
        None => None,
    };
    let result = with_span(
        telemetry.as_deref(),
        "qualcheck",
        &[KeyValue::new("qualcheck.input", cli.input.display().to_string())],
        || execute(&cli, telemetry.clone()),
    );
    if let Some(telemetry) = telemetry.as_ref() {
        telemetry.shutdown()?;
    }
    result
}

fn execute(cli: &Cli, telemetry: Option<Arc<Telemetry>>) -> Result<usize> {
    let started_at = Instant::now();
    let inputs = load_inputs(
        &cli.input,
        &cli.stubs,
        &cli.hierarchies,
        telemetry.as_deref(),
    )?;
    let load_duration_ms = started_at.elapsed().as_millis();
    let systems = checkers::resolve(&cli.checkers, &inputs.hierarchies)?;
    let checker_count = systems.len();
    let unit_count = inputs.units.len();
    let class_count = inputs.class_count();

    let analysis_started_at = Instant::now();
    let engine = Engine::new(systems, cli.checker_options());
    let context = AnalysisContext::new(inputs.units, inputs.stubs, telemetry);
    let output = engine.analyze(&context)?;
    let analysis_duration_ms = analysis_started_at.elapsed().as_millis();

    let stats = InvocationStats {
        load_duration_ms,
        analysis_duration_ms,
        unit_count,
        class_count,
        checker_count,
        suppressed_count: output.suppressed,
        trace_id: current_trace_id(),
    };
    let invocation = build_invocation(&stats);
    let sarif = build_sarif(inputs.artifacts, invocation, output.rules.clone(), output.results());

    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &sarif)
        .context("failed to serialize SARIF output")?;
    writer
        .write_all(b"\n")
        .context("failed to write SARIF output")?;
    writer.flush().context("failed to flush SARIF output")?;

    if !cli.quiet {
        for diagnostic in &output.diagnostics {
            eprintln!("{diagnostic}");
        }
    }
    let errors = output.error_count();
    info!(
        checkers = checker_count,
        units = unit_count,
        errors,
        diagnostics = output.diagnostics.len(),
        "analysis finished"
    );
    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} load_ms={} analysis_ms={} units={} classes={}",
            started_at.elapsed().as_millis(),
            load_duration_ms,
            analysis_duration_ms,
            unit_count,
            class_count
        );
    }
    Ok(errors)
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}

/// Metadata captured for SARIF invocation properties.
struct InvocationStats {
    load_duration_ms: u128,
    analysis_duration_ms: u128,
    unit_count: usize,
    class_count: usize,
    checker_count: usize,
    suppressed_count: usize,
    trace_id: Option<String>,
}

fn build_invocation(stats: &InvocationStats) -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");
    let mut properties = BTreeMap::new();
    properties.insert("qualcheck.load_ms".to_string(), json!(stats.load_duration_ms));
    properties.insert(
        "qualcheck.analysis_ms".to_string(),
        json!(stats.analysis_duration_ms),
    );
    properties.insert("qualcheck.unit_count".to_string(), json!(stats.unit_count));
    properties.insert("qualcheck.class_count".to_string(), json!(stats.class_count));
    properties.insert(
        "qualcheck.checker_count".to_string(),
        json!(stats.checker_count),
    );
    properties.insert(
        "qualcheck.suppressed_count".to_string(),
        json!(stats.suppressed_count),
    );
    if let Some(trace_id) = stats.trace_id.as_ref() {
        properties.insert("qualcheck.trace_id".to_string(), json!(trace_id));
    }

    Invocation::builder()
        .execution_successful(true)
        .arguments(arguments)
        .command_line(command_line)
        .properties(PropertyBag::builder().additional_properties(properties).build())
        .build()
}

fn build_sarif(
    artifacts: Vec<Artifact>,
    invocation: Invocation,
    rules: Vec<ReportingDescriptor>,
    results: Vec<SarifResult>,
) -> Sarif {
    let driver = if rules.is_empty() {
        ToolComponent::builder()
            .name("qualcheck")
            .information_uri("https://checkerframework.org/manual/")
            .build()
    } else {
        ToolComponent::builder()
            .name("qualcheck")
            .information_uri("https://checkerframework.org/manual/")
            .rules(rules)
            .build()
    };
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = if artifacts.is_empty() {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .build()
    } else {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .artifacts(artifacts)
            .build()
    };

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}
