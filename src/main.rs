mod cache;
mod error;
mod item;
mod manifest;
mod node;
mod params;
mod pipeline;
mod registry;
mod seeds;
mod settings;
mod stages;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{ArgMatches, Command, CommandFactory, FromArgMatches, Parser};
use tracing::{debug, error, info};

use crate::params::Params;
use crate::registry::{Registry, INPUT_DATA_DIR, SITEMAP, SITEMAP_FILTER, URL};
use crate::seeds::SeedSpec;
use crate::settings::Settings;

const SELECTOR: &str = "--pipeline_name";

#[derive(Parser, Debug)]
#[command(name = "page_pipeline", about = "Cached, stage-by-stage web page processing")]
struct Cli {
    /// Project the stage outputs are stored under
    #[arg(long = "project_name")]
    project_name: String,
    /// Workflow to run
    #[arg(long = "pipeline_name")]
    pipeline_name: String,
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let registry = Registry::new(Settings::load()?);
    let args: Vec<String> = std::env::args().collect();

    // Phase one: only the selector, so the workflow's own flags can be added.
    let Some(workflow) = selected_workflow(&args) else {
        // Reports the missing selector (or prints help) and exits.
        let _ = Cli::command().get_matches_from(&args);
        anyhow::bail!("{} is required", SELECTOR);
    };
    let Some(command) = command_for(&registry, &workflow) else {
        error!(
            pipeline = %workflow,
            available = %registry.names().join(", "),
            "unknown pipeline"
        );
        return Ok(ExitCode::from(1));
    };

    // Phase two: the full command line against the base plus workflow flags.
    let matches = command.get_matches_from(&args);
    let cli = Cli::from_arg_matches(&matches)?;

    let sources = seed_spec(&matches);
    if sources.is_empty() {
        error!(pipeline = %workflow, "no input: pass --url, --input_data_dir or --sitemap");
        return Ok(ExitCode::from(1));
    }
    let flags = stage_flags(&matches, registry.stage_flags(&workflow).unwrap_or(&[]));

    let Some(mut pipeline) = registry.create(&workflow, &cli.project_name) else {
        error!(pipeline = %workflow, "unknown pipeline");
        return Ok(ExitCode::from(1));
    };

    debug!(
        pipeline = %workflow,
        nodes = ?pipeline.nodes(),
        flags = ?pipeline.accepted_flags(),
        "pipeline wired"
    );

    let result = seeds::resolve(&sources).and_then(|input| pipeline.execute(input, &flags));
    match result {
        Ok(dir) => {
            info!(
                pipeline = %pipeline.name(),
                elapsed_s = t0.elapsed().as_secs_f64(),
                "pipeline finished"
            );
            println!("{}", dir.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(pipeline = %cli.pipeline_name, error = %e, "pipeline failed");
            Ok(ExitCode::from(1))
        }
    }
}

/// Value of `--pipeline_name` (either `--pipeline_name x` or
/// `--pipeline_name=x`), ignoring everything else on the command line.
fn selected_workflow(args: &[String]) -> Option<String> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            return None;
        }
        if arg == SELECTOR {
            return iter.next().filter(|v| !v.starts_with("--")).cloned();
        }
        if let Some(value) = arg.strip_prefix(SELECTOR).and_then(|r| r.strip_prefix('=')) {
            return Some(value.to_string());
        }
    }
    None
}

fn command_for(registry: &Registry, workflow: &str) -> Option<Command> {
    let args = registry.arguments(workflow)?;
    let about = registry.about(workflow)?;
    Some(Cli::command().about(about).args(args))
}

fn seed_spec(matches: &ArgMatches) -> SeedSpec {
    let string = |id: &str| matches.try_get_one::<String>(id).ok().flatten().cloned();
    SeedSpec {
        urls: matches
            .try_get_many::<String>(URL)
            .ok()
            .flatten()
            .map(|v| v.cloned().collect())
            .unwrap_or_default(),
        input_dir: matches
            .try_get_one::<PathBuf>(INPUT_DATA_DIR)
            .ok()
            .flatten()
            .cloned(),
        sitemap: string(SITEMAP),
        sitemap_filter: string(SITEMAP_FILTER),
    }
}

/// Stage flags given on the command line. Switches are only forwarded when
/// set, so unset ones leave the workflow's defaults alone.
fn stage_flags(matches: &ArgMatches, names: &[&str]) -> Params {
    let mut flags = Params::new();
    for &name in names {
        if registry::is_switch(name) {
            if let Ok(Some(true)) = matches.try_get_one::<bool>(name) {
                flags.insert(name, true);
            }
        } else if let Ok(Some(value)) = matches.try_get_one::<String>(name) {
            flags.insert(name, value.clone());
        }
    }
    flags
}

// ── Tests ──
