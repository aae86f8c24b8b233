use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sphere::config::BackendKind;
use sphere::{Config, Engine, InvocationReport, SphereError};

/// Exit code when interrupted (128 + SIGINT).
const INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "sphere",
    version,
    about = "Runs a sphere descriptor and its dependencies in capability-scoped sandboxes",
    after_help = "ENVIRONMENT VARIABLES:\n    RUST_LOG    Log level filter for tracing (e.g. debug, sphere=debug)\n\n\
                  Config files may reference variables via ${VAR_NAME} syntax."
)]
struct Cli {
    /// Path to the root .sphere descriptor
    file: PathBuf,

    /// Print only the root's raw output and errors
    #[arg(short, long)]
    quiet: bool,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of nodes that may run concurrently
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Isolation backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Cancel every not-yet-started node as soon as one fails
    #[arg(long)]
    cancel_on_first_failure: bool,

    /// Resolve and print the execution plan without running anything
    #[arg(long)]
    plan: bool,

    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Portable,
    Native,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Portable => BackendKind::Portable,
            BackendArg::Native => BackendKind::Native,
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match cli.config {
        Some(ref path) => {
            info!("Loading configuration from {}", path.display());
            Config::load(path)?
        }
        None => Config::default(),
    };
    // Flags override the file
    if let Some(workers) = cli.workers {
        anyhow::ensure!(workers > 0, "--workers must be at least 1");
        config.engine.workers = workers;
    }
    if let Some(backend) = cli.backend {
        config.sandbox.backend = backend.into();
    }
    if cli.cancel_on_first_failure {
        config.engine.cancel_on_first_failure = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging (RUST_LOG=debug for debug mode)
    let default_filter = if cli.quiet { "sphere=warn" } else { "sphere=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let engine = Engine::new(config)?;

    if cli.plan {
        return plan(&engine, &cli);
    }

    let outcome = tokio::select! {
        outcome = engine.run(&cli.file) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping running nodes");
            return Ok(ExitCode::from(INTERRUPTED));
        }
    };

    let code = match outcome {
        Ok(report) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report, cli.quiet);
            }
            report.exit_code()
        }
        Err(e) => {
            report_error(&e, cli.json)?;
            e.kind().exit_code()
        }
    };
    Ok(exit_code(code))
}

fn plan(engine: &Engine, cli: &Cli) -> Result<ExitCode> {
    let ctx = engine.context();
    let graph = match engine.resolve(&ctx, &cli.file) {
        Ok(graph) => graph,
        Err(e) => {
            report_error(&e, cli.json)?;
            return Ok(exit_code(e.kind().exit_code()));
        }
    };

    if cli.json {
        let nodes: Vec<serde_json::Value> = graph
            .nodes()
            .map(|node| {
                serde_json::json!({
                    "name": node.descriptor.name(),
                    "path": node.path(),
                    "entrypoint": node.descriptor.entrypoint,
                    "dependencies": node
                        .dependencies
                        .iter()
                        .map(|e| serde_json::json!({
                            "alias": e.alias,
                            "path": graph.node(e.target).path(),
                        }))
                        .collect::<Vec<_>>(),
                    "grants": node.descriptor.grants,
                })
            })
            .collect();
        let plan = serde_json::json!({
            "fingerprint": graph.fingerprint(),
            "order": nodes,
        });
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        for node in graph.nodes() {
            let deps: Vec<&str> = node.dependencies.iter().map(|e| e.alias.as_str()).collect();
            if deps.is_empty() {
                println!("{:>3}. {}  ({})", node.id + 1, node.descriptor.name(), node.path().display());
            } else {
                println!(
                    "{:>3}. {}  ({})  after: {}",
                    node.id + 1,
                    node.descriptor.name(),
                    node.path().display(),
                    deps.join(", ")
                );
            }
        }
        println!("fingerprint: {}", graph.fingerprint());
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &InvocationReport, quiet: bool) {
    let root = &report.root;
    if quiet {
        print!("{}", root.stdout);
        eprint!("{}", root.stderr);
    } else {
        if !root.stdout.is_empty() {
            println!("--- Command STDOUT ---");
            print!("{}", root.stdout);
        }
        if !root.stderr.is_empty() {
            eprintln!("--- Command STDERR ---");
            eprint!("{}", root.stderr);
        }
    }

    if report.succeeded() {
        return;
    }
    if let Some(ref failure) = report.first_failure {
        match failure.error {
            Some(ref e) => eprintln!("sphere: {} failed: {e} [{}]", failure.name, e.kind()),
            None => eprintln!("sphere: {} {}", failure.name, failure.outcome),
        }
        // The root's own stderr is already printed above
        if failure.node != root.node && !failure.stderr.is_empty() && !quiet {
            eprintln!("--- {} STDERR ---", failure.name);
            eprint!("{}", failure.stderr);
        }
    }
    if !quiet {
        let failed = report.nodes.iter().filter(|n| !n.outcome.is_success()).count();
        eprintln!(
            "sphere: {failed} of {} node(s) did not succeed",
            report.nodes.len()
        );
    }
}

fn report_error(error: &SphereError, json: bool) -> Result<()> {
    if json {
        let body = serde_json::json!({ "error": error });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        eprintln!("sphere: {error} [{}]", error.kind());
    }
    Ok(())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
