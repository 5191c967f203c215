use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use release_pipeline::definition::{DependencySource, PipelineDefinition};
use release_pipeline::lockfile::{DEFAULT_LOCKFILE, PipelineLock, generate_lock};
use release_pipeline::observability::{MetricsCollector, MetricsSnapshot, log_snapshot};
#[cfg(feature = "metrics-server")]
use release_pipeline::observability::server::MetricsServer;
use release_pipeline::pipeline::{PipelineExecutor, RunOptions};
use release_pipeline::provenance::RevisionSource;
use release_pipeline::reproducibility::{ReproducibilityOptions, verify_reproducible};
use release_pipeline::secrets::{SecretStore, seal};
use release_pipeline::security::{
    ManifestEntry, ManifestEntryKind, compute_sha256, write_release_manifest, write_sha256,
};
use release_pipeline::signing::{SigningCollector, SigningLedger, build_service};
use release_pipeline::templates::{TEMPLATES, generate_template};
use release_pipeline::toolchain::ToolchainRegistry;
use release_pipeline::validation::validate_definition;
use release_pipeline::workspace::{CancellationToken, WorkspaceContext};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};
use zeroize::Zeroizing;

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

const DEFAULT_REPORT: &str = "run-report.json";

fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result: Result<()> = match cli.command {
        Commands::Run {
            definition,
            revision,
            workspace,
            report,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            otlp_endpoint,
        } => {
            let _ = otlp_endpoint; // already handled in tracing configuration
            run_pipeline(RunArgs {
                definition,
                revision,
                workspace,
                report,
                print_metrics,
                metrics_json,
                metrics_prometheus,
                metrics_listen,
            })
        }
        Commands::Validate { definition } => validate_definition_cmd(definition),
        Commands::Lock {
            definition,
            output,
            check,
        } => lock_definition(definition, output, check),
        Commands::ListToolchains => {
            list_toolchains();
            Ok(())
        }
        Commands::Init { template, output } => init_definition(&template, output),
        Commands::Secrets { action } => secrets_command(action),
        Commands::Signing { action } => signing_command(action),
        Commands::VerifyReproducible {
            definition,
            revision,
            source,
            scratch,
            report,
        } => verify_reproducible_cmd(definition, revision, source, scratch, report),
        Commands::Security { action } => security_command(action),
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(shell, &mut command, name, &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "release-pipeline")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

struct RunArgs {
    definition: PathBuf,
    revision: Option<String>,
    workspace: Option<PathBuf>,
    report: Option<PathBuf>,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    metrics_listen: Option<String>,
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    let definition = PipelineDefinition::load(&args.definition)?;
    let registry = ToolchainRegistry::default();
    reject_invalid(&definition, &registry, &args.definition)?;

    let workspace = resolve_workspace(args.workspace, &args.definition)?;
    let revision = RevisionSource::detect(args.revision, &definition.provenance.revision_env);
    let executor =
        PipelineExecutor::new(definition, &registry)?.with_metrics(MetricsCollector::global().clone());
    let metrics_handle = executor.metrics();

    let cancellation = CancellationToken::new();
    let handler_token = cancellation.clone();
    ctrlc::set_handler(move || {
        eprintln!("Interrupt received; cancelling the in-flight command");
        handler_token.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &args.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &args.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let run = executor
        .execute(RunOptions::new(&workspace, revision).with_cancellation(cancellation));

    let report_path = args
        .report
        .unwrap_or_else(|| workspace.join(DEFAULT_REPORT));
    run.write_report(&report_path)?;
    info!(report = %report_path.display(), "Run report written");

    let snapshot = metrics_handle.snapshot();
    if args.print_metrics {
        log_snapshot(&snapshot);
    }
    write_metrics(&snapshot, args.metrics_json, args.metrics_prometheus)?;

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    match &run.failure {
        None => {
            for published in &run.published {
                println!("{}  {}", published.sha256, published.path.display());
            }
            Ok(())
        }
        Some(failure) => Err(anyhow!(
            "Pipeline run {} failed during {} ({}): {}",
            run.id,
            failure.during.as_str(),
            failure.kind.as_str(),
            failure.message
        )),
    }
}

fn write_metrics(
    snapshot: &MetricsSnapshot,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
) -> Result<()> {
    if let Some(path) = metrics_json {
        ensure_parent(&path)?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = metrics_prometheus {
        ensure_parent(&path)?;
        fs::write(&path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// The workspace defaults to the directory holding the definition file.
fn resolve_workspace(explicit: Option<PathBuf>, definition_path: &Path) -> Result<PathBuf> {
    let workspace = match explicit {
        Some(dir) => dir,
        None => definition_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace: {}", workspace.display()))?;
    workspace
        .canonicalize()
        .with_context(|| format!("Failed to resolve workspace: {}", workspace.display()))
}

fn reject_invalid(
    definition: &PipelineDefinition,
    registry: &ToolchainRegistry,
    path: &Path,
) -> Result<()> {
    let report = validate_definition(definition, registry);
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    if report.is_ok() {
        return Ok(());
    }
    for error_msg in &report.errors {
        error!(file = %path.display(), "{error_msg}");
    }
    Err(anyhow!(
        "Pipeline definition is invalid: {} error(s)",
        report.errors.len()
    ))
}

fn validate_definition_cmd(definition_path: PathBuf) -> Result<()> {
    let definition = PipelineDefinition::load(&definition_path)?;
    let registry = ToolchainRegistry::default();
    reject_invalid(&definition, &registry, &definition_path)?;
    info!(file = %definition_path.display(), "Pipeline definition validation passed");
    Ok(())
}

fn lock_definition(definition_path: PathBuf, output: Option<PathBuf>, check: bool) -> Result<()> {
    let definition = PipelineDefinition::load(&definition_path)?;
    let registry = ToolchainRegistry::default();
    let output_path = output.unwrap_or_else(|| {
        definition_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(DEFAULT_LOCKFILE)
    });

    if check {
        let lock = PipelineLock::load(&output_path)?;
        let drift = lock.drift(&definition);
        if drift.is_empty() {
            info!(lockfile = %output_path.display(), "Lockfile is up to date");
            return Ok(());
        }
        for line in &drift {
            error!(lockfile = %output_path.display(), "{line}");
        }
        return Err(anyhow!(
            "Lockfile is out of date: {} difference(s)",
            drift.len()
        ));
    }

    reject_invalid(&definition, &registry, &definition_path)
        .context("Cannot generate lockfile")?;
    ensure_parent(&output_path)?;
    generate_lock(&definition, &output_path)?;
    info!(lockfile = %output_path.display(), "Lockfile generated successfully");
    Ok(())
}

fn list_toolchains() {
    let registry = ToolchainRegistry::default();
    println!("Available platforms:");
    for name in registry.known_platforms() {
        println!("- {name}");
    }
}

fn init_definition(template: &str, output: Option<PathBuf>) -> Result<()> {
    let destination = output.unwrap_or_else(|| PathBuf::from(format!("{template}.yaml")));
    let path = generate_template(template, &destination)?;
    info!(template, definition = %path.display(), "Pipeline definition created");
    println!("{}", path.display());
    Ok(())
}

fn secrets_command(command: SecretsCommands) -> Result<()> {
    match command {
        SecretsCommands::Seal {
            reference,
            input,
            output,
            key_env,
            salt_env,
        } => {
            let read_env = |name: &str| -> Result<Zeroizing<Vec<u8>>> {
                std::env::var(name)
                    .ok()
                    .filter(|value| !value.is_empty())
                    .map(|value| Zeroizing::new(value.into_bytes()))
                    .ok_or_else(|| anyhow!("Environment variable {name} is not set"))
            };
            let key = read_env(&key_env)?;
            let salt = read_env(&salt_env)?;
            let plaintext = Zeroizing::new(
                fs::read(&input)
                    .with_context(|| format!("Failed to read secret input: {}", input.display()))?,
            );
            let blob = seal(&key, &salt, &reference, &plaintext)?;
            ensure_parent(&output)?;
            fs::write(&output, blob)
                .with_context(|| format!("Failed to write sealed secret: {}", output.display()))?;
            info!(reference = %reference, blob = %output.display(), "Secret sealed");
            Ok(())
        }
    }
}

fn signing_command(command: SigningCommands) -> Result<()> {
    match command {
        SigningCommands::Collect {
            definition,
            workspace,
            destination,
        } => {
            let pipeline = PipelineDefinition::load(&definition)?;
            let signing = pipeline.signing.as_ref().ok_or_else(|| {
                anyhow!(
                    "Pipeline definition has no signing section: {}",
                    definition.display()
                )
            })?;
            let workspace = resolve_workspace(workspace, &definition)?;
            let ctx = WorkspaceContext::new(&workspace);
            let service = build_service(&signing.service, &ctx);
            let ledger = SigningLedger::new(ctx.resolve(&signing.ledger));
            let destination = ctx.resolve(&destination.unwrap_or_else(|| PathBuf::from("signed")));

            let secrets = SecretStore::from_env(&pipeline.secrets, &workspace);
            let token = match secrets.resolve(&signing.credential) {
                Ok(token) => Some(token),
                Err(err) => {
                    warn!("Collecting without credential: {err}");
                    None
                }
            };

            let summary = SigningCollector::new(service.as_ref(), ledger, destination)
                .collect(token.as_ref())?;
            for signed in &summary.signed {
                println!("signed   {}  {}", signed.handle.id, signed.path.display());
            }
            for pending in &summary.pending {
                println!("pending  {}", pending.id);
            }
            info!(
                signed = summary.signed.len(),
                pending = summary.pending.len(),
                "Signing collection finished"
            );
            Ok(())
        }
    }
}

fn verify_reproducible_cmd(
    definition_path: PathBuf,
    revision: Option<String>,
    source: Option<PathBuf>,
    scratch: Option<PathBuf>,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let definition = PipelineDefinition::load(&definition_path)?;
    let registry = ToolchainRegistry::default();
    reject_invalid(&definition, &registry, &definition_path)?;
    let source = resolve_workspace(source, &definition_path)?;
    let revision = RevisionSource::detect(revision, &definition.provenance.revision_env);
    let scratch = scratch.unwrap_or_else(|| {
        std::env::temp_dir().join(format!("release-pipeline-{}", uuid::Uuid::new_v4().simple()))
    });

    let executor = PipelineExecutor::new(definition, &registry)?;
    let cancellation = CancellationToken::new();
    let handler_token = cancellation.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("Failed to install Ctrl-C handler")?;

    let report = verify_reproducible(
        &executor,
        &ReproducibilityOptions {
            source,
            scratch,
            revision,
            cancellation,
        },
    )?;

    if let Some(path) = report_path {
        ensure_parent(&path)?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        to_writer_pretty(file, &report)
            .with_context(|| format!("Failed to write reproducibility report: {}", path.display()))?;
    }

    if report.reproducible {
        info!(
            outputs = report.outputs.len(),
            artifacts = report.artifacts.len(),
            "Builds are reproducible"
        );
        Ok(())
    } else {
        let differing = report.outputs.iter().filter(|o| !o.matches).count()
            + report.artifacts.iter().filter(|a| !a.matches).count();
        Err(anyhow!("Builds differ in {differing} place(s)"))
    }
}

fn security_command(command: SecurityCommands) -> Result<()> {
    match command {
        SecurityCommands::Manifest { definition, output } => {
            let pipeline = PipelineDefinition::load(&definition)?;
            let entries: Vec<ManifestEntry> = pipeline
                .dependencies
                .iter()
                .map(|dependency| ManifestEntry {
                    name: dependency.name.clone(),
                    kind: ManifestEntryKind::Dependency,
                    locator: Some(dependency.source.locator()),
                    sha256: match &dependency.source {
                        DependencySource::Archive(archive) => archive.sha256.clone(),
                        DependencySource::Git(_) => None,
                    },
                })
                .collect();
            ensure_parent(&output)?;
            write_release_manifest(&pipeline.name, &pipeline.product_version, &entries, &output)?;
            info!(manifest = %output.display(), "Release manifest generated");
            Ok(())
        }
        SecurityCommands::Digest { path, output } => {
            if let Some(out_path) = output {
                let digest = write_sha256(&path, &out_path)?;
                println!("{}  {}", digest, path.display());
                info!(
                    file = %path.display(),
                    digest_output = %out_path.display(),
                    "SHA256 digest written"
                );
            } else {
                let digest = compute_sha256(&path)?;
                println!("{}  {}", digest, path.display());
                info!(file = %path.display(), "SHA256 computed");
            }
            Ok(())
        }
    }
}

#[derive(Parser)]
#[command(
    name = "release-pipeline",
    version,
    about = "Provenance-pinned release pipeline orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline definition end to end.
    Run {
        definition: PathBuf,
        /// Revision actually checked out; falls back to the definition's
        /// revision variable, then to `git rev-parse HEAD`.
        #[arg(long)]
        revision: Option<String>,
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    Validate {
        definition: PathBuf,
    },
    Lock {
        definition: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        /// Compare against an existing lockfile instead of writing one.
        #[arg(long)]
        check: bool,
    },
    ListToolchains,
    /// Write a starter pipeline definition.
    Init {
        #[arg(long, value_parser = clap::builder::PossibleValuesParser::new(TEMPLATES))]
        template: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Secrets {
        #[command(subcommand)]
        action: SecretsCommands,
    },
    Signing {
        #[command(subcommand)]
        action: SigningCommands,
    },
    /// Build twice from copies of the source and compare outputs.
    VerifyReproducible {
        definition: PathBuf,
        /// Revision the source tree is checked out at.
        #[arg(long)]
        revision: Option<String>,
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long)]
        scratch: Option<PathBuf>,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    Security {
        #[command(subcommand)]
        action: SecurityCommands,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum SecretsCommands {
    /// Encrypt a credential into a blob the secret store can resolve.
    Seal {
        #[arg(long)]
        reference: String,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long = "key-env", default_value = release_pipeline::definition::DEFAULT_SECRET_KEY_ENV)]
        key_env: String,
        #[arg(long = "salt-env", default_value = release_pipeline::definition::DEFAULT_SECRET_SALT_ENV)]
        salt_env: String,
    },
}

#[derive(Subcommand)]
enum SigningCommands {
    /// Pick up signed results for every pending submission in the ledger.
    Collect {
        definition: PathBuf,
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        destination: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SecurityCommands {
    /// Write a CycloneDX-style manifest of the pinned dependencies.
    Manifest {
        definition: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    Digest {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
