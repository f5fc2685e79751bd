//! Terrace CLI entrypoint.
//!
//! This is the main entrypoint for the terrace command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use terrace::cli::{Cli, Commands, OutputFormatter, StateCommands};
use terrace::config::{
    ConfigParser, ConfigValidator, ProviderType, StackConfig, StackDeclarations, StateBackend,
    ValidationError, find_config_file,
};
use terrace::engine::{Engine, RunMode, RunStatus};
use terrace::error::{ConfigError, Result, TerraceError};
use terrace::graph::{DependencyResolver, ResourceRegistry};
use terrace::provider::{
    EchoProvider, HttpProvider, Provider, ProviderDispatcher, ProviderRegistry,
};
use terrace::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore, generate_holder_id};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph => cmd_graph(config, &formatter).map(|()| ExitCode::SUCCESS),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, parallelism } => cmd_apply(config, yes, parallelism, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::Outputs => cmd_outputs(config, &formatter).await.map(|()| ExitCode::SUCCESS),
        Commands::State { command } => {
            cmd_state(config, command, &formatter).await.map(|()| ExitCode::SUCCESS)
        }
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("terrace.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/terrace.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Terrace")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit terrace.yaml with your resources and providers");
    eprintln!("  2. Run 'terrace validate' to check the stack file");
    eprintln!("  3. Run 'terrace plan' to see what will change");
    eprintln!("  4. Run 'terrace apply' to provision");

    Ok(())
}

/// Validate the stack file.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating stack file: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let mut result = ConfigValidator::new().collect(&config);
    if result.is_valid()
        && let Err(e) = check_graph(&config, &config_file)
    {
        result.errors.push(ValidationError {
            field: String::from("resources"),
            message: e.to_string(),
        });
    }

    println!("{}", formatter.format_validation(&result, show_warnings));

    if result.is_valid() {
        eprintln!("\nStack summary:");
        eprintln!("  Stack: {}", config.stack.name);
        eprintln!("  Resources: {}", config.resources.len());
        eprintln!("  Providers: {}", config.providers.len());
        eprintln!("  State backend: {}", config.state.backend);
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Resolves the graph and checks every kind has a provider, without touching state.
fn check_graph(config: &StackConfig, config_file: &Path) -> Result<()> {
    let declarations = ConfigParser::declarations(config)?;
    let state_store = LocalStateStore::with_base_dir(base_dir(config_file).join(STATE_DIR), &config.stack.name);
    let engine = build_engine(config, declarations, Box::new(state_store))?;
    engine.validate()?;
    Ok(())
}

/// Show the resource graph.
fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let declarations = ConfigParser::declarations(&config)?;

    let mut registry = ResourceRegistry::new();
    for spec in declarations.resources {
        registry.register(spec)?;
    }
    let order = DependencyResolver::resolve(&registry)?;

    println!("{}", formatter.format_graph(&registry, &order));
    Ok(())
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let engine = load_engine(config_path, None).await?;
    let result = engine.run(RunMode::Plan).await?;

    println!("{}", formatter.format_plan(&result.plan, detailed));
    Ok(ExitCode::SUCCESS)
}

/// Apply the stack.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    parallelism: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let engine = load_engine(config_path, parallelism).await?;

    let planned = engine.run(RunMode::Plan).await?;
    if !planned.plan.has_changes() {
        eprintln!("No changes to apply.");
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("{}", formatter.format_plan(&planned.plan, false));

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let result = with_interrupt(&engine, engine.run(RunMode::Apply)).await?;
    println!("{}", formatter.format_run(&result));

    Ok(exit_code(result.status))
}

/// Destroy every resource in state.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let engine = load_engine(config_path, None).await?;

    let Some(state) = engine.state_store().load().await? else {
        eprintln!("No resources to destroy.");
        return Ok(ExitCode::SUCCESS);
    };
    if state.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("The following resources will be destroyed:");
    for resource in state.resources.values() {
        eprintln!(
            "  - {} ({}) {}",
            resource.name,
            resource.kind,
            resource.external_id.as_deref().unwrap_or("")
        );
    }

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let result = with_interrupt(&engine, engine.run(RunMode::Destroy)).await?;
    println!("{}", formatter.format_run(&result));

    Ok(exit_code(result.status))
}

/// Show exported outputs.
async fn cmd_outputs(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let state_store = create_state_store(&config, &config_file).await?;

    let outputs = state_store
        .load()
        .await?
        .map(|state| state.exports)
        .unwrap_or_default();
    println!("{}", formatter.format_outputs(&outputs));
    Ok(())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let state_store = create_state_store(&config, &config_file).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = state_store.load().await? {
                println!("{}", formatter.format_state(&state));
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = state_store.acquire_lock(&holder).await?;
            eprintln!("State locked: {}", lock.lock_id);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = state_store.get_lock_info().await? {
                    warn!("Force-unlocking state held by {}", lock_info.holder);
                    state_store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                state_store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the stack file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn base_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Loads and validates the stack file.
fn load_config(config_path: Option<&PathBuf>) -> Result<(StackConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading stack file from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    Ok((config, config_file))
}

/// Loads the stack file and builds an engine with every resource declared.
async fn load_engine(
    config_path: Option<&PathBuf>,
    parallelism: Option<usize>,
) -> Result<Engine<Box<dyn StateStore>>> {
    let (config, config_file) = load_config(config_path)?;
    let declarations = ConfigParser::declarations(&config)?;
    let state_store = create_state_store(&config, &config_file).await?;

    let engine = build_engine(&config, declarations, state_store)?;
    Ok(engine.with_parallelism(parallelism.unwrap_or(config.settings.parallelism)))
}

fn build_engine(
    config: &StackConfig,
    declarations: StackDeclarations,
    state_store: Box<dyn StateStore>,
) -> Result<Engine<Box<dyn StateStore>>> {
    let dispatcher = ProviderDispatcher::new(create_providers(config)?)
        .with_timeout(Duration::from_secs(config.settings.call_timeout_secs));

    let mut engine = Engine::new(&config.stack.name, dispatcher, state_store)
        .with_parallelism(config.settings.parallelism);
    engine.declare_all(declarations)?;
    Ok(engine)
}

/// Builds the provider registry from the stack's provider entries.
fn create_providers(config: &StackConfig) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    for provider in &config.providers {
        let plugin: Arc<dyn Provider> = match provider.provider_type {
            ProviderType::Http => {
                let endpoint = provider.endpoint.as_deref().ok_or_else(|| {
                    ConfigError::validation(
                        format!("HTTP provider '{}' needs an endpoint", provider.name),
                        "providers.endpoint",
                    )
                })?;
                let mut http = HttpProvider::new(endpoint)?;
                if let Some(var) = &provider.token_env {
                    let token = std::env::var(var)
                        .map_err(|_| ConfigError::MissingVariable { name: var.clone() })?;
                    http = http.with_token(token);
                }
                Arc::new(http)
            }
            ProviderType::Echo => {
                Arc::new(EchoProvider::new().with_force_new(provider.force_new.iter().cloned()))
            }
        };

        debug!("Registered {} provider {}", provider.provider_type, provider.name);
        for kind in &provider.kinds {
            registry.register(kind.clone(), Arc::clone(&plugin));
        }
        registry.register(provider.name.clone(), plugin);
    }

    Ok(registry)
}

/// Creates the state store configured for the stack.
async fn create_state_store(config: &StackConfig, config_file: &Path) -> Result<Box<dyn StateStore>> {
    let stack = &config.stack.name;
    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| base_dir(config_file).join(STATE_DIR), PathBuf::from);
            Box::new(LocalStateStore::with_base_dir(path, stack))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| TerraceError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Box::new(S3StateStore::new(bucket, prefix, region, stack).await?)
        }
    };
    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Runs `run` while Ctrl-C cancels the engine's token.
async fn with_interrupt<S: StateStore, T>(
    engine: &Engine<S>,
    run: impl Future<Output = Result<T>>,
) -> Result<T> {
    let token = engine.cancellation_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight operations");
            token.cancel();
        }
    });

    let result = run.await;
    watcher.abort();
    result
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::PartialFailure => ExitCode::FAILURE,
        RunStatus::Aborted => ExitCode::from(130),
    }
}
