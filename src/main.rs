//! converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use converge::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use converge::config::{find_config_file, ConfigParser, ConfigValidator, DeclarationFile};
use converge::error::Result;
use converge::model::Address;
use converge::planner::CancelToken;
use converge::reconciler::Reconciler;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Declaration written by `converge init`.
const DECLARATION_TEMPLATE: &str = include_str!("../templates/converge.yaml");

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
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence.
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

/// Main async entry point. Returns `false` when a resource failed.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force, &formatter).map(|()| true),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { destroy, detailed } => cmd_plan(config, destroy, detailed, &formatter).await,
        Commands::Apply { yes, parallelism } => cmd_apply(config, yes, parallelism, &formatter).await,
        Commands::Destroy { yes, targets } => cmd_destroy(config, yes, &targets, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::Graph => cmd_graph(config),
        Commands::State { command } => cmd_state(config, command, &formatter).await.map(|()| true),
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool, formatter: &OutputFormatter) -> Result<()> {
    info!(path = %path.display(), "initializing converge project");

    let config_path = path.join("converge.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("{}", formatter.warning(&format!(
            "Declaration already exists: {} (use --force to overwrite)",
            config_path.display()
        )));
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, DECLARATION_TEMPLATE)?;
    eprintln!("Created: {}", config_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".converge") {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# converge state\n.converge/\n.env")?;
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".converge/\n.env\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("{}", formatter.success("Project initialized."));
    eprintln!("Next steps:");
    eprintln!("  1. Edit converge.yaml with your kinds and resources");
    eprintln!("  2. Run 'converge validate' to check the declaration");
    eprintln!("  3. Run 'converge plan' to see what would change");
    eprintln!("  4. Run 'converge apply' to converge");
    Ok(())
}

/// Validate the declaration.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<bool> {
    let (declaration, _) = load_declaration(config_path)?;
    let result = ConfigValidator::new().collect(&declaration);

    println!("{}", formatter.format_validation(&result, show_warnings));
    if result.is_valid() && formatter_is_text(formatter) {
        eprintln!("\nDeclaration summary:");
        eprintln!("  Project: {}", declaration.project.name);
        eprintln!("  Environment: {}", declaration.project.environment);
        eprintln!("  Kinds: {}", declaration.kinds.len());
        eprintln!("  Resources: {}", declaration.resource_count());
    }
    Ok(result.is_valid())
}

/// Show the execution plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    destroy: bool,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let reconciler = load_reconciler(config_path)?;
    let plan = if destroy {
        reconciler.plan_destroy(&[]).await?
    } else {
        reconciler.plan().await?
    };

    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(true)
}

/// Converge infrastructure to the declaration.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    parallelism: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let mut reconciler = load_reconciler(config_path)?;
    if let Some(parallelism) = parallelism {
        reconciler = reconciler.with_parallelism(parallelism);
    }

    let plan = reconciler.plan().await?;
    if plan.is_empty() {
        eprintln!("{}", formatter.success("No changes to apply."));
        return Ok(true);
    }

    eprintln!("{}", formatter.format_plan(&plan, false));
    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(true);
    }

    let reconciler = reconciler.with_cancel_token(cancel_on_ctrl_c());
    let result = reconciler.apply_approved(&plan).await?;

    println!("{}", formatter.format_result(&result));
    Ok(result.success)
}

/// Destroy recorded resources.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    targets: &[String],
    formatter: &OutputFormatter,
) -> Result<bool> {
    let reconciler = load_reconciler(config_path)?;
    let targets = targets
        .iter()
        .map(|t| t.parse::<Address>())
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let plan = reconciler.plan_destroy(&targets).await?;
    if plan.is_empty() {
        eprintln!("{}", formatter.success("Nothing to destroy."));
        return Ok(true);
    }

    eprintln!("{}", formatter.format_plan(&plan, false));
    if !auto_approve
        && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
    {
        eprintln!("Destroy cancelled.");
        return Ok(true);
    }

    let reconciler = reconciler.with_cancel_token(cancel_on_ctrl_c());
    let result = reconciler.destroy_approved(&targets, &plan).await?;

    println!("{}", formatter.format_result(&result));
    Ok(result.success)
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<bool> {
    let reconciler = load_reconciler(config_path)?;
    let report = reconciler.check_drift().await?;

    println!("{}", formatter.format_drift(&report));
    Ok(true)
}

/// Print the dependency graph.
fn cmd_graph(config_path: Option<&Path>) -> Result<bool> {
    let reconciler = load_reconciler(config_path)?;
    let graph = reconciler.graph()?;
    println!("{}", graph.to_dot());
    Ok(true)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let reconciler = load_reconciler(config_path)?;
    let store = reconciler.store();

    match command {
        StateCommands::Show => {
            let records = store.load().await?;
            let lock = store.get_lock_info().await?;
            let history = store.load_history().await?;
            println!(
                "{}",
                formatter.format_state_summary(store.backend_type(), records.len(), lock.as_ref(), &history)
            );
        }
        StateCommands::List => {
            let records = store.load().await?;
            println!("{}", formatter.format_records(&records));
        }
        StateCommands::Rm { address } => {
            let address: Address = address.parse()?;
            reconciler.forget(&address).await?;
            eprintln!("{}", formatter.success(&format!("Removed {address} from state.")));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                eprintln!("{}", formatter.success("State forcefully unlocked."));
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("{}", formatter.success("State unlocked."));
            } else {
                eprintln!("{}", formatter.warning("Please provide --lock-id or use --force"));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the declaration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads the declaration with `.env` and environment overrides applied.
fn load_declaration(config_path: Option<&Path>) -> Result<(DeclarationFile, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!(path = %config_file.display(), "loading declaration");

    let base_dir = config_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;

    let declaration = parser.load_with_env(&config_file)?;
    Ok((declaration, base_dir))
}

/// Loads the declaration and builds a reconciler for it.
fn load_reconciler(config_path: Option<&Path>) -> Result<Reconciler> {
    let (declaration, base_dir) = load_declaration(config_path)?;
    Reconciler::from_declaration(declaration, &base_dir)
}

/// Returns a token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelToken {
    let token = CancelToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight operations");
            handle.cancel();
        }
    });
    token
}

/// Prompts on stderr and compares the answer.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

const fn formatter_is_text(formatter: &OutputFormatter) -> bool {
    matches!(formatter.format(), OutputFormat::Text)
}
