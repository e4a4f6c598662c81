//! RalphX - iterative LLM loop orchestrator.
//!
//! CLI entry point (§6 "CLI to operator"). Exit codes: 0 success, 1
//! user-visible failure, 2 usage error (clap's own default for parse
//! failures).

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tracing::{debug, info, warn};

use ralphx::cli::{Cli, Command, DoctorCommand, GuardrailsCommand, LoopsCommand, OutputFormat, ProjectsCommand};
use ralphx::credential::{CredentialManager, NoRefresh};
use ralphx::doctor::Doctor;
use ralphx::domain::LoopConfig;
use ralphx::llm::{ClaudeCliAdapter, StopSignal};
use ralphx::loop_engine::{LoopExecutor, PauseGate, RunOutcome};
use ralphx::resources::ResourceManager;
use ralphx::{EventBus, create_event_bus};
use projectstore::{
    CredentialStore, NewWorkItem, ProjectStore, ResourceFilter, ResourceType, WorkItemStatus,
};

fn setup_logging(log_level: Option<&str>) -> Result<()> {
    let level = log_level.map(str::to_uppercase).unwrap_or_else(|| "INFO".to_string());
    let filter = tracing_subscriber::EnvFilter::try_new(&level)
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    debug!(level = %level, "setup_logging: initialized");
    Ok(())
}

fn ralphx_dir(project: &std::path::Path) -> PathBuf {
    project.join(".ralphx")
}

fn db_path(project: &std::path::Path) -> PathBuf {
    ralphx_dir(project).join("state.db")
}

fn open_store(project: &std::path::Path) -> Result<ProjectStore> {
    fs::create_dir_all(ralphx_dir(project)).context("creating .ralphx directory")?;
    ProjectStore::open(db_path(project)).context("opening project store")
}

fn project_slug(project: &std::path::Path) -> String {
    project.canonicalize().unwrap_or_else(|_| project.to_path_buf()).to_string_lossy().replace('/', "-")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref()).context("failed to set up logging")?;
    info!("ralphx starting");

    debug!(command = ?cli.command, "main: dispatching command");
    let result = match cli.command {
        Command::Add { content, item_type, title, priority, category, tags, dependencies } => {
            cmd_add(&cli.project, content, item_type, title, priority, category, tags, dependencies)
        }
        Command::Projects { command } => match command {
            ProjectsCommand::List { format } => cmd_projects_list(format),
        },
        Command::Loops { command } => match command {
            LoopsCommand::List { format } => cmd_loops_list(&cli.project, format),
            LoopsCommand::Show { name } => cmd_loops_show(&cli.project, &name),
            LoopsCommand::Sync => cmd_loops_sync(&cli.project),
            LoopsCommand::Create { name, r#type, source } => cmd_loops_create(&cli.project, name, r#type.into(), source),
            LoopsCommand::Delete { name } => cmd_loops_delete(&cli.project, &name),
        },
        Command::Run { loop_name, account } => cmd_run(&cli.project, &loop_name, account).await,
        Command::Serve { port } => cmd_serve(port),
        Command::Doctor { command } => match command {
            DoctorCommand::Scan => cmd_doctor_scan(&cli.project),
            DoctorCommand::Cleanup => cmd_doctor_cleanup(&cli.project),
            DoctorCommand::Check => cmd_doctor_check(&cli.project),
        },
        Command::Guardrails { command } => match command {
            GuardrailsCommand::List => cmd_guardrails_list(&cli.project),
            GuardrailsCommand::Show { name } => cmd_guardrails_show(&cli.project, &name),
            GuardrailsCommand::Sync => cmd_guardrails_sync(&cli.project),
        },
        Command::Mcp => cmd_mcp(),
    };

    if let Err(e) = &result {
        eprintln!("{} {e:#}", "Error:".red().bold());
        std::process::exit(1);
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn cmd_add(
    project: &std::path::Path,
    content: String,
    item_type: String,
    title: Option<String>,
    priority: Option<i64>,
    category: Option<String>,
    tags: Vec<String>,
    dependencies: Vec<String>,
) -> Result<()> {
    let store = open_store(project)?;
    let id = uuid::Uuid::now_v7().to_string();
    let item = store
        .create_work_item(NewWorkItem {
            id: id.clone(),
            priority,
            content,
            title,
            status: Some(WorkItemStatus::Pending),
            category,
            tags,
            metadata: serde_json::Value::Object(Default::default()),
            source_loop: None,
            item_type,
            dependencies,
            phase: None,
        })
        .context("creating work item")?;
    println!("{} work item {}", "Added".green(), item.id);
    Ok(())
}

fn cmd_projects_list(format: OutputFormat) -> Result<()> {
    // The operator-facing project catalog lives outside this core (§1 Non-goals);
    // `~/.ralphx/projects.json` is the well-known location an external
    // collaborator writes to.
    let catalog_path = dirs::home_dir().ok_or_else(|| eyre!("no home directory"))?.join(".ralphx").join("projects.json");

    if !catalog_path.exists() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Text => println!("No projects registered (no catalog at {}).", catalog_path.display()),
        }
        return Ok(());
    }

    let text = fs::read_to_string(&catalog_path).context("reading projects catalog")?;
    match format {
        OutputFormat::Json => println!("{text}"),
        OutputFormat::Text => {
            let value: serde_json::Value = serde_json::from_str(&text).context("parsing projects catalog")?;
            if let Some(projects) = value.as_array() {
                for p in projects {
                    let name = p.get("name").and_then(|v| v.as_str()).unwrap_or("?");
                    let path = p.get("path").and_then(|v| v.as_str()).unwrap_or("?");
                    println!("  {name:20} {path}");
                }
            }
        }
    }
    Ok(())
}

fn cmd_loops_list(project: &std::path::Path, format: OutputFormat) -> Result<()> {
    let loops = LoopConfig::load_all(project).context("loading loop configs")?;
    let mut names: Vec<&String> = loops.keys().collect();
    names.sort();

    match format {
        OutputFormat::Json => {
            let value = serde_json::to_string_pretty(&loops)?;
            println!("{value}");
        }
        OutputFormat::Text => {
            if names.is_empty() {
                println!("No loops configured under {}", project.join(".ralphx").join("loops").display());
                return Ok(());
            }
            for name in names {
                let cfg = &loops[name];
                println!("  {:20} {:?}", name.cyan(), cfg.loop_type);
            }
        }
    }
    Ok(())
}

fn cmd_loops_show(project: &std::path::Path, name: &str) -> Result<()> {
    let loops = LoopConfig::load_all(project).context("loading loop configs")?;
    let cfg = loops.get(name).ok_or_else(|| eyre!("loop {name:?} not found"))?;
    println!("{}", serde_yaml::to_string(cfg)?);
    Ok(())
}

fn cmd_loops_sync(project: &std::path::Path) -> Result<()> {
    let loops = LoopConfig::load_all(project).context("loading loop configs")?;
    let mut errors = 0;
    for (name, cfg) in &loops {
        match cfg.validate(&loops) {
            Ok(()) => println!("  {} {name}", "ok".green()),
            Err(e) => {
                errors += 1;
                println!("  {} {name}: {e}", "invalid".red());
            }
        }
    }
    println!("\n{} loops checked, {} invalid", loops.len(), errors);
    if errors > 0 {
        return Err(eyre!("{errors} loop(s) failed validation"));
    }
    Ok(())
}

fn cmd_loops_create(
    project: &std::path::Path,
    name: String,
    loop_type: ralphx::domain::LoopType,
    source: Option<String>,
) -> Result<()> {
    use ralphx::domain::{InputItemTypes, ItemTypeNames, ItemTypes, Limits, LoopType, ModeSelection};
    use std::collections::HashMap;

    ralphx::domain::validate_loop_name(&name).map_err(|e| eyre!(e))?;

    if matches!(loop_type, LoopType::Consumer) && source.is_none() {
        return Err(eyre!("consumer loops require --source"));
    }

    let item_types = match loop_type {
        LoopType::Generator => ItemTypes { input: None, output: ItemTypeNames { singular: "item".into(), plural: "items".into() } },
        LoopType::Consumer => ItemTypes {
            input: Some(InputItemTypes { source: source.unwrap(), singular: "item".into(), plural: "items".into() }),
            output: ItemTypeNames { singular: "result".into(), plural: "results".into() },
        },
    };

    let cfg = LoopConfig {
        name: name.clone(),
        loop_type,
        modes: HashMap::new(),
        mode_selection: ModeSelection::default(),
        limits: Limits::default(),
        item_types: Some(item_types),
        multi_phase: None,
        respect_dependencies: true,
    };

    cfg.save(project).context("writing loop config")?;
    println!("{} loop config {} at {}", "Created".green(), name, cfg.path_in(project).display());
    println!("Note: add at least one mode to {} before running.", cfg.file_name());
    Ok(())
}

fn cmd_loops_delete(project: &std::path::Path, name: &str) -> Result<()> {
    let loops = LoopConfig::load_all(project).context("loading loop configs")?;
    let cfg = loops.get(name).ok_or_else(|| eyre!("loop {name:?} not found"))?;
    let path = cfg.path_in(project);
    fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;

    let store = open_store(project)?;
    let released = store.release_claims_by_loop(name).context("releasing claims held by deleted loop")?;
    if released > 0 {
        info!(loop_name = name, released, "loops delete: released claims held by this loop's items");
    }
    println!("{} loop {}", "Deleted".green(), name);
    Ok(())
}

async fn cmd_run(project: &std::path::Path, loop_name: &str, account: Option<String>) -> Result<()> {
    let project = project.canonicalize().unwrap_or_else(|_| project.to_path_buf());
    let loops = LoopConfig::load_all(&project).context("loading loop configs")?;
    let config = loops.get(loop_name).cloned().ok_or_else(|| eyre!("loop {loop_name:?} not found"))?;
    config.validate(&loops).map_err(|e| eyre!(e))?;

    let store = Arc::new(open_store(&project)?);
    let cred_store_path = dirs::home_dir().ok_or_else(|| eyre!("no home directory"))?.join(".ralphx").join("credentials.db");
    fs::create_dir_all(cred_store_path.parent().unwrap())?;
    let cred_store = Arc::new(CredentialStore::open(&cred_store_path).context("opening credential store")?);
    let cred_manager = Arc::new(CredentialManager::new(cred_store, Arc::new(NoRefresh), project_slug(&project)));

    if cred_manager.get_fresh(account.as_deref()).await.is_err() {
        warn!("no credential found for this account; execution will report AUTH_REQUIRED until one is configured");
    }
    let adapter: Arc<dyn ralphx::llm::LlmAdapter> = Arc::new(ClaudeCliAdapter::new(cred_manager.clone()));

    let refresh_task = tokio::spawn(cred_manager.clone().run_refresh_sweep());
    let retention_task = tokio::spawn(run_log_retention_sweep(store.clone()));

    let event_bus: Arc<EventBus> = Arc::new(create_event_bus());
    let logger_handle = ralphx::events::spawn_event_logger(&project, event_bus.clone()).ok();

    let mut stdout_rx = event_bus.subscribe();
    let print_task = tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match stdout_rx.recv().await {
                Ok(event) => println!("[{}] {}", event.event_type(), event.run_id()),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let emitter = event_bus.emitter_for(uuid::Uuid::now_v7().to_string());
    let stop = StopSignal::new();
    let pause = PauseGate::new();

    let mut executor =
        LoopExecutor::new(store.as_ref(), config, project.clone(), project_slug(&project), adapter, emitter, stop, pause);
    if let Some(account_id) = account {
        executor = executor.with_account(account_id);
    }

    let run_stop = executor.stop_handle();
    let ctrlc_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received, requesting graceful stop");
            run_stop.trigger();
        }
    });

    let outcome = executor.run_to_completion().await.context("running loop")?;
    ctrlc_task.abort();
    print_task.abort();
    refresh_task.abort();
    retention_task.abort();
    drop(logger_handle);

    match outcome {
        RunOutcome::Completed(reason) => {
            println!("{} ({:?})", "Run completed".green(), reason);
            Ok(())
        }
        RunOutcome::Aborted => {
            println!("{}", "Run aborted".yellow());
            Ok(())
        }
        RunOutcome::Error(message) => Err(eyre!("run ended in error: {message}")),
    }
}

/// Daily background sweep dropping log rows older than 30 days (§5 "Background tasks").
async fn run_log_retention_sweep(store: Arc<ProjectStore>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(24 * 3600));
    loop {
        ticker.tick().await;
        match store.prune_logs_older_than(Duration::from_secs(30 * 24 * 3600)) {
            Ok(pruned) if pruned > 0 => debug!(pruned, "log retention sweep: pruned old log rows"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "log retention sweep failed"),
        }
    }
}

fn cmd_serve(port: u16) -> Result<()> {
    println!(
        "{} the HTTP collaborator API is an external surface not implemented by this core (§1). Would bind :{port}.",
        "Note:".yellow()
    );
    Ok(())
}

fn cmd_doctor_scan(project: &std::path::Path) -> Result<()> {
    let store = open_store(project)?;
    let doctor = Doctor::new(&store);
    let findings = doctor.scan().context("scanning for stale runs")?;
    if findings.is_empty() {
        println!("{}", "No stale runs found.".green());
        return Ok(());
    }
    for f in &findings {
        println!("  {} run {} (loop {}): {:?}", "stale".yellow(), f.run_id, f.loop_name, f.reason);
    }
    Ok(())
}

fn cmd_doctor_cleanup(project: &std::path::Path) -> Result<()> {
    let store = open_store(project)?;
    let doctor = Doctor::new(&store);
    let findings = doctor.cleanup().context("cleaning up stale runs")?;
    println!("{} {} stale run(s)", "Aborted".green(), findings.len());
    for f in &findings {
        println!("  {} (loop {}): {:?}", f.run_id, f.loop_name, f.reason);
    }
    Ok(())
}

fn cmd_doctor_check(project: &std::path::Path) -> Result<()> {
    let store = open_store(project)?;
    let doctor = Doctor::new(&store);
    for check in doctor.check_prerequisites() {
        let mark = if check.ok { "ok".green() } else { "missing".red() };
        println!("  [{}] {}: {}", mark, check.name, check.detail);
    }
    Ok(())
}

fn cmd_guardrails_list(project: &std::path::Path) -> Result<()> {
    let store = open_store(project)?;
    let manager = ResourceManager::new(&store, project.to_path_buf());
    let resources = manager
        .list(&ResourceFilter { resource_type: Some(ResourceType::Custom), ..Default::default() })
        .context("listing guardrail resources")?;
    if resources.is_empty() {
        println!("No guardrails configured.");
        return Ok(());
    }
    for r in resources {
        let status = if r.enabled { "enabled".green() } else { "disabled".red() };
        println!("  {:20} [{}] priority={}", r.name.cyan(), status, r.priority);
    }
    Ok(())
}

fn cmd_guardrails_show(project: &std::path::Path, name: &str) -> Result<()> {
    let store = open_store(project)?;
    let manager = ResourceManager::new(&store, project.to_path_buf());
    let resource = manager.get(name).context("looking up guardrail")?;
    let content = manager.load_content(&resource).context("reading guardrail content")?;
    println!("{content}");
    Ok(())
}

fn cmd_guardrails_sync(project: &std::path::Path) -> Result<()> {
    let store = open_store(project)?;
    let manager = ResourceManager::new(&store, project.to_path_buf());
    let changes = manager.sync().context("syncing guardrail resources")?;
    if changes.is_empty() {
        println!("{}", "No changes.".green());
    }
    for change in changes {
        match change {
            ralphx::resources::SyncChange::Added(n) => println!("  {} {n}", "added".green()),
            ralphx::resources::SyncChange::Updated(n) => println!("  {} {n}", "updated".yellow()),
            ralphx::resources::SyncChange::Removed(n) => println!("  {} {n}", "removed".red()),
        }
    }
    Ok(())
}

fn cmd_mcp() -> Result<()> {
    println!("{} the MCP server surface is an external surface not implemented by this core (§1).", "Note:".yellow());
    Ok(())
}
