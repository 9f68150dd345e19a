//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::DraftsAction;
use crate::convert::PandocConverter;
use dossier_core::gateway;
use dossier_core::{
    DossierConfig, DraftRecord, DraftStore, FailoverCoordinator, Orchestrator, ProviderRegistry,
    RunManager, RunOutcome, RunRequest, RunTerminal, StageSet, Tone,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            query,
            tone,
            lang,
            max_sections,
            no_review,
            formats,
            guideline,
        } => {
            let tone: Tone = tone.parse().map_err(anyhow::Error::msg)?;
            let mut request = RunRequest::new(query)
                .with_tone(tone)
                .with_guidelines(guideline);
            if let Some(lang) = lang {
                request = request.with_target_language(lang);
            }
            if let Some(max_sections) = max_sections {
                request = request.with_max_sections(max_sections);
            }
            if no_review {
                request = request.with_review(false);
            }
            if !formats.is_empty() {
                request = request.with_formats(formats);
            }
            let config = load(workspace, config_file)?;
            handle_run(request, &config).await
        }
        Commands::Resume { run_id } => {
            let config = load(workspace, config_file)?;
            handle_resume(run_id, &config).await
        }
        Commands::Serve { host, port } => {
            let mut config = load(workspace, config_file)?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            handle_serve(&config).await
        }
        Commands::Drafts { action } => {
            let config = load(workspace, config_file)?;
            handle_drafts(action, &config)
        }
        Commands::Config { action } => handle_config(action, workspace, config_file),
    }
}

fn load(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<DossierConfig> {
    let config = dossier_core::load_config(Some(workspace), config_file, None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    for warning in config.providers.warnings() {
        warn!("{warning}");
    }
    Ok(config)
}

/// Wire the configured backends, stages and stores into a run manager.
fn build_manager(config: &DossierConfig) -> anyhow::Result<Arc<RunManager>> {
    let registry = ProviderRegistry::from_config(&config.providers)?;
    let coordinator = FailoverCoordinator::new(Arc::new(config.providers.clone()), &registry)?;
    let drafts = DraftStore::new(config.drafts.resolved_directory());
    info!(drafts = %drafts.root().display(), "Draft store ready");

    let orchestrator = Orchestrator::new(Arc::new(coordinator), drafts)
        .with_stages(StageSet::standard(Some(Arc::new(PandocConverter::default()))));
    Ok(Arc::new(
        RunManager::new(Arc::new(orchestrator), config.run_options())
            .with_retained_runs(config.gateway.retained_runs),
    ))
}

async fn handle_run(request: RunRequest, config: &DossierConfig) -> anyhow::Result<()> {
    let manager = build_manager(config)?;
    let events = manager.events().subscribe();
    let run_id = manager.start_run(request).await?;
    println!("Started run {run_id}");
    follow(manager, run_id, events).await
}

async fn handle_resume(run_id: Uuid, config: &DossierConfig) -> anyhow::Result<()> {
    let manager = build_manager(config)?;
    let events = manager.events().subscribe();
    manager.resume_run(run_id).await?;
    println!("Resumed run {run_id}");
    follow(manager, run_id, events).await
}

/// Print progress until the run ends; Ctrl-C cancels it.
async fn follow(
    manager: Arc<RunManager>,
    run_id: Uuid,
    mut events: tokio::sync::broadcast::Receiver<dossier_core::ProgressEvent>,
) -> anyhow::Result<()> {
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.run_id == run_id => {
                    eprintln!("  {:<11} {}", event.stage, event.status);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let outcome = tokio::select! {
        outcome = manager.wait(run_id) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling run {run_id}...");
            manager.cancel_run(run_id).await?;
            manager.wait(run_id).await?
        }
    };
    printer.abort();
    report(&outcome)
}

fn report(outcome: &RunOutcome) -> anyhow::Result<()> {
    for error in &outcome.errors {
        let label = if error.fatal { "error" } else { "warning" };
        match error.section {
            Some(section) => eprintln!("{label}: {} (section {section}): {}", error.stage, error.message),
            None => eprintln!("{label}: {}: {}", error.stage, error.message),
        }
    }
    for (format, path) in &outcome.state.published_artifacts {
        println!("{format:<12} {}", path.display());
    }

    match outcome.terminal {
        RunTerminal::Completed => {
            println!("Run {} completed", outcome.run_id);
            Ok(())
        }
        RunTerminal::Cancelled => anyhow::bail!(
            "Run {} cancelled; continue it with `dossier resume {}`",
            outcome.run_id,
            outcome.run_id
        ),
        RunTerminal::Failed => anyhow::bail!("Run {} failed", outcome.run_id),
    }
}

async fn handle_serve(config: &DossierConfig) -> anyhow::Result<()> {
    let manager = build_manager(config)?;
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down gateway");
            on_signal.cancel();
        }
    });
    gateway::serve(manager, &config.gateway, shutdown).await?;
    Ok(())
}

fn handle_drafts(action: DraftsAction, config: &DossierConfig) -> anyhow::Result<()> {
    let store = DraftStore::new(config.drafts.resolved_directory());
    match action {
        DraftsAction::List { run_id: None } => {
            let runs = store.runs()?;
            if runs.is_empty() {
                println!("No stored runs in {}", store.root().display());
                return Ok(());
            }
            for run_id in runs {
                let (record, state) = store.load_latest(run_id)?;
                println!(
                    "{run_id}  {:>3} {:<11} {}",
                    record.sequence_number, record.stage_name, state.query
                );
            }
            Ok(())
        }
        DraftsAction::List {
            run_id: Some(run_id),
        } => {
            for line in draft_lines(&store.list(run_id)?) {
                println!("{line}");
            }
            Ok(())
        }
        DraftsAction::Show {
            run_id,
            seq,
            report,
        } => {
            let record = match seq {
                Some(seq) => store
                    .list(run_id)?
                    .into_iter()
                    .find(|r| r.sequence_number == seq)
                    .ok_or_else(|| anyhow::anyhow!("Run {run_id} has no draft {seq}"))?,
                None => store.latest(run_id)?,
            };
            let state = store.load(&record)?;
            if report {
                let body = state
                    .translated_report
                    .as_deref()
                    .or(state.report_body())
                    .ok_or_else(|| {
                        anyhow::anyhow!("Draft {} has no report yet", record.sequence_number)
                    })?;
                print!("{body}");
            } else {
                println!("{}", serde_json::to_string_pretty(&state)?);
            }
            Ok(())
        }
    }
}

fn draft_lines(records: &[DraftRecord]) -> Vec<String> {
    records
        .iter()
        .map(|r| {
            format!(
                "{:>3}  {:<11} {}  {}",
                r.sequence_number,
                r.stage_name,
                r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                r.snapshot_path.display()
            )
        })
        .collect()
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".dossier");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&DossierConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_file)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
