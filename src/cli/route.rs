//! CLI route: run context and the command table. Dispatches to the orchestrator
//! and presentation.

use crate::artifact::MediaDescriptor;
use crate::cli::parse::Commands;
use crate::cli::presentation::{
    format_entry, format_event_line, format_history, format_progress_line, format_purge_report,
};
use crate::config::{AtelierConfig, ConfigLoader};
use crate::error::{ApiError, StorageError};
use crate::history::HistoryFilter;
use crate::orchestrator::Orchestrator;
use crate::provider::{create_provider, ApiCredentials, API_KEY_ENV};
use crate::request::GenerationRequest;
use crate::types::{ArtifactRef, TaskId};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Runtime context for CLI execution.
pub struct RunContext {
    orchestrator: Orchestrator,
    has_credentials: bool,
}

impl RunContext {
    /// Load configuration and open the orchestrator on the current runtime.
    pub fn new(config_path: Option<PathBuf>, cache_root: Option<PathBuf>) -> Result<Self, ApiError> {
        let config = Self::load_config(config_path.as_deref(), cache_root)?;
        let provider = create_provider(&config.provider)?;
        let credentials = ApiCredentials::from_env();
        let has_credentials = credentials.as_ref().is_some_and(|c| !c.is_empty());
        let orchestrator =
            Orchestrator::open(config, provider, credentials.unwrap_or_else(|| ApiCredentials::new("")))?;
        Ok(Self {
            orchestrator,
            has_credentials,
        })
    }

    pub fn load_config(
        config_path: Option<&Path>,
        cache_root: Option<PathBuf>,
    ) -> Result<AtelierConfig, ApiError> {
        let mut config = ConfigLoader::load(config_path)?;
        if cache_root.is_some() {
            config.cache_root = cache_root;
        }
        Ok(config)
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run one command, then drain and flush.
    pub async fn execute(&self, command: &Commands) -> Result<String, ApiError> {
        let result = self.dispatch(command).await;
        self.orchestrator.shutdown().await;
        result
    }

    async fn dispatch(&self, command: &Commands) -> Result<String, ApiError> {
        match command {
            Commands::Generate {
                prompt,
                primary,
                references,
                negative,
                aspect,
                resolution,
                optimize,
                wait_secs,
            } => {
                let mut builder = GenerationRequest::builder()
                    .prompt(prompt.clone())
                    .dimension(*aspect)
                    .resolution(*resolution)
                    .optimize_prompt(*optimize);
                if let Some(path) = primary {
                    builder = builder.primary(self.import_file(path).await?);
                }
                for path in references {
                    builder = builder.reference(self.import_file(path).await?);
                }
                if let Some(negative) = negative {
                    builder = builder.negative_prompt(negative.clone());
                }
                self.handle_generate(builder.build(), Duration::from_secs(*wait_secs))
                    .await
            }
            Commands::History {
                limit,
                state,
                search,
                format,
            } => {
                let mut filter = HistoryFilter::all().limit(*limit);
                if let Some(state) = state {
                    filter = filter.state(*state);
                }
                if let Some(search) = search {
                    filter = filter.prompt_contains(search.clone());
                }
                let entries = self.orchestrator.history(filter).await?;
                format_history(&entries, format)
            }
            Commands::Show { task_id, format } => {
                match self.orchestrator.history_entry(task_id).await? {
                    Some(entry) => format_entry(&entry, format),
                    None => Err(ApiError::TaskNotFound(*task_id)),
                }
            }
            Commands::Purge {
                task_id,
                with_artifacts,
            } => {
                let report = self
                    .orchestrator
                    .purge_history(*task_id, *with_artifacts)
                    .await?;
                Ok(format_purge_report(&report))
            }
            Commands::Export { artifact, out } => self.handle_export(*artifact, out).await,
        }
    }

    async fn import_file(&self, path: &Path) -> Result<ArtifactRef, ApiError> {
        let bytes = std::fs::read(path).map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read {}: {}", path.display(), e),
            ))
        })?;
        let descriptor = MediaDescriptor::sniffed(&bytes);
        let artifact = self.orchestrator.import_image(bytes, descriptor).await?;
        debug!(path = %path.display(), artifact = %artifact.short(), "Imported input image");
        Ok(artifact)
    }

    async fn handle_generate(
        &self,
        request: GenerationRequest,
        wait: Duration,
    ) -> Result<String, ApiError> {
        if !self.has_credentials {
            return Err(ApiError::Config(format!("{} is not set", API_KEY_ENV)));
        }

        let mut events = self.orchestrator.subscribe();
        let task_id = self.orchestrator.submit(request)?;
        println!("Submitted task {}", task_id);
        info!(task_id = %task_id, "Following task");

        let deadline = tokio::time::Instant::now() + wait;
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.tick().await;
        loop {
            let received = tokio::select! {
                received = tokio::time::timeout_at(deadline, events.recv()) => received,
                _ = ticker.tick() => {
                    if let Some(progress) = self.orchestrator.progress(&task_id) {
                        if !progress.state.is_terminal() {
                            println!("{}", format_progress_line(&progress));
                        }
                    }
                    continue;
                }
            };
            let event = match received {
                Ok(Ok(event)) => event,
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => break,
                Err(_) => return Err(ApiError::WaitTimeout(task_id)),
            };
            if event.task_id != task_id {
                continue;
            }
            println!("{}", format_event_line(&event));
            if event.is_final() {
                break;
            }
        }

        self.summarize(task_id).await
    }

    async fn summarize(&self, task_id: TaskId) -> Result<String, ApiError> {
        let (reason, artifacts) = match self.orchestrator.task(&task_id) {
            Some(task) => (task.reason(), task.artifacts.len()),
            None => match self.orchestrator.history_entry(&task_id).await? {
                Some(entry) => (entry.reason, entry.artifacts.len()),
                None => return Err(ApiError::TaskNotFound(task_id)),
            },
        };
        match reason {
            Some(reason) => Err(ApiError::TaskFailed(task_id, reason)),
            None => Ok(format!(
                "Task {} produced {} image(s). Export with `atelier export <hash> <file>`.",
                task_id, artifacts
            )),
        }
    }

    async fn handle_export(&self, artifact: ArtifactRef, out: &Path) -> Result<String, ApiError> {
        let bytes = self.orchestrator.artifact_bytes(artifact).await?;
        std::fs::write(out, &bytes).map_err(StorageError::from)?;
        Ok(format!("Wrote {} bytes to {}", bytes.len(), out.display()))
    }
}
