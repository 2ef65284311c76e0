//! CLI route: single route table and run context. Dispatches to the stage
//! executor and renders results.

use crate::cli::parse::{CaseCommands, Commands, MessageCommands};
use crate::config::{CaseworkConfig, ConfigLoader, StoreBackend};
use crate::generation::GenerationClient;
use crate::provider::MessageRole;
use crate::store::{InMemoryResultStore, ResultStore, SledResultStore};
use crate::workflow::StageExecutor;
use anyhow::Context;
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runtime context for CLI execution: workspace, loaded config and executor.
pub struct RunContext {
    executor: StageExecutor,
    workspace_root: PathBuf,
    sled: Option<SledResultStore>,
}

impl RunContext {
    /// Load and validate configuration, open the store and resolve the provider.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config = load_config(&workspace_root, config_path.as_deref())?.validated()?;

        let (store, sled): (Arc<dyn ResultStore>, Option<SledResultStore>) =
            match config.store.backend {
                StoreBackend::Memory => (Arc::new(InMemoryResultStore::new()), None),
                StoreBackend::Sled => {
                    let path = config.store.resolved_path(&workspace_root);
                    std::fs::create_dir_all(&path).with_context(|| {
                        format!("Failed to create store directory {}", path.display())
                    })?;
                    let sled = SledResultStore::open(&path)
                        .with_context(|| format!("Failed to open store at {}", path.display()))?;
                    (Arc::new(sled.clone()), Some(sled))
                }
            };

        let client = GenerationClient::from_config(&config.provider, config.generation.clone())
            .context("Failed to set up the generation provider")?;
        info!(
            provider = client.provider_name(),
            model = client.model_name(),
            "Generation client ready"
        );

        let executor = StageExecutor::new(Arc::new(client), store, config.executor_settings());
        Ok(Self {
            executor,
            workspace_root,
            sled,
        })
    }

    pub fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Run one command. The returned text goes to stdout; `stream` writes its
    /// frames directly and returns nothing.
    pub async fn execute(&self, command: &Commands) -> anyhow::Result<String> {
        let output = match command {
            Commands::Case { command } => self.handle_case(command).await?,
            Commands::Message { command } => self.handle_message(command).await?,
            Commands::Start { case_id } => to_json(&self.executor.start(case_id).await?)?,
            Commands::Process {
                case_id,
                stage,
                input,
            } => to_json(
                &self
                    .executor
                    .process(case_id, stage, input.as_deref())
                    .await?,
            )?,
            Commands::Approve { case_id, stage } => {
                to_json(&self.executor.approve(case_id, stage).await?)?
            }
            Commands::Stream {
                case_id,
                stage,
                input,
            } => {
                self.handle_stream(case_id, stage, input.as_deref()).await?;
                String::new()
            }
            Commands::Status { case_id } => to_json(&self.executor.status(case_id).await?)?,
            Commands::Note { case_id } => self.executor.generate_note(case_id).await?,
        };

        if let Some(sled) = &self.sled {
            sled.flush().context("Failed to flush the store")?;
        }
        Ok(output)
    }

    async fn handle_case(&self, command: &CaseCommands) -> anyhow::Result<String> {
        match command {
            CaseCommands::Create {
                case_id,
                text,
                file,
            } => {
                let case_text = match (text, file) {
                    (Some(text), _) => text.clone(),
                    (None, Some(path)) => std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read case text from {}", path.display()))?,
                    (None, None) => anyhow::bail!("Case text is required (argument or --file)"),
                };
                to_json(&self.executor.create_case(case_id, &case_text).await?)
            }
        }
    }

    async fn handle_message(&self, command: &MessageCommands) -> anyhow::Result<String> {
        match command {
            MessageCommands::Add {
                case_id,
                role,
                content,
            } => {
                let role = MessageRole::parse_lenient(role);
                to_json(&self.executor.add_message(case_id, role, content).await?)
            }
            MessageCommands::List { case_id } => to_json(&self.executor.messages(case_id).await?),
        }
    }

    /// Write wire frames to stdout until the stream ends. Ctrl-C cancels the
    /// run; whatever was already produced is still flushed.
    async fn handle_stream(
        &self,
        case_id: &str,
        stage: &str,
        input: Option<&str>,
    ) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel();
            }
        });

        let stream = self
            .executor
            .stream_with_input(case_id, stage, input, cancel)
            .await?;
        let wire = stream.into_wire();
        futures::pin_mut!(wire);

        let mut stdout = tokio::io::stdout();
        let mut frames = 0usize;
        while let Some(frame) = wire.next().await {
            stdout.write_all(frame.as_bytes()).await?;
            stdout.flush().await?;
            frames += 1;
        }
        watcher.abort();
        debug!(case_id, stage, frames, "Stream finished");
        Ok(())
    }
}

fn load_config(workspace_root: &Path, config_path: Option<&Path>) -> anyhow::Result<CaseworkConfig> {
    let config = match config_path {
        Some(path) => ConfigLoader::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigLoader::load(workspace_root).context("Failed to load configuration")?,
    };
    Ok(config)
}

fn to_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
