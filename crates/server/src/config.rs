use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stepflow_core::events::{EventLog, MemoryEventLog};
use stepflow_core::storage::{InMemoryStore, JsonlEventLog, RedbStore, WorkflowStore};
use stepflow_core::{register_builtin_handlers, AppContext};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Redb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_index_file() -> String {
    "stepflow.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            event_log_dir: default_event_log_dir(),
            index_file: default_index_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    /// Get the index file path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub context: AppContext,
}

impl AppState {
    /// Build the engine context for the configured backend with the built-in handlers
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let (store, event_log): (Arc<dyn WorkflowStore>, Arc<dyn EventLog>) =
            match config.storage.backend {
                StorageBackend::Redb => {
                    tracing::info!("Using redb store at {}", config.index_path().display());
                    let store = RedbStore::new(config.index_path())
                        .context("Failed to create workflow store")?;
                    let event_log = JsonlEventLog::new(config.event_log_path())
                        .context("Failed to create event log")?;
                    (Arc::new(store), Arc::new(event_log))
                }
                StorageBackend::Memory => {
                    tracing::info!("Using in-memory store");
                    (
                        Arc::new(InMemoryStore::new()),
                        Arc::new(MemoryEventLog::new()),
                    )
                }
            };

        let context = AppContext::new(store, event_log);
        register_builtin_handlers(context.registry())
            .context("Failed to register built-in handlers")?;

        Ok(Self { context })
    }
}
