//! Wires the configured stores, capabilities and modules into an
//! orchestrator.

use routewise_agent::{Orchestrator, OrchestratorSettings};
use routewise_config::AppConfig;
use routewise_core::event::EventBus;
use routewise_core::retrieval::Retriever;
use routewise_core::store::{LogStore, SessionStore};
use routewise_memory::{
    ConversationMemory, EpisodicStore, FileSessionStore, InMemoryLogStore, InMemorySessionStore,
    JsonlLogStore,
};
use routewise_policy::{PolicyEngine, PolicySet};
use routewise_reflection::{LearningModule, ReflectionModule};
use routewise_tools::{default_registry, InMemoryRetriever};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

/// Session and log stores for the configured backend.
pub fn open_stores(config: &AppConfig) -> Result<(Arc<dyn SessionStore>, Arc<dyn LogStore>), Box<dyn std::error::Error>> {
    if config.storage.backend == "memory" {
        return Ok((Arc::new(InMemorySessionStore::new()), Arc::new(InMemoryLogStore::new())));
    }
    let dir = config.data_dir();
    std::fs::create_dir_all(dir.join("state"))?;
    std::fs::create_dir_all(dir.join("logs"))?;
    debug!(path = %dir.display(), "Using file storage");
    Ok((
        Arc::new(FileSessionStore::new(dir.join("state"))),
        Arc::new(JsonlLogStore::new(dir.join("logs"))),
    ))
}

pub fn load_policies(config: &AppConfig) -> Result<PolicyEngine, Box<dyn std::error::Error>> {
    if !config.policy_enabled {
        return Ok(PolicyEngine::disabled());
    }
    let set = match &config.policy_file {
        Some(path) => PolicySet::load(Path::new(path))?,
        None => PolicySet::defaults(),
    };
    Ok(PolicyEngine::new(set)?)
}

pub async fn build(config: &AppConfig) -> Result<Orchestrator, Box<dyn std::error::Error>> {
    let (store, logs) = open_stores(config)?;

    let retriever: Option<Arc<dyn Retriever>> = match &config.documents.chunks_file {
        Some(path) => {
            let retriever: Arc<dyn Retriever> = Arc::new(InMemoryRetriever::load(path).await?);
            Some(retriever)
        }
        None => None,
    };
    let registry = Arc::new(default_registry(retriever)?);
    let summarizer = registry.capability(&config.summarizer_capability).ok();

    let mut memory = ConversationMemory::new(config.memory_window_size, config.retain_recent())
        .with_store(store.clone());
    if let Some(summarizer) = &summarizer {
        memory = memory.with_summarizer(summarizer.clone());
    }
    let episodic = EpisodicStore::open(store.clone(), summarizer).await?;

    let policy = load_policies(config)?
        .with_log_store(logs.clone())
        .with_log_limit(config.storage.violation_log_limit);

    let events = Arc::new(EventBus::default());
    let learning = LearningModule::spawn(Some(store)).await;
    let reflection = ReflectionModule::new(learning)
        .with_log_store(logs)
        .with_events(events.clone());

    let orchestrator = Orchestrator::new(
        registry,
        Arc::new(memory),
        Arc::new(episodic),
        Arc::new(policy),
        Arc::new(reflection),
    )
    .with_settings(OrchestratorSettings::from_config(config))
    .with_events(events);

    Ok(orchestrator)
}
