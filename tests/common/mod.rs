//! In-memory collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use dual_pass_context::clients::{
    CollaboratorError, EntityQuery, EntityStore, GeneratedNarrative, LocalInference,
    NarrativeGenerator, QueryClassifier, QueryType, RetrievalClient, SnapshotSink, StoreError,
};
use dual_pass_context::config::Config;
use dual_pass_context::divergence::{ModelError, StructuredModel};
use dual_pass_context::context::{
    BaselineEntity, Chunk, EntityKind, EntityRecord, FeaturedEntity, NarrativeAnalysis,
};
use dual_pass_context::memory::BaselineSnapshot;
use dual_pass_context::turn::ContextPayload;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Retrieval keyed by substring: any query containing a key returns its chunks
#[derive(Default)]
pub struct MockRetrieval {
    pub by_keyword: Vec<(String, Vec<Chunk>)>,
    pub recent: Vec<Chunk>,
    pub queries: Mutex<Vec<String>>,
}

impl MockRetrieval {
    pub fn with_recent(mut self, chunks: Vec<Chunk>) -> Self {
        self.recent = chunks;
        self
    }

    pub fn with_keyword(mut self, keyword: &str, chunks: Vec<Chunk>) -> Self {
        self.by_keyword.push((keyword.to_lowercase(), chunks));
        self
    }

    pub fn issued(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetrievalClient for MockRetrieval {
    async fn query_memory(
        &self,
        query: &str,
        _k: usize,
        _hybrid: bool,
    ) -> Result<Vec<Chunk>, CollaboratorError> {
        self.queries.lock().unwrap().push(query.to_string());
        let lowered = query.to_lowercase();
        Ok(self
            .by_keyword
            .iter()
            .filter(|(keyword, _)| lowered.contains(keyword.as_str()))
            .flat_map(|(_, chunks)| chunks.clone())
            .collect())
    }

    async fn get_recent_chunks(
        &self,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<Chunk>, CollaboratorError> {
        let eligible: Vec<Chunk> = self
            .recent
            .iter()
            .filter(|c| before.map_or(true, |b| c.id < b))
            .cloned()
            .collect();
        let skip = eligible.len().saturating_sub(limit);
        Ok(eligible[skip..].to_vec())
    }
}

/// Entity store with per-kind canned records and failure modes
#[derive(Default)]
pub struct MockEntityStore {
    pub records: HashMap<EntityKind, Vec<EntityRecord>>,
    pub missing_tables: HashSet<EntityKind>,
    pub failing: HashSet<EntityKind>,
    pub queries: Mutex<Vec<EntityQuery>>,
}

impl MockEntityStore {
    pub fn with_records(mut self, kind: EntityKind, records: Vec<EntityRecord>) -> Self {
        self.records.insert(kind, records);
        self
    }

    pub fn missing(mut self, kind: EntityKind) -> Self {
        self.missing_tables.insert(kind);
        self
    }

    pub fn failing(mut self, kind: EntityKind) -> Self {
        self.failing.insert(kind);
        self
    }

    pub fn queries_for(&self, kind: EntityKind) -> Vec<EntityQuery> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.kind == Some(kind))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EntityStore for MockEntityStore {
    async fn lookup(&self, query: &EntityQuery) -> Result<Vec<EntityRecord>, StoreError> {
        self.queries.lock().unwrap().push(query.clone());
        let Some(kind) = query.kind else {
            return Ok(Vec::new());
        };
        if self.missing_tables.contains(&kind) {
            return Err(StoreError::MissingTable(kind.as_str().to_string()));
        }
        if self.failing.contains(&kind) {
            return Err(StoreError::Query("connection reset".to_string()));
        }
        Ok(self.records.get(&kind).cloned().unwrap_or_default())
    }
}

pub struct MockInference {
    pub available: bool,
    pub analysis: NarrativeAnalysis,
    pub queries: Vec<String>,
}

impl Default for MockInference {
    fn default() -> Self {
        Self {
            available: true,
            analysis: NarrativeAnalysis {
                summary: Some("Smugglers at the harbor".to_string()),
                themes: vec!["smuggling".to_string()],
                expected_user_themes: vec!["bargain".to_string()],
                entities_mentioned: vec!["Mira Kestrel".to_string()],
                authorial_directives: vec!["keep the tension".to_string()],
            },
            queries: vec!["harbor smuggling routes".to_string()],
        }
    }
}

#[async_trait]
impl LocalInference for MockInference {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn analyze_narrative_context(
        &self,
        _chunks: &[Chunk],
        _user_input: &str,
    ) -> Result<NarrativeAnalysis, CollaboratorError> {
        Ok(self.analysis.clone())
    }

    async fn generate_retrieval_queries(
        &self,
        _analysis: &NarrativeAnalysis,
        _user_input: &str,
    ) -> Result<Vec<String>, CollaboratorError> {
        Ok(self.queries.clone())
    }
}

pub enum GeneratorMode {
    Narrative(String),
    Failing,
    Disabled,
}

pub struct MockGenerator {
    pub mode: GeneratorMode,
    pub payloads: Mutex<Vec<ContextPayload>>,
}

impl MockGenerator {
    pub fn narrating(text: &str) -> Self {
        Self {
            mode: GeneratorMode::Narrative(text.to_string()),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_mode(mode: GeneratorMode) -> Self {
        Self {
            mode,
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn last_payload(&self) -> Option<ContextPayload> {
        self.payloads.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl NarrativeGenerator for MockGenerator {
    fn is_enabled(&self) -> bool {
        !matches!(self.mode, GeneratorMode::Disabled)
    }

    async fn generate_narrative(
        &self,
        payload: &ContextPayload,
    ) -> Result<GeneratedNarrative, CollaboratorError> {
        self.payloads.lock().unwrap().push(payload.clone());
        match &self.mode {
            GeneratorMode::Narrative(text) => Ok(GeneratedNarrative {
                narrative: text.clone(),
                model: Some("mock".to_string()),
                ..Default::default()
            }),
            GeneratorMode::Failing => Err(CollaboratorError::Timeout("generation".to_string())),
            GeneratorMode::Disabled => Err(CollaboratorError::Unavailable("disabled".to_string())),
        }
    }
}

pub struct FailingClassifier;

#[async_trait]
impl QueryClassifier for FailingClassifier {
    async fn classify(&self, _query: &str) -> Result<QueryType, CollaboratorError> {
        Err(CollaboratorError::Unavailable("classifier".to_string()))
    }
}

#[derive(Default)]
pub struct MockSink {
    pub fail: bool,
    pub snapshots: Mutex<Vec<BaselineSnapshot>>,
}

#[async_trait]
impl SnapshotSink for MockSink {
    async fn persist(&self, snapshot: &BaselineSnapshot) -> Result<(), CollaboratorError> {
        if self.fail {
            return Err(CollaboratorError::RequestFailed("disk full".to_string()));
        }
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

/// Structured model with a fixed reply or a fixed network failure
pub struct ScriptedModel {
    pub reply: Result<String, String>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reply: Err("connection refused".to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl StructuredModel for ScriptedModel {
    async fn complete(&self, _system: &str, prompt: &str) -> Result<String, ModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.reply.clone().map_err(ModelError::Network)
    }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.token_budget.apex_window = Some(32_000);
    config
}

pub fn chunk(id: i64, text: &str) -> Chunk {
    Chunk::new(id, text)
}

pub fn harbor_retrieval() -> MockRetrieval {
    MockRetrieval::default()
        .with_recent(vec![
            chunk(101, "Rain hammered the harbor as the smugglers unloaded their crates."),
            chunk(102, "Mira Kestrel counted the crates twice and frowned at the manifest."),
        ])
        .with_keyword(
            "harbor",
            vec![Chunk::new(201, "The harbor master takes bribes in silver.").with_score(0.8)],
        )
        .with_keyword(
            "vexmoor",
            vec![Chunk::new(301, "Lord Vexmoor keeps a manor beyond the salt flats.").with_score(0.9)],
        )
}

pub fn harbor_store() -> MockEntityStore {
    let mira = FeaturedEntity {
        aliases: vec!["Captain".to_string()],
        ..FeaturedEntity::new(1, EntityKind::Character, "Mira Kestrel").in_scene()
    };
    MockEntityStore::default()
        .with_records(
            EntityKind::Character,
            vec![
                EntityRecord::Featured(mira),
                EntityRecord::Baseline(BaselineEntity {
                    id: 2,
                    kind: EntityKind::Character,
                    name: "Oren Vale".to_string(),
                    status: None,
                }),
            ],
        )
        .with_records(
            EntityKind::Place,
            vec![EntityRecord::Featured(
                FeaturedEntity::new(10, EntityKind::Place, "Saltmarsh Harbor").in_scene(),
            )],
        )
        .with_records(
            EntityKind::Relationship,
            vec![EntityRecord::Featured(FeaturedEntity::new(
                20,
                EntityKind::Relationship,
                "Mira owes Oren",
            ))],
        )
}
