//! Data models for context management

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Narrative or retrieved text chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub text: String,
    #[serde(default)]
    pub score: f32,
    /// Label of the gap query or component that pulled this chunk in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Chunk {
    pub fn new(id: i64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            score: 0.0,
            label: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Budgeted content component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetComponent {
    WarmSlice,
    Structured,
    Augmentation,
}

impl BudgetComponent {
    /// Donation order used when raising utilization
    pub const DONATION_ORDER: [BudgetComponent; 3] = [
        BudgetComponent::WarmSlice,
        BudgetComponent::Augmentation,
        BudgetComponent::Structured,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WarmSlice => "warm_slice",
            Self::Structured => "structured",
            Self::Augmentation => "augmentation",
        }
    }
}

impl fmt::Display for BudgetComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage of an assembled pass-1 context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total_available: usize,
    pub warm_slice: usize,
    pub structured: usize,
    pub augmentation: usize,
}

impl TokenUsage {
    /// Tokens consumed by content components
    pub fn content_tokens(&self) -> usize {
        self.warm_slice + self.structured + self.augmentation
    }

    pub fn get(&self, component: BudgetComponent) -> usize {
        match component {
            BudgetComponent::WarmSlice => self.warm_slice,
            BudgetComponent::Structured => self.structured,
            BudgetComponent::Augmentation => self.augmentation,
        }
    }

    pub fn add(&mut self, component: BudgetComponent, tokens: usize) {
        match component {
            BudgetComponent::WarmSlice => self.warm_slice += tokens,
            BudgetComponent::Structured => self.structured += tokens,
            BudgetComponent::Augmentation => self.augmentation += tokens,
        }
    }
}

/// Logical entity type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    Place,
    Faction,
    Relationship,
    Event,
    Threat,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Place => "place",
            Self::Faction => "faction",
            Self::Relationship => "relationship",
            Self::Event => "event",
            Self::Threat => "threat",
        }
    }

    /// Whether this type keeps a protected baseline set
    pub fn has_baseline(&self) -> bool {
        matches!(self, Self::Character | Self::Place | Self::Faction)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal always-retained entity form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineEntity {
    pub id: i64,
    pub kind: EntityKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Full-detail entity form, retained while referenced or prioritized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturedEntity {
    pub id: i64,
    pub kind: EntityKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Present in the current scene (characters) or the current setting (places)
    #[serde(default)]
    pub in_scene: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl FeaturedEntity {
    pub fn new(id: i64, kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            aliases: Vec::new(),
            status: None,
            in_scene: false,
            details: BTreeMap::new(),
        }
    }

    pub fn in_scene(mut self) -> Self {
        self.in_scene = true;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Minimal form of this entity
    pub fn to_baseline(&self) -> BaselineEntity {
        BaselineEntity {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            status: self.status.clone(),
        }
    }

    /// Trimming tier; lower tiers are kept first
    pub fn priority_tier(&self) -> u8 {
        match (self.kind, self.in_scene) {
            (EntityKind::Character, true) => 1,
            (EntityKind::Place, true) => 2,
            (EntityKind::Character, false) => 3,
            (EntityKind::Place, false) => 4,
            (EntityKind::Faction, _) => 5,
            (EntityKind::Relationship, _) => 6,
            (EntityKind::Event, _) => 7,
            (EntityKind::Threat, _) => 8,
        }
    }
}

/// Entity record as returned by the structured store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum EntityRecord {
    Baseline(BaselineEntity),
    Featured(FeaturedEntity),
}

impl EntityRecord {
    pub fn id(&self) -> i64 {
        match self {
            Self::Baseline(e) => e.id,
            Self::Featured(e) => e.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Baseline(e) => e.kind,
            Self::Featured(e) => e.kind,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Baseline(e) => &e.name,
            Self::Featured(e) => &e.name,
        }
    }

    /// Full form; baseline records carry no detail
    pub fn into_featured(self) -> FeaturedEntity {
        match self {
            Self::Featured(e) => e,
            Self::Baseline(e) => FeaturedEntity {
                status: e.status,
                ..FeaturedEntity::new(e.id, e.kind, e.name)
            },
        }
    }
}

/// Baseline and featured sets of one entity type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TieredEntities {
    pub baseline: Vec<BaselineEntity>,
    pub featured: Vec<FeaturedEntity>,
}

impl TieredEntities {
    /// Partition store records, synthesizing a baseline form for any featured
    /// record whose id is missing from the baseline set
    pub fn from_records(records: Vec<EntityRecord>) -> Self {
        let mut tiered = Self::default();
        for record in records {
            match record {
                EntityRecord::Baseline(entity) => {
                    if !tiered.baseline.iter().any(|b| b.id == entity.id) {
                        tiered.baseline.push(entity);
                    }
                }
                EntityRecord::Featured(entity) => {
                    if !tiered.featured.iter().any(|f| f.id == entity.id) {
                        tiered.featured.push(entity);
                    }
                }
            }
        }
        for featured in &tiered.featured {
            if !tiered.baseline.iter().any(|b| b.id == featured.id) {
                tiered.baseline.push(featured.to_baseline());
            }
        }
        tiered
    }

    pub fn is_empty(&self) -> bool {
        self.baseline.is_empty() && self.featured.is_empty()
    }
}

/// Structured world state for one turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub characters: TieredEntities,
    pub places: TieredEntities,
    pub factions: TieredEntities,
    pub relationships: Vec<FeaturedEntity>,
    pub events: Vec<FeaturedEntity>,
    pub threats: Vec<FeaturedEntity>,
}

impl EntityData {
    /// All protected baseline records
    pub fn baseline_records(&self) -> impl Iterator<Item = &BaselineEntity> {
        self.characters
            .baseline
            .iter()
            .chain(self.places.baseline.iter())
            .chain(self.factions.baseline.iter())
    }

    /// All trimmable records
    pub fn trimmable_records(&self) -> impl Iterator<Item = &FeaturedEntity> {
        self.characters
            .featured
            .iter()
            .chain(self.places.featured.iter())
            .chain(self.factions.featured.iter())
            .chain(self.relationships.iter())
            .chain(self.events.iter())
            .chain(self.threats.iter())
    }

    /// Ids of featured characters, used to scope relationship lookups
    pub fn featured_character_ids(&self) -> Vec<i64> {
        self.characters.featured.iter().map(|c| c.id).collect()
    }

    pub fn record_count(&self) -> usize {
        self.baseline_records().count() + self.trimmable_records().count()
    }

    /// Name-keyed references for every named character, place, and faction
    pub fn entity_refs(&self) -> BTreeMap<String, EntityRef> {
        let mut refs = BTreeMap::new();
        for baseline in self.baseline_records() {
            refs.entry(baseline.name.clone()).or_insert_with(|| EntityRef {
                id: baseline.id,
                kind: baseline.kind,
                aliases: Vec::new(),
            });
        }
        for featured in self
            .characters
            .featured
            .iter()
            .chain(self.places.featured.iter())
            .chain(self.factions.featured.iter())
        {
            let entry = refs.entry(featured.name.clone()).or_insert_with(|| EntityRef {
                id: featured.id,
                kind: featured.kind,
                aliases: Vec::new(),
            });
            for alias in &featured.aliases {
                if !entry.aliases.contains(alias) {
                    entry.aliases.push(alias.clone());
                }
            }
        }
        refs
    }
}

/// Reference to a tracked entity held in a context package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: i64,
    pub kind: EntityKind,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Local-inference reading of the warm slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeAnalysis {
    pub summary: Option<String>,
    pub themes: Vec<String>,
    pub expected_user_themes: Vec<String>,
    pub entities_mentioned: Vec<String>,
    pub authorial_directives: Vec<String>,
}
