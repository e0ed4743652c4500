// 🔀 Reconciliation Engine - cluster contributions, merge by priority
//
// Several independent extraction passes each report their own candidate
// list for the same entity type (epochs, encounters, activities). This
// engine clusters the candidates by name similarity, merges fields by
// source priority (fill-only: a higher-priority source is never
// overwritten), assigns canonical IDs, and records provenance.
//
// The engine is entity-type-agnostic. Type-specific behavior (ordering,
// classification, timing extraction) is injected through an EntityProfile
// passed to reconcile().

use crate::normalize::{matching_key, normalize_name};
use crate::similarity::{similarity, DEFAULT_MATCH_THRESHOLD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Open attribute mapping carried by contributions and reconciled entities.
pub type RawFields = serde_json::Map<String, Value>;

// ============================================================================
// ERRORS / DIAGNOSTICS
// ============================================================================

/// Non-fatal defects encountered during a reconcile run. These are
/// aggregated into `ReconcileOutcome::diagnostics`, never raised: one bad
/// entity must not fail the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationError {
    MissingName { source: String, index: usize },

    EnrichmentFailed { entity_id: String, reason: String },

    AuxConflict { entity_id: String, key: String },
}

// Manual Display/Error impls: thiserror's derive would treat the
// `source` field of MissingName as an error source, which a String
// cannot be.
impl std::fmt::Display for ReconciliationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconciliationError::MissingName { source, index } => write!(
                f,
                "contribution from '{source}' at index {index} has no usable name"
            ),
            ReconciliationError::EnrichmentFailed { entity_id, reason } => {
                write!(f, "enrichment failed for entity '{entity_id}': {reason}")
            }
            ReconciliationError::AuxConflict { entity_id, key } => write!(
                f,
                "auxiliary attribute '{key}' already set on entity '{entity_id}'"
            ),
        }
    }
}

impl std::error::Error for ReconciliationError {}

// ============================================================================
// ENTITY KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Epoch,
    Encounter,
    Activity,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Epoch => "StudyEpoch",
            EntityKind::Encounter => "Encounter",
            EntityKind::Activity => "Activity",
        }
    }
}

// ============================================================================
// CONTRIBUTION
// ============================================================================

/// One candidate entity as reported by one extraction source.
/// Immutable after creation; consumed by `reconcile()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityContribution {
    /// Identifier of the contributing extraction pass.
    pub source: String,

    /// Higher wins ties during merge.
    pub priority: i32,

    /// Position within the source's own list.
    pub sequence_index: usize,

    /// Open attribute mapping; `name` required, `id` optional/advisory.
    pub raw_fields: RawFields,

    /// Global arrival order, used as the final stable tie-break.
    #[serde(skip)]
    pub(crate) insertion_index: usize,
}

impl EntityContribution {
    pub fn name(&self) -> Option<&str> {
        self.raw_fields.get("name").and_then(Value::as_str)
    }

    pub fn raw_id(&self) -> Option<&str> {
        self.raw_fields.get("id").and_then(Value::as_str)
    }
}

// ============================================================================
// MATCH GROUP (internal clustering)
// ============================================================================

/// Ephemeral cluster of contributions believed to denote the same
/// real-world entity. Exists only during `reconcile()`.
#[derive(Debug, Clone)]
pub struct MatchGroup {
    /// Index (into the flattened contribution list) of the representative:
    /// the highest-priority contribution, which seeds the merge.
    pub(crate) representative: usize,

    /// Member indices in merge order (representative first).
    pub(crate) members: Vec<usize>,

    /// Matching key of the representative's clean name.
    pub(crate) rep_key: String,
}

impl MatchGroup {
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn representative(&self) -> usize {
        self.representative
    }
}

// ============================================================================
// RECONCILED ENTITY
// ============================================================================

/// One output entity after merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledEntity {
    /// Canonical identifier: reused from a pinned upstream id, else minted.
    pub id: String,

    /// Cleaned display name (footnotes removed, whitespace normalized).
    /// NOT lower-cased.
    pub canonical_name: String,

    /// Union of fields from all contributions, populated by priority.
    pub merged_fields: RawFields,

    /// Ordered set of distinct sources that fed this entity.
    pub contributing_sources: Vec<String>,
}

impl ReconciledEntity {
    /// Flat JSON-compatible mapping for downstream consumers: structural
    /// fields plus the entity's auxiliary attributes.
    pub fn to_flat_json(&self, aux: &AuxTable) -> Value {
        let mut out = RawFields::new();
        out.insert("id".to_string(), Value::String(self.id.clone()));
        out.insert(
            "name".to_string(),
            Value::String(self.canonical_name.clone()),
        );
        for (k, v) in &self.merged_fields {
            if k != "id" && k != "name" {
                out.insert(k.clone(), v.clone());
            }
        }
        out.insert(
            "contributingSources".to_string(),
            Value::Array(
                self.contributing_sources
                    .iter()
                    .map(|s| Value::String(s.clone()))
                    .collect(),
            ),
        );
        if let Some(attrs) = aux.attributes(&self.id) {
            for (k, v) in attrs {
                out.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        Value::Object(out)
    }
}

// ============================================================================
// AUXILIARY ATTRIBUTE SIDE-TABLE
// ============================================================================

/// Type-specific computed attributes (epoch category, study day, ...) kept
/// separate from the structural entity, keyed by entity id. Write-once:
/// the first writer wins, a second write to the same key is a diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxTable {
    entries: HashMap<String, RawFields>,
}

impl AuxTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_once(
        &mut self,
        entity_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), ReconciliationError> {
        let attrs = self.entries.entry(entity_id.to_string()).or_default();
        if attrs.contains_key(key) {
            return Err(ReconciliationError::AuxConflict {
                entity_id: entity_id.to_string(),
                key: key.to_string(),
            });
        }
        attrs.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, entity_id: &str, key: &str) -> Option<&Value> {
        self.entries.get(entity_id).and_then(|attrs| attrs.get(key))
    }

    pub fn attributes(&self, entity_id: &str) -> Option<&RawFields> {
        self.entries.get(entity_id)
    }
}

// ============================================================================
// ID MINTING
// ============================================================================

/// Identifier generation policy. Random mode mints UUIDs; deterministic
/// mode derives ids from a seed so repeated runs are comparable in tests.
#[derive(Debug, Clone)]
pub enum IdMinter {
    Random,
    Deterministic(String),
}

impl IdMinter {
    pub fn mint(&self, kind: EntityKind, canonical_name: &str, occurrence: usize) -> String {
        match self {
            IdMinter::Random => format!("{}_{}", kind.as_str(), Uuid::new_v4()),
            IdMinter::Deterministic(seed) => {
                let mut hasher = Sha256::new();
                hasher.update(seed.as_bytes());
                hasher.update(kind.as_str().as_bytes());
                hasher.update(canonical_name.as_bytes());
                hasher.update(occurrence.to_le_bytes());
                let digest = hasher.finalize();
                let hex: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();
                format!("{}_{}", kind.as_str(), hex)
            }
        }
    }
}

/// A contribution id is trusted (and reused verbatim) only when it looks
/// like a real identifier rather than a placeholder.
pub(crate) fn is_pinned_id(id: &str) -> bool {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return false;
    }
    const PLACEHOLDERS: &[&str] = &[
        "tbd",
        "todo",
        "unknown",
        "null",
        "none",
        "n/a",
        "na",
        "temp",
        "placeholder",
        "xxx",
    ];
    if PLACEHOLDERS.contains(&trimmed.to_lowercase().as_str()) {
        return false;
    }
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ============================================================================
// ENTITY PROFILE (type-specific hook)
// ============================================================================

/// Capability object injected into the engine: supplies the entity kind and
/// the post-merge enrichment hook.
pub trait EntityProfile {
    fn kind(&self) -> EntityKind;

    /// Type-specific post-processing for one merged entity. Errors are
    /// collected as diagnostics, never fatal.
    fn enrich(
        &self,
        entity: &mut ReconciledEntity,
        group: &MatchGroup,
        contributions: &[EntityContribution],
        aux: &mut AuxTable,
    ) -> Result<(), ReconciliationError>;
}

/// Profile with no type-specific behavior.
pub struct NoopProfile(pub EntityKind);

impl EntityProfile for NoopProfile {
    fn kind(&self) -> EntityKind {
        self.0
    }

    fn enrich(
        &self,
        _entity: &mut ReconciledEntity,
        _group: &MatchGroup,
        _contributions: &[EntityContribution],
        _aux: &mut AuxTable,
    ) -> Result<(), ReconciliationError> {
        Ok(())
    }
}

// ============================================================================
// RECONCILE OUTCOME
// ============================================================================

/// Everything one `reconcile()` run produces.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Entities in stable output order (sequence order of each group's
    /// representative contribution).
    pub entities: Vec<ReconciledEntity>,

    /// Type-specific computed attributes, keyed by entity id.
    pub aux: AuxTable,

    /// Pre-merge contribution id → post-merge canonical id.
    pub id_map: HashMap<String, String>,

    /// Non-fatal defects encountered during the run.
    pub diagnostics: Vec<ReconciliationError>,

    /// Contributions dropped for lack of a usable name.
    pub dropped: usize,
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct Reconciler {
    /// Similarity threshold for "same entity".
    pub match_threshold: f64,

    minter: IdMinter,
    contributions: Vec<EntityContribution>,
    per_source_counts: HashMap<String, usize>,
}

impl Reconciler {
    pub fn new() -> Self {
        Reconciler {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            minter: IdMinter::Random,
            contributions: Vec::new(),
            per_source_counts: HashMap::new(),
        }
    }

    pub fn with_threshold(match_threshold: f64) -> Self {
        Reconciler {
            match_threshold,
            ..Self::new()
        }
    }

    pub fn set_minter(&mut self, minter: IdMinter) {
        self.minter = minter;
    }

    /// Accept one batch of candidate entities from a named source. May be
    /// called multiple times per source; later calls are additive and
    /// continue the source's sequence numbering.
    pub fn contribute(&mut self, source: &str, items: Vec<RawFields>, priority: i32) {
        let counter = self.per_source_counts.entry(source.to_string()).or_insert(0);
        for raw_fields in items {
            let insertion_index = self.contributions.len();
            self.contributions.push(EntityContribution {
                source: source.to_string(),
                priority,
                sequence_index: *counter,
                raw_fields,
                insertion_index,
            });
            *counter += 1;
        }
    }

    /// Cluster and merge all contributions received so far. Deterministic
    /// given the same sequence of `contribute()` calls; never fails on
    /// malformed input.
    pub fn reconcile(&self, profile: &dyn EntityProfile) -> ReconcileOutcome {
        let kind = profile.kind();
        let mut diagnostics = Vec::new();
        let mut dropped = 0usize;

        // Sort order is the single source of "who clusters attach to and
        // who wins merges": priority desc, then source-local sequence,
        // then arrival order.
        let mut order: Vec<usize> = (0..self.contributions.len()).collect();
        order.sort_by_key(|&i| {
            let c = &self.contributions[i];
            (-c.priority, c.sequence_index, c.insertion_index)
        });

        // Greedy clustering against existing group representatives
        let mut groups: Vec<MatchGroup> = Vec::new();
        let mut clean_names: HashMap<usize, String> = HashMap::new();

        for &idx in &order {
            let contribution = &self.contributions[idx];
            let normalized = normalize_name(contribution.name().unwrap_or(""));
            if normalized.clean_name.is_empty() {
                warn!(
                    source = %contribution.source,
                    index = contribution.sequence_index,
                    "dropping contribution with no usable name"
                );
                diagnostics.push(ReconciliationError::MissingName {
                    source: contribution.source.clone(),
                    index: contribution.sequence_index,
                });
                dropped += 1;
                continue;
            }

            let key = matching_key(&normalized.clean_name);
            clean_names.insert(idx, normalized.clean_name);

            let mut best: Option<(usize, f64)> = None;
            for (gi, group) in groups.iter().enumerate() {
                let score = similarity(&key, &group.rep_key);
                if score >= self.match_threshold
                    && best.map(|(_, s)| score > s).unwrap_or(true)
                {
                    best = Some((gi, score));
                }
            }

            match best {
                Some((gi, score)) => {
                    debug!(key = %key, group = gi, score, "attached to existing cluster");
                    groups[gi].members.push(idx);
                }
                None => {
                    groups.push(MatchGroup {
                        representative: idx,
                        members: vec![idx],
                        rep_key: key,
                    });
                }
            }
        }

        // Output preserves the ordering of the highest-priority source:
        // groups sort by their representative's sequence index.
        groups.sort_by_key(|g| {
            let rep = &self.contributions[g.representative];
            (rep.sequence_index, rep.insertion_index)
        });

        // Merge each group into one entity
        let mut entities = Vec::with_capacity(groups.len());
        let mut aux = AuxTable::new();
        let mut id_map = HashMap::new();
        let mut mint_counts: HashMap<String, usize> = HashMap::new();

        for group in &groups {
            let base = &self.contributions[group.representative];

            let mut merged_fields = base.raw_fields.clone();
            let mut contributing_sources = vec![base.source.clone()];
            for &member in group.members.iter().skip(1) {
                let contribution = &self.contributions[member];
                for (k, v) in &contribution.raw_fields {
                    // Fill-only: never overwrite a higher-priority field
                    if !merged_fields.contains_key(k) {
                        merged_fields.insert(k.clone(), v.clone());
                    }
                }
                if !contributing_sources.contains(&contribution.source) {
                    contributing_sources.push(contribution.source.clone());
                }
            }

            let canonical_name = self.pick_display_name(group, &clean_names);

            let id = match base.raw_id() {
                Some(raw) if is_pinned_id(raw) => raw.to_string(),
                _ => {
                    let occurrence = mint_counts.entry(canonical_name.clone()).or_insert(0);
                    let minted = self.minter.mint(kind, &canonical_name, *occurrence);
                    *occurrence += 1;
                    minted
                }
            };

            for &member in &group.members {
                if let Some(old) = self.contributions[member].raw_id() {
                    if !old.trim().is_empty() {
                        id_map.insert(old.to_string(), id.clone());
                    }
                }
            }

            let mut entity = ReconciledEntity {
                id,
                canonical_name,
                merged_fields,
                contributing_sources,
            };

            if let Err(e) = profile.enrich(&mut entity, group, &self.contributions, &mut aux) {
                warn!(entity = %entity.id, error = %e, "enrichment hook failed");
                diagnostics.push(e);
            }

            entities.push(entity);
        }

        debug!(
            contributions = self.contributions.len(),
            entities = entities.len(),
            dropped,
            "reconcile complete"
        );

        ReconcileOutcome {
            entities,
            aux,
            id_map,
            diagnostics,
            dropped,
        }
    }

    /// Display name for a group. Comparison-oriented sources (traversal
    /// sequences, execution models) often emit lower-cased keys, so prefer
    /// the first member, in merge order, whose clean name carries any
    /// uppercase character; fall back to the representative's clean name.
    fn pick_display_name(
        &self,
        group: &MatchGroup,
        clean_names: &HashMap<usize, String>,
    ) -> String {
        for &member in &group.members {
            if let Some(name) = clean_names.get(&member) {
                if name.chars().any(|c| c.is_uppercase()) {
                    return name.clone();
                }
            }
        }
        clean_names
            .get(&group.representative)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
