// 📅 Epoch Reconciler - ordering and classification of study epochs
//
// Epochs arrive from the schedule table, the narrative, and optionally an
// execution-model traversal sequence. Reconciliation clusters and merges
// them; this wrapper then reorders the result to the traversal sequence
// (when one was supplied) and tags each epoch with a best-effort category.

use crate::normalize::matching_key;
use crate::reconciler::{
    AuxTable, EntityContribution, EntityKind, EntityProfile, IdMinter, MatchGroup, RawFields,
    ReconcileOutcome, ReconciledEntity, Reconciler, ReconciliationError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};

// ============================================================================
// EPOCH CATEGORY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochCategory {
    /// Part of the main treatment flow.
    Main,

    /// Peripheral: screening, follow-up, washout, run-in, termination.
    Other,
}

impl EpochCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpochCategory::Main => "main",
            EpochCategory::Other => "other",
        }
    }
}

/// Name fragments that mark an epoch as peripheral to the treatment flow.
const PERIPHERAL_PATTERNS: &[&str] = &[
    "screening",
    "screen",
    "follow-up",
    "follow up",
    "followup",
    "washout",
    "wash-out",
    "run-in",
    "run in",
    "baseline",
    "end of study",
    "early termination",
];

// ============================================================================
// EPOCH PROFILE
// ============================================================================

struct EpochProfile {
    /// Pre-merge ids from the traversal sequence, when supplied.
    traversal: Option<HashSet<String>>,
}

impl EpochProfile {
    fn classify(&self, entity: &ReconciledEntity, group: &MatchGroup, all: &[EntityContribution]) -> EpochCategory {
        // Explicit traversal membership takes precedence over name heuristics
        if let Some(traversal) = &self.traversal {
            let in_traversal = traversal.contains(&entity.id)
                || group.members().iter().any(|&m| {
                    all[m]
                        .raw_id()
                        .map(|id| traversal.contains(id))
                        .unwrap_or(false)
                });
            return if in_traversal {
                EpochCategory::Main
            } else {
                EpochCategory::Other
            };
        }

        let key = matching_key(&entity.canonical_name);
        if PERIPHERAL_PATTERNS.iter().any(|p| key.contains(p)) {
            EpochCategory::Other
        } else {
            EpochCategory::Main
        }
    }
}

impl EntityProfile for EpochProfile {
    fn kind(&self) -> EntityKind {
        EntityKind::Epoch
    }

    fn enrich(
        &self,
        entity: &mut ReconciledEntity,
        group: &MatchGroup,
        contributions: &[EntityContribution],
        aux: &mut AuxTable,
    ) -> Result<(), ReconciliationError> {
        let category = self.classify(entity, group, contributions);
        aux.set_once(&entity.id, "epochCategory", json!(category.as_str()))?;
        Ok(())
    }
}

// ============================================================================
// EPOCH RECONCILER
// ============================================================================

pub struct EpochReconciler {
    base: Reconciler,
    traversal_order: Option<Vec<String>>,
}

impl EpochReconciler {
    pub fn new() -> Self {
        EpochReconciler {
            base: Reconciler::new(),
            traversal_order: None,
        }
    }

    pub fn with_threshold(match_threshold: f64) -> Self {
        EpochReconciler {
            base: Reconciler::with_threshold(match_threshold),
            traversal_order: None,
        }
    }

    pub fn set_minter(&mut self, minter: IdMinter) {
        self.base.set_minter(minter);
    }

    /// Ordered epoch identifiers from the execution-model extraction.
    /// Optional; without it, source-priority order is preserved.
    pub fn set_traversal_order(&mut self, ids: Vec<String>) {
        self.traversal_order = Some(ids);
    }

    pub fn contribute(&mut self, source: &str, items: Vec<RawFields>, priority: i32) {
        self.base.contribute(source, items, priority);
    }

    pub fn reconcile(&self) -> ReconcileOutcome {
        let profile = EpochProfile {
            traversal: self
                .traversal_order
                .as_ref()
                .map(|ids| ids.iter().cloned().collect()),
        };
        let mut outcome = self.base.reconcile(&profile);

        if let Some(order) = &self.traversal_order {
            reorder_to_traversal(&mut outcome.entities, order, &outcome.id_map);
        }

        outcome
    }
}

impl Default for EpochReconciler {
    fn default() -> Self {
        Self::new()
    }
}

/// Reorder reconciled epochs to the traversal sequence. Traversal ids may
/// be pre-merge contribution ids; they are resolved through the id map.
/// Epochs not named by the traversal keep their relative order, appended
/// after the traversal-ordered ones.
fn reorder_to_traversal(
    entities: &mut Vec<ReconciledEntity>,
    traversal: &[String],
    id_map: &HashMap<String, String>,
) {
    let mut position: HashMap<&str, usize> = HashMap::new();
    for (pos, old_id) in traversal.iter().enumerate() {
        let final_id = id_map.get(old_id).map(String::as_str).unwrap_or(old_id);
        position.entry(final_id).or_insert(pos);
    }

    let mut keyed: Vec<(Option<usize>, usize, ReconciledEntity)> = entities
        .drain(..)
        .enumerate()
        .map(|(i, e)| (position.get(e.id.as_str()).copied(), i, e))
        .collect();

    keyed.sort_by_key(|(pos, original, _)| match pos {
        Some(p) => (0, *p, *original),
        None => (1, 0, *original),
    });

    entities.extend(keyed.into_iter().map(|(_, _, e)| e));
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn fields(pairs: &[(&str, Value)]) -> RawFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn named(name: &str) -> RawFields {
        fields(&[("name", json!(name))])
    }

    #[test]
    fn test_scenario_a_footnote_case_merge() {
        let mut reconciler = EpochReconciler::new();
        reconciler.contribute("soa", vec![named("Screening¹")], 10);
        reconciler.contribute("traversal", vec![named("screening")], 25);

        let outcome = reconciler.reconcile();
        assert_eq!(outcome.entities.len(), 1);
        let epoch = &outcome.entities[0];
        assert_eq!(epoch.canonical_name, "Screening");
        let mut sources = epoch.contributing_sources.clone();
        sources.sort();
        assert_eq!(sources, vec!["soa".to_string(), "traversal".to_string()]);
    }

    #[test]
    fn test_name_heuristic_classification() {
        let mut reconciler = EpochReconciler::new();
        reconciler.contribute(
            "soa",
            vec![named("Screening"), named("Treatment"), named("Follow-up")],
            10,
        );

        let outcome = reconciler.reconcile();
        let category = |name: &str| {
            let e = outcome
                .entities
                .iter()
                .find(|e| e.canonical_name == name)
                .unwrap();
            outcome.aux.get(&e.id, "epochCategory").cloned()
        };
        assert_eq!(category("Screening"), Some(json!("other")));
        assert_eq!(category("Treatment"), Some(json!("main")));
        assert_eq!(category("Follow-up"), Some(json!("other")));
    }

    #[test]
    fn test_traversal_membership_overrides_heuristic() {
        let mut reconciler = EpochReconciler::new();
        reconciler.contribute(
            "soa",
            vec![
                fields(&[("name", json!("Screening")), ("id", json!("ep_scr"))]),
                fields(&[("name", json!("Treatment")), ("id", json!("ep_trt"))]),
            ],
            10,
        );
        // Traversal names Screening explicitly: it is main despite the
        // name heuristic, and Treatment is not
        reconciler.set_traversal_order(vec!["ep_scr".to_string()]);

        let outcome = reconciler.reconcile();
        let screening = outcome
            .entities
            .iter()
            .find(|e| e.canonical_name == "Screening")
            .unwrap();
        let treatment = outcome
            .entities
            .iter()
            .find(|e| e.canonical_name == "Treatment")
            .unwrap();
        assert_eq!(
            outcome.aux.get(&screening.id, "epochCategory"),
            Some(&json!("main"))
        );
        assert_eq!(
            outcome.aux.get(&treatment.id, "epochCategory"),
            Some(&json!("other"))
        );
    }

    #[test]
    fn test_traversal_reorders_epochs() {
        let mut reconciler = EpochReconciler::new();
        reconciler.contribute(
            "soa",
            vec![
                fields(&[("name", json!("Follow-up")), ("id", json!("ep3"))]),
                fields(&[("name", json!("Screening")), ("id", json!("ep1"))]),
                fields(&[("name", json!("Treatment")), ("id", json!("ep2"))]),
            ],
            10,
        );
        reconciler.set_traversal_order(vec![
            "ep1".to_string(),
            "ep2".to_string(),
            "ep3".to_string(),
        ]);

        let outcome = reconciler.reconcile();
        let names: Vec<&str> = outcome
            .entities
            .iter()
            .map(|e| e.canonical_name.as_str())
            .collect();
        assert_eq!(names, vec!["Screening", "Treatment", "Follow-up"]);
    }

    #[test]
    fn test_unlisted_epochs_append_after_traversal() {
        let mut reconciler = EpochReconciler::new();
        reconciler.contribute(
            "soa",
            vec![
                fields(&[("name", json!("Unplanned Extension")), ("id", json!("ep9"))]),
                fields(&[("name", json!("Screening")), ("id", json!("ep1"))]),
            ],
            10,
        );
        reconciler.set_traversal_order(vec!["ep1".to_string()]);

        let outcome = reconciler.reconcile();
        let names: Vec<&str> = outcome
            .entities
            .iter()
            .map(|e| e.canonical_name.as_str())
            .collect();
        assert_eq!(names, vec!["Screening", "Unplanned Extension"]);
    }

    #[test]
    fn test_no_traversal_preserves_priority_order() {
        let mut reconciler = EpochReconciler::new();
        reconciler.contribute("soa", vec![named("Screening"), named("Treatment")], 10);

        let outcome = reconciler.reconcile();
        let names: Vec<&str> = outcome
            .entities
            .iter()
            .map(|e| e.canonical_name.as_str())
            .collect();
        assert_eq!(names, vec!["Screening", "Treatment"]);
    }
}
