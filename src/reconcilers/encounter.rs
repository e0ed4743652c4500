// 🏥 Encounter Reconciler - timing extraction and unscheduled detection
//
// Encounters (visits) carry their timing in the name more often than in a
// structured field: "Day 1", "Week 12", "Day -7 (Screening)". This wrapper
// parses study day/week out of the cleaned name and flags unscheduled
// visits from a small fixed vocabulary. Visit-window bounds contributed by
// the execution-model stream merge fill-only through the base engine.

use crate::normalize::matching_key;
use crate::reconciler::{
    AuxTable, EntityContribution, EntityKind, EntityProfile, IdMinter, MatchGroup, RawFields,
    ReconcileOutcome, ReconciledEntity, Reconciler, ReconciliationError,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static DAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bday\s*(-?\d+)\b").unwrap());
static WEEK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bweek\s*(-?\d+)\b").unwrap());

/// Whole tokens that mark an unscheduled visit.
const UNSCHEDULED_TOKENS: &[&str] = &["uns", "unscheduled", "unplanned", "prn"];

/// Multi-word markers, matched as phrases on the hyphen-folded key.
const UNSCHEDULED_PHRASES: &[&str] = &["ad hoc", "as needed", "event driven"];

fn parse_timing(clean_name: &str, re: &Regex) -> Option<i64> {
    re.captures(clean_name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

pub(crate) fn name_looks_unscheduled(clean_name: &str) -> bool {
    let key = matching_key(clean_name).replace('-', " ");
    if UNSCHEDULED_PHRASES.iter().any(|p| key.contains(p)) {
        return true;
    }
    key.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .any(|token| UNSCHEDULED_TOKENS.contains(&token))
}

// ============================================================================
// ENCOUNTER PROFILE
// ============================================================================

struct EncounterProfile;

impl EntityProfile for EncounterProfile {
    fn kind(&self) -> EntityKind {
        EntityKind::Encounter
    }

    fn enrich(
        &self,
        entity: &mut ReconciledEntity,
        _group: &MatchGroup,
        _contributions: &[EntityContribution],
        aux: &mut AuxTable,
    ) -> Result<(), ReconciliationError> {
        if let Some(day) = parse_timing(&entity.canonical_name, &DAY_RE) {
            aux.set_once(&entity.id, "studyDay", json!(day))?;
        }
        if let Some(week) = parse_timing(&entity.canonical_name, &WEEK_RE) {
            aux.set_once(&entity.id, "studyWeek", json!(week))?;
        }

        // An explicit upstream flag always wins over the name heuristic
        let unscheduled = match entity.merged_fields.get("isUnscheduled") {
            Some(Value::Bool(explicit)) => *explicit,
            _ => name_looks_unscheduled(&entity.canonical_name),
        };
        aux.set_once(&entity.id, "isUnscheduled", json!(unscheduled))?;

        Ok(())
    }
}

// ============================================================================
// ENCOUNTER RECONCILER
// ============================================================================

pub struct EncounterReconciler {
    base: Reconciler,
}

impl EncounterReconciler {
    pub fn new() -> Self {
        EncounterReconciler {
            base: Reconciler::new(),
        }
    }

    pub fn with_threshold(match_threshold: f64) -> Self {
        EncounterReconciler {
            base: Reconciler::with_threshold(match_threshold),
        }
    }

    pub fn set_minter(&mut self, minter: IdMinter) {
        self.base.set_minter(minter);
    }

    pub fn contribute(&mut self, source: &str, items: Vec<RawFields>, priority: i32) {
        self.base.contribute(source, items, priority);
    }

    pub fn reconcile(&self) -> ReconcileOutcome {
        self.base.reconcile(&EncounterProfile)
    }
}

impl Default for EncounterReconciler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
