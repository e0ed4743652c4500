// 🔧 Reference Repair - rewrite old entity ids across the document
//
// Reconciliation collapses several contribution ids into one canonical id
// per entity. Every downstream structure that captured a pre-merge id
// (assignment cells, schedule instances, grouping membership lists) must
// be rewritten to the canonical id, and references that no longer resolve
// must be re-targeted to a fallback or dropped.
//
// Runs once, after all three reconcilers, in the fixed order
// epochs → encounters → activities: later repairs consult the id maps
// produced by earlier ones, so the order is not negotiable.

use crate::reconciler::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

// ============================================================================
// REPAIR COUNTS / REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairCounts {
    /// References rewritten old → new.
    pub remapped: usize,

    /// References that resolved to nothing and were dropped/nulled.
    pub dropped: usize,

    /// References re-targeted to the configured fallback entity.
    pub fallback: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairReport {
    pub epochs: RepairCounts,
    pub encounters: RepairCounts,
    pub activities: RepairCounts,
    pub repaired_at: DateTime<Utc>,
}

impl RepairReport {
    pub fn total_remapped(&self) -> usize {
        self.epochs.remapped + self.encounters.remapped + self.activities.remapped
    }

    pub fn total_dropped(&self) -> usize {
        self.epochs.dropped + self.encounters.dropped + self.activities.dropped
    }

    pub fn summary(&self) -> String {
        format!(
            "Reference repair: {} remapped, {} dropped, {} fallback (epochs {}/{}/{}, encounters {}/{}/{}, activities {}/{}/{})",
            self.total_remapped(),
            self.total_dropped(),
            self.epochs.fallback + self.encounters.fallback + self.activities.fallback,
            self.epochs.remapped,
            self.epochs.dropped,
            self.epochs.fallback,
            self.encounters.remapped,
            self.encounters.dropped,
            self.encounters.fallback,
            self.activities.remapped,
            self.activities.dropped,
            self.activities.fallback,
        )
    }
}

// ============================================================================
// REFERENCE REPAIR
// ============================================================================

#[derive(Debug, Clone, Default)]
struct KindConfig {
    map: HashMap<String, String>,
    valid_new_ids: HashSet<String>,
    fallback: Option<String>,
    configured: bool,
}

pub struct ReferenceRepair {
    epochs: KindConfig,
    encounters: KindConfig,
    activities: KindConfig,
}

impl ReferenceRepair {
    pub fn new() -> Self {
        ReferenceRepair {
            epochs: KindConfig::default(),
            encounters: KindConfig::default(),
            activities: KindConfig::default(),
        }
    }

    pub fn set_epoch_map(&mut self, map: HashMap<String, String>) {
        self.epochs = configured(map, self.epochs.fallback.take());
    }

    pub fn set_encounter_map(&mut self, map: HashMap<String, String>) {
        self.encounters = configured(map, self.encounters.fallback.take());
    }

    pub fn set_activity_map(&mut self, map: HashMap<String, String>) {
        self.activities = configured(map, self.activities.fallback.take());
    }

    /// Entity re-targeted to when a scalar reference resolves to nothing
    /// (e.g. the nearest surviving encounter). Without one, unresolvable
    /// scalar references are nulled.
    pub fn set_fallback(&mut self, kind: EntityKind, entity_id: &str) {
        self.config_mut(kind).fallback = Some(entity_id.to_string());
    }

    fn config_mut(&mut self, kind: EntityKind) -> &mut KindConfig {
        match kind {
            EntityKind::Epoch => &mut self.epochs,
            EntityKind::Encounter => &mut self.encounters,
            EntityKind::Activity => &mut self.activities,
        }
    }

    fn config(&self, kind: EntityKind) -> &KindConfig {
        match kind {
            EntityKind::Epoch => &self.epochs,
            EntityKind::Encounter => &self.encounters,
            EntityKind::Activity => &self.activities,
        }
    }

    /// Rewrite every epoch/encounter/activity reference in the document.
    /// Kinds whose id map was never set are left untouched.
    pub fn repair(&self, document: &mut Value) -> RepairReport {
        let mut report = RepairReport {
            epochs: RepairCounts::default(),
            encounters: RepairCounts::default(),
            activities: RepairCounts::default(),
            repaired_at: Utc::now(),
        };

        // Fixed order: epochs before encounters before activities
        for (kind, counts) in [
            (EntityKind::Epoch, &mut report.epochs),
            (EntityKind::Encounter, &mut report.encounters),
            (EntityKind::Activity, &mut report.activities),
        ] {
            let config = self.config(kind);
            if !config.configured {
                continue;
            }
            walk(document, kind, config, counts);
            debug!(
                kind = kind.as_str(),
                remapped = counts.remapped,
                dropped = counts.dropped,
                fallback = counts.fallback,
                "reference repair pass complete"
            );
        }

        report
    }
}

impl Default for ReferenceRepair {
    fn default() -> Self {
        Self::new()
    }
}

fn configured(map: HashMap<String, String>, fallback: Option<String>) -> KindConfig {
    let valid_new_ids = map.values().cloned().collect();
    KindConfig {
        map,
        valid_new_ids,
        fallback,
        configured: true,
    }
}

/// Reference-field key names per entity kind.
fn key_matches(kind: EntityKind, key: &str) -> Option<bool> {
    // Some(false) = scalar reference, Some(true) = array of references
    let (scalar, array) = match kind {
        EntityKind::Epoch => ("epochId", "epochIds"),
        EntityKind::Encounter => ("encounterId", "encounterIds"),
        EntityKind::Activity => ("activityId", "activityIds"),
    };
    if key == scalar {
        Some(false)
    } else if key == array {
        Some(true)
    } else {
        None
    }
}

fn walk(value: &mut Value, kind: EntityKind, config: &KindConfig, counts: &mut RepairCounts) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                match key_matches(kind, key) {
                    Some(false) => repair_scalar(child, config, counts),
                    Some(true) => repair_array(child, config, counts),
                    None => walk(child, kind, config, counts),
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                walk(item, kind, config, counts);
            }
        }
        _ => {}
    }
}

fn repair_scalar(value: &mut Value, config: &KindConfig, counts: &mut RepairCounts) {
    let Some(old) = value.as_str().map(str::to_string) else {
        return;
    };
    if let Some(new_id) = config.map.get(&old) {
        if *new_id != old {
            *value = Value::String(new_id.clone());
            counts.remapped += 1;
        }
    } else if config.valid_new_ids.contains(&old) {
        // Already canonical
    } else if let Some(fallback) = &config.fallback {
        warn!(reference = %old, fallback = %fallback, "re-targeting unresolvable reference");
        *value = Value::String(fallback.clone());
        counts.fallback += 1;
    } else {
        warn!(reference = %old, "dropping unresolvable reference");
        *value = Value::Null;
        counts.dropped += 1;
    }
}

fn repair_array(value: &mut Value, config: &KindConfig, counts: &mut RepairCounts) {
    let Some(items) = value.as_array() else {
        return;
    };

    let mut seen = HashSet::new();
    let mut repaired = Vec::with_capacity(items.len());
    for item in items {
        let Some(old) = item.as_str() else {
            repaired.push(item.clone());
            continue;
        };
        let resolved = if let Some(new_id) = config.map.get(old) {
            if new_id != old {
                counts.remapped += 1;
            }
            Some(new_id.clone())
        } else if config.valid_new_ids.contains(old) {
            Some(old.to_string())
        } else {
            warn!(reference = %old, "dropping unresolvable array reference");
            counts.dropped += 1;
            None
        };
        if let Some(id) = resolved {
            // Merged entities can leave the same canonical id twice
            if seen.insert(id.clone()) {
                repaired.push(Value::String(id));
            }
        }
    }
    *value = Value::Array(repaired);
}

// ============================================================================
// TESTS
// ============================================================================
