// 🧪 Activity Reconciler - classify activities, tag narrative-only ones
//
// Activities come primarily from the schedule-of-activities table, with a
// second, lower-priority stream of procedures inferred from narrative
// text. Both streams merge through the base engine; this wrapper infers
// each activity's purpose from its name and tags activities that were only
// seen in the narrative, so downstream consumers can tell "in the schedule
// table" from "inferred from procedure text".
//
// Footnote-condition and repetition metadata contributed by the execution
// model arrive as ordinary fields and merge additively through the base
// engine's fill-only rule; they never overwrite schedule-derived fields.

use crate::normalize::matching_key;
use crate::reconciler::{
    AuxTable, EntityContribution, EntityKind, EntityProfile, IdMinter, MatchGroup, RawFields,
    ReconcileOutcome, ReconciledEntity, Reconciler, ReconciliationError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Default name of the schedule-derived extraction pass.
pub const PRIMARY_ACTIVITY_SOURCE: &str = "soa";

// ============================================================================
// ACTIVITY TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    /// Specimen collection / lab panel
    Laboratory,

    /// Clinical procedure (ECG, biopsy, examination, dosing)
    Procedure,

    /// Patient-reported outcome / questionnaire
    Questionnaire,

    /// Imaging (MRI, CT, X-ray, ultrasound)
    Imaging,

    /// Anything else
    Other,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Laboratory => "laboratory",
            ActivityType::Procedure => "procedure",
            ActivityType::Questionnaire => "questionnaire",
            ActivityType::Imaging => "imaging",
            ActivityType::Other => "other",
        }
    }
}

/// Keyword table checked in order against the cleaned name; the first
/// matching keyword wins.
const TYPE_KEYWORDS: &[(ActivityType, &[&str])] = &[
    (
        ActivityType::Laboratory,
        &[
            "blood",
            "hematology",
            "haematology",
            "chemistry",
            "urinalysis",
            "serum",
            "plasma",
            "laboratory",
            "lipid",
            "glucose",
            "coagulation",
            "pregnancy test",
            "biomarker",
        ],
    ),
    (
        ActivityType::Questionnaire,
        &[
            "questionnaire",
            "diary",
            "qol",
            "eq-5d",
            "survey",
            "scale",
            "patient-reported",
            "patient reported",
        ],
    ),
    (
        ActivityType::Imaging,
        &[
            "mri",
            "x-ray",
            "xray",
            "ct scan",
            "ultrasound",
            "pet",
            "imaging",
            "echocardiogram",
            "dexa",
        ],
    ),
    (
        ActivityType::Procedure,
        &[
            "ecg",
            "ekg",
            "biopsy",
            "examination",
            "exam",
            "vital sign",
            "physical",
            "dosing",
            "administration",
            "randomization",
            "randomisation",
            "infusion",
        ],
    ),
];

pub(crate) fn classify_activity(clean_name: &str) -> ActivityType {
    let key = matching_key(clean_name);
    for (activity_type, keywords) in TYPE_KEYWORDS {
        if keywords.iter().any(|kw| key.contains(kw)) {
            return *activity_type;
        }
    }
    ActivityType::Other
}

// ============================================================================
// ACTIVITY PROFILE
// ============================================================================

struct ActivityProfile {
    primary_source: String,
}

impl EntityProfile for ActivityProfile {
    fn kind(&self) -> EntityKind {
        EntityKind::Activity
    }

    fn enrich(
        &self,
        entity: &mut ReconciledEntity,
        _group: &MatchGroup,
        _contributions: &[EntityContribution],
        aux: &mut AuxTable,
    ) -> Result<(), ReconciliationError> {
        let activity_type = classify_activity(&entity.canonical_name);
        aux.set_once(&entity.id, "activityType", json!(activity_type.as_str()))?;

        if !entity
            .contributing_sources
            .iter()
            .any(|s| s == &self.primary_source)
        {
            aux.set_once(&entity.id, "narrativeOnly", json!(true))?;
        }
        Ok(())
    }
}

// ============================================================================
// ACTIVITY RECONCILER
// ============================================================================

pub struct ActivityReconciler {
    base: Reconciler,
    primary_source: String,
}

impl ActivityReconciler {
    pub fn new() -> Self {
        ActivityReconciler {
            base: Reconciler::new(),
            primary_source: PRIMARY_ACTIVITY_SOURCE.to_string(),
        }
    }

    pub fn with_threshold(match_threshold: f64) -> Self {
        ActivityReconciler {
            base: Reconciler::with_threshold(match_threshold),
            ..Self::new()
        }
    }

    /// Name of the schedule-derived source; activities never fed by it are
    /// tagged `narrativeOnly`.
    pub fn set_primary_source(&mut self, source: &str) {
        self.primary_source = source.to_string();
    }

    pub fn set_minter(&mut self, minter: IdMinter) {
        self.base.set_minter(minter);
    }

    pub fn contribute(&mut self, source: &str, items: Vec<RawFields>, priority: i32) {
        self.base.contribute(source, items, priority);
    }

    pub fn reconcile(&self) -> ReconcileOutcome {
        let profile = ActivityProfile {
            primary_source: self.primary_source.clone(),
        };
        self.base.reconcile(&profile)
    }
}

impl Default for ActivityReconciler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
