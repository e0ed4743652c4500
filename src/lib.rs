// Study Entity Reconciliation - Core Library
// Multi-source reconciliation of study epochs, encounters, and activities,
// plus referential integrity checking over the assembled study document.

pub mod normalize;
pub mod similarity;
pub mod reconciler;
pub mod reconcilers;
pub mod repair;
pub mod integrity;

// Re-export commonly used types
pub use normalize::{
    matching_key, normalize_name, validate_footnote_refs, FootnoteRefStatus, NormalizedName,
};
pub use similarity::{similarity, DEFAULT_MATCH_THRESHOLD};
pub use reconciler::{
    AuxTable, EntityContribution, EntityKind, EntityProfile, IdMinter, MatchGroup, RawFields,
    ReconcileOutcome, ReconciledEntity, Reconciler, ReconciliationError,
};
pub use reconcilers::{
    ActivityReconciler, ActivityType, EncounterReconciler, EpochCategory, EpochReconciler,
};
pub use repair::{ReferenceRepair, RepairCounts, RepairReport};
pub use integrity::{
    default_reference_rules, IntegrityChecker, IntegrityFinding, IntegrityReport,
    IntegritySummary, ReferenceRule, Severity,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
