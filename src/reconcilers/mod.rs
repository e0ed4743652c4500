// Entity-specific reconcilers
//
// Thin wrappers over the base engine: each supplies a profile with
// type-specific enrichment (ordering, classification, timing extraction)
// and forwards contribute/reconcile.

pub mod activity;
pub mod encounter;
pub mod epoch;

pub use activity::{ActivityReconciler, ActivityType};
pub use encounter::EncounterReconciler;
pub use epoch::{EpochCategory, EpochReconciler};
