// ✅ Integrity Checker - three-layer validation of the assembled document
//
// Runs against the final reconciled study document and produces a flat
// list of findings. Three independent layers:
//   Layer 1 - reference resolution, driven by a declarative rule table
//   Layer 2 - orphan detection over every *Id/*Ids key in the document
//   Layer 3 - a fixed battery of cross-entity semantic rules
//
// Findings are data about the document, never exceptions: the checker
// navigates defensively and reports whatever it managed to compute. A
// malformed rule table, by contrast, is a programming error and fails
// loudly at construction time.

use crate::reconciler::RawFields;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

// ============================================================================
// SEVERITY / FINDING / REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Blocks downstream acceptance.
    Error,
    /// Questionable but usable.
    Warning,
    /// Informational only.
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityFinding {
    /// Stable rule id, e.g. "dangling_reference".
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub entity_type: String,
    pub entity_ids: Vec<String>,
    /// Rule-specific context.
    pub details: RawFields,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegritySummary {
    pub total_findings: usize,
    pub errors: usize,
    pub warnings: usize,
    pub info: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub summary: IntegritySummary,
    pub findings: Vec<IntegrityFinding>,
    pub checked_at: DateTime<Utc>,
}

impl IntegrityReport {
    /// The single authoritative signal for "is this document usable":
    /// ERROR findings block acceptance, WARNING/INFO do not.
    pub fn is_acceptable(&self) -> bool {
        self.summary.errors == 0
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} findings ({} errors, {} warnings, {} info)",
            self.summary.total_findings,
            self.summary.errors,
            self.summary.warnings,
            self.summary.info
        )
    }
}

fn build_report(findings: Vec<IntegrityFinding>) -> IntegrityReport {
    let mut summary = IntegritySummary {
        total_findings: findings.len(),
        ..Default::default()
    };
    for finding in &findings {
        match finding.severity {
            Severity::Error => summary.errors += 1,
            Severity::Warning => summary.warnings += 1,
            Severity::Info => summary.info += 1,
        }
    }
    IntegrityReport {
        summary,
        findings,
        checked_at: Utc::now(),
    }
}

// ============================================================================
// REFERENCE RULE TABLE (Layer 1)
// ============================================================================

/// One known reference relationship in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRule {
    /// Path to the collection holding the referencing entities.
    pub source_path: String,

    /// Field on each source entity holding the reference.
    pub reference_field: String,

    /// Path to the collection the reference must resolve into.
    pub target_path: String,

    /// Entity type name used in findings.
    pub target_type: String,

    /// Whether the reference field holds a list of ids.
    pub is_array: bool,
}

impl ReferenceRule {
    pub fn new(
        source_path: &str,
        reference_field: &str,
        target_path: &str,
        target_type: &str,
        is_array: bool,
    ) -> Self {
        ReferenceRule {
            source_path: source_path.to_string(),
            reference_field: reference_field.to_string(),
            target_path: target_path.to_string(),
            target_type: target_type.to_string(),
            is_array,
        }
    }
}

/// The static rule table covering every known reference relationship in a
/// USDM-shaped study design document.
pub fn default_reference_rules() -> Vec<ReferenceRule> {
    const CELLS: &str = "studyDesigns[].studyCells";
    const EPOCHS: &str = "studyDesigns[].epochs";
    const ENCOUNTERS: &str = "studyDesigns[].encounters";
    const ACTIVITIES: &str = "studyDesigns[].activities";
    const ELEMENTS: &str = "studyDesigns[].elements";
    const INSTANCES: &str = "studyDesigns[].scheduleTimelines[].instances";
    const TIMELINES: &str = "studyDesigns[].scheduleTimelines";
    const EXITS: &str = "studyDesigns[].scheduleTimelines[].exits";
    const ESTIMANDS: &str = "studyDesigns[].estimands";
    const ENDPOINTS: &str = "studyDesigns[].objectives[].endpoints";

    vec![
        // Assignment matrix
        ReferenceRule::new(CELLS, "armId", "studyDesigns[].arms", "StudyArm", false),
        ReferenceRule::new(CELLS, "epochId", EPOCHS, "StudyEpoch", false),
        ReferenceRule::new(CELLS, "elementIds", ELEMENTS, "StudyElement", true),
        // Schedule instances
        ReferenceRule::new(INSTANCES, "encounterId", ENCOUNTERS, "Encounter", false),
        ReferenceRule::new(INSTANCES, "epochId", EPOCHS, "StudyEpoch", false),
        ReferenceRule::new(INSTANCES, "activityIds", ACTIVITIES, "Activity", true),
        ReferenceRule::new(INSTANCES, "timelineExitId", EXITS, "ScheduleTimelineExit", false),
        ReferenceRule::new(ACTIVITIES, "timelineId", TIMELINES, "ScheduleTimeline", false),
        // Estimands
        ReferenceRule::new(
            ESTIMANDS,
            "analysisPopulationId",
            "studyDesigns[].analysisPopulations",
            "AnalysisPopulation",
            false,
        ),
        ReferenceRule::new(
            ESTIMANDS,
            "interventionIds",
            "studyDesigns[].studyInterventions",
            "StudyIntervention",
            true,
        ),
        ReferenceRule::new(ESTIMANDS, "variableOfInterestId", ENDPOINTS, "Endpoint", false),
        // Chain pointers
        ReferenceRule::new(EPOCHS, "nextId", EPOCHS, "StudyEpoch", false),
        ReferenceRule::new(EPOCHS, "previousId", EPOCHS, "StudyEpoch", false),
        ReferenceRule::new(ENCOUNTERS, "nextId", ENCOUNTERS, "Encounter", false),
        ReferenceRule::new(ENCOUNTERS, "previousId", ENCOUNTERS, "Encounter", false),
        ReferenceRule::new(ACTIVITIES, "nextId", ACTIVITIES, "Activity", false),
        ReferenceRule::new(ACTIVITIES, "previousId", ACTIVITIES, "Activity", false),
        ReferenceRule::new(ELEMENTS, "nextId", ELEMENTS, "StudyElement", false),
        ReferenceRule::new(ELEMENTS, "previousId", ELEMENTS, "StudyElement", false),
    ]
}

/// Collections that should always be pointed at by something (Layer 2).
const ORPHAN_COLLECTIONS: &[(&str, &str)] = &[
    ("studyDesigns[].arms", "StudyArm"),
    ("studyDesigns[].epochs", "StudyEpoch"),
    ("studyDesigns[].elements", "StudyElement"),
    ("studyDesigns[].activities", "Activity"),
    ("studyDesigns[].encounters", "Encounter"),
    ("studyDesigns[].activities[].definedProcedures", "Procedure"),
];

/// Collections scanned for cross-document duplicate ids (Layer 3).
const ID_COLLECTIONS: &[(&str, &str)] = &[
    ("studyDesigns[].arms", "StudyArm"),
    ("studyDesigns[].epochs", "StudyEpoch"),
    ("studyDesigns[].elements", "StudyElement"),
    ("studyDesigns[].activities", "Activity"),
    ("studyDesigns[].encounters", "Encounter"),
    ("studyDesigns[].activities[].definedProcedures", "Procedure"),
    ("studyDesigns[].studyCells", "StudyCell"),
    ("studyDesigns[].estimands", "Estimand"),
    ("studyDesigns[].analysisPopulations", "AnalysisPopulation"),
    ("studyDesigns[].studyInterventions", "StudyIntervention"),
    ("studyDesigns[].scheduleTimelines", "ScheduleTimeline"),
    ("studyDesigns[].scheduleTimelines[].instances", "ScheduledActivityInstance"),
    ("studyDesigns[].objectives", "Objective"),
    ("studyDesigns[].objectives[].endpoints", "Endpoint"),
];

/// Epochs matching a terminal name pattern are exempt from the
/// "appears in at least one cell" rule.
static TERMINAL_EPOCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(end\s*of\s*(study|trial)|early\s*term|discontinu|follow[\s-]*up|\beos\b|\beot\b)")
        .unwrap()
});

// ============================================================================
// PATH NAVIGATION
// ============================================================================

/// Collect the collection values (arrays) at a dot-separated path; a `[]`
/// suffix on a segment iterates the array at that point. Returns an empty
/// vec when the path does not exist in the document.
fn collect_collections<'a>(document: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut nodes = vec![document];
    for segment in path.split('.') {
        let (name, iterate) = match segment.strip_suffix("[]") {
            Some(stripped) => (stripped, true),
            None => (segment, false),
        };
        let mut next = Vec::new();
        for node in nodes {
            if let Some(child) = node.get(name) {
                if iterate {
                    if let Some(items) = child.as_array() {
                        next.extend(items.iter());
                    }
                } else {
                    next.push(child);
                }
            }
        }
        nodes = next;
    }
    nodes
}

/// Flatten the entities of all collections at a path.
fn collect_entities<'a>(document: &'a Value, path: &str) -> Vec<&'a Value> {
    collect_collections(document, path)
        .into_iter()
        .flat_map(|collection| match collection {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .collect()
}

fn entity_id(entity: &Value) -> Option<&str> {
    entity.get("id").and_then(Value::as_str)
}

fn entity_ids_at<'a>(document: &'a Value, path: &str) -> HashSet<&'a str> {
    collect_entities(document, path)
        .into_iter()
        .filter_map(entity_id)
        .collect()
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        bail!("empty collection path");
    }
    for segment in path.split('.') {
        let name = segment.strip_suffix("[]").unwrap_or(segment);
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("invalid path segment '{}' in '{}'", segment, path);
        }
    }
    Ok(())
}

// ============================================================================
// INTEGRITY CHECKER
// ============================================================================

pub struct IntegrityChecker {
    rules: Vec<ReferenceRule>,
}

impl IntegrityChecker {
    /// Construct with an explicit rule table. A nonsensical rule is a
    /// programming error and fails here, not at document-processing time.
    pub fn new(rules: Vec<ReferenceRule>) -> Result<Self> {
        for rule in &rules {
            validate_path(&rule.source_path)?;
            validate_path(&rule.target_path)?;
            if rule.reference_field.is_empty() {
                bail!(
                    "reference rule {} -> {} has an empty reference field",
                    rule.source_path,
                    rule.target_path
                );
            }
        }
        Ok(IntegrityChecker { rules })
    }

    /// Checker with the built-in USDM-shaped rule table.
    pub fn with_default_rules() -> Self {
        IntegrityChecker {
            rules: default_reference_rules(),
        }
    }

    /// Run all three layers and produce the report. Pure; the document is
    /// never mutated. Layers are independent: findings from one layer are
    /// reported even when another layer finds nothing to navigate.
    pub fn check_integrity(&self, document: &Value) -> IntegrityReport {
        let mut findings = self.check_references(document);
        findings.extend(self.check_orphans(document));
        findings.extend(self.check_semantics(document));
        build_report(findings)
    }

    // ------------------------------------------------------------------
    // Layer 1: reference resolution
    // ------------------------------------------------------------------

    fn check_references(&self, document: &Value) -> Vec<IntegrityFinding> {
        let mut findings = Vec::new();

        for rule in &self.rules {
            let targets = collect_collections(document, &rule.target_path);
            if targets.is_empty() {
                // Target collection entirely absent: an upstream modeling
                // choice, not an integrity defect.
                continue;
            }
            let valid_ids = entity_ids_at(document, &rule.target_path);

            for entity in collect_entities(document, &rule.source_path) {
                let Some(reference) = entity.get(&rule.reference_field) else {
                    continue;
                };
                let values: Vec<&str> = if rule.is_array {
                    reference
                        .as_array()
                        .map(|items| items.iter().filter_map(Value::as_str).collect())
                        .unwrap_or_default()
                } else {
                    reference.as_str().into_iter().collect()
                };

                for value in values {
                    if !valid_ids.contains(value) {
                        findings.push(IntegrityFinding {
                            rule: "dangling_reference".to_string(),
                            severity: Severity::Error,
                            message: format!(
                                "{}.{} = '{}' does not resolve to any {}",
                                rule.source_path, rule.reference_field, value, rule.target_type
                            ),
                            entity_type: rule.target_type.clone(),
                            entity_ids: entity_id(entity)
                                .map(|id| vec![id.to_string()])
                                .unwrap_or_default(),
                            details: details(&[
                                ("field", json!(rule.reference_field)),
                                ("value", json!(value)),
                                ("sourcePath", json!(rule.source_path)),
                                ("targetPath", json!(rule.target_path)),
                            ]),
                        });
                    }
                }
            }
        }

        findings
    }

    // ------------------------------------------------------------------
    // Layer 2: orphan detection
    // ------------------------------------------------------------------

    fn check_orphans(&self, document: &Value) -> Vec<IntegrityFinding> {
        let mut referenced = HashSet::new();
        collect_referenced_ids(document, &mut referenced);

        let mut findings = Vec::new();
        for (path, entity_type) in ORPHAN_COLLECTIONS {
            for entity in collect_entities(document, path) {
                let Some(id) = entity_id(entity) else {
                    continue;
                };
                if referenced.contains(id) || orphan_exempt(entity) {
                    continue;
                }
                findings.push(IntegrityFinding {
                    rule: "orphan_entity".to_string(),
                    severity: Severity::Warning,
                    message: format!(
                        "{} '{}' is never referenced by any other entity",
                        entity_type, id
                    ),
                    entity_type: entity_type.to_string(),
                    entity_ids: vec![id.to_string()],
                    details: details(&[("collection", json!(path))]),
                });
            }
        }
        findings
    }

    // ------------------------------------------------------------------
    // Layer 3: semantic rules
    // ------------------------------------------------------------------

    fn check_semantics(&self, document: &Value) -> Vec<IntegrityFinding> {
        let mut findings = Vec::new();
        findings.extend(check_cell_coverage(document));
        findings.extend(check_estimand_references(document));
        findings.extend(check_duplicate_ids(document));
        findings.extend(check_required_arrays(document));
        findings.extend(check_statistical_method_endpoints(document));
        findings
    }
}

fn details(pairs: &[(&str, Value)]) -> RawFields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn collect_referenced_ids(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key != "id" && key.ends_with("Id") {
                    if let Some(s) = child.as_str() {
                        out.insert(s.to_string());
                    }
                } else if key.ends_with("Ids") {
                    if let Some(items) = child.as_array() {
                        for item in items {
                            if let Some(s) = item.as_str() {
                                out.insert(s.to_string());
                            }
                        }
                    }
                }
                collect_referenced_ids(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_referenced_ids(item, out);
            }
        }
        _ => {}
    }
}

/// Documented exemptions from the orphan rule: the entity carries its own
/// chain pointers, or a provenance tag proving it came from the primary
/// extraction pass.
fn orphan_exempt(entity: &Value) -> bool {
    for pointer in ["nextId", "previousId"] {
        if entity.get(pointer).map(|v| !v.is_null()).unwrap_or(false) {
            return true;
        }
    }
    let primary = entity
        .get("primaryExtraction")
        .or_else(|| {
            entity
                .get("extensionAttributes")
                .and_then(|ext| ext.get("primaryExtraction"))
        })
        .and_then(Value::as_bool)
        .unwrap_or(false);
    primary
}

fn check_cell_coverage(document: &Value) -> Vec<IntegrityFinding> {
    let cells = collect_collections(document, "studyDesigns[].studyCells");
    if cells.is_empty() {
        return Vec::new();
    }
    let cell_entities = collect_entities(document, "studyDesigns[].studyCells");
    let arm_refs: HashSet<&str> = cell_entities
        .iter()
        .filter_map(|c| c.get("armId").and_then(Value::as_str))
        .collect();
    let epoch_refs: HashSet<&str> = cell_entities
        .iter()
        .filter_map(|c| c.get("epochId").and_then(Value::as_str))
        .collect();

    let mut findings = Vec::new();
    for entity in collect_entities(document, "studyDesigns[].arms") {
        if let Some(id) = entity_id(entity) {
            if !arm_refs.contains(id) {
                findings.push(IntegrityFinding {
                    rule: "arm_not_in_cell".to_string(),
                    severity: Severity::Warning,
                    message: format!("StudyArm '{}' appears in no assignment cell", id),
                    entity_type: "StudyArm".to_string(),
                    entity_ids: vec![id.to_string()],
                    details: RawFields::new(),
                });
            }
        }
    }
    for entity in collect_entities(document, "studyDesigns[].epochs") {
        let Some(id) = entity_id(entity) else { continue };
        if epoch_refs.contains(id) {
            continue;
        }
        let name = entity.get("name").and_then(Value::as_str).unwrap_or("");
        if TERMINAL_EPOCH_RE.is_match(name) {
            continue;
        }
        findings.push(IntegrityFinding {
            rule: "epoch_not_in_cell".to_string(),
            severity: Severity::Warning,
            message: format!("StudyEpoch '{}' appears in no assignment cell", id),
            entity_type: "StudyEpoch".to_string(),
            entity_ids: vec![id.to_string()],
            details: details(&[("name", json!(name))]),
        });
    }
    findings
}

fn check_estimand_references(document: &Value) -> Vec<IntegrityFinding> {
    let estimands = collect_entities(document, "studyDesigns[].estimands");
    if estimands.is_empty() {
        return Vec::new();
    }

    let populations = entity_ids_at(document, "studyDesigns[].analysisPopulations");
    let interventions = entity_ids_at(document, "studyDesigns[].studyInterventions");
    let endpoints = entity_ids_at(document, "studyDesigns[].objectives[].endpoints");

    let mut findings = Vec::new();
    let mut push = |estimand: &Value, field: &str, value: &str, target: &str| {
        findings.push(IntegrityFinding {
            rule: "unresolved_estimand_ref".to_string(),
            severity: Severity::Error,
            message: format!(
                "Estimand {} '{}' does not resolve to any {}",
                field, value, target
            ),
            entity_type: "Estimand".to_string(),
            entity_ids: entity_id(estimand)
                .map(|id| vec![id.to_string()])
                .unwrap_or_default(),
            details: details(&[("field", json!(field)), ("value", json!(value))]),
        });
    };

    for estimand in estimands {
        if let Some(value) = estimand.get("analysisPopulationId").and_then(Value::as_str) {
            if !populations.contains(value) {
                push(estimand, "analysisPopulationId", value, "AnalysisPopulation");
            }
        }
        if let Some(items) = estimand.get("interventionIds").and_then(Value::as_array) {
            for value in items.iter().filter_map(Value::as_str) {
                if !interventions.contains(value) {
                    push(estimand, "interventionIds", value, "StudyIntervention");
                }
            }
        }
        if let Some(value) = estimand.get("variableOfInterestId").and_then(Value::as_str) {
            if !endpoints.contains(value) {
                push(estimand, "variableOfInterestId", value, "Endpoint");
            }
        }
    }
    findings
}

fn check_duplicate_ids(document: &Value) -> Vec<IntegrityFinding> {
    let mut occurrences: HashMap<String, Vec<&str>> = HashMap::new();
    for (path, entity_type) in ID_COLLECTIONS {
        for entity in collect_entities(document, path) {
            if let Some(id) = entity_id(entity) {
                occurrences.entry(id.to_string()).or_default().push(*entity_type);
            }
        }
    }

    let mut duplicated: Vec<(String, Vec<&str>)> = occurrences
        .into_iter()
        .filter(|(_, collections)| collections.len() > 1)
        .collect();
    // Deterministic finding order
    duplicated.sort_by(|a, b| a.0.cmp(&b.0));

    duplicated
        .into_iter()
        .map(|(id, collections)| IntegrityFinding {
            rule: "duplicate_id".to_string(),
            severity: Severity::Error,
            message: format!(
                "id '{}' is used by {} entities across: {}",
                id,
                collections.len(),
                collections.join(", ")
            ),
            entity_type: collections[0].to_string(),
            entity_ids: vec![id],
            details: details(&[("collections", json!(collections))]),
        })
        .collect()
}

fn check_required_arrays(document: &Value) -> Vec<IntegrityFinding> {
    let mut findings = Vec::new();

    for cell in collect_entities(document, "studyDesigns[].studyCells") {
        if let Some(items) = cell.get("elementIds").and_then(Value::as_array) {
            if items.is_empty() {
                findings.push(IntegrityFinding {
                    rule: "empty_required_array".to_string(),
                    severity: Severity::Warning,
                    message: "StudyCell has an empty elementIds array".to_string(),
                    entity_type: "StudyCell".to_string(),
                    entity_ids: entity_id(cell)
                        .map(|id| vec![id.to_string()])
                        .unwrap_or_default(),
                    details: details(&[("field", json!("elementIds"))]),
                });
            }
        }
    }

    for timeline in collect_entities(document, "studyDesigns[].scheduleTimelines") {
        if let Some(items) = timeline.get("instances").and_then(Value::as_array) {
            if items.is_empty() {
                findings.push(IntegrityFinding {
                    rule: "empty_required_array".to_string(),
                    severity: Severity::Warning,
                    message: "ScheduleTimeline has no instances".to_string(),
                    entity_type: "ScheduleTimeline".to_string(),
                    entity_ids: entity_id(timeline)
                        .map(|id| vec![id.to_string()])
                        .unwrap_or_default(),
                    details: details(&[("field", json!("instances"))]),
                });
            }
        }
    }

    findings
}

fn check_statistical_method_endpoints(document: &Value) -> Vec<IntegrityFinding> {
    let methods = collect_entities(document, "studyDesigns[].statisticalMethods");
    if methods.is_empty() {
        return Vec::new();
    }

    let endpoint_names: HashSet<&str> =
        collect_entities(document, "studyDesigns[].objectives[].endpoints")
            .into_iter()
            .filter_map(|e| e.get("name").and_then(Value::as_str))
            .collect();

    let mut findings = Vec::new();
    for method in methods {
        let endpoint_name = method
            .get("extensionAttributes")
            .and_then(|ext| ext.get("endpointName"))
            .or_else(|| method.get("endpointName"))
            .and_then(Value::as_str);
        if let Some(name) = endpoint_name {
            if !endpoint_names.contains(name) {
                findings.push(IntegrityFinding {
                    rule: "unknown_endpoint_reference".to_string(),
                    severity: Severity::Warning,
                    message: format!(
                        "Statistical method references unknown endpoint '{}'",
                        name
                    ),
                    entity_type: "StatisticalMethod".to_string(),
                    entity_ids: entity_id(method)
                        .map(|id| vec![id.to_string()])
                        .unwrap_or_default(),
                    details: details(&[("endpointName", json!(name))]),
                });
            }
        }
    }
    findings
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checker() -> IntegrityChecker {
        IntegrityChecker::with_default_rules()
    }

    fn rules_fired(report: &IntegrityReport, rule: &str) -> Vec<IntegrityFinding> {
        report
            .findings
            .iter()
            .filter(|f| f.rule == rule)
            .cloned()
            .collect()
    }

    #[test]
    fn test_rule_table_validation_rejects_bad_path() {
        let rules = vec![ReferenceRule::new(
            "studyDesigns[].cells",
            "epochId",
            "bad path!",
            "StudyEpoch",
            false,
        )];
        assert!(IntegrityChecker::new(rules).is_err());

        let rules = vec![ReferenceRule::new(
            "studyDesigns[].cells",
            "",
            "studyDesigns[].epochs",
            "StudyEpoch",
            false,
        )];
        assert!(IntegrityChecker::new(rules).is_err());
    }

    #[test]
    fn test_default_rules_pass_validation() {
        assert!(IntegrityChecker::new(default_reference_rules()).is_ok());
    }

    #[test]
    fn test_clean_document_is_acceptable() {
        let document = json!({
            "studyDesigns": [{
                "arms": [{"id": "arm1", "name": "Placebo"}],
                "epochs": [{"id": "ep1", "name": "Treatment"}],
                "elements": [{"id": "el1", "name": "Dose"}],
                "studyCells": [
                    {"id": "cell1", "armId": "arm1", "epochId": "ep1", "elementIds": ["el1"]}
                ]
            }]
        });

        let report = checker().check_integrity(&document);
        assert!(report.is_acceptable(), "{:?}", report.findings);
        assert_eq!(report.summary.errors, 0);
    }

    #[test]
    fn test_dangling_reference_error() {
        let document = json!({
            "studyDesigns": [{
                "arms": [{"id": "arm1", "name": "Placebo"}],
                "epochs": [{"id": "ep1", "name": "Treatment"}],
                "studyCells": [
                    {"id": "cell1", "armId": "arm1", "epochId": "ep_missing"}
                ]
            }]
        });

        let report = checker().check_integrity(&document);
        let dangling = rules_fired(&report, "dangling_reference");
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].severity, Severity::Error);
        assert_eq!(dangling[0].entity_type, "StudyEpoch");
        assert_eq!(dangling[0].entity_ids, vec!["cell1"]);
        assert_eq!(dangling[0].details["value"], json!("ep_missing"));
        assert!(!report.is_acceptable());
    }

    #[test]
    fn test_absent_target_collection_skips_rule() {
        // No epochs collection at all: modeling choice, not a defect
        let document = json!({
            "studyDesigns": [{
                "arms": [{"id": "arm1"}],
                "studyCells": [{"id": "cell1", "armId": "arm1", "epochId": "ep1"}]
            }]
        });

        let report = checker().check_integrity(&document);
        assert!(rules_fired(&report, "dangling_reference").is_empty());
    }

    #[test]
    fn test_array_reference_rule() {
        let document = json!({
            "studyDesigns": [{
                "encounters": [{"id": "enc1", "name": "Day 1"}],
                "activities": [{"id": "act1", "name": "Vitals"}],
                "scheduleTimelines": [{
                    "id": "tl1",
                    "instances": [
                        {"id": "sai1", "encounterId": "enc1", "activityIds": ["act1", "act_gone"]}
                    ]
                }]
            }]
        });

        let report = checker().check_integrity(&document);
        let dangling = rules_fired(&report, "dangling_reference");
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].details["value"], json!("act_gone"));
    }

    #[test]
    fn test_orphan_entity_warning() {
        let document = json!({
            "studyDesigns": [{
                "epochs": [{"id": "ep1", "name": "Treatment"}],
                "encounters": [{"id": "enc_unused", "name": "Day 1"}],
                "studyCells": [{"id": "cell1", "epochId": "ep1"}]
            }]
        });

        let report = checker().check_integrity(&document);
        let orphans = rules_fired(&report, "orphan_entity");
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].entity_ids, vec!["enc_unused"]);
        assert_eq!(orphans[0].severity, Severity::Warning);
        // Warnings do not block acceptance
        assert!(report.is_acceptable());
    }

    #[test]
    fn test_orphan_exemption_chain_pointers() {
        let document = json!({
            "studyDesigns": [{
                "encounters": [
                    {"id": "enc1", "name": "Day 1", "nextId": "enc2"},
                    {"id": "enc2", "name": "Day 8"}
                ]
            }]
        });

        let report = checker().check_integrity(&document);
        // enc1 carries chain pointers (exempt); enc2 is referenced by them
        assert!(rules_fired(&report, "orphan_entity").is_empty());
    }

    #[test]
    fn test_orphan_exemption_provenance_tag() {
        let document = json!({
            "studyDesigns": [{
                "activities": [
                    {"id": "act1", "name": "Vitals",
                     "extensionAttributes": {"primaryExtraction": true}}
                ]
            }]
        });

        let report = checker().check_integrity(&document);
        assert!(rules_fired(&report, "orphan_entity").is_empty());
    }

    #[test]
    fn test_scenario_d_single_epoch_no_chain_no_orphan() {
        let document = json!({
            "studyDesigns": [{
                "arms": [{"id": "arm1"}],
                "epochs": [{"id": "ep1", "name": "Treatment"}],
                "studyCells": [{"id": "cell1", "armId": "arm1", "epochId": "ep1"}]
            }]
        });

        let report = checker().check_integrity(&document);
        assert!(rules_fired(&report, "dangling_reference").is_empty());
        let orphan_epochs: Vec<_> = rules_fired(&report, "orphan_entity")
            .into_iter()
            .filter(|f| f.entity_ids == vec!["ep1".to_string()])
            .collect();
        assert!(orphan_epochs.is_empty());
    }

    #[test]
    fn test_duplicate_id_exactly_one_finding() {
        let document = json!({
            "studyDesigns": [{
                "epochs": [{"id": "shared", "name": "Treatment"}],
                "encounters": [{"id": "shared", "name": "Day 1"}],
                "studyCells": [{"id": "cell1", "epochId": "shared"}]
            }]
        });

        let report = checker().check_integrity(&document);
        let duplicates = rules_fired(&report, "duplicate_id");
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].severity, Severity::Error);
        assert_eq!(duplicates[0].entity_ids, vec!["shared"]);
        assert_eq!(
            duplicates[0].details["collections"],
            json!(["StudyEpoch", "Encounter"])
        );
    }

    #[test]
    fn test_epoch_not_in_cell_terminal_exempt() {
        let document = json!({
            "studyDesigns": [{
                "arms": [{"id": "arm1"}],
                "epochs": [
                    {"id": "ep1", "name": "Treatment"},
                    {"id": "ep2", "name": "Washout"},
                    {"id": "ep3", "name": "End of Study"}
                ],
                "studyCells": [{"id": "cell1", "armId": "arm1", "epochId": "ep1"}]
            }]
        });

        let report = checker().check_integrity(&document);
        let uncovered = rules_fired(&report, "epoch_not_in_cell");
        // ep2 flagged; ep3 exempt via terminal name pattern
        assert_eq!(uncovered.len(), 1);
        assert_eq!(uncovered[0].entity_ids, vec!["ep2"]);
    }

    #[test]
    fn test_arm_not_in_cell() {
        let document = json!({
            "studyDesigns": [{
                "arms": [{"id": "arm1"}, {"id": "arm2"}],
                "epochs": [{"id": "ep1", "name": "Treatment"}],
                "studyCells": [{"id": "cell1", "armId": "arm1", "epochId": "ep1"}]
            }]
        });

        let report = checker().check_integrity(&document);
        let uncovered = rules_fired(&report, "arm_not_in_cell");
        assert_eq!(uncovered.len(), 1);
        assert_eq!(uncovered[0].entity_ids, vec!["arm2"]);
    }

    #[test]
    fn test_unresolved_estimand_reference() {
        let document = json!({
            "studyDesigns": [{
                "analysisPopulations": [{"id": "pop1"}],
                "studyInterventions": [{"id": "int1"}],
                "objectives": [{"id": "obj1", "endpoints": [{"id": "endp1", "name": "ORR"}]}],
                "estimands": [{
                    "id": "est1",
                    "analysisPopulationId": "pop_missing",
                    "interventionIds": ["int1"],
                    "variableOfInterestId": "endp1"
                }]
            }]
        });

        let report = checker().check_integrity(&document);
        let unresolved = rules_fired(&report, "unresolved_estimand_ref");
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].details["field"], json!("analysisPopulationId"));
    }

    #[test]
    fn test_empty_required_arrays() {
        let document = json!({
            "studyDesigns": [{
                "studyCells": [{"id": "cell1", "elementIds": []}],
                "scheduleTimelines": [{"id": "tl1", "instances": []}]
            }]
        });

        let report = checker().check_integrity(&document);
        let empties = rules_fired(&report, "empty_required_array");
        assert_eq!(empties.len(), 2);
    }

    #[test]
    fn test_statistical_method_endpoint_cross_reference() {
        let document = json!({
            "studyDesigns": [{
                "objectives": [{"id": "obj1", "endpoints": [{"id": "endp1", "name": "ORR"}]}],
                "statisticalMethods": [
                    {"id": "sm1", "extensionAttributes": {"endpointName": "ORR"}},
                    {"id": "sm2", "extensionAttributes": {"endpointName": "PFS"}}
                ]
            }]
        });

        let report = checker().check_integrity(&document);
        let unknown = rules_fired(&report, "unknown_endpoint_reference");
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].entity_ids, vec!["sm2"]);
    }

    #[test]
    fn test_malformed_document_yields_partial_report() {
        // Collections holding scalars instead of arrays must not panic
        let document = json!({
            "studyDesigns": [{
                "epochs": "not-an-array",
                "encounters": [{"id": "enc_unused", "name": "Day 1"}],
                "studyCells": 42
            }]
        });

        let report = checker().check_integrity(&document);
        // Layer 2 still reports the orphan even though other shapes broke
        assert_eq!(rules_fired(&report, "orphan_entity").len(), 1);
    }

    #[test]
    fn test_report_serialization_shape() {
        let document = json!({
            "studyDesigns": [{
                "epochs": [{"id": "ep1", "name": "Treatment"}],
                "studyCells": [{"id": "cell1", "epochId": "ep_missing"}]
            }]
        });

        let report = checker().check_integrity(&document);
        let serialized = serde_json::to_value(&report).unwrap();
        assert!(serialized["summary"]["totalFindings"].as_u64().unwrap() >= 1);
        assert!(serialized["summary"]["errors"].as_u64().unwrap() >= 1);
        assert_eq!(
            serialized["findings"][0]["severity"],
            json!("ERROR")
        );
    }

    #[test]
    fn test_full_pipeline_reconcile_repair_check() {
        use crate::reconcilers::{ActivityReconciler, EncounterReconciler, EpochReconciler};
        use crate::repair::ReferenceRepair;

        let fields = |pairs: &[(&str, Value)]| -> RawFields {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect()
        };

        let mut epochs = EpochReconciler::new();
        epochs.contribute(
            "soa",
            vec![
                // Placeholder id: a fresh one gets minted and the document
                // reference below must be remapped to it
                fields(&[("name", json!("Screening¹")), ("id", json!("tbd"))]),
                fields(&[("name", json!("Treatment")), ("id", json!("ep_trt"))]),
            ],
            10,
        );
        let epoch_outcome = epochs.reconcile();

        let mut encounters = EncounterReconciler::new();
        encounters.contribute(
            "soa",
            vec![fields(&[("name", json!("Day 1")), ("id", json!("v1"))])],
            10,
        );
        let encounter_outcome = encounters.reconcile();

        let mut activities = ActivityReconciler::new();
        activities.contribute(
            "soa",
            vec![fields(&[("name", json!("Vital signs")), ("id", json!("act_vs"))])],
            10,
        );
        let activity_outcome = activities.reconcile();

        let entity_json = |e: &crate::reconciler::ReconciledEntity| {
            json!({"id": e.id, "name": e.canonical_name})
        };
        let mut document = json!({
            "studyDesigns": [{
                "arms": [{"id": "arm1", "name": "Arm A"}],
                "epochs": epoch_outcome.entities.iter().map(entity_json).collect::<Vec<_>>(),
                "encounters": encounter_outcome.entities.iter().map(entity_json).collect::<Vec<_>>(),
                "activities": activity_outcome.entities.iter().map(entity_json).collect::<Vec<_>>(),
                "studyCells": [
                    {"id": "cell1", "armId": "arm1", "epochId": "tbd"},
                    {"id": "cell2", "armId": "arm1", "epochId": "ep_trt"}
                ],
                "scheduleTimelines": [{
                    "id": "tl1",
                    "instances": [
                        {"id": "sai1", "encounterId": "v1", "epochId": "tbd",
                         "activityIds": ["act_vs"]}
                    ]
                }]
            }]
        });

        let mut repair = ReferenceRepair::new();
        repair.set_epoch_map(epoch_outcome.id_map.clone());
        repair.set_encounter_map(encounter_outcome.id_map.clone());
        repair.set_activity_map(activity_outcome.id_map.clone());
        let repair_report = repair.repair(&mut document);

        // Both "tbd" references were rewritten to the minted epoch id
        assert_eq!(repair_report.epochs.remapped, 2);
        assert!(!document.to_string().contains("\"tbd\""));

        let report = checker().check_integrity(&document);
        assert!(report.is_acceptable(), "{:?}", report.findings);
        assert!(rules_fired(&report, "dangling_reference").is_empty());
        assert!(rules_fired(&report, "orphan_entity").is_empty());
    }

    #[test]
    fn test_summary_counts_by_severity() {
        let findings = vec![
            IntegrityFinding {
                rule: "a".to_string(),
                severity: Severity::Error,
                message: String::new(),
                entity_type: String::new(),
                entity_ids: vec![],
                details: RawFields::new(),
            },
            IntegrityFinding {
                rule: "b".to_string(),
                severity: Severity::Warning,
                message: String::new(),
                entity_type: String::new(),
                entity_ids: vec![],
                details: RawFields::new(),
            },
        ];
        let report = build_report(findings);
        assert_eq!(report.summary.total_findings, 2);
        assert_eq!(report.summary.errors, 1);
        assert_eq!(report.summary.warnings, 1);
        assert_eq!(report.summary.info, 0);
        assert!(!report.is_acceptable());
        assert!(report.summary_line().contains("2 findings"));
    }
}
