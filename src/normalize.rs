// 🧼 Name Normalizer - Strip footnote glyphs from extracted labels
//
// Schedule-of-activities tables decorate entity names with superscript
// footnote marks: "Screening¹", "CT scan*". The glyph is a footnote
// reference, not part of the name. This module removes the marks, records
// them, and produces the comparison keys used for clustering.
//
// Deliberately conservative: plain ASCII letters are NEVER stripped, even
// when a trailing letter looks like a misrendered footnote. Truncating
// "examination" to "examinatio" is worse than missing a footnote.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ============================================================================
// FOOTNOTE GLYPH TABLE
// ============================================================================

/// Unicode superscript/footnote glyphs → plain-character equivalent.
///
/// Covers superscript digits, superscript a-z (no superscript q exists in
/// Unicode), and the common footnote symbols † ‡ § *.
static FOOTNOTE_GLYPHS: Lazy<HashMap<char, char>> = Lazy::new(|| {
    let mut m = HashMap::new();

    // Superscript digits
    for (glyph, plain) in [
        ('⁰', '0'),
        ('¹', '1'),
        ('²', '2'),
        ('³', '3'),
        ('⁴', '4'),
        ('⁵', '5'),
        ('⁶', '6'),
        ('⁷', '7'),
        ('⁸', '8'),
        ('⁹', '9'),
    ] {
        m.insert(glyph, plain);
    }

    // Superscript letters
    for (glyph, plain) in [
        ('ᵃ', 'a'),
        ('ᵇ', 'b'),
        ('ᶜ', 'c'),
        ('ᵈ', 'd'),
        ('ᵉ', 'e'),
        ('ᶠ', 'f'),
        ('ᵍ', 'g'),
        ('ʰ', 'h'),
        ('ⁱ', 'i'),
        ('ʲ', 'j'),
        ('ᵏ', 'k'),
        ('ˡ', 'l'),
        ('ᵐ', 'm'),
        ('ⁿ', 'n'),
        ('ᵒ', 'o'),
        ('ᵖ', 'p'),
        ('ʳ', 'r'),
        ('ˢ', 's'),
        ('ᵗ', 't'),
        ('ᵘ', 'u'),
        ('ᵛ', 'v'),
        ('ʷ', 'w'),
        ('ˣ', 'x'),
        ('ʸ', 'y'),
        ('ᶻ', 'z'),
    ] {
        m.insert(glyph, plain);
    }

    // Footnote symbols (kept as-is in the refs list)
    for sym in ['†', '‡', '§', '*'] {
        m.insert(sym, sym);
    }

    m
});

/// Confusable-character substitutions used when validating footnote refs
/// against the known footnote keys of a page (OCR-style confusions).
static CONFUSABLES: Lazy<HashMap<char, &'static [char]>> = Lazy::new(|| {
    let mut m: HashMap<char, &'static [char]> = HashMap::new();
    m.insert('1', &['i', 'l']);
    m.insert('i', &['1', 'l']);
    m.insert('l', &['1', 'i']);
    m.insert('0', &['o']);
    m.insert('o', &['0']);
    m.insert('5', &['s']);
    m.insert('s', &['5']);
    m
});

// ============================================================================
// NORMALIZED NAME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedName {
    /// Display name: footnote glyphs removed, whitespace collapsed.
    /// Case is preserved.
    pub clean_name: String,

    /// Footnote references removed from the name, as plain characters,
    /// in the order they appeared.
    pub footnote_refs: Vec<String>,
}

/// Strip footnote glyphs from a raw label and collapse whitespace.
pub fn normalize_name(raw: &str) -> NormalizedName {
    let mut cleaned = String::with_capacity(raw.len());
    let mut footnote_refs = Vec::new();

    for ch in raw.chars() {
        match FOOTNOTE_GLYPHS.get(&ch) {
            Some(plain) => footnote_refs.push(plain.to_string()),
            None => cleaned.push(ch),
        }
    }

    NormalizedName {
        clean_name: collapse_whitespace(&cleaned),
        footnote_refs,
    }
}

/// Matching-only normalization: lower-cased, whitespace collapsed.
/// Used for similarity comparison, never stored on output entities.
pub fn matching_key(name: &str) -> String {
    collapse_whitespace(&name.to_lowercase())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// FOOTNOTE REFERENCE VALIDATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum FootnoteRefStatus {
    /// Reference matches a known footnote key verbatim.
    Valid { reference: String },

    /// Reference matched only after a confusable-character substitution.
    Corrected { found: String, corrected: String },

    /// Reference matches no known key, even after substitution.
    Invalid { reference: String },
}

/// Cross-check extracted footnote references against the literal footnote
/// keys present on the page. Unknown refs are retried through the
/// confusable table before being reported as invalid.
pub fn validate_footnote_refs(
    refs: &[String],
    known_keys: &HashSet<String>,
) -> Vec<FootnoteRefStatus> {
    refs.iter()
        .map(|r| {
            if known_keys.contains(r) {
                return FootnoteRefStatus::Valid {
                    reference: r.clone(),
                };
            }

            // Single-character refs may be OCR confusions of a real key
            let mut chars = r.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                if let Some(subs) = CONFUSABLES.get(&c.to_ascii_lowercase()) {
                    for sub in subs.iter() {
                        let candidate = sub.to_string();
                        if known_keys.contains(&candidate) {
                            return FootnoteRefStatus::Corrected {
                                found: r.clone(),
                                corrected: candidate,
                            };
                        }
                    }
                }
            }

            FootnoteRefStatus::Invalid {
                reference: r.clone(),
            }
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_strip_superscript_digit() {
        let n = normalize_name("Screening¹");
        assert_eq!(n.clean_name, "Screening");
        assert_eq!(n.footnote_refs, vec!["1"]);
    }

    #[test]
    fn test_strip_multiple_glyphs() {
        let n = normalize_name("CT scan*²");
        assert_eq!(n.clean_name, "CT scan");
        assert_eq!(n.footnote_refs, vec!["*", "2"]);
    }

    #[test]
    fn test_strip_superscript_letter() {
        let n = normalize_name("Vital signsᵃ");
        assert_eq!(n.clean_name, "Vital signs");
        assert_eq!(n.footnote_refs, vec!["a"]);
    }

    #[test]
    fn test_plain_ascii_never_stripped() {
        // Trailing plain letters are not footnotes
        let n = normalize_name("Physical examination");
        assert_eq!(n.clean_name, "Physical examination");
        assert!(n.footnote_refs.is_empty());
    }

    #[test]
    fn test_whitespace_collapsed() {
        let n = normalize_name("  Follow   up\tvisit ");
        assert_eq!(n.clean_name, "Follow up visit");
    }

    #[test]
    fn test_matching_key_lowercases() {
        assert_eq!(matching_key("Screening  Visit"), "screening visit");
        assert_eq!(matching_key("SCREENING"), matching_key("screening"));
    }

    #[test]
    fn test_validate_known_ref() {
        let statuses = validate_footnote_refs(&["a".to_string()], &keys(&["a", "b"]));
        assert_eq!(
            statuses,
            vec![FootnoteRefStatus::Valid {
                reference: "a".to_string()
            }]
        );
    }

    #[test]
    fn test_validate_confusable_correction() {
        // OCR read footnote "l" as "1"
        let statuses = validate_footnote_refs(&["1".to_string()], &keys(&["l", "m"]));
        assert_eq!(
            statuses,
            vec![FootnoteRefStatus::Corrected {
                found: "1".to_string(),
                corrected: "l".to_string(),
            }]
        );
    }

    #[test]
    fn test_validate_confusable_prefers_listed_order() {
        // "1" could be "i" or "l"; "i" is checked first
        let statuses = validate_footnote_refs(&["1".to_string()], &keys(&["i", "l"]));
        assert_eq!(
            statuses,
            vec![FootnoteRefStatus::Corrected {
                found: "1".to_string(),
                corrected: "i".to_string(),
            }]
        );
    }

    #[test]
    fn test_validate_invalid_ref() {
        let statuses = validate_footnote_refs(&["z".to_string()], &keys(&["a", "b"]));
        assert_eq!(
            statuses,
            vec![FootnoteRefStatus::Invalid {
                reference: "z".to_string()
            }]
        );
    }

    #[test]
    fn test_numeric_ref_valid_when_numeric_keys_known() {
        // "1" is itself a key: no substitution attempted
        let statuses = validate_footnote_refs(&["1".to_string()], &keys(&["1", "2"]));
        assert_eq!(
            statuses,
            vec![FootnoteRefStatus::Valid {
                reference: "1".to_string()
            }]
        );
    }
}
