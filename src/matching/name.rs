// src/matching/name.rs - Employer name normalization and string similarity
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use strsim::jaro_winkler;

/// Trailing legal-entity suffixes removed by the standard level, longest first
/// so that "limited liability company" wins over "company".
const LEGAL_SUFFIXES: [&str; 22] = [
    "limited liability company",
    "limited partnership",
    "incorporated",
    "corporation",
    "company",
    "limited",
    "l l c",
    "l l p",
    "pllc",
    "corp",
    "llc",
    "llp",
    "ltd",
    "inc",
    "plc",
    "l p",
    "p c",
    "lp",
    "pc",
    "lc",
    "co",
    "pa",
];

/// Legal tokens the aggressive level drops wherever they appear.
const LEGAL_TOKENS: [&str; 15] = [
    "inc", "incorporated", "corp", "corporation", "llc", "ltd", "limited", "lp", "llp", "pllc",
    "plc", "co", "company", "pc", "lc",
];

const STOPWORDS: [&str; 9] = ["the", "of", "and", "a", "an", "at", "for", "in", "on"];

const LEADING_ARTICLES: [&str; 3] = ["the", "a", "an"];

/// Token-level abbreviation table applied by the aggressive level.
const ABBREVIATIONS: [(&str, &str); 28] = [
    ("saint", "st"),
    ("mount", "mt"),
    ("fort", "ft"),
    ("hosp", "hospital"),
    ("hlth", "health"),
    ("med", "medical"),
    ("ctr", "center"),
    ("cntr", "center"),
    ("centre", "center"),
    ("mfg", "manufacturing"),
    ("mfrs", "manufacturers"),
    ("svc", "services"),
    ("svcs", "services"),
    ("srvs", "services"),
    ("service", "services"),
    ("assn", "association"),
    ("assoc", "association"),
    ("natl", "national"),
    ("intl", "international"),
    ("dept", "department"),
    ("univ", "university"),
    ("bros", "brothers"),
    ("constr", "construction"),
    ("contr", "contractors"),
    ("elec", "electric"),
    ("transp", "transportation"),
    ("mgmt", "management"),
    ("grp", "group"),
];

/// "Doing business as" and alias tails. The marker only counts after a
/// leading name, so "Aka Sushi" or "DBA Architects" keep their first word.
/// Everything from the marker on is dropped.
static DBA_TAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(\S.*?)[\s,;]+(?:d\s*/\s*b\s*/\s*a\b|d\.b\.a\b\.?|dba\b|doing business as\b|a\s*/\s*k\s*/\s*a\b|aka\b|f\s*/\s*k\s*/\s*a\b|fka\b).*$")
        .expect("valid dba regex")
});

static SIGNATORY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\ball\s+signator(y|ies)\b",
        r"(?i)\bsignatory\s+(contractors|employers|companies)\b",
        r"(?i)\bvarious\s+(employers|contractors|companies)\b",
        r"(?i)\bmultiple\s+(employers|contractors|companies)\b",
        r"(?i)\bmulti[-\s]?employer\b",
        r"(?i)^(see|per)\s+attached\b",
        r"(?i)\bemployers?\s+association\s+members\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid signatory regex"))
    .collect()
});

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_trailing_suffixes(mut normalized: String) -> String {
    loop {
        let mut stripped = false;
        for suffix in LEGAL_SUFFIXES {
            let tail = format!(" {}", suffix);
            if normalized.ends_with(&tail) {
                normalized.truncate(normalized.len() - tail.len());
                normalized = normalized.trim_end().to_string();
                stripped = true;
                break;
            }
        }
        if !stripped {
            return normalized;
        }
    }
}

/// Level 1: lowercase, drop dba tails, strip punctuation except hyphens,
/// remove trailing legal suffixes, collapse whitespace.
pub fn normalize_standard(name: &str) -> String {
    let lowered = name.to_lowercase();
    let without_dba = DBA_TAIL.replace(&lowered, "$1");

    let cleaned: String = without_dba
        .chars()
        .filter(|c| *c != '\'' && *c != '\u{2019}')
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    let collapsed = collapse_whitespace(&cleaned);
    strip_trailing_suffixes(collapsed)
}

fn expand_abbreviation(token: &str) -> &str {
    ABBREVIATIONS
        .iter()
        .find(|(short, _)| *short == token)
        .map(|(_, long)| *long)
        .unwrap_or(token)
}

/// Level 2: standard plus `&`/`+` folding, abbreviation expansion, stopword,
/// single-letter and legal-token removal.
pub fn normalize_aggressive(name: &str) -> String {
    let folded = name.replace('&', " and ").replace('+', " and ");
    let standard = normalize_standard(&folded);
    let dehyphenated = standard.replace('-', " ");

    let tokens: Vec<&str> = dehyphenated
        .split_whitespace()
        .map(expand_abbreviation)
        .filter(|token| token.chars().count() > 1)
        .filter(|token| !STOPWORDS.contains(token))
        .filter(|token| !LEGAL_TOKENS.contains(token))
        .collect();

    if tokens.is_empty() {
        // Names made only of stopwords/suffixes keep their standard form.
        return collapse_whitespace(&dehyphenated);
    }
    tokens.join(" ")
}

/// Level 3: aggressive plus removal of standalone digits and leading articles.
/// Only ever used as similarity input, never as an exact index key.
pub fn normalize_fuzzy(name: &str) -> String {
    let aggressive = normalize_aggressive(name);
    let mut tokens: Vec<&str> = aggressive
        .split_whitespace()
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit()))
        .collect();
    while tokens.len() > 1 && LEADING_ARTICLES.contains(&tokens[0]) {
        tokens.remove(0);
    }
    tokens.join(" ")
}

/// Upper-cased, whitespace-collapsed state/city key. Blank values become `None`.
pub fn normalize_location_key(value: Option<&str>) -> Option<String> {
    let value = value?;
    let collapsed = collapse_whitespace(value).to_uppercase();
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// EIN digit string, present only when at least 8 digits survive stripping.
pub fn normalize_ein(value: Option<&str>) -> Option<String> {
    let digits: String = value?.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 8 {
        Some(digits)
    } else {
        None
    }
}

/// First five digits of a ZIP / ZIP+4 value.
pub fn normalize_zip(value: Option<&str>) -> Option<String> {
    let digits: String = value?.chars().filter(|c| c.is_ascii_digit()).take(5).collect();
    if digits.len() == 5 {
        Some(digits)
    } else {
        None
    }
}

/// NAICS code digits (2 to 6 of them).
pub fn normalize_naics(value: Option<&str>) -> Option<String> {
    let digits: String = value?.chars().filter(|c| c.is_ascii_digit()).take(6).collect();
    if digits.len() >= 2 {
        Some(digits)
    } else {
        None
    }
}

/// Lowercased street address with punctuation removed and whitespace collapsed.
pub fn normalize_address(value: Option<&str>) -> Option<String> {
    let cleaned: String = value?
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let collapsed = collapse_whitespace(&cleaned);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Names that describe a roster of signatories rather than one organization.
pub fn is_signatory_pattern(name: &str) -> bool {
    SIGNATORY_PATTERNS.iter().any(|re| re.is_match(name))
}

/// pg_trgm-style trigram set: every alphanumeric word padded with two leading
/// blanks and one trailing blank.
pub fn trigram_set(value: &str) -> HashSet<String> {
    let mut trigrams = HashSet::new();
    for word in value
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = format!("  {} ", word).chars().collect();
        for window in padded.windows(3) {
            trigrams.insert(window.iter().collect());
        }
    }
    trigrams
}

/// Jaccard similarity of two trigram sets given their sizes and overlap.
pub fn trigram_jaccard(shared: usize, a_len: usize, b_len: usize) -> f64 {
    if a_len == 0 || b_len == 0 {
        return 0.0;
    }
    shared as f64 / (a_len + b_len - shared) as f64
}

/// Fewest shared trigrams that can still reach `threshold` against a set of
/// `len` trigrams: the union is never smaller than `len`.
pub fn min_shared_trigrams(threshold: f64, len: usize) -> usize {
    ((threshold * len as f64) - 1e-9).ceil().max(1.0) as usize
}

/// Indel similarity on a 0-100 scale.
pub fn ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 100.0;
    }
    rapidfuzz::fuzz::ratio(a.chars(), b.chars()) * 100.0
}

/// Token-set ratio (0-100): compares the shared tokens against each side's
/// shared-plus-remaining tokens, so a name that is a token subset of the other scores 100.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let tokens_a: HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let mut intersection: Vec<&str> = tokens_a.intersection(&tokens_b).copied().collect();
    let mut only_a: Vec<&str> = tokens_a.difference(&tokens_b).copied().collect();
    let mut only_b: Vec<&str> = tokens_b.difference(&tokens_a).copied().collect();
    intersection.sort_unstable();
    only_a.sort_unstable();
    only_b.sort_unstable();

    let sect = intersection.join(" ");
    if !sect.is_empty() && (only_a.is_empty() || only_b.is_empty()) {
        return 100.0;
    }

    let combine = |rest: &[&str]| {
        if sect.is_empty() {
            rest.join(" ")
        } else {
            format!("{} {}", sect, rest.join(" "))
        }
    };
    let combined_a = combine(&only_a);
    let combined_b = combine(&only_b);

    let mut best = ratio(&combined_a, &combined_b);
    if !sect.is_empty() {
        best = best.max(ratio(&sect, &combined_a)).max(ratio(&sect, &combined_b));
    }
    best
}

/// Jaro-Winkler similarity of two already-normalized names.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    jaro_winkler(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_normalization() {
        assert_eq!(normalize_standard("Acme, Inc."), "acme");
        assert_eq!(normalize_standard("  Big   Box  Co. "), "big box");
        assert_eq!(normalize_standard("Smith-Jones L.L.C."), "smith-jones");
        assert_eq!(normalize_standard("ACME CORP D/B/A Acme Widgets"), "acme");
        assert_eq!(normalize_standard("Joe's Diner dba Joe's"), "joes diner");
        assert_eq!(normalize_standard("Widget Holdings Corp Inc"), "widget holdings");
        assert_eq!(normalize_standard("The Acme Foods, Inc."), "the acme foods");
    }

    #[test]
    fn test_alias_marker_needs_a_leading_name() {
        assert_eq!(normalize_standard("Aka Sushi Bar Inc"), "aka sushi bar");
        assert_eq!(normalize_standard("DBA Architects LLC"), "dba architects");
        assert_eq!(normalize_standard("FKA Logistics"), "fka logistics");
        assert_eq!(normalize_standard("Joe's Pizza dba Aka Sushi"), "joes pizza");
        assert_eq!(normalize_standard("Harbor Freight, d.b.a. Harbor Tools"), "harbor freight");
        assert_eq!(normalize_aggressive("Aka Sushi Bar Inc"), "aka sushi bar");
        assert!(!normalize_fuzzy("DBA Architects LLC").is_empty());
    }

    #[test]
    fn test_standard_keeps_lone_suffix_word() {
        assert_eq!(normalize_standard("Company"), "company");
    }

    #[test]
    fn test_aggressive_normalization() {
        assert_eq!(normalize_aggressive("The Acme Foods, Inc."), "acme foods");
        assert_eq!(normalize_aggressive("Saint Mary's Hosp."), "st marys hospital");
        assert_eq!(normalize_aggressive("Johnson & Johnson"), "johnson johnson");
        assert_eq!(normalize_aggressive("Bank of the West"), "bank west");
        assert_eq!(normalize_aggressive("Mount Sinai Med Ctr"), "mt sinai medical center");
        assert_eq!(normalize_aggressive("Acme Co Services LLC"), "acme services");
        assert_eq!(normalize_aggressive("Coca-Cola Bottling"), "coca cola bottling");
    }

    #[test]
    fn test_aggressive_falls_back_when_everything_is_dropped() {
        assert_eq!(normalize_aggressive("The A"), "the a");
    }

    #[test]
    fn test_fuzzy_normalization() {
        assert_eq!(normalize_fuzzy("Teamsters Local 705"), "teamsters local");
        assert_eq!(normalize_fuzzy("The 3M Company"), "3m");
        assert_eq!(normalize_fuzzy("24 Hour Fitness"), "hour fitness");
    }

    #[test]
    fn test_levels_are_deterministic() {
        let name = "St. Luke's Health System, Inc. d/b/a St Luke's";
        assert_eq!(normalize_aggressive(name), normalize_aggressive(name));
        assert_eq!(normalize_fuzzy(name), normalize_fuzzy(name));
    }

    #[test]
    fn test_location_and_ein_keys() {
        assert_eq!(normalize_location_key(Some(" san  jose ")), Some("SAN JOSE".to_string()));
        assert_eq!(normalize_location_key(Some("   ")), None);
        assert_eq!(normalize_location_key(None), None);
        assert_eq!(normalize_ein(Some("12-3456789")), Some("123456789".to_string()));
        assert_eq!(normalize_ein(Some("1234567")), None);
        assert_eq!(normalize_ein(Some("12-345-678")), Some("12345678".to_string()));
        assert_eq!(normalize_zip(Some("95112-1234")), Some("95112".to_string()));
        assert_eq!(normalize_zip(Some("951")), None);
        assert_eq!(normalize_naics(Some("311-611")), Some("311611".to_string()));
        assert_eq!(normalize_address(Some("100 N. Main St., Ste 4")), Some("100 n main st ste 4".to_string()));
    }

    #[test]
    fn test_signatory_patterns() {
        assert!(is_signatory_pattern("All Signatory Contractors"));
        assert!(is_signatory_pattern("Various Employers - Building Trades"));
        assert!(is_signatory_pattern("Multi-Employer Plan"));
        assert!(!is_signatory_pattern("Acme Foods"));
    }

    fn trigram_similarity(a: &str, b: &str) -> f64 {
        let (a, b) = (trigram_set(a), trigram_set(b));
        trigram_jaccard(a.intersection(&b).count(), a.len(), b.len())
    }

    #[test]
    fn test_trigram_similarity() {
        assert!((trigram_similarity("acme", "acme") - 1.0).abs() < 1e-9);
        assert_eq!(trigram_similarity("", "acme"), 0.0);
        assert!((trigram_similarity("acme foods", "acme food") - 0.75).abs() < 1e-9);
        assert_eq!(trigram_similarity("acme foods", "zenith steel"), 0.0);
    }

    #[test]
    fn test_min_shared_trigrams_bound() {
        assert_eq!(min_shared_trigrams(0.4, 10), 4);
        assert_eq!(min_shared_trigrams(0.4, 11), 5);
        assert_eq!(min_shared_trigrams(0.4, 2), 1);
        assert_eq!(min_shared_trigrams(0.0, 5), 1);
        // The bound is tight when the other set is inside the union.
        assert!((trigram_jaccard(4, 10, 4) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_token_set_ratio() {
        assert_eq!(token_set_ratio("acme foods", "acme foods distribution"), 100.0);
        assert_eq!(token_set_ratio("foods acme", "acme foods"), 100.0);
        let near = token_set_ratio("acme food", "acme foods");
        assert!(near > 90.0 && near < 100.0, "near={}", near);
        assert!(token_set_ratio("acme foods", "zenith steel") < 50.0);
        assert_eq!(token_set_ratio("", "acme"), 0.0);
    }

    #[test]
    fn test_ratio() {
        assert_eq!(ratio("", ""), 100.0);
        assert_eq!(ratio("abc", "abc"), 100.0);
        assert_eq!(ratio("abc", "xyz"), 0.0);
        let close = ratio("acme food", "acme foods");
        assert!((close - 2.0 * 9.0 / 19.0 * 100.0).abs() < 1e-6, "close={}", close);
        assert!((ratio("kitten", "sitting") - 2.0 * 4.0 / 13.0 * 100.0).abs() < 1e-6);
    }
}
