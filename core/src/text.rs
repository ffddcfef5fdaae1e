//! Text normalization shared by every resolver and parser.
//!
//! RULE: normalized keys are for comparison and slugging only.
//! Display strings keep their original spelling (trimmed, whitespace collapsed).

use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

pub const UNKNOWN_DISTRIBUTOR: &str = "distribuidora_desconhecida";
pub const OTHERS_GROUP: &str = "outros";

/// Collapse whitespace runs to a single space and trim.
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Uppercase ASCII-folded comparison key: NFKD, combining marks removed,
/// whitespace collapsed.
pub fn normalize_key(value: &str) -> String {
    let folded: String = value.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    collapse_whitespace(&folded).to_uppercase()
}

/// Lowercase slug: non-alphanumeric runs become a single `_`, edges trimmed.
/// Returns `fallback` when nothing alphanumeric survives.
pub fn slugify(value: &str, fallback: &str) -> String {
    let normalized = normalize_key(value).to_lowercase();
    let mut slug = String::with_capacity(normalized.len());
    let mut pending_sep = false;
    for ch in normalized.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(ch);
        } else {
            pending_sep = true;
        }
    }
    if slug.is_empty() {
        fallback.to_string()
    } else {
        slug
    }
}

/// Title-case a single lowercase word ("coelba" -> "Coelba").
pub fn title_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Parse a number as published by the regulator.
///
/// Values containing a comma use the Brazilian layout (`1.234,56`).
/// Plain values (`1234.5`, `42`) parse directly. Blank, `-` and `.` are `None`.
pub fn parse_br_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" || trimmed == "." {
        return None;
    }
    if !trimmed.contains(',') {
        if let Ok(v) = trimmed.parse::<f64>() {
            return v.is_finite().then_some(v);
        }
    }
    let cleaned: String = trimmed
        .replace('.', "")
        .replace(',', ".")
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() || cleaned == "-" || cleaned == "." {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Classify a service/indicator description into a location segment.
pub fn classify_segment(description: &str) -> &'static str {
    let upper = normalize_key(description);
    let urban = upper.contains("URBANA") || upper.contains("URBANO");
    if upper.contains("GRUPO A") {
        "grupo_a"
    } else if upper.contains("GRUPO B") && upper.contains("RURAL") {
        "grupo_b_rural"
    } else if upper.contains("GRUPO B") && urban {
        "grupo_b_urbana"
    } else if upper.contains("GRUPO B") {
        "grupo_b"
    } else if upper.contains("RURAL") {
        "rural"
    } else if urban {
        "urbana"
    } else {
        "nao_classificado"
    }
}

/// Leading word sequences stripped from indicator descriptions.
const SERVICE_PREFIXES: &[&[&str]] = &[
    &["QUANTIDADE", "DE"],
    &["QUANT.", "PRAZOS", "VIOL.", "DE"],
    &["QUANT.", "PRAZOS", "VIOL."],
    &["PRAZO", "MEDIO", "DE"],
    &["CRED.", "PRAZO", "VIOL.", "DE"],
    &["CRED.", "PRAZO", "VIOL.", "POR"],
    &["CREDITOS", "CEDIDOS", "POR"],
];

/// Remove every parenthesized `(art. ...)` reference, case-insensitive.
fn strip_article_refs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('(') {
        let after = &rest[open + 1..];
        let is_article = normalize_key(after.get(..4).unwrap_or(after)).starts_with("ART.");
        match (is_article, after.find(')')) {
            (true, Some(close)) => {
                out.push_str(&rest[..open]);
                rest = &after[close + 1..];
            }
            _ => {
                out.push_str(&rest[..=open]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Short service name from an indicator description
/// ("Quantidade de Ligação Nova (art. 31)" -> "Ligação Nova").
pub fn clean_service_name(description: &str) -> String {
    let text = collapse_whitespace(&strip_article_refs(&collapse_whitespace(description)));
    let words: Vec<&str> = text.split(' ').filter(|w| !w.is_empty()).collect();
    let keys: Vec<String> = words.iter().map(|w| normalize_key(w)).collect();

    for prefix in SERVICE_PREFIXES {
        if keys.len() >= prefix.len() && keys.iter().zip(prefix.iter()).all(|(k, p)| k == p) {
            return words[prefix.len()..].join(" ");
        }
    }
    words.join(" ")
}

/// The regulation article cited in a description, e.g. `art. 31`.
pub fn extract_article(description: &str) -> String {
    let text = collapse_whitespace(description);
    let mut rest = text.as_str();
    while let Some(open) = rest.find('(') {
        let after = &rest[open + 1..];
        if normalize_key(after.get(..4).unwrap_or(after)).starts_with("ART.") {
            if let Some(close) = after.find(')') {
                return collapse_whitespace(&after[..close]);
            }
        }
        rest = after;
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_diacritics_and_collapses() {
        assert_eq!(normalize_key("  Distribuição   São Paulo "), "DISTRIBUICAO SAO PAULO");
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Neoenergia  Coelba", "x"), "neoenergia_coelba");
        assert_eq!(slugify("--CPFL/Paulista--", "x"), "cpfl_paulista");
        assert_eq!(slugify("  ***  ", "fallback"), "fallback");
    }

    #[test]
    fn br_numbers() {
        assert_eq!(parse_br_number("1.234,56"), Some(1234.56));
        assert_eq!(parse_br_number("42"), Some(42.0));
        assert_eq!(parse_br_number("0,5"), Some(0.5));
        assert_eq!(parse_br_number(" - "), None);
        assert_eq!(parse_br_number(""), None);
    }

    #[test]
    fn segment_classification() {
        assert_eq!(classify_segment("Ligação Grupo B - Área Rural"), "grupo_b_rural");
        assert_eq!(classify_segment("Religação urbana"), "urbana");
        assert_eq!(classify_segment("Grupo A"), "grupo_a");
        assert_eq!(classify_segment("Vistoria"), "nao_classificado");
    }

    #[test]
    fn service_name_cleanup() {
        assert_eq!(
            clean_service_name("Quantidade de Ligação Nova (art. 31, I)"),
            "Ligação Nova"
        );
        assert_eq!(clean_service_name("Prazo Médio de Vistoria"), "Vistoria");
        assert_eq!(extract_article("Quantidade de Ligação (Art. 31, I)"), "Art. 31, I");
        assert_eq!(extract_article("Sem artigo"), "");
    }
}
