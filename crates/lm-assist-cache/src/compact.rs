use once_cell::sync::Lazy;
use regex::Regex;

use lm_assist_types::{CompactMessage, CompactSection};

// Numbered headings of the continuation summary, with or without markdown
// heading prefixes: "1. Primary Request and Intent:".
static SECTION_HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:#{1,6}\s*)?\d+\.\s*([^:\n]+?):?\s*$").unwrap());
static BULLET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*[-*]\s+(.+)$").unwrap());

/// Parse a compact/continuation user message into its numbered sections.
pub fn parse_compact_message(
    text: &str,
    line_index: u64,
    turn_index: u32,
    compact_order: u32,
) -> CompactMessage {
    let mut sections = Vec::new();

    let headings: Vec<(usize, usize, String)> = SECTION_HEADING_RE
        .captures_iter(text)
        .map(|caps| {
            let whole = caps.get(0).unwrap();
            (whole.start(), whole.end(), caps[1].trim().to_string())
        })
        .collect();

    for (i, (_, body_start, title)) in headings.iter().enumerate() {
        let body_end = headings
            .get(i + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(text.len());
        let body = text[*body_start..body_end].trim().to_string();
        sections.push(CompactSection {
            title: title.clone(),
            body,
        });
    }

    let primary_request = sections
        .iter()
        .find(|s| s.title.eq_ignore_ascii_case("Primary Request and Intent"))
        .map(|s| s.body.clone());

    let key_concepts = sections
        .iter()
        .find(|s| s.title.eq_ignore_ascii_case("Key Technical Concepts"))
        .map(|s| {
            BULLET_RE
                .captures_iter(&s.body)
                .map(|caps| caps[1].trim().to_string())
                .collect()
        })
        .unwrap_or_default();

    CompactMessage {
        line_index,
        turn_index,
        compact_order,
        primary_request,
        key_concepts,
        sections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "This session is being continued from a previous conversation that ran out of context. The summary follows:\n\n1. Primary Request and Intent:\nBuild the ingestion engine and keep it incremental.\n\n2. Key Technical Concepts:\n- JSONL append-only session files\n- Byte-offset resume\n- Single-flight cache extension\n\n3. Pending Tasks:\nNone.\n";

    #[test]
    fn test_sections_in_order() {
        let msg = parse_compact_message(SAMPLE, 10, 5, 0);
        let titles: Vec<&str> = msg.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "Primary Request and Intent",
                "Key Technical Concepts",
                "Pending Tasks"
            ]
        );
    }

    #[test]
    fn test_primary_request_and_concepts() {
        let msg = parse_compact_message(SAMPLE, 10, 5, 1);
        assert_eq!(
            msg.primary_request.as_deref(),
            Some("Build the ingestion engine and keep it incremental.")
        );
        assert_eq!(
            msg.key_concepts,
            vec![
                "JSONL append-only session files",
                "Byte-offset resume",
                "Single-flight cache extension"
            ]
        );
        assert_eq!(msg.compact_order, 1);
    }

    #[test]
    fn test_unstructured_text_yields_no_sections() {
        let msg = parse_compact_message("continued without a summary", 0, 1, 0);
        assert!(msg.sections.is_empty());
        assert!(msg.primary_request.is_none());
        assert!(msg.key_concepts.is_empty());
    }
}
