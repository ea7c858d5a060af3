//! Text chunking for fact extraction.
//!
//! Splits oversized input at natural boundaries, preferring paragraph
//! breaks over line breaks over sentence endings over weaker separators.
//! Chunks may slightly overshoot the limit to finish a sentence.

/// Separators in order of preference.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", "; ", ", ", " "];

/// Splits text into chunks of roughly `max_chars` at natural boundaries.
///
/// Text at or under the limit comes back as a single chunk. The
/// concatenation of all chunks reproduces the input.
#[must_use]
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max_chars {
        let cut = find_cut(rest, max_chars);
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_string());
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Finds the best cut position at or shortly after `target`, honoring the
/// separator preference order. Falls back to the nearest char boundary.
fn find_cut(text: &str, target: usize) -> usize {
    // Search window: up to 10% overshoot to complete a sentence.
    let window_end = (target + target / 10).min(text.len());

    for separator in SEPARATORS {
        // Last occurrence whose end lands inside the window.
        let mut best = None;
        let mut from = 0;
        while let Some(position) = text[from..window_end].find(separator) {
            let absolute = from + position + separator.len();
            if absolute > window_end {
                break;
            }
            best = Some(absolute);
            from = from + position + 1;
        }
        if let Some(cut) = best {
            // A cut too close to the start would make degenerate chunks.
            if cut >= target / 4 {
                return cut;
            }
        }
    }

    // No separator found: cut at the last char boundary within the target.
    let mut cut = target.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut.max(1)
}

/// Splits a chunk near its midpoint, preferring a sentence boundary within
/// ±20% of the midpoint. Used when extraction hits the LLM output cap.
#[must_use]
pub fn split_at_midpoint(text: &str) -> (String, String) {
    let midpoint = text.len() / 2;
    let slack = text.len() / 5;
    let window_start = midpoint.saturating_sub(slack);
    let window_end = (midpoint + slack).min(text.len());

    let mut cut = None;
    for separator in SEPARATORS {
        let mut from = window_start;
        let mut best: Option<usize> = None;
        while let Some(position) = text[from..window_end].find(separator) {
            let absolute = from + position + separator.len();
            if absolute > window_end {
                break;
            }
            // Prefer the boundary nearest the midpoint.
            let better = best.map_or(true, |current| {
                absolute.abs_diff(midpoint) < current.abs_diff(midpoint)
            });
            if better {
                best = Some(absolute);
            }
            from = from + position + 1;
        }
        if best.is_some() {
            cut = best;
            break;
        }
    }

    let mut cut = cut.unwrap_or(midpoint).clamp(1, text.len().saturating_sub(1));
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let (head, tail) = text.split_at(cut.max(1));
    (head.to_string(), tail.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("short", 100);
        assert_eq!(chunks, vec!["short".to_string()]);
    }

    #[test]
    fn test_exactly_max_chars_not_split() {
        let text = "a".repeat(100);
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_prefers_paragraph_breaks() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = chunk_text(&text, 80);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with("\n\n"));
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn test_sentence_boundary_over_hard_cut() {
        let text = format!("{}. {}", "a".repeat(70), "b".repeat(70));
        let chunks = chunk_text(&text, 80);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with(". "));
    }

    #[test]
    fn test_concatenation_reproduces_input() {
        let text = "The quick brown fox. Jumped over the lazy dog. Again and again. "
            .repeat(50);
        let chunks = chunk_text(&text, 200);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_no_separator_falls_back_to_hard_cut() {
        let text = "x".repeat(250);
        let chunks = chunk_text(&text, 100);
        assert!(chunks.len() >= 3);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_at_midpoint_prefers_sentence() {
        let text = format!("{}. {}", "a".repeat(50), "b".repeat(50));
        let (head, tail) = split_at_midpoint(&text);
        assert!(head.ends_with(". "));
        assert_eq!(format!("{head}{tail}"), text);
    }

    #[test]
    fn test_split_at_midpoint_no_boundary() {
        let text = "y".repeat(100);
        let (head, tail) = split_at_midpoint(&text);
        assert_eq!(head.len(), 50);
        assert_eq!(tail.len(), 50);
    }

    #[test]
    fn test_multibyte_safety() {
        let text = "é".repeat(120);
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.concat(), text);
        let (head, tail) = split_at_midpoint(&text);
        assert_eq!(format!("{head}{tail}"), text);
    }
}
