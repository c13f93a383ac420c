//! Token estimation and hard budget enforcement.

/// Appended when `optimize_content` cut the text well short of the budget.
pub const TRUNCATION_NOTICE: &str = "[Content truncated to fit the token budget]";

const ELLIPSIS: &str = "...";

/// Conservative token estimate: the larger of the word count and a quarter of the character count.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count();
    let chars = text.chars().count();
    words.max(chars.div_ceil(4))
}

/// Cuts `text` down to at most `max_tokens` estimated tokens.
///
/// Text already within budget is returned unchanged. Otherwise whole lines are
/// kept in order until the next one would overflow. That line is truncated
/// with an ellipsis when it alone costs more than a tenth of the budget, and
/// nothing after it is kept. A notice is appended when less than 90% of the
/// budget ended up used.
pub fn optimize_content(text: &str, max_tokens: usize) -> String {
    if max_tokens == 0 {
        return String::new();
    }
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }

    let mut out = String::new();
    let mut used = 0;
    for line in text.lines() {
        let cost = estimate_tokens(&format!("{line}\n"));
        if used + cost <= max_tokens {
            out.push_str(line);
            out.push('\n');
            used += cost;
            continue;
        }

        let remaining = max_tokens - used;
        if cost * 10 > max_tokens && remaining > 0 {
            if let Some(truncated) = truncate_line(line, cost, remaining) {
                used += estimate_tokens(&format!("{truncated}\n"));
                out.push_str(&truncated);
                out.push('\n');
            }
        }
        break;
    }

    if used * 10 < max_tokens * 9 {
        out.push_str(TRUNCATION_NOTICE);
        out.push('\n');
    }
    out
}

/// Truncates `line` to a prefix proportional to `budget / cost`, snapped back to
/// a word boundary when one lies past 80% of the cut, so that the result plus a
/// newline fits in `budget` tokens.
fn truncate_line(line: &str, cost: usize, budget: usize) -> Option<String> {
    let chars: Vec<char> = line.chars().collect();
    let mut cut = chars.len() * budget / cost.max(1);

    while cut > 0 {
        let prefix = &chars[..cut.min(chars.len())];
        let snapped = prefix
            .iter()
            .rposition(|c| c.is_whitespace())
            .filter(|&at| at * 10 >= cut * 8)
            .map_or(prefix, |at| &prefix[..at]);

        let mut candidate: String = snapped.iter().collect();
        candidate.truncate(candidate.trim_end().len());
        candidate.push_str(ELLIPSIS);

        if estimate_tokens(&format!("{candidate}\n")) <= budget {
            return Some(candidate);
        }
        cut = (cut * 9 / 10).min(cut - 1);
    }
    None
}
