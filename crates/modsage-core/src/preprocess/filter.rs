//! Task-aware line filtering.

use modsage_abstraction::TaskType;

const CONFLICT_KEYWORDS: [&str; 4] = ["conflict", "error", "duplicate", "incompatible"];
const PERFORMANCE_KEYWORDS: [&str; 4] = ["performance", "memory", "cpu", "lag"];
const QUICK_MAX_LINE_CHARS: usize = 200;

/// Headings, bullets and emphasized lines survive every filter.
fn is_structural(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#')
        || trimmed.starts_with("- ")
        || trimmed.starts_with("* ")
        || line.contains("**")
}

fn mentions_any(line: &str, keywords: &[&str]) -> bool {
    let lower = line.to_lowercase();
    keywords.iter().any(|keyword| lower.contains(keyword))
}

fn keep_line(line: &str, task: TaskType) -> bool {
    // Structural lines are kept before any task rule, including the Quick length limit.
    if line.trim().is_empty() || is_structural(line) {
        return true;
    }
    match task {
        TaskType::Conflicts => mentions_any(line, &CONFLICT_KEYWORDS),
        TaskType::Performance => mentions_any(line, &PERFORMANCE_KEYWORDS),
        TaskType::Quick => {
            let is_preview = line.trim_start().to_lowercase().starts_with("preview:");
            !is_preview && line.chars().count() <= QUICK_MAX_LINE_CHARS
        }
        TaskType::Full | TaskType::Summary | TaskType::Custom => true,
    }
}

/// Keeps the lines relevant to `task` and collapses runs of blank lines to one.
pub fn filter_content(text: &str, task: TaskType) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in text.lines().filter(|line| keep_line(line, task)) {
        let blank = line.trim().is_empty();
        if blank && kept.last().is_some_and(|prev| prev.trim().is_empty()) {
            continue;
        }
        kept.push(if blank { "" } else { line });
    }
    kept.join("\n")
}
