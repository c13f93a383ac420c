//! Prompt assembly from preprocessed content.

use std::fmt::Write;

use modsage_abstraction::TaskType;

use crate::preprocess::{ContentSection, PreprocessedContent};

fn instructions(task: TaskType) -> &'static str {
    match task {
        TaskType::Quick => {
            "Give a short health check of this modded installation. List the most important \
             problems first and keep the answer brief."
        }
        TaskType::Summary => {
            "Summarize this modded installation: what it contains, how it is configured and \
             anything notable."
        }
        TaskType::Full => {
            "Perform a full analysis of this modded installation covering mods, configuration, \
             resource packs, conflicts and performance. Give concrete recommendations."
        }
        TaskType::Conflicts => {
            "Identify conflicts, duplicate mods, incompatible versions and errors in this \
             modded installation. Explain each one and how to resolve it."
        }
        TaskType::Performance => {
            "Identify performance problems in this modded installation, such as memory, CPU or \
             lag issues, and suggest optimizations."
        }
        TaskType::Custom => "Analyze this modded installation and answer with practical advice.",
    }
}

fn names(sections: &[ContentSection]) -> String {
    if sections.is_empty() {
        return "none".to_string();
    }
    sections.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
}

/// Builds the model prompt: task header, preprocessing metadata,
/// prioritization summary, then the optimized content.
pub fn build_prompt(task: TaskType, content: &PreprocessedContent) -> String {
    let mut prompt = String::with_capacity(content.content.len() + 512);
    let _ = writeln!(prompt, "# Task: {task}");
    let _ = writeln!(prompt, "{}", instructions(task));
    prompt.push('\n');

    prompt.push_str("## Preprocessing\n");
    let _ = writeln!(prompt, "- Original tokens: {}", content.original_tokens);
    let _ = writeln!(prompt, "- Final tokens: {}", content.final_tokens);
    let _ = writeln!(prompt, "- Compression ratio: {:.2}", content.compression_ratio);
    let _ = writeln!(prompt, "- Steps: {}", content.optimization_steps.join(", "));
    prompt.push('\n');

    prompt.push_str("## Priorities\n");
    let _ = writeln!(prompt, "- High: {}", names(&content.sections.high));
    let _ = writeln!(prompt, "- Medium: {}", names(&content.sections.medium));
    let _ = writeln!(prompt, "- Low: {}", names(&content.sections.low));
    prompt.push('\n');

    prompt.push_str("## Content\n\n");
    prompt.push_str(&content.content);
    if !prompt.ends_with('\n') {
        prompt.push('\n');
    }
    prompt
}
