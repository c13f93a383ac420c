//! Section building, prioritization and rendering.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use modsage_abstraction::{ConfigFile, ScanResult, ScannedFile, TaskType};
use serde::Serialize;

use super::tokens::estimate_tokens;

const PREVIEW_LINES: usize = 5;

/// The logical group a section was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    /// Scan-wide counts. Always present.
    Summary,
    /// The mod list.
    Mods,
    /// Configuration files sharing one directory.
    Config,
    /// The resource-pack list.
    ResourcePacks,
}

impl SectionKind {
    /// Static priority of this kind of section for `task`, from 1 to 10.
    #[must_use]
    pub fn priority_for(self, task: TaskType) -> u8 {
        use TaskType::{Conflicts, Custom, Full, Performance, Quick, Summary};
        match (self, task) {
            (Self::Summary, _) => 10,
            (Self::Mods, Full | Conflicts) => 9,
            (Self::Mods, Summary) => 7,
            (Self::Mods, Performance | Quick | Custom) => 6,
            (Self::Config, Conflicts | Performance) => 9,
            (Self::Config, Full) => 7,
            (Self::Config, Custom) => 6,
            (Self::Config, Summary) => 5,
            (Self::Config, Quick) => 4,
            (Self::ResourcePacks, Full | Performance) => 5,
            (Self::ResourcePacks, Conflicts | Summary) => 4,
            (Self::ResourcePacks, Custom) => 3,
            (Self::ResourcePacks, Quick) => 2,
        }
    }
}

/// Priority bucket of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityBucket {
    /// Priority 8 and above.
    High,
    /// Priority 5 to 7.
    Medium,
    /// Everything below 5.
    Low,
}

impl PriorityBucket {
    /// The bucket a priority belongs to.
    #[must_use]
    pub fn for_priority(priority: u8) -> Self {
        match priority {
            8.. => Self::High,
            5..=7 => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// One rendered group of scan data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentSection {
    /// Heading shown above the section.
    pub name: String,
    /// What the section was built from.
    pub kind: SectionKind,
    /// Priority for the task it was built for.
    pub priority: u8,
    /// Rendered body, without the heading.
    pub content: String,
    /// Token estimate of the body.
    pub estimated_tokens: usize,
}

impl ContentSection {
    fn new(name: impl Into<String>, kind: SectionKind, task: TaskType, content: String) -> Self {
        let estimated_tokens = estimate_tokens(&content);
        Self { name: name.into(), kind, priority: kind.priority_for(task), content, estimated_tokens }
    }
}

/// Sections partitioned into priority buckets, each ordered by descending priority.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PrioritizedSections {
    /// Priority 8 and above.
    pub high: Vec<ContentSection>,
    /// Priority 5 to 7.
    pub medium: Vec<ContentSection>,
    /// Priority below 5.
    pub low: Vec<ContentSection>,
}

impl PrioritizedSections {
    /// Number of sections over all buckets.
    #[must_use]
    pub fn total_sections(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    /// All sections in rendering order: high, medium, low.
    pub fn iter(&self) -> impl Iterator<Item = &ContentSection> {
        self.high.iter().chain(&self.medium).chain(&self.low)
    }

    fn push(&mut self, section: ContentSection) {
        match PriorityBucket::for_priority(section.priority) {
            PriorityBucket::High => self.high.push(section),
            PriorityBucket::Medium => self.medium.push(section),
            PriorityBucket::Low => self.low.push(section),
        }
    }
}

/// Builds and buckets the sections of `scan` for `task`.
///
/// A summary section is always present. Mod and resource-pack sections appear
/// only when the lists are non-empty, and configs get one section per directory.
pub fn prioritize_sections(scan: &ScanResult, task: TaskType) -> PrioritizedSections {
    let mut all = vec![ContentSection::new("Summary", SectionKind::Summary, task, render_summary(scan))];

    if !scan.mods.is_empty() {
        all.push(ContentSection::new("Mods", SectionKind::Mods, task, render_files(&scan.mods)));
    }

    let mut by_directory: BTreeMap<String, Vec<&ConfigFile>> = BTreeMap::new();
    for config in &scan.configs {
        by_directory.entry(config_directory(&config.relative_path)).or_default().push(config);
    }
    for (directory, configs) in by_directory {
        all.push(ContentSection::new(
            format!("Config: {directory}"),
            SectionKind::Config,
            task,
            render_configs(&configs),
        ));
    }

    if !scan.resource_packs.is_empty() {
        all.push(ContentSection::new(
            "Resource Packs",
            SectionKind::ResourcePacks,
            task,
            render_files(&scan.resource_packs),
        ));
    }

    // Stable sort keeps build order among equal priorities.
    all.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut sections = PrioritizedSections::default();
    for section in all {
        sections.push(section);
    }
    sections
}

/// Renders the task header followed by every section under its own heading.
pub fn generate_optimized_content(sections: &PrioritizedSections, task: TaskType) -> String {
    let (title, focus) = task_header(task);
    let mut out = format!("# {title}\n\n**Focus:** {focus}\n\n");
    for section in sections.iter() {
        let _ = write!(out, "## {}\n\n{}\n\n", section.name, section.content.trim_end());
    }
    out.truncate(out.trim_end().len());
    out.push('\n');
    out
}

fn task_header(task: TaskType) -> (&'static str, &'static str) {
    match task {
        TaskType::Quick => (
            "Quick Modpack Overview",
            "Give a brief overview of the setup and flag anything obviously wrong.",
        ),
        TaskType::Summary => (
            "Modpack Summary",
            "Summarize what is installed and how it is configured.",
        ),
        TaskType::Full => (
            "Full Modpack Analysis",
            "Analyze every mod and configuration file in depth.",
        ),
        TaskType::Conflicts => (
            "Mod Conflict Analysis",
            "Identify conflicts, duplicate mods, incompatible versions and configuration errors.",
        ),
        TaskType::Performance => (
            "Performance Analysis",
            "Identify mods and settings that affect performance, memory use, CPU load and lag.",
        ),
        TaskType::Custom => ("Modpack Analysis", "Answer the request using the scan data below."),
    }
}

fn render_summary(scan: &ScanResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "**Scan Path:** {}", scan.scan_path.display());
    let _ = writeln!(out, "**Scanned At:** {}", scan.timestamp.to_rfc3339());
    let _ = writeln!(out, "**Total Files:** {}", scan.files.len());
    let _ = writeln!(out, "**Total Mods:** {}", scan.mods.len());
    let _ = writeln!(out, "**Total Configs:** {}", scan.configs.len());
    let _ = writeln!(out, "**Total Resource Packs:** {}", scan.resource_packs.len());

    if !scan.errors.is_empty() {
        let _ = writeln!(out, "**Scan Errors:** {}", scan.errors.len());
        for error in &scan.errors {
            let _ = writeln!(out, "- error: {error}");
        }
    }
    if !scan.warnings.is_empty() {
        let _ = writeln!(out, "**Scan Warnings:** {}", scan.warnings.len());
        for warning in &scan.warnings {
            let _ = writeln!(out, "- warning: {warning}");
        }
    }
    out
}

fn render_files(files: &[ScannedFile]) -> String {
    let mut out = String::new();
    for file in files {
        let _ = writeln!(out, "- {} ({})", file.name, format_size(file.size));
    }
    out
}

fn render_configs(configs: &[&ConfigFile]) -> String {
    let mut out = String::new();
    for config in configs {
        let language = config.language.as_deref().unwrap_or("unknown");
        let _ = writeln!(out, "- {} [{language}] ({})", config.name, format_size(config.size));
        if let Some(preview) = &config.preview {
            for line in preview.lines().filter(|l| !l.trim().is_empty()).take(PREVIEW_LINES) {
                let _ = writeln!(out, "  preview: {}", line.trim_end());
            }
        }
    }
    out
}

fn config_directory(relative_path: &Path) -> String {
    relative_path
        .parent()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string())
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    match bytes {
        b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}
