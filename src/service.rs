use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::anthropic::{generate_cancellable, StoryGenerator};
use crate::error::StoryError;
use crate::export::to_markdown;
use crate::invest::{parse_invest_answer, parse_suggestions, InvestReport, Suggestion};
use crate::models::{GeneratedStory, Section, StoryRecord, StoryRequest, StoryVersion};
use crate::parser::{parse_section, parse_story};
use crate::prompt::{build_invest_prompt, build_section_prompt, build_story_prompt, build_suggestion_prompt};
use crate::validate::{header_violations, validate_story, Violation};

/// Sections a manual edit may not leave blank.
const REQUIRED_ON_EDIT: [Section; 7] = [
    Section::Title,
    Section::Context,
    Section::Objective,
    Section::BusinessRules,
    Section::Apis,
    Section::Objectives,
    Section::AcceptanceCriteria,
];

pub struct StoryService {
    generator: Arc<dyn StoryGenerator>,
}

/// A section rewrite not yet applied to its record.
#[derive(Debug, Clone)]
pub struct Regenerated {
    pub story: GeneratedStory,
    pub warnings: Vec<Violation>,
    pub summary: String,
}

impl StoryService {
    pub fn new(generator: Arc<dyn StoryGenerator>) -> Self {
        Self { generator }
    }

    /// Validates `request`, generates and parses a story, and attaches the
    /// validation findings. The provider is never called for an invalid request.
    pub async fn create_story(
        &self,
        request: StoryRequest,
        cancel: &CancellationToken,
    ) -> Result<StoryRecord, StoryError> {
        let prompt = build_story_prompt(&request)?;
        info!("🚀 Generating story: {}", request.title.trim());
        let started = Instant::now();

        let raw = generate_cancellable(self.generator.as_ref(), &prompt, cancel).await?;
        let parsed = parse_story(&raw);
        let warnings = validate_story(&parsed, &request);
        log_warnings(&warnings);

        let mut story = parsed.story;
        if story.title.is_empty() {
            story.title = request.title.trim().to_string();
        }
        info!(
            "✅ Story generated in {:.1?} ({} sections, {} warnings)",
            started.elapsed(),
            parsed.present.len(),
            warnings.len()
        );
        Ok(StoryRecord::new(request, story, warnings))
    }

    /// Rewrites one section of `record`'s current story. The result is
    /// re-validated as a whole before it is handed back.
    pub async fn regenerate_section(
        &self,
        record: &StoryRecord,
        section: Section,
        cancel: &CancellationToken,
    ) -> Result<Regenerated, StoryError> {
        let prompt = build_section_prompt(&record.request, &record.story, section)?;
        info!("🔄 Regenerating {} of story {}", section.heading(), record.id);

        let raw = generate_cancellable(self.generator.as_ref(), &prompt, cancel).await?;
        let content = parse_section(&raw, section);
        let story = record.story.with_section(section, content);

        let mut warnings = header_violations(&parse_story(&raw).headings);
        warnings.extend(review(&story, &record.request));
        log_warnings(&warnings);

        Ok(Regenerated { story, warnings, summary: format!("Regenerated {}", section.heading()) })
    }

    /// Has the provider score the story against INVEST.
    pub async fn review_invest(&self, record: &StoryRecord, cancel: &CancellationToken) -> Result<InvestReport, StoryError> {
        info!("🧭 Requesting INVEST review of story {}", record.id);
        let raw = generate_cancellable(self.generator.as_ref(), &build_invest_prompt(&record.story), cancel).await?;
        let report = parse_invest_answer(&raw)?;
        info!("✅ INVEST review of story {}: {} overall", record.id, report.overall);
        Ok(report)
    }

    /// Asks the provider for concrete improvements to the story.
    pub async fn suggest_improvements(
        &self,
        record: &StoryRecord,
        cancel: &CancellationToken,
    ) -> Result<Vec<Suggestion>, StoryError> {
        info!("💡 Requesting suggestions for story {}", record.id);
        let raw = generate_cancellable(self.generator.as_ref(), &build_suggestion_prompt(&record.story), cancel).await?;
        let suggestions = parse_suggestions(&raw)?;
        info!("✅ {} suggestion(s) for story {}", suggestions.len(), record.id);
        Ok(suggestions)
    }
}

/// Validates an already-assembled story through its canonical Markdown.
pub fn review(story: &GeneratedStory, request: &StoryRequest) -> Vec<Violation> {
    validate_story(&parse_story(&to_markdown(story)), request)
}

/// Makes an old version current again by appending a copy of it.
pub fn restore_version(record: &mut StoryRecord, number: u32) -> Result<StoryVersion, StoryError> {
    let old = record.version(number).cloned().ok_or(StoryError::VersionNotFound(number))?;
    let restored = record
        .push_version(old.story, old.warnings, format!("Restored version {number}"))
        .clone();
    info!("⏪ Restored story {} to version {}", record.id, number);
    Ok(restored)
}

/// A manual change to some sections of a story.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoryEdit {
    pub sections: HashMap<Section, String>,
    pub note: Option<String>,
}

static TRAILING_SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)[ \t]+$").expect("valid regex"));
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

fn tidy(text: &str) -> String {
    let text = TRAILING_SPACES.replace_all(text, "");
    BLANK_RUNS.replace_all(&text, "\n\n").trim().to_string()
}

/// `Modified Context, Business Rules` style summary, in document order.
fn changes_summary(before: &GeneratedStory, after: &GeneratedStory) -> String {
    let changed: Vec<&str> = Section::ALL
        .into_iter()
        .filter(|s| before.get(*s) != after.get(*s))
        .map(Section::heading)
        .collect();
    if changed.is_empty() {
        "No significant changes".to_string()
    } else {
        format!("Modified {}", changed.join(", "))
    }
}

/// Applies a user edit as a new version. Required sections must stay
/// non-empty; the edited story is re-validated like a generated one.
pub fn apply_edit(record: &mut StoryRecord, edit: StoryEdit) -> Result<StoryVersion, StoryError> {
    if edit.sections.is_empty() {
        return Err(StoryError::Validation(vec!["an edit must change at least one section".to_string()]));
    }
    let story = Section::ALL.into_iter().fold(record.story.clone(), |story, section| match edit.sections.get(&section) {
        Some(content) => story.with_section(section, tidy(content)),
        None => story,
    });

    let problems: Vec<String> = REQUIRED_ON_EDIT
        .into_iter()
        .filter(|s| story.get(*s).is_empty())
        .map(|s| format!("{} must not be empty", s.heading()))
        .collect();
    if !problems.is_empty() {
        return Err(StoryError::Validation(problems));
    }

    let summary = changes_summary(&record.story, &story);
    let warnings = review(&story, &record.request);
    log_warnings(&warnings);
    let version = record.push_version(story, warnings, summary);
    version.note = edit.note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
    let version = version.clone();
    info!("✏️ Edited story {} ({})", record.id, version.summary);
    Ok(version)
}

/// Sets or clears (blank `note`) the remark on one version.
pub fn annotate_version(record: &mut StoryRecord, number: u32, note: &str) -> Result<StoryVersion, StoryError> {
    let version = record.version_mut(number).ok_or(StoryError::VersionNotFound(number))?;
    let note = note.trim();
    version.note = (!note.is_empty()).then(|| note.to_string());
    Ok(version.clone())
}

/// Line diff between two versions' canonical Markdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDiff {
    pub from: u32,
    pub to: u32,
    pub changed_sections: Vec<Section>,
    pub added_lines: usize,
    pub removed_lines: usize,
    pub unified: String,
}

pub fn compare_versions(record: &StoryRecord, from: u32, to: u32) -> Result<VersionDiff, StoryError> {
    let old = record.version(from).ok_or(StoryError::VersionNotFound(from))?;
    let new = record.version(to).ok_or(StoryError::VersionNotFound(to))?;
    let (old_md, new_md) = (to_markdown(&old.story), to_markdown(&new.story));

    let diff = TextDiff::from_lines(&old_md, &new_md);
    let (mut added_lines, mut removed_lines) = (0, 0);
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => added_lines += 1,
            ChangeTag::Delete => removed_lines += 1,
            ChangeTag::Equal => {}
        }
    }
    let unified = diff
        .unified_diff()
        .context_radius(1)
        .header(&format!("version {from}"), &format!("version {to}"))
        .to_string();

    Ok(VersionDiff {
        from,
        to,
        changed_sections: Section::ALL.into_iter().filter(|s| old.story.get(*s) != new.story.get(*s)).collect(),
        added_lines,
        removed_lines,
        unified,
    })
}

fn log_warnings(warnings: &[Violation]) {
    for w in warnings {
        warn!(kind = ?w.kind, "⚠️ {}", w.message);
    }
}
