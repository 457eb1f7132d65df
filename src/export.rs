use std::io::{Cursor, Write};
use std::str::FromStr;
use std::sync::LazyLock;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::StoryError;
use crate::models::{GeneratedStory, StoryRecord};
use crate::parser::{fold_accent, is_emoji};
use crate::pdf::generate_pdf;

pub const MAX_FILENAME_LENGTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Txt,
    Markdown,
    Json,
    Pdf,
    Zip,
}

impl FromStr for ExportFormat {
    type Err = StoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "txt" | "text" => Ok(ExportFormat::Txt),
            "md" | "markdown" => Ok(ExportFormat::Markdown),
            "json" => Ok(ExportFormat::Json),
            "pdf" => Ok(ExportFormat::Pdf),
            "zip" => Ok(ExportFormat::Zip),
            _ => Err(StoryError::UnknownFormat(s.to_string())),
        }
    }
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Txt => "txt",
            ExportFormat::Markdown => "md",
            ExportFormat::Json => "json",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Zip => "zip",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ExportFormat::Txt => "text/plain; charset=utf-8",
            ExportFormat::Markdown => "text/markdown; charset=utf-8",
            ExportFormat::Json => "application/json",
            ExportFormat::Pdf => "application/pdf",
            ExportFormat::Zip => "application/zip",
        }
    }

    pub fn render(self, record: &StoryRecord) -> Result<Bytes, StoryError> {
        let bytes = match self {
            ExportFormat::Txt => Bytes::from(to_txt(&record.story)),
            ExportFormat::Markdown => Bytes::from(to_markdown(&record.story)),
            ExportFormat::Json => Bytes::from(to_json(&record.story)?),
            ExportFormat::Pdf => Bytes::from(generate_pdf(record)?),
            ExportFormat::Zip => Bytes::from(to_zip(std::slice::from_ref(record))?),
        };
        Ok(bytes)
    }

    /// Renders several stories as one download: a JSON array, Markdown or
    /// text documents separated by a rule, or one Markdown file per story
    /// inside a ZIP. PDF covers a single story only.
    pub fn render_all(self, records: &[StoryRecord]) -> Result<Bytes, StoryError> {
        if records.is_empty() {
            return Err(StoryError::Validation(vec!["there are no stories to export".to_string()]));
        }
        let bytes = match self {
            ExportFormat::Txt => Bytes::from(join_documents(records, to_txt)),
            ExportFormat::Markdown => Bytes::from(join_documents(records, to_markdown)),
            ExportFormat::Json => {
                let stories: Vec<&GeneratedStory> = records.iter().map(|r| &r.story).collect();
                Bytes::from(serde_json::to_string_pretty(&stories).map_err(|e| StoryError::Export(e.to_string()))?)
            }
            ExportFormat::Zip => Bytes::from(to_zip(records)?),
            ExportFormat::Pdf => {
                return Err(StoryError::Validation(vec![
                    "pdf export covers a single story; use zip for several".to_string(),
                ]))
            }
        };
        Ok(bytes)
    }
}

const DOCUMENT_SEPARATOR: &str = "\n---\n\n";

fn join_documents(records: &[StoryRecord], render: fn(&GeneratedStory) -> String) -> String {
    records.iter().map(|r| render(&r.story)).collect::<Vec<_>>().join(DOCUMENT_SEPARATOR)
}

/// One `stories/story-<n>-<slug>.md` entry per record, deflated.
fn to_zip(records: &[StoryRecord]) -> Result<Vec<u8>, StoryError> {
    let zip_error = |e: zip::result::ZipError| StoryError::Export(format!("zip: {e}"));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (i, record) in records.iter().enumerate() {
        let name = format!("stories/story-{}-{}.md", i + 1, slug(&record.story.title));
        writer.start_file(name, options).map_err(zip_error)?;
        writer
            .write_all(to_markdown(&record.story).as_bytes())
            .map_err(|e| StoryError::Export(format!("zip: {e}")))?;
    }
    Ok(writer.finish().map_err(zip_error)?.into_inner())
}

static EXTRA_BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Canonical Markdown: `##` title, `###` per non-empty section, bodies as-is.
pub fn to_markdown(story: &GeneratedStory) -> String {
    let mut out = String::new();
    if !story.title.is_empty() {
        out.push_str(&format!("## {}\n\n", story.title));
    }
    for (section, body) in story.body_sections() {
        if body.trim().is_empty() {
            continue;
        }
        out.push_str(&format!("### {}\n\n{}\n\n", section.heading(), body.trim()));
    }
    let collapsed = EXTRA_BLANK_LINES.replace_all(&out, "\n\n");
    format!("{}\n", collapsed.trim_end())
}

static MARKDOWN_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?m)^```[^\n]*\n?", ""),
        (r"(?m)^[ \t]{0,3}#{1,6}[ \t]+", ""),
        (r"\*\*(.+?)\*\*", "$1"),
        (r"__(.+?)__", "$1"),
        (r"\*([^*\s][^*]*?)\*", "$1"),
        (r"`([^`]+)`", "$1"),
        (r"\[([^\]]+)\]\([^)]*\)", "$1"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).expect("valid regex"), replacement))
    .collect()
});

pub fn strip_markdown(text: &str) -> String {
    let without_emoji: String = text.chars().filter(|c| !is_emoji(*c)).collect();
    MARKDOWN_RULES
        .iter()
        .fold(without_emoji, |acc, (re, replacement)| re.replace_all(&acc, *replacement).into_owned())
}

/// Plain text: one block per section, section name on its own line.
pub fn to_txt(story: &GeneratedStory) -> String {
    let mut blocks = Vec::new();
    if !story.title.is_empty() {
        blocks.push(strip_markdown(&story.title).trim().to_string());
    }
    for (section, body) in story.body_sections() {
        if body.trim().is_empty() {
            continue;
        }
        blocks.push(format!("{}\n{}", section.heading(), strip_markdown(body).trim()));
    }
    let text = blocks.join("\n\n");
    format!("{}\n", EXTRA_BLANK_LINES.replace_all(&text, "\n\n"))
}

/// Section key → content, keys in document order.
pub fn to_json(story: &GeneratedStory) -> Result<String, StoryError> {
    serde_json::to_string_pretty(story).map_err(|e| StoryError::Export(e.to_string()))
}

pub fn from_json(json: &str) -> Result<GeneratedStory, StoryError> {
    serde_json::from_str(json).map_err(|e| StoryError::Export(e.to_string()))
}

/// Lowercase ASCII slug of `title`, capped at [`MAX_FILENAME_LENGTH`]
/// characters; `story` when nothing usable is left.
fn slug(title: &str) -> String {
    let mut slug = String::new();
    for c in title.chars().flat_map(char::to_lowercase).map(fold_accent) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if (c.is_whitespace() || c == '-' || c == '_') && !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(MAX_FILENAME_LENGTH);
    let slug = slug.trim_matches('-');
    if slug.is_empty() { "story".to_string() } else { slug.to_string() }
}

/// `<slug-of-title>_<YYYYmmdd_HHMMSS>.<ext>`.
pub fn download_filename(title: &str, format: ExportFormat, now: DateTime<Utc>) -> String {
    format!("{}_{}.{}", slug(title), now.format("%Y%m%d_%H%M%S"), format.extension())
}
