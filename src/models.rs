use serde::{Serialize, Deserialize};
use serde_with::skip_serializing_none;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::validate::Violation;

/// Story points accepted for `StoryRequest::complexity`.
pub const FIBONACCI_SCALE: [u32; 7] = [1, 2, 3, 5, 8, 13, 21];

/// Number of versions retained per story; the oldest is dropped first.
pub const MAX_VERSIONS: usize = 10;

/// Fields a user submits through the story form.
///
/// Every field defaults when absent so a half-filled form reaches request
/// validation instead of failing JSON extraction.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StoryRequest {
    pub title: String,
    pub business_rules: Vec<String>,
    pub apis: Vec<ApiSpec>,
    pub objective: String,
    pub complexity: Option<u32>,
    pub acceptance_criteria: Vec<String>,
}

/// An API or service the story depends on. Accepts either a bare name
/// (`"Stripe Payments API"`) or the full object form.
#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(from = "ApiSpecInput")]
pub struct ApiSpec {
    pub name: String,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ApiSpecInput {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
}

impl From<ApiSpecInput> for ApiSpec {
    fn from(input: ApiSpecInput) -> Self {
        match input {
            ApiSpecInput::Name(name) => ApiSpec::named(name),
            ApiSpecInput::Full { name, endpoint, method, description } => {
                ApiSpec { name, endpoint, method, description }
            }
        }
    }
}

impl ApiSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// One-line rendering used in prompts: `name (METHOD endpoint): description`.
    pub fn render(&self) -> String {
        let mut line = self.name.trim().to_string();
        let method = self.method.as_deref().map(str::trim).filter(|m| !m.is_empty());
        let endpoint = self.endpoint.as_deref().map(str::trim).filter(|e| !e.is_empty());
        match (method, endpoint) {
            (Some(m), Some(e)) => line.push_str(&format!(" ({} {})", m.to_uppercase(), e)),
            (None, Some(e)) => line.push_str(&format!(" ({})", e)),
            (Some(m), None) => line.push_str(&format!(" ({})", m.to_uppercase())),
            (None, None) => {}
        }
        if let Some(d) = self.description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            line.push_str(": ");
            line.push_str(d);
        }
        line
    }
}

impl StoryRequest {
    pub fn non_blank<'a>(items: &'a [String]) -> impl Iterator<Item = &'a str> + 'a {
        items.iter().map(|s| s.trim()).filter(|s| !s.is_empty())
    }

    pub fn named_apis(&self) -> impl Iterator<Item = &ApiSpec> {
        self.apis.iter().filter(|a| !a.name.trim().is_empty())
    }
}

/// One of the nine headed parts of a generated story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Section {
    Title,
    Context,
    Objective,
    BusinessRules,
    Apis,
    Objectives,
    AcceptanceCriteria,
    TestScenarios,
    Complexity,
}

impl Section {
    /// Document order, which is also the JSON export key order.
    pub const ALL: [Section; 9] = [
        Section::Title,
        Section::Context,
        Section::Objective,
        Section::BusinessRules,
        Section::Apis,
        Section::Objectives,
        Section::AcceptanceCriteria,
        Section::TestScenarios,
        Section::Complexity,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Section::Title => "title",
            Section::Context => "context",
            Section::Objective => "objective",
            Section::BusinessRules => "businessRules",
            Section::Apis => "apis",
            Section::Objectives => "objectives",
            Section::AcceptanceCriteria => "acceptanceCriteria",
            Section::TestScenarios => "testScenarios",
            Section::Complexity => "complexity",
        }
    }

    /// Canonical `###` heading text requested from the model.
    pub fn heading(self) -> &'static str {
        match self {
            Section::Title => "Title",
            Section::Context => "Context",
            Section::Objective => "Objective",
            Section::BusinessRules => "Business Rules",
            Section::Apis => "APIs and Services",
            Section::Objectives => "Technical Objectives",
            Section::AcceptanceCriteria => "Acceptance Criteria",
            Section::TestScenarios => "Suggested Test Scenarios",
            Section::Complexity => "Complexity",
        }
    }

    /// Accepts the JSON key or a kebab/snake spelling (`acceptance-criteria`).
    pub fn from_key(raw: &str) -> Option<Section> {
        let wanted: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Section::ALL
            .into_iter()
            .find(|s| s.key().to_ascii_lowercase() == wanted)
    }
}

/// Parsed model output, one body string per section. Never mutated in place:
/// regenerating a section yields a new value via [`GeneratedStory::with_section`].
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedStory {
    pub title: String,
    pub context: String,
    pub objective: String,
    pub business_rules: String,
    pub apis: String,
    pub objectives: String,
    pub acceptance_criteria: String,
    pub test_scenarios: String,
    pub complexity: String,
}

impl GeneratedStory {
    pub fn get(&self, section: Section) -> &str {
        match section {
            Section::Title => &self.title,
            Section::Context => &self.context,
            Section::Objective => &self.objective,
            Section::BusinessRules => &self.business_rules,
            Section::Apis => &self.apis,
            Section::Objectives => &self.objectives,
            Section::AcceptanceCriteria => &self.acceptance_criteria,
            Section::TestScenarios => &self.test_scenarios,
            Section::Complexity => &self.complexity,
        }
    }

    pub fn with_section(&self, section: Section, content: String) -> GeneratedStory {
        let mut next = self.clone();
        let slot = match section {
            Section::Title => &mut next.title,
            Section::Context => &mut next.context,
            Section::Objective => &mut next.objective,
            Section::BusinessRules => &mut next.business_rules,
            Section::Apis => &mut next.apis,
            Section::Objectives => &mut next.objectives,
            Section::AcceptanceCriteria => &mut next.acceptance_criteria,
            Section::TestScenarios => &mut next.test_scenarios,
            Section::Complexity => &mut next.complexity,
        };
        *slot = content;
        next
    }

    /// Sections (other than the title) whose bodies carry all text below the
    /// title, in document order.
    pub fn body_sections(&self) -> impl Iterator<Item = (Section, &str)> {
        Section::ALL
            .into_iter()
            .filter(|s| *s != Section::Title)
            .map(move |s| (s, self.get(s)))
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StoryVersion {
    pub number: u32,
    pub created_at: DateTime<Utc>,
    pub summary: String,
    /// Free-form remark from the user, editable after the fact.
    #[serde(default)]
    pub note: Option<String>,
    pub story: GeneratedStory,
    pub warnings: Vec<Violation>,
}

/// A generated story as held by its session, with its edit history.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StoryRecord {
    pub id: Uuid,
    pub request: StoryRequest,
    pub story: GeneratedStory,
    pub warnings: Vec<Violation>,
    pub versions: Vec<StoryVersion>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoryRecord {
    pub fn new(request: StoryRequest, story: GeneratedStory, warnings: Vec<Violation>) -> Self {
        let now = Utc::now();
        let initial = StoryVersion {
            number: 1,
            created_at: now,
            summary: "Initial version".to_string(),
            note: None,
            story: story.clone(),
            warnings: warnings.clone(),
        };
        Self {
            id: Uuid::new_v4(),
            request,
            story,
            warnings,
            versions: vec![initial],
            created_at: now,
            updated_at: now,
        }
    }

    /// Makes `story` current and appends it to the history, keeping at most
    /// [`MAX_VERSIONS`] entries numbered from 1.
    pub fn push_version(&mut self, story: GeneratedStory, warnings: Vec<Violation>, summary: impl Into<String>) -> &mut StoryVersion {
        let now = Utc::now();
        self.versions.push(StoryVersion {
            number: self.versions.len() as u32 + 1,
            created_at: now,
            summary: summary.into(),
            note: None,
            story: story.clone(),
            warnings: warnings.clone(),
        });
        if self.versions.len() > MAX_VERSIONS {
            let excess = self.versions.len() - MAX_VERSIONS;
            self.versions.drain(..excess);
            for (i, v) in self.versions.iter_mut().enumerate() {
                v.number = i as u32 + 1;
            }
        }
        self.story = story;
        self.warnings = warnings;
        self.updated_at = now;
        let last = self.versions.len() - 1;
        &mut self.versions[last]
    }

    pub fn version(&self, number: u32) -> Option<&StoryVersion> {
        self.versions.iter().find(|v| v.number == number)
    }

    pub fn version_mut(&mut self, number: u32) -> Option<&mut StoryVersion> {
        self.versions.iter_mut().find(|v| v.number == number)
    }

    pub fn current_version(&self) -> u32 {
        self.versions.last().map(|v| v.number).unwrap_or(0)
    }
}
