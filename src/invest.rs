use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::anthropic::GenerationError;
use crate::error::StoryError;
use crate::models::StoryRecord;
use crate::validate::count_items;

/// Cap on provider suggestions kept per request.
pub const MAX_SUGGESTIONS: usize = 5;

const DEPENDENCY_KEYWORDS: &[&str] = &[
    "depends on",
    "blocked by",
    "after the completion of",
    "requires that",
    "waiting for",
    "depende de",
    "depois de",
    "requer que",
    "bloqueada por",
    "aguardar",
];

/// Placeholder until negotiability can be judged by a reviewer.
const NEGOTIABLE_DEFAULT: u8 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Criterion {
    Independent,
    Negotiable,
    Valuable,
    Estimable,
    Small,
    Testable,
}

impl Criterion {
    pub fn label(self) -> &'static str {
        match self {
            Criterion::Independent => "Independence",
            Criterion::Negotiable => "Negotiability",
            Criterion::Valuable => "Value",
            Criterion::Estimable => "Estimability",
            Criterion::Small => "Size",
            Criterion::Testable => "Testability",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InvestStatus {
    Excellent,
    Fair,
    NeedsImprovement,
}

impl InvestStatus {
    fn of(overall: u8) -> Self {
        match overall {
            80.. => InvestStatus::Excellent,
            50..=79 => InvestStatus::Fair,
            _ => InvestStatus::NeedsImprovement,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionScore {
    pub criterion: Criterion,
    pub score: u8,
    pub justification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestReport {
    pub scores: Vec<CriterionScore>,
    pub overall: u8,
    pub status: InvestStatus,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub suggestions: Vec<String>,
}

impl InvestReport {
    fn from_scores(scores: Vec<CriterionScore>, strengths: Vec<String>, weaknesses: Vec<String>, suggestions: Vec<String>) -> Self {
        let overall = match scores.len() {
            0 => 0,
            n => (scores.iter().map(|s| s.score as u32).sum::<u32>() / n as u32) as u8,
        };
        InvestReport { scores, overall, status: InvestStatus::of(overall), strengths, weaknesses, suggestions }
    }
}

/// Local, rule-based INVEST scoring. Never calls the provider.
pub fn score_story(record: &StoryRecord) -> InvestReport {
    let story = &record.story;
    let complexity = record.request.complexity.unwrap_or(0);
    let criteria = count_items(&story.acceptance_criteria);

    let full_text = story
        .body_sections()
        .map(|(_, body)| body)
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase();
    let dependencies: usize = DEPENDENCY_KEYWORDS.iter().map(|k| full_text.matches(k).count()).sum();

    let independent = match dependencies {
        0 => 100,
        1 => 70,
        _ => 40,
    };
    let valuable = match count_items(&story.objectives) {
        0 if story.objective.trim().is_empty() => 30,
        0 | 1 => 70,
        _ => 90,
    };
    let estimable = if complexity > 0 { 100 } else { 20 };
    let small = match complexity {
        0 => 50,
        1..=5 => 100,
        6..=8 => 90,
        9..=13 => 70,
        _ => 30,
    };
    let testable = match criteria {
        0 => 10,
        1 => 50,
        2 => 70,
        _ => 100,
    };

    let scores = vec![
        CriterionScore {
            criterion: Criterion::Independent,
            score: independent,
            justification: match independent {
                80.. => "No explicit dependency on other stories".to_string(),
                50..=79 => "Mentions a dependency but can still be developed on its own".to_string(),
                _ => "Several dependencies may block development".to_string(),
            },
        },
        CriterionScore {
            criterion: Criterion::Negotiable,
            score: NEGOTIABLE_DEFAULT,
            justification: "Negotiability needs a human review".to_string(),
        },
        CriterionScore {
            criterion: Criterion::Valuable,
            score: valuable,
            justification: match valuable {
                80.. => "Technical and business objectives are clearly stated".to_string(),
                50..=79 => "Value is present but could be more explicit".to_string(),
                _ => "Business or technical value is unclear".to_string(),
            },
        },
        CriterionScore {
            criterion: Criterion::Estimable,
            score: estimable,
            justification: if estimable >= 80 {
                "Complexity has been estimated".to_string()
            } else {
                "No complexity estimate".to_string()
            },
        },
        CriterionScore {
            criterion: Criterion::Small,
            score: small,
            justification: match small {
                90.. => format!("{complexity} points fits in one sprint"),
                70..=89 => format!("{complexity} points is at the limit; consider splitting"),
                _ if complexity == 0 => "Size is unknown without an estimate".to_string(),
                _ => format!("{complexity} points is too large; the story should be split"),
            },
        },
        CriterionScore {
            criterion: Criterion::Testable,
            score: testable,
            justification: match testable {
                80.. => "Acceptance criteria are well defined and testable".to_string(),
                50..=79 => "Has some criteria but more would cover edge cases".to_string(),
                _ => "Clear, testable acceptance criteria are missing".to_string(),
            },
        },
    ];

    let strengths = scores
        .iter()
        .filter(|s| s.score >= 80)
        .map(|s| format!("{}: {}%", s.criterion.label(), s.score))
        .collect();
    let weaknesses = scores
        .iter()
        .filter(|s| s.score < 50)
        .map(|s| format!("{}: {}%", s.criterion.label(), s.score))
        .collect();

    let mut suggestions = Vec::new();
    if small < 70 {
        suggestions.push(format!(
            "Consider splitting this story. {complexity} points is too much for one sprint."
        ));
    }
    if testable < 80 {
        suggestions.push(format!(
            "Add acceptance criteria. It currently has {criteria}; at least 3 are recommended."
        ));
    }
    if valuable < 80 {
        suggestions.push("Make the business and technical objectives explicit and measurable.".to_string());
    }
    if independent < 80 {
        suggestions.push("Reduce dependencies on other stories so work can proceed in parallel.".to_string());
    }

    InvestReport::from_scores(scores, strengths, weaknesses, suggestions)
}

#[derive(Debug, Deserialize)]
struct ScoredAnswer {
    #[serde(default)]
    score: f64,
    #[serde(default)]
    justification: String,
}

#[derive(Debug, Deserialize)]
struct InvestAnswer {
    independent: ScoredAnswer,
    negotiable: ScoredAnswer,
    valuable: ScoredAnswer,
    estimable: ScoredAnswer,
    small: ScoredAnswer,
    testable: ScoredAnswer,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    weaknesses: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// One improvement proposed by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub severity: String,
    pub problem: String,
    pub suggestion: String,
    #[serde(default = "applicable_by_default")]
    pub applicable: bool,
}

fn applicable_by_default() -> bool {
    true
}

/// The outermost `open`..`close` span of `raw`, skipping any prose or code
/// fence the model wrapped around its JSON.
fn json_payload(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    (end > start).then(|| &raw[start..=end])
}

fn decode<T: DeserializeOwned>(raw: &str, open: char, close: char) -> Result<T, StoryError> {
    let undecodable = |message: String| {
        StoryError::Generation(GenerationError::Service { status: 200, message })
    };
    let payload = json_payload(raw, open, close)
        .ok_or_else(|| undecodable("answer contained no JSON".to_string()))?;
    serde_json::from_str(payload).map_err(|e| undecodable(format!("undecodable answer: {e}")))
}

/// Turns the provider's INVEST answer into a report on the same scale as
/// [`score_story`]. Scores outside 0..=100 are clamped.
pub fn parse_invest_answer(raw: &str) -> Result<InvestReport, StoryError> {
    let answer: InvestAnswer = decode(raw, '{', '}')?;
    let scores = [
        (Criterion::Independent, answer.independent),
        (Criterion::Negotiable, answer.negotiable),
        (Criterion::Valuable, answer.valuable),
        (Criterion::Estimable, answer.estimable),
        (Criterion::Small, answer.small),
        (Criterion::Testable, answer.testable),
    ]
    .into_iter()
    .map(|(criterion, scored)| CriterionScore {
        criterion,
        score: scored.score.round().clamp(0.0, 100.0) as u8,
        justification: scored.justification.trim().to_string(),
    })
    .collect();
    Ok(InvestReport::from_scores(scores, answer.strengths, answer.weaknesses, answer.suggestions))
}

/// Reads the provider's suggestion array, keeping the first [`MAX_SUGGESTIONS`].
pub fn parse_suggestions(raw: &str) -> Result<Vec<Suggestion>, StoryError> {
    let mut suggestions: Vec<Suggestion> = decode(raw, '[', ']')?;
    suggestions.truncate(MAX_SUGGESTIONS);
    Ok(suggestions)
}
