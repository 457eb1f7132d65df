use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{Section, StoryRequest};
use crate::parser::{is_decorative, is_emoji, Heading, ParsedStory};

pub const MIN_ACCEPTANCE_CRITERIA: usize = 3;
pub const MIN_TEST_SCENARIOS: usize = 3;

/// Technologies the fabrication check looks for. Best-effort: a name outside
/// this list is only caught when it is listed in the APIs section.
const KNOWN_TECHNOLOGIES: &[&str] = &[
    "Google", "Facebook", "Apple", "Microsoft", "GitHub", "Twitter", "LinkedIn",
    "OAuth", "OpenID", "SAML", "JWT", "Auth0", "Okta", "Keycloak", "Cognito",
    "AWS", "S3", "Lambda", "DynamoDB", "SQS", "SNS", "Azure", "GCP", "Firebase", "Supabase",
    "Stripe", "PayPal", "Braintree", "Adyen", "PagSeguro", "Mercado Pago",
    "Twilio", "SendGrid", "Mailgun", "Slack", "WhatsApp", "Telegram",
    "Kafka", "RabbitMQ", "Redis", "Memcached", "Elasticsearch",
    "PostgreSQL", "MySQL", "MongoDB", "Cassandra", "Oracle", "SQL Server",
    "GraphQL", "gRPC", "WebSocket", "Docker", "Kubernetes", "Terraform",
    "Salesforce", "SAP", "Shopify", "Zendesk", "HubSpot", "OpenAI", "Sentry", "Datadog",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    FormatViolation,
    IncompletenessViolation,
    FabricationViolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub kind: ViolationKind,
    pub section: Option<Section>,
    pub message: String,
}

impl Violation {
    fn new(kind: ViolationKind, section: Option<Section>, message: impl Into<String>) -> Self {
        Self { kind, section, message: message.into() }
    }
}

static GHERKIN_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#{1,6}\s*)?(?:\*\*)?(?:ac|ca|scenario|cen[aá]rio)\s*[-#]?\s*\d+").expect("valid regex")
});
static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[-*+]|\d+[.)])\s+\S").expect("valid regex")
});

/// Counts criteria or scenarios in a section body: `AC1`-style identifiers
/// (bare or as `#### Scenario 1` sub-headings) when present, otherwise
/// top-level list items.
pub fn count_items(body: &str) -> usize {
    let ids = body.lines().filter(|l| GHERKIN_ID.is_match(l)).count();
    if ids > 0 {
        return ids;
    }
    body.lines()
        .filter(|l| {
            let indent = l.len() - l.trim_start().len();
            indent < 2 && LIST_ITEM.is_match(l.trim_start())
        })
        .count()
}

fn missing_scenario_labels(body: &str) -> Vec<&'static str> {
    let lower = body.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    let mut missing = Vec::new();
    if !has(&["success", "sucesso", "happy path"]) {
        missing.push("success");
    }
    if !has(&["error", "erro", "failure", "exception", "exceção", "excecao"]) {
        missing.push("error");
    }
    if !has(&["edge"]) {
        missing.push("edge case");
    }
    missing
}

/// Headers that open with a decorative glyph or carry an emoji anywhere.
/// Typographic punctuation inside the text (dashes, curly quotes) is fine.
pub fn header_violations(headings: &[Heading]) -> Vec<Violation> {
    headings
        .iter()
        .filter_map(|heading| {
            let leading = heading
                .text
                .trim_start_matches(|c: char| c.is_whitespace() || c == '*' || c == '_')
                .chars()
                .next()
                .filter(|c| is_decorative(*c));
            let glyph = leading.or_else(|| heading.text.chars().find(|c| is_emoji(*c)))?;
            Some(Violation::new(
                ViolationKind::FormatViolation,
                heading.section,
                format!("header \"{}\" on line {} is decorated with {:?}", heading.text, heading.line, glyph),
            ))
        })
        .collect()
}

fn format_violations(parsed: &ParsedStory) -> Vec<Violation> {
    let mut found = header_violations(&parsed.headings);
    for (section, body) in parsed.story.body_sections() {
        if let Some(glyph) = body.chars().find(|c| is_emoji(*c)) {
            found.push(Violation::new(
                ViolationKind::FormatViolation,
                Some(section),
                format!("{} contains emoji {:?}", section.heading(), glyph),
            ));
        }
    }
    found
}

fn incompleteness_violations(parsed: &ParsedStory) -> Vec<Violation> {
    let mut found = Vec::new();
    for section in Section::ALL {
        if !parsed.has(section) {
            found.push(Violation::new(
                ViolationKind::IncompletenessViolation,
                Some(section),
                format!("section \"{}\" is missing", section.heading()),
            ));
        }
    }

    if parsed.has(Section::AcceptanceCriteria) {
        let count = count_items(&parsed.story.acceptance_criteria);
        if count < MIN_ACCEPTANCE_CRITERIA {
            found.push(Violation::new(
                ViolationKind::IncompletenessViolation,
                Some(Section::AcceptanceCriteria),
                format!("{count} acceptance criteria found, at least {MIN_ACCEPTANCE_CRITERIA} required"),
            ));
        }
    }

    if parsed.has(Section::TestScenarios) {
        let body = &parsed.story.test_scenarios;
        let count = count_items(body);
        if count < MIN_TEST_SCENARIOS {
            found.push(Violation::new(
                ViolationKind::IncompletenessViolation,
                Some(Section::TestScenarios),
                format!("{count} test scenarios found, at least {MIN_TEST_SCENARIOS} required"),
            ));
        }
        let missing = missing_scenario_labels(body);
        if !missing.is_empty() {
            found.push(Violation::new(
                ViolationKind::IncompletenessViolation,
                Some(Section::TestScenarios),
                format!("test scenarios lack a {} scenario", missing.join(", ")),
            ));
        }
    }
    found
}

fn supplied_api_text(request: &StoryRequest) -> String {
    request
        .named_apis()
        .map(|a| {
            [Some(a.name.as_str()), a.endpoint.as_deref(), a.description.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

static TECHNOLOGY_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    KNOWN_TECHNOLOGIES
        .iter()
        .map(|term| {
            let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term))).expect("valid regex");
            (*term, re)
        })
        .collect()
});

/// Name part of an APIs-section bullet: `- **Name** (GET /x): use` → `Name`.
fn listed_api_name(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    if line.len() - trimmed.len() >= 2 || !LIST_ITEM.is_match(trimmed) {
        return None;
    }
    let item = trimmed.split_once(char::is_whitespace).map(|(_, rest)| rest)?;
    let name = item
        .split([':', '(', '\u{2013}', '\u{2014}'])
        .next()
        .unwrap_or("")
        .split(" - ")
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches(|c: char| c == '*' || c == '_' || c == '`')
        .trim();
    let lower = name.to_lowercase();
    let placeholder = lower.is_empty()
        || lower.starts_with("no ")
        || matches!(lower.as_str(), "none" | "n/a" | "not provided" | "not specified" | "nenhuma" | "nenhum");
    (!placeholder).then(|| name.to_string())
}

fn api_was_supplied(name: &str, request: &StoryRequest) -> bool {
    let wanted = name.to_lowercase();
    request.named_apis().any(|api| {
        let supplied = api.name.trim().to_lowercase();
        supplied.contains(&wanted) || wanted.contains(&supplied)
    })
}

fn fabrication_violations(parsed: &ParsedStory, request: &StoryRequest) -> Vec<Violation> {
    let supplied = supplied_api_text(request);
    let mut flagged: BTreeSet<String> = BTreeSet::new();
    let mut found = Vec::new();

    for line in parsed.story.apis.lines() {
        if let Some(name) = listed_api_name(line) {
            if !api_was_supplied(&name, request) && flagged.insert(name.to_lowercase()) {
                found.push(Violation::new(
                    ViolationKind::FabricationViolation,
                    Some(Section::Apis),
                    format!("API \"{name}\" is listed but was not supplied"),
                ));
            }
        }
    }

    for (section, body) in parsed.story.body_sections() {
        for (term, pattern) in TECHNOLOGY_PATTERNS.iter() {
            if pattern.is_match(body) && !pattern.is_match(&supplied) && flagged.insert(term.to_lowercase()) {
                found.push(Violation::new(
                    ViolationKind::FabricationViolation,
                    Some(section),
                    format!("{} mentions \"{term}\", which is not among the supplied APIs", section.heading()),
                ));
            }
        }
    }
    found
}

/// Runs every check and returns the findings in a stable order: format,
/// incompleteness, fabrication.
pub fn validate_story(parsed: &ParsedStory, request: &StoryRequest) -> Vec<Violation> {
    let mut violations = format_violations(parsed);
    violations.extend(incompleteness_violations(parsed));
    violations.extend(fabrication_violations(parsed, request));
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApiSpec;
    use crate::parser::parse_story;
    use crate::test_support::{oauth_request, OAUTH_STORY};

    fn kinds(violations: &[Violation]) -> Vec<ViolationKind> {
        violations.iter().map(|v| v.kind).collect()
    }

    fn story_with_criteria(criteria: &str) -> String {
        OAUTH_STORY.replace(
            &OAUTH_STORY[OAUTH_STORY.find("AC1 - ").unwrap()..OAUTH_STORY.find("### Suggested").unwrap()],
            &format!("{criteria}\n\n"),
        )
    }

    #[test]
    fn well_formed_story_has_no_violations() {
        let parsed = parse_story(OAUTH_STORY);
        assert_eq!(validate_story(&parsed, &oauth_request()), vec![]);
    }

    #[test]
    fn two_acceptance_criteria_are_incomplete_three_are_not() {
        let two = parse_story(&story_with_criteria("- System validates the token\n- System rejects expired tokens"));
        let violations = validate_story(&two, &oauth_request());
        assert_eq!(kinds(&violations), vec![ViolationKind::IncompletenessViolation]);
        assert_eq!(violations[0].section, Some(Section::AcceptanceCriteria));

        let three = parse_story(&story_with_criteria(
            "- System validates the token\n- System rejects expired tokens\n- System logs failures",
        ));
        assert_eq!(validate_story(&three, &oauth_request()), vec![]);
    }

    #[test]
    fn emoji_in_header_is_a_format_violation() {
        let raw = OAUTH_STORY.replace("### Context", "### 📋 Context");
        let violations = validate_story(&parse_story(&raw), &oauth_request());
        assert_eq!(kinds(&violations), vec![ViolationKind::FormatViolation]);
        assert_eq!(violations[0].section, Some(Section::Context));
    }

    #[test]
    fn emoji_in_body_is_a_format_violation() {
        let raw = OAUTH_STORY.replace("- Session expires after 30 minutes", "- Session expires after 30 minutes ✅");
        let violations = validate_story(&parse_story(&raw), &oauth_request());
        assert_eq!(kinds(&violations), vec![ViolationKind::FormatViolation]);
        assert_eq!(violations[0].section, Some(Section::BusinessRules));
    }

    #[test]
    fn scenarios_need_count_and_labels() {
        let raw = OAUTH_STORY.replace(
            "3. Edge case scenario: token expires during the session and the user is asked to log in again\n",
            "",
        );
        let violations = validate_story(&parse_story(&raw), &oauth_request());
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|v| v.section == Some(Section::TestScenarios)));
        assert!(violations[1].message.contains("edge case"));
    }

    #[test]
    fn missing_section_is_reported() {
        let start = OAUTH_STORY.find("### Technical Objectives").unwrap();
        let end = OAUTH_STORY.find("### Acceptance Criteria").unwrap();
        let raw = format!("{}{}", &OAUTH_STORY[..start], &OAUTH_STORY[end..]);
        let violations = validate_story(&parse_story(&raw), &oauth_request());
        assert_eq!(kinds(&violations), vec![ViolationKind::IncompletenessViolation]);
        assert_eq!(violations[0].section, Some(Section::Objectives));
    }

    #[test]
    fn unsupplied_technology_is_a_fabrication() {
        let raw = OAUTH_STORY.replace(
            "- Google OAuth 2.0 API: user authentication and authorisation",
            "- Google OAuth 2.0 API: user authentication and authorisation\n- Redis: session cache",
        );
        let violations = validate_story(&parse_story(&raw), &oauth_request());
        assert_eq!(kinds(&violations), vec![ViolationKind::FabricationViolation]);
        assert!(violations[0].message.contains("Redis"));
    }

    #[test]
    fn technology_named_in_prose_is_a_fabrication() {
        let raw = OAUTH_STORY.replace(
            "A social login option is required.",
            "A social login option is required. Sessions are cached in Redis.",
        );
        let violations = validate_story(&parse_story(&raw), &oauth_request());
        assert_eq!(kinds(&violations), vec![ViolationKind::FabricationViolation]);
        assert_eq!(violations[0].section, Some(Section::Context));
        assert_eq!(violations[0].message, "Context mentions \"Redis\", which is not among the supplied APIs");
    }

    #[test]
    fn apis_are_fabricated_when_none_were_supplied() {
        let request = StoryRequest { apis: vec![], ..oauth_request() };
        let violations = validate_story(&parse_story(OAUTH_STORY), &request);
        assert!(violations.iter().all(|v| v.kind == ViolationKind::FabricationViolation));
        assert!(violations.iter().any(|v| v.message.contains("Google OAuth 2.0 API")));
    }

    #[test]
    fn supplied_api_description_counts_as_supplied() {
        let mut request = oauth_request();
        request.apis.push(ApiSpec {
            name: "Session store".into(),
            endpoint: None,
            method: None,
            description: Some("backed by Redis".into()),
        });
        let raw = OAUTH_STORY.replace(
            "- Google OAuth 2.0 API: user authentication and authorisation",
            "- Google OAuth 2.0 API: user authentication and authorisation\n- Session store: Redis cache",
        );
        assert_eq!(validate_story(&parse_story(&raw), &request), vec![]);
    }

    #[test]
    fn counts_gherkin_ids_or_list_items() {
        assert_eq!(count_items("AC1 - a\nGiven x\nAC2 - b\n**AC3** - c"), 3);
        assert_eq!(count_items("- a\n  - nested\n- b\n1. c"), 3);
        assert_eq!(count_items("plain prose"), 0);
    }

    #[test]
    fn scenarios_written_as_sub_headings_are_counted() {
        let start = OAUTH_STORY.find("1. Success scenario").unwrap();
        let end = OAUTH_STORY.find("### Complexity").unwrap();
        let scenarios = "#### Scenario 1: Success\nThe user completes the OAuth flow\n\n\
                         #### Scenario 2: Error\nThe user denies permission\n\n\
                         #### Scenario 3: Edge case\nThe token expires mid-session\n\n";
        let raw = format!("{}{}{}", &OAUTH_STORY[..start], scenarios, &OAUTH_STORY[end..]);
        let parsed = parse_story(&raw);
        assert_eq!(count_items(&parsed.story.test_scenarios), 3);
        assert_eq!(validate_story(&parsed, &oauth_request()), vec![]);
    }

    #[test]
    fn typographic_punctuation_in_headers_is_not_decoration() {
        let raw = OAUTH_STORY
            .replace("### Business Rules", "### Business Rules – Checkout")
            .replace("### Context", "### Users’ Context");
        assert_eq!(validate_story(&parse_story(&raw), &oauth_request()), vec![]);

        let arrow = OAUTH_STORY.replace("### Context", "### → Context");
        let violations = validate_story(&parse_story(&arrow), &oauth_request());
        assert_eq!(kinds(&violations), vec![ViolationKind::FormatViolation]);
        assert_eq!(violations[0].section, Some(Section::Context));

        let trailing = OAUTH_STORY.replace("### Objective\n", "### Objective 🎯\n");
        let violations = validate_story(&parse_story(&trailing), &oauth_request());
        assert_eq!(kinds(&violations), vec![ViolationKind::FormatViolation]);
        assert_eq!(violations[0].section, Some(Section::Objective));
    }

    #[test]
    fn placeholder_api_bullets_are_ignored() {
        assert_eq!(listed_api_name("- Not provided"), None);
        assert_eq!(listed_api_name("- **Stripe API** (POST /charges): payments"), Some("Stripe API".into()));
    }
}
