use std::fmt::Write;

use crate::error::StoryError;
use crate::export::to_markdown;
use crate::models::{GeneratedStory, Section, StoryRequest, FIBONACCI_SCALE};

pub const MAX_TITLE_LENGTH: usize = 100;
const FORBIDDEN_TITLE_CHARS: &[char] = &['!', '@', '#', '$', '%', '^', '&', '*', '(', ')'];

const CRITICAL_RULES: &str = "\
1. NEVER ADD EMOJIS
   - Titles, section headers, lists and body text are plain text only
   - Corporate, technical register throughout

2. NEVER FABRICATE
   - Use only the data supplied in <input_data>; never invent APIs not mentioned.
   - Do not add endpoints, technologies or business rules that were not provided
   - If something was not provided, do not speculate

3. BE OBJECTIVE AND DIRECT
   - No embellishment or elaborate prose
   - Precise technical language, no excess creativity

4. TECHNICAL FORMAT
   - This is a specification for developers
   - Prefer direct phrasing: \"Implement X\", \"Integrate Y\"";

/// Checks the fields the prompt cannot do without. All problems are reported
/// together so the form can highlight every one of them.
pub fn validate_request(request: &StoryRequest) -> Result<(), StoryError> {
    let mut problems = Vec::new();

    let title = request.title.trim();
    if title.is_empty() {
        problems.push("title is required".to_string());
    } else {
        if title.chars().count() > MAX_TITLE_LENGTH {
            problems.push(format!("title must be at most {MAX_TITLE_LENGTH} characters"));
        }
        if title.contains(FORBIDDEN_TITLE_CHARS) {
            problems.push("title must not contain any of !@#$%^&*()".to_string());
        }
    }

    if request.objective.trim().is_empty() {
        problems.push("objective is required".to_string());
    }

    match request.complexity {
        None => problems.push("complexity is required".to_string()),
        Some(points) if !FIBONACCI_SCALE.contains(&points) => problems.push(format!(
            "complexity must be one of {:?}, got {points}",
            FIBONACCI_SCALE
        )),
        Some(_) => {}
    }

    if StoryRequest::non_blank(&request.acceptance_criteria).next().is_none() {
        problems.push("at least one acceptance criterion is required".to_string());
    }

    if problems.is_empty() { Ok(()) } else { Err(StoryError::Validation(problems)) }
}

fn bullet_list<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let lines: Vec<String> = items.map(|i| format!("- {i}")).collect();
    if lines.is_empty() { "- Not provided".to_string() } else { lines.join("\n") }
}

fn input_data(request: &StoryRequest) -> String {
    let apis: Vec<String> = request.named_apis().map(|a| a.render()).collect();
    // validated callers always have Some
    let complexity = request.complexity.unwrap_or_default();
    format!(
        "<input_data>\n\
<title>{title}</title>\n\n\
<business_rules>\n{rules}\n</business_rules>\n\n\
<apis_and_services>\n{apis}\n</apis_and_services>\n\n\
<objective>{objective}</objective>\n\n\
<complexity>{complexity}</complexity>\n\n\
<acceptance_criteria>\n{criteria}\n</acceptance_criteria>\n\
</input_data>",
        title = request.title.trim(),
        rules = bullet_list(StoryRequest::non_blank(&request.business_rules)),
        apis = bullet_list(apis.iter().map(String::as_str)),
        objective = request.objective.trim(),
        criteria = bullet_list(StoryRequest::non_blank(&request.acceptance_criteria)),
    )
}

/// Renders the full generation prompt for `request`.
pub fn build_story_prompt(request: &StoryRequest) -> Result<String, StoryError> {
    validate_request(request)?;
    let complexity = request.complexity.unwrap_or_default();

    let mut prompt = String::new();
    prompt.push_str(
        "<task>\nYou are a senior Product Owner specialised in agile delivery and high quality technical documentation.\n\
Write a COMPLETE, TECHNICAL and PROFESSIONAL user story that follows the structure below exactly.\n</task>\n\n",
    );
    let _ = write!(prompt, "<critical_rules>\nABSOLUTE RULES (NEVER VIOLATE):\n\n{CRITICAL_RULES}\n</critical_rules>\n\n");
    prompt.push_str(&input_data(request));
    prompt.push_str("\n\n<mandatory_structure>\nTHE STORY MUST CONTAIN EXACTLY THESE SECTIONS, IN THIS ORDER, WITHOUT EMOJIS:\n\n");
    prompt.push_str("1. TITLE (level ##)\n   Format: ## [Task title]\n\n");
    for (n, section) in Section::ALL.into_iter().skip(1).enumerate() {
        let _ = write!(prompt, "{}. {} (level ###)\n   Format: ### {}\n", n + 2, section.heading().to_uppercase(), section.heading());
        let guidance = match section {
            Section::Context => "   Content: current situation, based ONLY on the supplied data\n".to_string(),
            Section::Objective => "   Content: what is to be achieved, based on the supplied objective\n".to_string(),
            Section::BusinessRules => "   Content: EVERY supplied rule as a bullet point, none omitted\n".to_string(),
            Section::Apis => "   Content: EVERY supplied API with its technical use; no other APIs\n".to_string(),
            Section::Objectives => "   Content: technical objectives derived from the supplied objective (bullet points)\n".to_string(),
            Section::AcceptanceCriteria => "   Content: at least 3 criteria, including every supplied criterion\n   \
Use Gherkin where appropriate:\n   AC1 - [criterion name]\n   Given [condition]\n   When [action]\n   Then [expected result]\n   \
Always cover a success case, an error case and a technical validation\n".to_string(),
            Section::TestScenarios => "   Content: at least 3 numbered scenarios, always including:\n   \
1. Success scenario: [objective description]\n   2. Error scenario: [objective description]\n   3. Edge case scenario: [objective description]\n".to_string(),
            Section::Complexity => format!("   Content:\n   Points: {complexity}\n"),
            Section::Title => String::new(),
        };
        prompt.push_str(&guidance);
        prompt.push('\n');
    }
    prompt.push_str("</mandatory_structure>\n\n");
    prompt.push_str(
        "<formatting_rules>\n\
1. Structured Markdown: ## for the title, ### for sections, - or numbers for lists\n\
2. No emojis anywhere: headers, lists, criteria or body text\n\
3. A blank line between sections; sequential numbering for scenarios\n\
</formatting_rules>\n\n",
    );
    prompt.push_str(
        "<quality_checklist>\nBEFORE ANSWERING, VERIFY:\n\
[ ] No emoji present\n\
[ ] All 9 mandatory sections present\n\
[ ] EVERY business rule included\n\
[ ] EVERY supplied API included, and no other\n\
[ ] EVERY supplied acceptance criterion included\n\
[ ] At least 3 acceptance criteria and 3 test scenarios\n\
[ ] Nothing invented\n\
</quality_checklist>\n\n",
    );
    prompt.push_str("Return ONLY the Markdown of the story, with no text before or after it.");

    Ok(prompt)
}

/// Renders a prompt asking the model to rewrite a single `section` of
/// `story`, keeping the original input as the only source of facts.
pub fn build_section_prompt(
    request: &StoryRequest,
    story: &GeneratedStory,
    section: Section,
) -> Result<String, StoryError> {
    validate_request(request)?;
    if section == Section::Title {
        return Err(StoryError::Validation(vec![
            "the title comes from the request and cannot be regenerated".to_string(),
        ]));
    }
    let heading = section.heading();

    Ok(format!(
        "<task>\nRegenerate ONLY the \"{heading}\" section of this story.\n\
Keep every other section and all context from the original story.\n</task>\n\n\
<critical_rules>\n{CRITICAL_RULES}\n</critical_rules>\n\n\
<original_story>\n{original}\n</original_story>\n\n\
{input}\n\n\
<instructions>\n\
1. Read the whole story for context\n\
2. Regenerate ONLY the \"{heading}\" section, at the same level of technical detail\n\
3. Return ONLY that section in Markdown, starting with ### {heading}\n\
</instructions>",
        original = to_markdown(story),
        input = input_data(request),
    ))
}

/// Asks the model to score `story` against the six INVEST criteria and
/// answer with a single JSON object.
pub fn build_invest_prompt(story: &GeneratedStory) -> String {
    format!(
        "<task>\nAssess this user story against the INVEST criteria.\n\
Be OBJECTIVE and TECHNICAL. Do not invent information; use only what the story says.\n</task>\n\n\
<story>\n{story}\n</story>\n\n\
<criteria>\nScore each criterion from 0 to 100:\n\n\
- Independent: can the story be developed without other stories?\n\
- Negotiable: is there room to shape the implementation, or is it rigid?\n\
- Valuable: does it deliver clear business or technical value?\n\
- Estimable: can the effort be estimated with confidence?\n\
- Small: does it fit in one sprint (1-2 weeks)?\n\
- Testable: are the acceptance criteria clear and testable?\n</criteria>\n\n\
<output_format>\nReturn ONLY valid JSON in exactly this shape:\n\
{{\n\
  \"independent\": {{\"score\": 0-100, \"justification\": \"objective explanation\"}},\n\
  \"negotiable\": {{\"score\": 0-100, \"justification\": \"objective explanation\"}},\n\
  \"valuable\": {{\"score\": 0-100, \"justification\": \"objective explanation\"}},\n\
  \"estimable\": {{\"score\": 0-100, \"justification\": \"objective explanation\"}},\n\
  \"small\": {{\"score\": 0-100, \"justification\": \"objective explanation\"}},\n\
  \"testable\": {{\"score\": 0-100, \"justification\": \"objective explanation\"}},\n\
  \"strengths\": [\"strength\"],\n\
  \"weaknesses\": [\"weakness\"],\n\
  \"suggestions\": [\"specific suggestion\"]\n\
}}\n</output_format>\n\n\
Return ONLY the JSON, with no text before or after it.",
        story = to_markdown(story).trim_end(),
    )
}

/// Asks the model for at most five concrete improvements to `story`, as a
/// JSON array.
pub fn build_suggestion_prompt(story: &GeneratedStory) -> String {
    format!(
        "<task>\nAnalyse this technical user story and suggest specific improvements.\n\
Be OBJECTIVE and PRACTICAL. Do not invent anything; use only what the story says.\n</task>\n\n\
<story>\n{story}\n</story>\n\n\
<analysis_points>\n\
1. AMBIGUITY: vague terms, missing technical detail, unclear requirements\n\
2. SIZE: is the story too large (complexity above 13) and how could it be split?\n\
3. MISSING CRITERIA: uncovered scenarios, unhandled errors, absent validations\n\
4. CLARITY: sections needing more detail or concrete examples\n</analysis_points>\n\n\
<output_format>\nReturn ONLY a JSON array in this shape:\n\
[\n\
  {{\n\
    \"type\": \"ambiguity|size|criteria|clarity\",\n\
    \"severity\": \"low|medium|high\",\n\
    \"problem\": \"the specific problem found\",\n\
    \"suggestion\": \"a specific, actionable improvement\",\n\
    \"applicable\": true\n\
  }}\n\
]\n</output_format>\n\n\
At most 5 suggestions, most important first. Return ONLY the JSON, with no text before or after it.",
        story = to_markdown(story).trim_end(),
    )
}
