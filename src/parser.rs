use crate::models::{GeneratedStory, Section};

#[derive(Debug, Clone, PartialEq)]
pub struct Heading {
    /// 1-based line number in the raw response.
    pub line: usize,
    pub level: usize,
    pub text: String,
    pub section: Option<Section>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedStory {
    pub story: GeneratedStory,
    pub headings: Vec<Heading>,
    pub present: Vec<Section>,
}

impl ParsedStory {
    pub fn has(&self, section: Section) -> bool {
        self.present.contains(&section)
    }
}

/// Non-ASCII glyph that is neither a letter nor a digit: emoji, pictographs,
/// variation selectors. Accented letters are not decorative.
pub fn is_decorative(c: char) -> bool {
    !c.is_ascii() && !c.is_alphanumeric() && !c.is_whitespace()
}

pub fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F000..=0x1FAFF
        | 0x2600..=0x27BF
        | 0x2B00..=0x2BFF
        | 0xFE0F
    )
}

pub fn strip_decoration(text: &str) -> &str {
    text.trim_matches(|c: char| is_decorative(c) || c.is_whitespace() || c == '*' || c == '_')
}

pub fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        other => other,
    }
}

/// Maps a `###` heading to its section, if it names one.
pub fn classify_heading(text: &str) -> Option<Section> {
    let key: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(fold_accent)
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let has = |needles: &[&str]| needles.iter().any(|n| key.contains(n));

    // order matters: "technical objectives" must win over "objective"
    if has(&["acceptance", "criteri"]) {
        Some(Section::AcceptanceCriteria)
    } else if has(&["scenario", "cenario", "testcase"]) {
        Some(Section::TestScenarios)
    } else if has(&["businessrule", "rule", "regra"]) {
        Some(Section::BusinessRules)
    } else if has(&["technical", "tecnic"]) {
        Some(Section::Objectives)
    } else if has(&["objective", "objetivo", "goal"]) {
        Some(Section::Objective)
    } else if has(&["complexity", "complexidade", "storypoint"]) {
        Some(Section::Complexity)
    } else if has(&["api", "service", "servico", "integration"]) {
        Some(Section::Apis)
    } else if has(&["context", "background", "problem"]) {
        Some(Section::Context)
    } else {
        None
    }
}

fn heading_of(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    // "#hashtag" is not a heading
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some((level, rest.trim().trim_end_matches('#').trim_end()))
}

/// Splits the model's Markdown answer into sections. Never fails: headers
/// are matched loosely and anything unplaced is left for validation.
pub fn parse_story(raw: &str) -> ParsedStory {
    let mut parsed = ParsedStory::default();
    let mut bodies: Vec<(Section, Vec<&str>)> = Vec::new();
    let mut current: Option<Section> = None;
    let mut in_fence = false;

    for (idx, line) in raw.lines().enumerate() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        let heading = if in_fence { None } else { heading_of(line) };

        match heading {
            Some((level, text)) if level <= 2 && !parsed.has(Section::Title) => {
                parsed.story.title = strip_decoration(text).to_string();
                parsed.present.push(Section::Title);
                parsed.headings.push(Heading { line: idx + 1, level, text: text.to_string(), section: Some(Section::Title) });
                current = None;
            }
            Some((level, text)) if level <= 3 => {
                let section = classify_heading(text);
                parsed.headings.push(Heading { line: idx + 1, level, text: text.to_string(), section });
                match section {
                    Some(s) => {
                        if !parsed.has(s) {
                            parsed.present.push(s);
                            bodies.push((s, Vec::new()));
                        }
                        current = Some(s);
                    }
                    None => push_line(&mut bodies, current, line),
                }
            }
            _ => push_line(&mut bodies, current, line),
        }
    }

    for (section, lines) in bodies {
        let content = lines.join("\n").trim().to_string();
        parsed.story = parsed.story.with_section(section, content);
    }
    parsed
}

fn push_line<'a>(bodies: &mut [(Section, Vec<&'a str>)], current: Option<Section>, line: &'a str) {
    if let Some(section) = current {
        if let Some((_, lines)) = bodies.iter_mut().find(|(s, _)| *s == section) {
            lines.push(line);
        }
    }
}

/// Extracts the body of `section` from a single-section answer. Falls back to
/// the whole answer minus any headings when the model omitted the header.
pub fn parse_section(raw: &str, section: Section) -> String {
    let parsed = parse_story(raw);
    if parsed.has(section) {
        return parsed.story.get(section).to_string();
    }
    raw.lines()
        .filter(|line| heading_of(line).is_none())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
