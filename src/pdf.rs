use crate::error::StoryError;
use crate::export::strip_markdown;
use crate::models::StoryRecord;
use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference};
use std::io::BufWriter;

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const MARGIN_X: f32 = 15.0;
const TOP: f32 = 275.0;
const BOTTOM: f32 = 20.0;
/// Characters per body line at 10pt Helvetica on A4 with the margins above.
const WRAP_WIDTH: usize = 95;

/// Text-only PDF: title block, then every non-empty section, paginated.
pub fn generate_pdf(record: &StoryRecord) -> Result<Vec<u8>, StoryError> {
    let story = &record.story;
    let (doc, page, layer) = PdfDocument::new(
        format!("User Story: {}", truncate(&story.title, 48)),
        Mm(PAGE_WIDTH),
        Mm(PAGE_HEIGHT),
        "Layer 1",
    );
    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| StoryError::Export(format!("pdf font: {e:?}")))?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| StoryError::Export(format!("pdf font: {e:?}")))?;
    let layer = doc.get_page(page).get_layer(layer);
    let mut pages = PageWriter { doc, layer, y: TOP, count: 1 };

    let title = strip_markdown(&story.title);
    for line in wrap(title.trim(), 55) {
        pages.line(&line, 18.0, 8.0, &bold);
    }
    pages.line(
        &format!(
            "Version {} | Updated {} | {} warning(s)",
            record.current_version(),
            record.updated_at.format("%Y-%m-%d %H:%M UTC"),
            record.warnings.len()
        ),
        9.0,
        10.0,
        &font,
    );

    for (section, body) in story.body_sections() {
        if body.trim().is_empty() {
            continue;
        }
        pages.gap(3.0);
        pages.line(section.heading(), 13.0, 7.0, &bold);
        let plain = strip_markdown(body);
        for line in wrap(plain.trim(), WRAP_WIDTH) {
            pages.line(&line, 10.0, 5.0, &font);
        }
    }

    pages.finish()
}

struct PageWriter {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    y: f32,
    count: usize,
}

impl PageWriter {
    fn line(&mut self, text: &str, size: f32, advance: f32, font: &IndirectFontRef) {
        if self.y - advance < BOTTOM {
            self.count += 1;
            let (page, layer) = self.doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), format!("Page {}", self.count));
            self.layer = self.doc.get_page(page).get_layer(layer);
            self.y = TOP;
        }
        if !text.is_empty() {
            self.layer.use_text(text, size, Mm(MARGIN_X), Mm(self.y), font);
        }
        self.y -= advance;
    }

    fn gap(&mut self, mm: f32) {
        self.y -= mm;
    }

    fn finish(self) -> Result<Vec<u8>, StoryError> {
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut writer = BufWriter::new(&mut buf);
            self.doc
                .save(&mut writer)
                .map_err(|e| StoryError::Export(format!("pdf save: {e:?}")))?;
        }
        Ok(buf)
    }
}

/// Greedy word wrap by character count; blank input lines are kept.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut out = Vec::new();
    for raw in text.lines() {
        let mut line = String::new();
        for word in raw.split_whitespace() {
            let needed = if line.is_empty() { word.chars().count() } else { line.chars().count() + 1 + word.chars().count() };
            if needed > width && !line.is_empty() {
                out.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(word);
        }
        out.push(line);
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max).collect::<String>())
    }
}
