//! SOAP-note sectioning.
//!
//! Clinical notes are often written as Subjective / Objective / Assessment /
//! Plan. When a note looks like one, it is split into contiguous section
//! spans and each span is chunked on its own, so a chunk never straddles
//! two sections and carries the section it came from.
//!
//! A note counts as SOAP when it has explicit headers (`S:`, `Objective -`,
//! ...) for at least two sections, or when its wording hits the indicator
//! phrases of at least two sections. Header-based notes are split at the
//! header lines; indicator-based notes are split by paragraph.
use serde::{Deserialize, Serialize};

use super::chunker::{Chunker, TextChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Subjective,
    Objective,
    Assessment,
    Plan,
    #[default]
    Unstructured,
}

const STRUCTURED: [Section; 4] = [
    Section::Subjective,
    Section::Objective,
    Section::Assessment,
    Section::Plan,
];

impl Section {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subjective => "subjective",
            Self::Objective => "objective",
            Self::Assessment => "assessment",
            Self::Plan => "plan",
            Self::Unstructured => "unstructured",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "subjective" => Some(Self::Subjective),
            "objective" => Some(Self::Objective),
            "assessment" => Some(Self::Assessment),
            "plan" => Some(Self::Plan),
            "unstructured" => Some(Self::Unstructured),
            _ => None,
        }
    }

    /// Phrases whose presence suggests text belongs to this section.
    #[must_use]
    pub fn indicators(self) -> &'static [&'static str] {
        match self {
            Self::Subjective => &[
                "client reports",
                "client states",
                "patient says",
                "reports feeling",
                "described",
                "expressed",
            ],
            Self::Objective => &[
                "observed",
                "during session",
                "appeared",
                "demonstrated",
                "exhibited",
                "noted",
            ],
            Self::Assessment => &[
                "diagnosis",
                "assessment",
                "impression",
                "clinical opinion",
                "meets criteria",
                "symptoms indicate",
            ],
            Self::Plan => &[
                "homework",
                "intervention",
                "treatment plan",
                "next session",
                "goals",
                "recommended",
                "follow-up",
            ],
            Self::Unstructured => &[],
        }
    }

    fn from_header(word: &str) -> Option<Self> {
        match word {
            "s" | "subjective" => Some(Self::Subjective),
            "o" | "objective" => Some(Self::Objective),
            "a" | "assessment" => Some(Self::Assessment),
            "p" | "plan" => Some(Self::Plan),
            _ => None,
        }
    }
}

impl rusqlite::types::FromSql for Section {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s).ok_or_else(|| {
            rusqlite::types::FromSqlError::Other(format!("unknown note section '{s}'").into())
        })
    }
}

impl rusqlite::types::ToSql for Section {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

/// A contiguous run of a note, in `char` offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionSpan {
    pub section: Section,
    pub char_start: usize,
    pub char_end: usize,
}

/// The section a header line opens, e.g. `"Plan: homework"` or `"S - ..."`.
fn header_section(line: &str) -> Option<Section> {
    let line = line.trim_start();
    let word_len = line
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(line.len());
    let section = Section::from_header(&line[..word_len].to_ascii_lowercase())?;
    let rest = line[word_len..].trim_start_matches([' ', '\t']);
    rest.starts_with([':', '|', '-']).then_some(section)
}

fn indicator_section(text: &str) -> Option<Section> {
    let lower = text.to_lowercase();
    STRUCTURED
        .into_iter()
        .find(|s| s.indicators().iter().any(|k| lower.contains(k)))
}

fn header_count(text: &str) -> usize {
    let mut seen: Vec<Section> = text.lines().filter_map(header_section).collect();
    seen.sort_by_key(|s| *s as u8);
    seen.dedup();
    seen.len()
}

fn indicator_count(text: &str) -> usize {
    let lower = text.to_lowercase();
    STRUCTURED
        .into_iter()
        .filter(|s| s.indicators().iter().any(|k| lower.contains(k)))
        .count()
}

/// Whether `text` reads like a SOAP note.
#[must_use]
pub fn is_soap_note(text: &str) -> bool {
    header_count(text) >= 2 || indicator_count(text) >= 2
}

/// Split `text` into section spans that together cover it exactly.
///
/// Text that is not a SOAP note comes back as a single unstructured span.
#[must_use]
pub fn split_sections(text: &str) -> Vec<SectionSpan> {
    let total = text.chars().count();
    if total == 0 {
        return Vec::new();
    }
    if header_count(text) >= 2 {
        return spans(text, |line, _| header_section(line));
    }
    if indicator_count(text) >= 2 {
        return spans(text, |line, paragraph_start| {
            paragraph_start.then(|| indicator_section(line)).flatten()
        });
    }
    vec![SectionSpan {
        section: Section::Unstructured,
        char_start: 0,
        char_end: total,
    }]
}

/// Walk `text` line by line; `opens(block, at_paragraph_start)` returns the
/// section a block starts, if any. Whitespace-only runs are folded into
/// the span that follows them.
fn spans(text: &str, opens: impl Fn(&str, bool) -> Option<Section>) -> Vec<SectionSpan> {
    let mut out: Vec<SectionSpan> = Vec::new();
    let mut current = Section::Unstructured;
    let mut start = 0;
    let mut pos = 0;
    let mut run = String::new();
    let mut previous_blank = true;

    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    for (i, line) in lines.iter().enumerate() {
        let blank = line.trim().is_empty();
        // For paragraph classification the whole paragraph is inspected
        let block: String = if previous_blank && !blank {
            lines[i..]
                .iter()
                .take_while(|l| !l.trim().is_empty())
                .copied()
                .collect()
        } else {
            (*line).to_string()
        };

        if !blank {
            if let Some(section) = opens(&block, previous_blank) {
                if section != current {
                    if !run.trim().is_empty() {
                        out.push(SectionSpan {
                            section: current,
                            char_start: start,
                            char_end: pos,
                        });
                        start = pos;
                        run.clear();
                    }
                    current = section;
                }
            }
        }

        run.push_str(line);
        pos += line.chars().count();
        previous_blank = blank;
    }

    if pos > start {
        out.push(SectionSpan {
            section: current,
            char_start: start,
            char_end: pos,
        });
    }
    out
}

/// Chunk a note section by section.
///
/// Sequence numbers run across the whole document and offsets refer to the
/// full text. Non-SOAP text chunks exactly like [`Chunker::chunk`].
#[must_use]
pub fn chunk_sections(chunker: &Chunker, text: &str) -> Vec<TextChunk> {
    let spans = split_sections(text);
    if spans.len() <= 1 {
        let section = spans.first().map_or(Section::Unstructured, |s| s.section);
        return chunker
            .chunk(text)
            .into_iter()
            .map(|c| TextChunk { section, ..c })
            .collect();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    for span in spans {
        let body: String = chars[span.char_start..span.char_end].iter().collect();
        for c in chunker.chunk(&body) {
            out.push(TextChunk {
                sequence: out.len(),
                char_start: span.char_start + c.char_start,
                char_end: span.char_start + c.char_end,
                text: c.text,
                section: span.section,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADED: &str = "Session 4, 2024-03-02\n\
        S: Client reports sleeping six hours and less worry about work.\n\
        O: Calm affect, good eye contact, on time.\n\
        A: Generalized anxiety improving with routine.\n\
        P: Continue sleep diary. Review budget worksheet next time.\n";

    fn section_text(text: &str, span: &SectionSpan) -> String {
        text.chars()
            .skip(span.char_start)
            .take(span.char_end - span.char_start)
            .collect()
    }

    #[test]
    fn test_header_detection() {
        assert_eq!(header_section("S: slept well"), Some(Section::Subjective));
        assert_eq!(header_section("  Objective - calm"), Some(Section::Objective));
        assert_eq!(header_section("plan | homework"), Some(Section::Plan));
        assert_eq!(header_section("Sleep: improved"), None);
        assert_eq!(header_section("A note without a colon"), None);
        assert!(is_soap_note(HEADED));
        assert!(!is_soap_note("Patient reports improved sleep. Plan: keep going."));
    }

    #[test]
    fn test_indicator_detection() {
        assert!(is_soap_note(
            "Client reports feeling low.\n\nHomework: daily walk."
        ));
        assert!(!is_soap_note("Discussed budgeting for the holidays."));
    }

    #[test]
    fn test_split_headed_note() {
        let spans = split_sections(HEADED);
        let sections: Vec<Section> = spans.iter().map(|s| s.section).collect();
        assert_eq!(
            sections,
            vec![
                Section::Unstructured,
                Section::Subjective,
                Section::Objective,
                Section::Assessment,
                Section::Plan
            ]
        );
        assert!(section_text(HEADED, &spans[4]).starts_with("P: Continue sleep diary"));

        // Spans tile the note with no gaps
        assert_eq!(spans[0].char_start, 0);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].char_end, pair[1].char_start);
        }
        assert_eq!(spans.last().unwrap().char_end, HEADED.chars().count());
    }

    #[test]
    fn test_split_by_paragraph_indicators() {
        let note = "Client reports feeling overwhelmed at work.\nSleep is short.\n\n\
            Homework: one walk a day, recommended breathing exercise.\n";
        let spans = split_sections(note);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].section, Section::Subjective);
        assert_eq!(spans[1].section, Section::Plan);
        assert!(section_text(note, &spans[0]).contains("Sleep is short."));
    }

    #[test]
    fn test_plain_text_is_one_unstructured_span() {
        let spans = split_sections("Discussed budgeting for the holidays.");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].section, Section::Unstructured);
        assert!(split_sections("").is_empty());
    }

    #[test]
    fn test_chunk_sections_labels_and_offsets() {
        let chunker = Chunker::new(1000, 200).unwrap();
        let chunks = chunk_sections(&chunker, HEADED);
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[4].section, Section::Plan);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence, i);
            let expected: String = HEADED
                .chars()
                .skip(c.char_start)
                .take(c.char_end - c.char_start)
                .collect();
            assert_eq!(c.text, expected);
        }

        // Concatenated sections reproduce the note
        let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rebuilt, HEADED);
    }

    #[test]
    fn test_long_section_is_split_within_section() {
        let subjective = "Client reports a long week. ".repeat(10);
        let note = format!("S: {subjective}\nP: Follow-up in two weeks.\n");
        let chunker = Chunker::new(120, 20).unwrap();
        let chunks = chunk_sections(&chunker, &note);
        assert!(chunks.len() > 2);
        let plan: Vec<_> = chunks.iter().filter(|c| c.section == Section::Plan).collect();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].text, "P: Follow-up in two weeks.\n");
        assert!(
            chunks
                .iter()
                .filter(|c| c.section == Section::Subjective)
                .all(|c| !c.text.contains("Follow-up"))
        );
    }

    #[test]
    fn test_plain_text_matches_chunker() {
        let chunker = Chunker::new(100, 20).unwrap();
        let text = "Sleep improved this week. ".repeat(10);
        let plain = chunker.chunk(&text);
        let sectioned = chunk_sections(&chunker, &text);
        assert_eq!(sectioned, plain);
    }
}
