//! Reply grammar and parser.
//!
//! A reply is a sequence of records:
//!
//! ```text
//! Task <N>:
//! - Grade: <int 1-4>
//! - Reference Count In Sources: <text>
//! - Reference Example Links: <text>
//! - Explanation: <text, possibly multi-line>
//! ```
//!
//! The parser is a line-oriented state machine. Markers and labels are only
//! recognised at the start of a line (after optional bullets, heading hashes
//! and markdown emphasis). A record runs from its marker to the next marker or
//! end of text; Explanation runs to the end of its record.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use super::types::{Grade, GradingResult};

// =============================================================================
// Grammar
// =============================================================================

/// The four labelled fields of a record, in reply order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyField {
    Grade,
    ReferenceCount,
    ReferenceLinks,
    Explanation,
}

impl ReplyField {
    pub const ORDER: [ReplyField; 4] = [
        ReplyField::Grade,
        ReplyField::ReferenceCount,
        ReplyField::ReferenceLinks,
        ReplyField::Explanation,
    ];

    /// Canonical label as written in the reply template.
    pub fn label(&self) -> &'static str {
        match self {
            ReplyField::Grade => "Grade",
            ReplyField::ReferenceCount => "Reference Count In Sources",
            ReplyField::ReferenceLinks => "Reference Example Links",
            ReplyField::Explanation => "Explanation",
        }
    }

    /// Placeholder shown after the label in the template.
    pub fn placeholder(&self) -> &'static str {
        match self {
            ReplyField::Grade => "[1-4]",
            ReplyField::ReferenceCount => "[count]",
            ReplyField::ReferenceLinks => "[links]",
            ReplyField::Explanation => "[brief explanation]",
        }
    }

    fn index(&self) -> usize {
        match self {
            ReplyField::Grade => 0,
            ReplyField::ReferenceCount => 1,
            ReplyField::ReferenceLinks => 2,
            ReplyField::Explanation => 3,
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        let normalized = label
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();
        if normalized == "grade" {
            Some(ReplyField::Grade)
        } else if normalized.starts_with("reference count") {
            Some(ReplyField::ReferenceCount)
        } else if normalized.starts_with("reference") && normalized.contains("link") {
            Some(ReplyField::ReferenceLinks)
        } else if normalized == "explanation" {
            Some(ReplyField::Explanation)
        } else {
            None
        }
    }
}

impl fmt::Display for ReplyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `Task 3:` with optional bullet or list number, heading hashes and emphasis.
static MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?:[-*•>]|\d{1,3}[.)])\s+)?(?:#{1,6}\s*)?(?:\*{1,2}|_{1,2})?\s*task\s+(\d{1,6})\s*(?:\*{1,2}|_{1,2})?\s*:",
    )
    .expect("Invalid task marker regex")
});

/// `- **Grade:** 4`, `1. *Grade*: 4`, `* Reference Count In Sources: ~40`, `Explanation**:` ...
static LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?:[-*•]|\d{1,3}[.)])\s+)?(?:\*{1,2}|_{1,2})?\s*(grade|reference\s+count(?:\s+in\s+sources)?|reference\s+(?:example\s+)?links?|explanation)\s*(?:\*{1,2}|_{1,2})?\s*:\s*(?:\*{1,2}|_{1,2})?(.*)$",
    )
    .expect("Invalid field label regex")
});

/// Markdown horizontal rule (`---`, `***`, `___`).
static RULE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:-{3,}|\*{3,}|_{3,}|={3,})\s*$").expect("Invalid rule regex"));

fn match_marker(line: &str) -> Option<u32> {
    MARKER_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn match_label(line: &str) -> Option<(ReplyField, &str)> {
    let caps = LABEL_RE.captures(line)?;
    let field = ReplyField::from_label(caps.get(1)?.as_str())?;
    let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    Some((field, rest))
}

// =============================================================================
// Parsed output
// =============================================================================

/// A well-formed record and the task number its marker carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub task_number: u32,
    pub result: GradingResult,
}

/// Why a record was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordDefect {
    MissingField(ReplyField),
    OutOfOrder {
        expected: ReplyField,
        found: ReplyField,
    },
    InvalidGrade(String),
}

impl fmt::Display for RecordDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordDefect::MissingField(field) => write!(f, "missing field '{field}'"),
            RecordDefect::OutOfOrder { expected, found } => {
                write!(f, "found '{found}' where '{expected}' was expected")
            }
            RecordDefect::InvalidGrade(raw) => write!(f, "invalid grade {raw:?}"),
        }
    }
}

/// A record that started with a marker but was not emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub task_number: u32,
    pub defect: RecordDefect,
}

/// Everything the parser recovered from one reply, in text order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedReply {
    pub records: Vec<ParsedRecord>,
    pub rejected: Vec<RejectedRecord>,
}

impl ParsedReply {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn task_numbers(&self) -> Vec<u32> {
        self.records.iter().map(|r| r.task_number).collect()
    }
}

// =============================================================================
// State machine
// =============================================================================

struct RecordBuilder {
    task_number: u32,
    values: [Option<Vec<String>>; 4],
    current: Option<ReplyField>,
    defect: Option<RecordDefect>,
}

impl RecordBuilder {
    fn new(task_number: u32) -> Self {
        Self {
            task_number,
            values: Default::default(),
            current: None,
            defect: None,
        }
    }

    fn in_explanation(&self) -> bool {
        self.current == Some(ReplyField::Explanation)
    }

    fn open(&mut self, field: ReplyField, first_line: &str) {
        if self.defect.is_some() {
            return;
        }
        let expected = match self.current {
            None => ReplyField::Grade,
            Some(current) => ReplyField::ORDER[(current.index() + 1).min(3)],
        };
        if field != expected {
            self.defect = Some(RecordDefect::OutOfOrder { expected, found: field });
            return;
        }
        self.values[field.index()] = Some(vec![first_line.to_string()]);
        self.current = Some(field);
    }

    fn push_line(&mut self, line: &str) {
        if self.defect.is_some() {
            return;
        }
        if let Some(field) = self.current {
            if let Some(lines) = self.values[field.index()].as_mut() {
                lines.push(line.to_string());
            }
        }
        // Lines between the marker and the Grade label are ignored.
    }

    fn finish(self) -> Result<ParsedRecord, RejectedRecord> {
        let task_number = self.task_number;
        let reject = |defect| RejectedRecord {
            task_number,
            defect,
        };

        if let Some(defect) = self.defect {
            return Err(reject(defect));
        }

        let mut texts: Vec<String> = Vec::with_capacity(4);
        for (field, value) in ReplyField::ORDER.iter().zip(self.values) {
            match value {
                Some(lines) => texts.push(join_value(lines, *field)),
                None => return Err(reject(RecordDefect::MissingField(*field))),
            }
        }

        let grade = parse_grade(&texts[0]).ok_or_else(|| {
            reject(RecordDefect::InvalidGrade(
                texts[0].lines().next().unwrap_or("").to_string(),
            ))
        })?;

        let mut texts = texts.into_iter().skip(1);
        let reference_count = texts.next().unwrap_or_default();
        let reference_links = texts.next().unwrap_or_default();
        let explanation = texts.next().unwrap_or_default();

        Ok(ParsedRecord {
            task_number,
            result: GradingResult {
                grade,
                explanation,
                reference_count,
                reference_links,
            },
        })
    }
}

fn join_value(mut lines: Vec<String>, field: ReplyField) -> String {
    // A rule ends an explanation; text after it is closing remarks.
    if field == ReplyField::Explanation {
        if let Some(cut) = lines.iter().position(|l| RULE_RE.is_match(l)) {
            lines.truncate(cut);
        }
    }
    // Drop trailing blank lines and separators the model puts between records.
    while lines
        .last()
        .is_some_and(|l| l.trim().is_empty() || RULE_RE.is_match(l))
    {
        lines.pop();
    }
    let joined = lines
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    let value = joined.trim();
    match field {
        ReplyField::Explanation => value.to_string(),
        _ => strip_emphasis(value).to_string(),
    }
}

fn strip_emphasis(s: &str) -> &str {
    s.trim_matches(|c: char| c == '*' || c == '_').trim()
}

/// Leading integer of the grade value: "4", "**3**", "[2]", "4/4",
/// "4 (Very commonly used)".
fn parse_grade(value: &str) -> Option<Grade> {
    let first = value.lines().next()?.trim();
    let first = first.trim_start_matches(|c: char| matches!(c, '*' | '_' | '[' | '(' | ' '));
    let digits: String = first.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    // A decimal like "3.5" is not on the scale; anything else after the
    // integer is annotation.
    let mut rest = first[digits.len()..].chars();
    if matches!(rest.next(), Some('.' | ','))
        && rest.next().is_some_and(|c| c.is_ascii_digit())
    {
        return None;
    }
    digits.parse::<u8>().ok().and_then(Grade::new)
}

fn flush_record(builder: RecordBuilder, out: &mut ParsedReply) {
    match builder.finish() {
        Ok(record) => out.records.push(record),
        Err(rejected) => {
            warn!(
                task_number = rejected.task_number,
                defect = %rejected.defect,
                "dropping malformed reply record"
            );
            out.rejected.push(rejected);
        }
    }
}

/// Parse a reply into records, in the order their markers appear.
pub fn parse_reply(raw: &str) -> ParsedReply {
    let mut out = ParsedReply::default();
    let mut current: Option<RecordBuilder> = None;

    for line in raw.lines() {
        if let Some(number) = match_marker(line) {
            if let Some(done) = current.take() {
                flush_record(done, &mut out);
            }
            current = Some(RecordBuilder::new(number));
            continue;
        }

        let Some(builder) = current.as_mut() else {
            continue;
        };

        if builder.in_explanation() {
            builder.push_line(line);
            continue;
        }

        match match_label(line) {
            Some((field, rest)) => builder.open(field, rest),
            None => builder.push_line(line),
        }
    }

    if let Some(done) = current.take() {
        flush_record(done, &mut out);
    }

    debug!(
        records = out.records.len(),
        rejected = out.rejected.len(),
        "parsed reply"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u32, grade: u8) -> String {
        format!(
            "Task {n}:\n- Grade: {grade}\n- Reference Count In Sources: {}\n- Reference Example Links: https://example.org/{n}\n- Explanation: Task {n} explanation.\n",
            n * 10
        )
    }

    #[test]
    fn parses_template_reply() {
        let raw = format!("{}\n{}", record(1, 4), record(2, 2));
        let parsed = parse_reply(&raw);
        assert!(parsed.rejected.is_empty());
        assert_eq!(parsed.task_numbers(), vec![1, 2]);

        let first = &parsed.records[0].result;
        assert_eq!(first.grade.value(), 4);
        assert_eq!(first.reference_count, "10");
        assert_eq!(first.reference_links, "https://example.org/1");
        assert_eq!(first.explanation, "Task 1 explanation.");
        assert_eq!(parsed.records[1].result.grade.value(), 2);
    }

    #[test]
    fn tolerates_markdown_emphasis_and_annotations() {
        let raw = "\
Here is my evaluation.

### **Task 1:** Age in Years
- **Grade:** 4 (Very commonly used)
- **Reference Count In Sources:** Over 1,000
- **Reference Example Links**:
  - https://www.ons.gov.uk/a
  - https://pubmed.ncbi.nlm.nih.gov/b
- **Explanation:** Standard life-stage bands.
They appear in census tables.

---

**Task 2:**
* Grade: [3]
* Reference Count In Sources: dozens
* Reference Example Links: https://scholar.google.com/c
* Explanation: Seen occasionally.
";
        let parsed = parse_reply(raw);
        assert!(parsed.rejected.is_empty(), "{:?}", parsed.rejected);
        assert_eq!(parsed.records.len(), 2);

        let first = &parsed.records[0].result;
        assert_eq!(first.grade.value(), 4);
        assert_eq!(first.reference_count, "Over 1,000");
        assert_eq!(
            first.reference_links,
            "- https://www.ons.gov.uk/a\n  - https://pubmed.ncbi.nlm.nih.gov/b"
        );
        assert_eq!(
            first.explanation,
            "Standard life-stage bands.\nThey appear in census tables."
        );
        assert_eq!(parsed.records[1].result.grade.value(), 3);

        for italic in [
            "Task 1:\n- *Grade:* 4\n- *Reference Count In Sources:* 10\n\
             - *Reference Example Links:* x\n- *Explanation:* y",
            "*Task 1*:\n- *Grade*: 4\n- _Reference Count In Sources_: 10\n\
             - *Reference Example Links*: x\n- *Explanation*: y",
        ] {
            let parsed = parse_reply(italic);
            assert!(parsed.rejected.is_empty(), "{:?}", parsed.rejected);
            let result = &parsed.records[0].result;
            assert_eq!(result.grade.value(), 4);
            assert_eq!(result.reference_count, "10");
            assert_eq!(result.reference_links, "x");
            assert_eq!(result.explanation, "y");
        }
    }

    #[test]
    fn multiline_explanation_stops_at_next_marker() {
        let raw = "Task 1:\n- Grade: 2\n- Reference Count In Sources: 3\n- Reference Example Links: none\n- Explanation: line one\nGrade: this line belongs to the explanation\n\nTask 2:\n- Grade: 1\n- Reference Count In Sources: 0\n- Reference Example Links: none\n- Explanation: unused";
        let parsed = parse_reply(raw);
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(
            parsed.records[0].result.explanation,
            "line one\nGrade: this line belongs to the explanation"
        );
        assert_eq!(parsed.records[1].result.explanation, "unused");
    }

    #[test]
    fn record_missing_a_field_is_rejected() {
        let raw = format!(
            "{}Task 2:\n- Grade: 3\n- Reference Example Links: x\n- Explanation: y\n{}",
            record(1, 4),
            record(3, 1)
        );
        let parsed = parse_reply(&raw);
        assert_eq!(parsed.task_numbers(), vec![1, 3]);
        assert_eq!(
            parsed.rejected,
            vec![RejectedRecord {
                task_number: 2,
                defect: RecordDefect::OutOfOrder {
                    expected: ReplyField::ReferenceCount,
                    found: ReplyField::ReferenceLinks,
                },
            }]
        );
    }

    #[test]
    fn record_cut_off_before_explanation_is_rejected() {
        let raw = "Task 1:\n- Grade: 3\n- Reference Count In Sources: 5\n- Reference Example Links: x";
        let parsed = parse_reply(raw);
        assert!(parsed.is_empty());
        assert_eq!(
            parsed.rejected[0].defect,
            RecordDefect::MissingField(ReplyField::Explanation)
        );
    }

    #[test]
    fn out_of_scale_or_non_numeric_grades_are_rejected() {
        for bad in ["5", "0", "high", "3.5", ""] {
            let raw = format!(
                "Task 1:\n- Grade: {bad}\n- Reference Count In Sources: 1\n- Reference Example Links: x\n- Explanation: y"
            );
            let parsed = parse_reply(&raw);
            assert!(parsed.is_empty(), "grade {bad:?} should be rejected");
            assert!(matches!(
                parsed.rejected[0].defect,
                RecordDefect::InvalidGrade(_)
            ));
        }
    }

    #[test]
    fn text_without_markers_yields_nothing() {
        let parsed = parse_reply(
            "- Grade: 4\n- Reference Count In Sources: 1\n- Reference Example Links: x\n- Explanation: y",
        );
        assert!(parsed.is_empty());
        assert!(parsed.rejected.is_empty());
    }

    #[test]
    fn marker_mid_line_does_not_split_records() {
        let raw = "Task 1:\n- Grade: 4\n- Reference Count In Sources: 1\n- Reference Example Links: x\n- Explanation: unlike Task 2: this one is common";
        let parsed = parse_reply(raw);
        assert_eq!(parsed.records.len(), 1);
        assert!(parsed.records[0].result.explanation.contains("Task 2:"));
    }

    #[test]
    fn crlf_line_endings_are_handled() {
        let raw = record(1, 3).replace('\n', "\r\n");
        let parsed = parse_reply(&raw);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].result.explanation, "Task 1 explanation.");
    }

    #[test]
    fn grade_leading_token() {
        assert_eq!(parse_grade("4").map(|g| g.value()), Some(4));
        assert_eq!(parse_grade("**3**").map(|g| g.value()), Some(3));
        assert_eq!(parse_grade("2 - Very few references").map(|g| g.value()), Some(2));
        assert_eq!(parse_grade("4.").map(|g| g.value()), Some(4));
        assert_eq!(parse_grade("4/4").map(|g| g.value()), Some(4));
        assert_eq!(parse_grade("3/4").map(|g| g.value()), Some(3));
        assert!(parse_grade("3.5").is_none());
        assert!(parse_grade("about 3").is_none());
    }

    #[test]
    fn numbered_list_markers_and_labels() {
        let raw = "\
1. Task 1:
   1. Grade: 4
   2. Reference Count In Sources: 40
   3. Reference Example Links: none
   4. Explanation: common
2) **Task 2:**
   1) Grade: 2
   2) Reference Count In Sources: 1
   3) Reference Example Links: none
   4) Explanation: rare
";
        let parsed = parse_reply(raw);
        assert!(parsed.rejected.is_empty(), "{:?}", parsed.rejected);
        assert_eq!(parsed.task_numbers(), vec![1, 2]);
        assert_eq!(parsed.records[0].result.reference_count, "40");
        assert_eq!(parsed.records[1].result.grade.value(), 2);
    }

    #[test]
    fn closing_remarks_after_a_rule_are_not_explanation() {
        let raw = format!("{}\n---\n\nOverall, these groupings are standard.\n", record(1, 4));
        let parsed = parse_reply(&raw);
        assert_eq!(parsed.records[0].result.explanation, "Task 1 explanation.");
    }
}
