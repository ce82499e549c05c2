//! Structured report grammars
//!
//! The inspection commands print numbered sections, each introduced by a
//! header of the form
//!
//! ```text
//! 1. Checking no_clock (0)\r\n
//! ------------------------\r\n
//! ```
//!
//! [`split_sections`] finds those sections; the three parsers below apply
//! their own closing rules on top of it. The timing-slack parser does not
//! reject unexpected section counts the way the other two do.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// Phrase the slack report prints when nothing violates
pub const NO_TIMING_PATHS: &str = "No timing paths found.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("Could not parse {report} response: no sections found")]
    NoSections { report: String },

    #[error("Could not parse {report} response: bad section header '{header}'")]
    BadHeader { report: String, header: String },

    #[error("Could not parse {report} response: expected 2 sections, found {found}")]
    SectionCount { report: String, found: usize },

    #[error("Could not parse {report} response: no 'Violations found' line")]
    MissingViolations { report: String },
}

fn header_pattern() -> &'static Regex {
    static HEADER_RE: OnceLock<Regex> = OnceLock::new();
    HEADER_RE.get_or_init(|| Regex::new(r"(?m)^\d+\..+\r\n-+\r\n").unwrap())
}

fn completed_pattern() -> &'static Regex {
    static COMPLETED_RE: OnceLock<Regex> = OnceLock::new();
    COMPLETED_RE.get_or_init(|| Regex::new(r"(?m)^.+completed successfully").unwrap())
}

fn check_count_pattern() -> &'static Regex {
    static COUNT_RE: OnceLock<Regex> = OnceLock::new();
    COUNT_RE.get_or_init(|| Regex::new(r"^\d+\..+\((\d+)\)\r\n").unwrap())
}

fn violations_pattern() -> &'static Regex {
    static VIOLATIONS_RE: OnceLock<Regex> = OnceLock::new();
    VIOLATIONS_RE.get_or_init(|| Regex::new(r"(?m)Violations found: (\d+)\s*$").unwrap())
}

fn timing_report_pattern() -> &'static Regex {
    static TIMING_RE: OnceLock<Regex> = OnceLock::new();
    TIMING_RE.get_or_init(|| Regex::new(r"(?m)^Timing Report\r\n").unwrap())
}

/// Where the last section of a report stops
#[derive(Debug, Clone, Copy)]
pub enum SectionEnd {
    /// Runs to the end of the text
    EndOfText,
    /// Stops at the first line matching the pattern
    Marker(&'static Regex),
}

/// Slice `text` into header-delimited sections.
///
/// Each section runs from its header up to the next header or the end
/// condition, and must carry at least one byte past its header. A section
/// whose end cannot be found is dropped.
pub fn split_sections(text: &str, end: SectionEnd) -> Vec<&str> {
    let headers: Vec<(usize, usize)> = header_pattern()
        .find_iter(text)
        .map(|m| (m.start(), m.end()))
        .collect();

    let mut sections = Vec::new();
    let mut i = 0;
    while i < headers.len() {
        let (start, body_start) = headers[i];

        let next_header = headers[i + 1..]
            .iter()
            .map(|&(s, _)| s)
            .find(|&s| s > body_start);
        let terminator = match end {
            SectionEnd::EndOfText => (text.len() > body_start).then_some(text.len()),
            SectionEnd::Marker(pattern) => pattern
                .find_iter(text)
                .map(|m| m.start())
                .find(|&s| s > body_start),
        };

        let stop = match (next_header, terminator) {
            (Some(h), Some(t)) => h.min(t),
            (Some(h), None) => h,
            (None, Some(t)) => t,
            (None, None) => break,
        };

        sections.push(&text[start..stop]);
        i = headers
            .iter()
            .position(|&(s, _)| s >= stop)
            .unwrap_or(headers.len());
    }
    sections
}

/// One numbered check of `check_timing`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingCheck {
    /// Header line without line terminator
    pub title: String,
    /// Failing endpoints reported in the header's trailing `(N)`
    pub failing: u64,
    /// Full section text including the header
    pub text: String,
}

impl TimingCheck {
    pub fn is_error(&self) -> bool {
        self.failing != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingCheckReport {
    pub checks: Vec<TimingCheck>,
}

impl TimingCheckReport {
    pub fn failures(&self) -> impl Iterator<Item = &TimingCheck> {
        self.checks.iter().filter(|c| c.is_error())
    }

    pub fn passed(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Parse the body of `check_timing`
pub fn parse_timing_checks(text: &str) -> Result<TimingCheckReport, ReportError> {
    let report = "check_timing".to_string();
    let sections = split_sections(text, SectionEnd::EndOfText);
    if sections.is_empty() {
        return Err(ReportError::NoSections { report });
    }

    let mut checks = Vec::with_capacity(sections.len());
    for section in sections {
        let title = section.lines().next().unwrap_or_default().trim_end().to_string();
        let failing = check_count_pattern()
            .captures(section)
            .and_then(|caps| caps[1].parse::<u64>().ok())
            .ok_or_else(|| ReportError::BadHeader {
                report: report.clone(),
                header: title.clone(),
            })?;
        checks.push(TimingCheck {
            title,
            failing,
            text: section.to_string(),
        });
    }
    Ok(TimingCheckReport { checks })
}

/// A DRC or methodology report: summary section, detail section and the
/// authoritative violation count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationReport {
    pub name: String,
    pub summary: String,
    pub detail: String,
    pub violations: u64,
}

impl ViolationReport {
    pub fn passed(&self) -> bool {
        self.violations == 0
    }

    /// Sections in the order they are surfaced to the operator
    pub fn display_sections(&self) -> [&str; 2] {
        [&self.detail, &self.summary]
    }
}

/// Parse the body of `report_drc` / `report_methodology`
pub fn parse_violation_report(name: &str, text: &str) -> Result<ViolationReport, ReportError> {
    let report = format!("Report {}", name);
    let sections = split_sections(text, SectionEnd::Marker(completed_pattern()));
    if sections.len() != 2 {
        return Err(ReportError::SectionCount {
            report,
            found: sections.len(),
        });
    }

    let violations = violations_pattern()
        .captures(text)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .ok_or(ReportError::MissingViolations { report })?;

    Ok(ViolationReport {
        name: name.to_string(),
        summary: sections[0].to_string(),
        detail: sections[1].to_string(),
        violations,
    })
}

/// Result of `report_timing` restricted to negative slack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingSlackReport {
    pub passed: bool,
    /// Text between the first and second `Timing Report` headers (whole body if none)
    pub detail: String,
    /// How many pieces the header split produced
    pub parts: usize,
}

/// Parse the body of `report_timing`.
///
/// Never fails: an unexpected number of `Timing Report` headers is logged and
/// the verdict is taken from the content alone.
pub fn parse_timing_slack(text: &str) -> TimingSlackReport {
    let pattern = timing_report_pattern();
    let parts = pattern.split(text).count();
    if parts != 2 {
        warn!("report_timing produced {} parts, expected 2", parts);
    }

    // Judge the first report only; a body without a header is judged whole.
    let mut pieces = pattern.split(text);
    let preamble = pieces.next().unwrap_or_default();
    let detail = pieces.next().unwrap_or(preamble);

    TimingSlackReport {
        passed: detail.contains(NO_TIMING_PATHS),
        detail: detail.to_string(),
        parts,
    }
}
