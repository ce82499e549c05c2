//! Severity classification of tool output lines
//!
//! Lines look like `<TAG>: [<Category> <code>] message`. The tag decides the
//! severity, except for a deny-list of message ids known to be false
//! positives, which are always downgraded to informational.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

/// Message ids whose severity tag is known to be bogus
pub const BENIGN_MESSAGES: &[(&str, &str)] = &[
    // Closing a project when none is open.
    ("Common", "17-53"),
    // Placer skipping physical synthesis.
    ("Place", "46-29"),
    // Incorrect system task syntax warning.
    ("Synth", "8-1921"),
];

/// Severity of one output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineKind {
    Common,
    Info,
    Warning,
    CriticalWarning,
    Error,
}

impl LineKind {
    /// Whether a line of this kind fails the transaction
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Warning | Self::CriticalWarning | Self::Error)
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "CRITICAL WARNING" => Some(Self::CriticalWarning),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Common => "COMMON",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::CriticalWarning => "CRITICAL WARNING",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// `Category code` pair inside the brackets, e.g. `Synth 8-1921`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub category: String,
    pub code: String,
}

impl MessageId {
    pub fn new(category: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            code: code.into(),
        }
    }
}

impl FromStr for MessageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().rsplit_once(' ') {
            Some((category, code)) if !category.trim().is_empty() && !code.is_empty() => {
                Ok(Self::new(category.trim(), code))
            }
            _ => Err(format!("Invalid message id '{}', expected 'Category code'", s)),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.category, self.code)
    }
}

fn tag_pattern() -> &'static Regex {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    TAG_RE.get_or_init(|| Regex::new(r"^(.+?): \[(.+?)\]").unwrap())
}

/// Line classifier with a configurable deny-list
#[derive(Debug, Clone)]
pub struct Classifier {
    benign: HashSet<MessageId>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            benign: BENIGN_MESSAGES
                .iter()
                .map(|(category, code)| MessageId::new(*category, *code))
                .collect(),
        }
    }
}

impl Classifier {
    /// Built-in deny-list plus `extra` ids
    pub fn with_benign(extra: impl IntoIterator<Item = MessageId>) -> Self {
        let mut classifier = Self::default();
        classifier.benign.extend(extra);
        classifier
    }

    pub fn is_benign(&self, id: &MessageId) -> bool {
        self.benign.contains(id)
    }

    pub fn classify(&self, line: &str) -> LineKind {
        let Some(caps) = tag_pattern().captures(line) else {
            return LineKind::Common;
        };

        let benign = caps[2]
            .parse::<MessageId>()
            .map(|id| self.is_benign(&id))
            .unwrap_or(false);
        if benign {
            return LineKind::Info;
        }

        LineKind::from_tag(&caps[1]).unwrap_or(LineKind::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_lines_are_common() {
        let classifier = Classifier::default();
        assert_eq!(classifier.classify("Vivado% "), LineKind::Common);
        assert_eq!(classifier.classify("\r\n"), LineKind::Common);
        assert_eq!(classifier.classify("Starting synth_design\r\n"), LineKind::Common);
        // Tag must be at the start of the line.
        assert_eq!(classifier.classify("  text ERROR: no brackets\r\n"), LineKind::Common);
    }

    #[test]
    fn test_known_tags() {
        let classifier = Classifier::default();
        assert_eq!(
            classifier.classify("INFO: [Synth 8-256] done synthesizing module 'top'\r\n"),
            LineKind::Info
        );
        assert_eq!(
            classifier.classify("WARNING: [Synth 8-3331] design top has unconnected port\r\n"),
            LineKind::Warning
        );
        assert_eq!(
            classifier.classify("CRITICAL WARNING: [Vivado 12-1411] Cannot set LOC\r\n"),
            LineKind::CriticalWarning
        );
        assert_eq!(classifier.classify("ERROR: [Foo 1-2] broken\r\n"), LineKind::Error);
    }

    #[test]
    fn test_benign_ids_downgraded() {
        let classifier = Classifier::default();
        assert_eq!(
            classifier.classify("WARNING: [Common 17-53] User Exception: No open project\r\n"),
            LineKind::Info
        );
        assert_eq!(classifier.classify("ERROR: [Common 17-53] whatever\r\n"), LineKind::Info);
        assert_eq!(classifier.classify("WARNING: [Place 46-29] skipped\r\n"), LineKind::Info);
        assert_eq!(classifier.classify("WARNING: [Synth 8-1921] system task\r\n"), LineKind::Info);
    }

    #[test]
    fn test_unknown_tag_is_info() {
        let classifier = Classifier::default();
        assert_eq!(classifier.classify("STATUS: [Labtools 27-147] ok\r\n"), LineKind::Info);
    }

    #[test]
    fn test_extra_benign_ids() {
        let classifier = Classifier::with_benign(vec!["Route 35-328".parse().unwrap()]);
        assert_eq!(classifier.classify("WARNING: [Route 35-328] congestion\r\n"), LineKind::Info);
        // Built-ins are kept.
        assert_eq!(classifier.classify("WARNING: [Place 46-29] skipped\r\n"), LineKind::Info);
    }

    #[test]
    fn test_message_id_parsing() {
        let id: MessageId = "Common 17-53".parse().unwrap();
        assert_eq!(id, MessageId::new("Common", "17-53"));
        assert_eq!(id.to_string(), "Common 17-53");
        assert!("NoCode".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_failure_kinds() {
        assert!(!LineKind::Common.is_failure());
        assert!(!LineKind::Info.is_failure());
        assert!(LineKind::Warning.is_failure());
        assert!(LineKind::CriticalWarning.is_failure());
        assert!(LineKind::Error.is_failure());
    }
}
