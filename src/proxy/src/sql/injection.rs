//! Regex-based injection screening. Patterns are precompiled once per
//! policy install; a detector that ends up with zero usable patterns
//! answers "detected" for everything rather than waving traffic through.
//!
//! Known blind spots of the pattern approach: keywords split by inline
//! comments (`UN/**/ION`), CHAR()/hex-literal encodings, and dynamic SQL
//! assembled in prepared-statement variables.

use regex::{Regex, RegexBuilder};
use tracing::warn;

/// Patterns every deployment starts from; the policy file can extend the
/// list through `sql_rules.block_patterns`.
pub const DEFAULT_PATTERNS: &[&str] = &[
    r"union\s+select",
    r"\b(or|and)\s+'[^']*'\s*=\s*'[^']*'",
    r"\b(sleep|benchmark)\s*\(",
    r"\bload_file\s*\(",
    r"into\s+(outfile|dumpfile)",
    r";\s*(drop|delete|update|insert|alter|create|call|prepare|execute|truncate)\b",
    r"--\s*$",
    r"/\*.*\*/",
];

#[derive(Debug, Clone)]
pub struct InjectionCheck {
    pub detected: bool,
    pub matched_pattern: Option<String>,
    pub reason: String,
}

impl InjectionCheck {
    fn clean() -> Self {
        InjectionCheck {
            detected: false,
            matched_pattern: None,
            reason: String::new(),
        }
    }
}

pub struct InjectionDetector {
    patterns: Vec<(String, Regex)>,
    fail_close: bool,
}

impl InjectionDetector {
    /// Compiles each pattern case-insensitively. Patterns that fail to
    /// compile are skipped with a warning; if none survive the detector
    /// enters fail-close mode permanently.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut compiled = Vec::with_capacity(patterns.len());
        for src in patterns {
            let src = src.as_ref();
            match RegexBuilder::new(src).case_insensitive(true).build() {
                Ok(re) => compiled.push((src.to_string(), re)),
                Err(e) => warn!(pattern = src, "skipping invalid injection pattern: {e}"),
            }
        }
        let fail_close = compiled.is_empty();
        if fail_close {
            warn!("injection detector has no valid patterns, failing closed");
        }
        InjectionDetector {
            patterns: compiled,
            fail_close,
        }
    }

    pub fn with_default_patterns() -> Self {
        Self::new(DEFAULT_PATTERNS)
    }

    pub fn is_fail_close(&self) -> bool {
        self.fail_close
    }

    /// First matching pattern wins; its source string is reported so the
    /// block log can name it.
    pub fn check(&self, sql: &str) -> InjectionCheck {
        if self.fail_close {
            return InjectionCheck {
                detected: true,
                matched_pattern: None,
                reason: "no valid patterns loaded".to_string(),
            };
        }
        for (src, re) in &self.patterns {
            if re.is_match(sql) {
                return InjectionCheck {
                    detected: true,
                    matched_pattern: Some(src.clone()),
                    reason: format!("matched pattern: {src}"),
                };
            }
        }
        InjectionCheck::clean()
    }
}
