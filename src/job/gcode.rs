//! Token expansion for start/end g-code templates.
//!
//! Any setting can be referenced as a `{setting_key}` placeholder inside
//! the g-code templates. Unknown keys are echoed back literally so the
//! engine sees the original token; nothing in here ever fails the job.

use std::collections::BTreeMap;
use std::fmt;

use regex_lite::Regex;

/// A recorded, non-fatal expansion warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcodeWarning {
    /// A placeholder referenced a key not present in the settings map.
    UnknownKey(String),
    /// A brace group that is not a valid placeholder.
    BadPlaceholder(String),
}

impl fmt::Display for GcodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcodeWarning::UnknownKey(key) => {
                write!(f, "unable to replace '{}' placeholder in start/end gcode", key)
            }
            GcodeWarning::BadPlaceholder(text) => {
                write!(f, "incorrectly formatted placeholder '{}' in start/end gcode", text)
            }
        }
    }
}

/// Expands `{setting_key}` placeholders against a settings map.
pub struct GcodeFormatter {
    pattern: Option<Regex>,
    warnings: Vec<GcodeWarning>,
}

impl GcodeFormatter {
    pub fn new() -> Self {
        Self {
            // A failed compile degrades to verbatim output in expand().
            pattern: Regex::new(r"\{([^{}]*)\}").ok(),
            warnings: Vec::new(),
        }
    }

    /// Expand every placeholder in `template`.
    ///
    /// Unknown keys and malformed placeholders are left in place with a
    /// warning; any other failure returns the template verbatim.
    pub fn expand(&mut self, template: &str, settings: &BTreeMap<String, String>) -> String {
        let Some(pattern) = &self.pattern else {
            return template.to_string();
        };

        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for captures in pattern.captures_iter(template) {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            out.push_str(&template[last..whole.start()]);

            let key = inner.as_str();
            if is_identifier(key) {
                match settings.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        log::warn!("Unable to replace '{}' placeholder in start/end gcode", key);
                        self.warnings.push(GcodeWarning::UnknownKey(key.to_string()));
                        out.push_str(whole.as_str());
                    }
                }
            } else {
                log::warn!("Incorrectly formatted placeholder '{}' in start/end gcode", key);
                self.warnings
                    .push(GcodeWarning::BadPlaceholder(key.to_string()));
                out.push_str(whole.as_str());
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        out
    }

    /// Warnings recorded across all expansions, oldest first.
    pub fn warnings(&self) -> &[GcodeWarning] {
        &self.warnings
    }

    /// Drain the recorded warnings.
    pub fn take_warnings(&mut self) -> Vec<GcodeWarning> {
        std::mem::take(&mut self.warnings)
    }
}

impl Default for GcodeFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
