//! Command screener: a denylist backstop applied to shell input.
//!
//! Input is tested against a fixed ordered set of regular expressions that
//! describe catastrophic shell operations. Matching is unanchored and
//! case-sensitive; any single hit blocks the input. This is not a security
//! boundary. Isolation of the shell itself belongs to a sandboxing layer.

use regex::Regex;
use shellgate_core::{GateError, GateResult};

/// Built-in patterns, always active.
///
/// | Pattern                  | Blocks                                  |
/// |--------------------------|-----------------------------------------|
/// | `rm\s+-rf\s+/(\W\|$)`    | recursive delete rooted at `/`          |
/// | `:\(\)\{.*\};:`          | the classic shell fork bomb             |
/// | `mkfs\b`                 | filesystem format tools                 |
/// | `dd\s+.*of=/dev/`        | raw writes to block devices             |
pub const BUILTIN_PATTERNS: &[&str] = &[
    r"rm\s+-rf\s+/(?:\W|$)",
    r":\(\)\{.*\};:",
    r"mkfs\b",
    r"dd\s+.*of=/dev/",
];

/// Compiled denylist.
#[derive(Debug, Clone)]
pub struct CommandScreener {
    patterns: Vec<Regex>,
}

impl CommandScreener {
    /// Screener with only the built-in patterns.
    pub fn builtin() -> Self {
        let patterns = BUILTIN_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self { patterns }
    }

    /// Built-in patterns followed by operator-supplied ones.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Config`] if any extra pattern fails to compile.
    pub fn with_extra<S: AsRef<str>>(extra: &[S]) -> GateResult<Self> {
        let mut screener = Self::builtin();
        for pattern in extra {
            let re = Regex::new(pattern.as_ref()).map_err(|e| {
                GateError::Config(format!("invalid screen pattern {:?}: {e}", pattern.as_ref()))
            })?;
            screener.patterns.push(re);
        }
        Ok(screener)
    }

    /// True if any pattern occurs anywhere in `text`.
    pub fn is_dangerous(&self, text: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(text))
    }

    /// Number of active patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

impl Default for CommandScreener {
    fn default() -> Self {
        Self::builtin()
    }
}
