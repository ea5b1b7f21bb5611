//! Column sanitization, PII masking and secret redaction for log output.
//!
//! Two independent transformations are applied to every string that reaches
//! a log stream:
//!
//! - [`sanitize_column`] keeps the pipe-delimited human format parseable:
//!   control characters become spaces, `|` becomes `¦`, and overlong values
//!   are cut with a trailing `…`.
//! - [`Redactor`] removes credentials (always) and masks email addresses and
//!   long digit runs such as national IDs and phone numbers (per policy).

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// The replacement text for redacted secrets.
const REDACTED: &str = "[REDACTED]";

/// Marker appended to masked fragments.
const MASK: &str = "***";

/// Default maximum length of a sanitized column, in characters.
pub const MAX_COLUMN_CHARS: usize = 2000;

/// Default minimum length of a digit run that is treated as PII.
pub const DEFAULT_PII_MIN_DIGITS: usize = 6;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9._%+-]+)@([A-Za-z0-9.-]+\.[A-Za-z]{2,})").expect("invalid email pattern")
});

static DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+\b").expect("invalid digit pattern"));

/// Credentials that must never reach a log, whatever the PII policy.
static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)(secret|password|passwd|pwd)['"]?\s*[:=]\s*['"]?([^\s'"]{8,})['"]?"#,
        r#"(?i)(access[_-]?token|auth[_-]?token|api[_-]?key)['"]?\s*[:=]\s*['"]?([a-zA-Z0-9_.=-]{20,})['"]?"#,
        r"(?i)bearer\s+([a-zA-Z0-9_.=-]+)",
        r"-----BEGIN\s+(RSA\s+)?PRIVATE\s+KEY-----",
        r"\$(argon2id?|2[aby]|pbkdf2-sha256)\$[^\s]+",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid secret pattern"))
    .collect()
});

/// Masks PII and redacts secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redactor {
    min_digits: usize,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(DEFAULT_PII_MIN_DIGITS)
    }
}

impl Redactor {
    /// `min_digits` is the shortest digit run that gets masked.
    #[must_use]
    pub const fn new(min_digits: usize) -> Self {
        Self { min_digits }
    }

    /// Redact secrets, then mask PII.
    #[must_use]
    pub fn scrub<'a>(&self, input: &'a str) -> Cow<'a, str> {
        match redact_secrets(input) {
            Cow::Borrowed(s) => self.mask_pii(s),
            Cow::Owned(s) => Cow::Owned(self.mask_pii(&s).into_owned()),
        }
    }

    /// Mask email addresses (`ab***@***`) and digit runs of at least
    /// `min_digits` (`12***`).
    #[must_use]
    pub fn mask_pii<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let mut result = Cow::Borrowed(input);
        if EMAIL.is_match(&result) {
            result = Cow::Owned(
                EMAIL
                    .replace_all(&result, |caps: &Captures<'_>| {
                        format!("{}{MASK}@{MASK}", prefix(&caps[1], 2))
                    })
                    .into_owned(),
            );
        }
        if self.min_digits > 0 && DIGIT_RUN.is_match(&result) {
            let min = self.min_digits;
            let masked = DIGIT_RUN.replace_all(&result, |caps: &Captures<'_>| {
                let run = &caps[0];
                if run.chars().count() >= min {
                    format!("{}{MASK}", prefix(run, 2))
                } else {
                    run.to_string()
                }
            });
            if let Cow::Owned(masked) = masked {
                result = Cow::Owned(masked);
            }
        }
        result
    }
}

/// Replace credentials with `[REDACTED]`.
#[must_use]
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    let mut result = Cow::Borrowed(input);
    for pattern in SECRET_PATTERNS.iter() {
        if pattern.is_match(&result) {
            result = Cow::Owned(pattern.replace_all(&result, REDACTED).into_owned());
        }
    }
    result
}

/// Make `input` safe for one column of a pipe-delimited line.
#[must_use]
pub fn sanitize_column(input: &str, max_chars: usize) -> Cow<'_, str> {
    let needs_mapping = input.chars().any(|c| c.is_control() || c == '|');
    let too_long = input.chars().nth(max_chars).is_some();
    if !needs_mapping && !too_long {
        return Cow::Borrowed(input);
    }
    let mut out: String = input
        .chars()
        .take(max_chars)
        .map(|c| match c {
            '|' => '¦',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    if too_long {
        out.push('…');
    }
    Cow::Owned(out)
}

/// Strip control characters from a value headed for a structured record.
/// JSON escaping already keeps the line intact; this keeps log viewers sane.
#[must_use]
pub fn strip_controls(input: &str) -> Cow<'_, str> {
    if input.chars().any(char::is_control) {
        Cow::Owned(
            input
                .chars()
                .map(|c| if c.is_control() { ' ' } else { c })
                .collect(),
        )
    } else {
        Cow::Borrowed(input)
    }
}

fn prefix(s: &str, n: usize) -> &str {
    s.char_indices().nth(n).map_or(s, |(i, _)| &s[..i])
}
