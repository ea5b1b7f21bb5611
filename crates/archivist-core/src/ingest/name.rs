//! Storage-safe file names that keep Persian and other non-Latin text.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use super::IngestError;

/// Longest file name most filesystems accept, in bytes.
const MAX_NAME_BYTES: usize = 255;

/// Room kept below [`MAX_NAME_BYTES`] for a `_v<N>` suffix, an appended kind
/// extension and the `.b3` sidecar extension.
const NAME_HEADROOM_BYTES: usize = 24;

/// A suffix after the last dot longer than this is not an extension.
const MAX_EXTENSION_BYTES: usize = 16;

/// Arabic code points rewritten to their Persian forms.
const PERSIAN_FOLDS: [(char, char); 2] = [('\u{064A}', '\u{06CC}'), ('\u{0643}', '\u{06A9}')];

/// Derive a storage-safe name from an uploaded file name.
///
/// Names that try to escape the destination directory are rejected rather
/// than repaired. Everything else is normalized to NFC, folded to Persian
/// letter forms, and reduced to letters, digits, combining marks and `._-`.
/// The part before the last dot is bounded to `max_base_chars` characters
/// and the whole name to a byte length that leaves room for versioning and
/// the digest sidecar, cutting on character boundaries.
/// A name with nothing usable left becomes `file_<unix seconds>`.
///
/// # Errors
///
/// [`IngestError::UnsafeName`] for `..` components, absolute paths and
/// drive-letter prefixes.
pub fn safe_name(original: &str, max_base_chars: usize) -> Result<String, IngestError> {
    reject_traversal(original)?;

    let folded: String = original
        .trim()
        .nfc()
        .map(|c| {
            PERSIAN_FOLDS
                .iter()
                .find(|(from, _)| *from == c)
                .map_or(c, |(_, to)| *to)
        })
        .collect();

    let mut name = String::with_capacity(folded.len());
    let mut in_unsafe_run = false;
    for c in folded.chars() {
        if c.is_whitespace() {
            name.push('_');
            in_unsafe_run = false;
        } else if c.is_alphanumeric() || is_combining_mark(c) || matches!(c, '.' | '_' | '-') {
            name.push(c);
            in_unsafe_run = false;
        } else if !in_unsafe_run {
            name.push('_');
            in_unsafe_run = true;
        }
    }

    let name = name.trim_start_matches('.');
    if name.is_empty() {
        return Ok(fallback_name());
    }
    Ok(bound_base(name, max_base_chars))
}

fn reject_traversal(original: &str) -> Result<(), IngestError> {
    let unsafe_name = |reason: &'static str| IngestError::UnsafeName {
        name: original.to_string(),
        reason,
    };
    if original.starts_with('/') || original.starts_with('\\') {
        return Err(unsafe_name("absolute path"));
    }
    let mut chars = original.chars();
    if let (Some(drive), Some(':')) = (chars.next(), chars.next()) {
        if drive.is_ascii_alphabetic() {
            return Err(unsafe_name("drive prefix"));
        }
    }
    if original.split(['/', '\\']).any(|part| part.trim() == "..") {
        return Err(unsafe_name("parent directory component"));
    }
    Ok(())
}

fn bound_base(name: &str, max_base_chars: usize) -> String {
    let byte_budget = MAX_NAME_BYTES - NAME_HEADROOM_BYTES;
    match name.rsplit_once('.') {
        Some((base, ext))
            if !base.is_empty() && !ext.is_empty() && ext.len() <= MAX_EXTENSION_BYTES =>
        {
            let base = truncate(base, max_base_chars, byte_budget - ext.len() - 1);
            format!("{base}.{ext}")
        },
        _ => truncate(name, max_base_chars, byte_budget).to_string(),
    }
}

/// Longest prefix of `s` within both `max_chars` characters and `max_bytes`
/// bytes.
fn truncate(s: &str, max_chars: usize, max_bytes: usize) -> &str {
    let mut end = 0;
    for (i, c) in s.chars().enumerate() {
        let next = end + c.len_utf8();
        if i == max_chars || next > max_bytes {
            break;
        }
        end = next;
    }
    &s[..end]
}

fn fallback_name() -> String {
    format!("file_{}", crate::time::unix_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 120;

    #[test]
    fn keeps_persian_and_folds_arabic_forms() {
        let name = safe_name("پايان نامه كامل.pdf", MAX).expect("safe");
        assert_eq!(name, "پایان_نامه_کامل.pdf");
    }

    #[test]
    fn nfc_normalizes() {
        let decomposed = "cafe\u{0301}.pdf";
        assert_eq!(safe_name(decomposed, MAX).expect("safe"), "caf\u{00E9}.pdf");
    }

    #[test]
    fn replaces_unsafe_runs_and_strips_leading_dots() {
        assert_eq!(safe_name("..hidden.pdf", MAX).expect("safe"), "hidden.pdf");
        assert_eq!(safe_name("a*?<>b.jpg", MAX).expect("safe"), "a_b.jpg");
        assert_eq!(safe_name("dir/report.pdf", MAX).expect("safe"), "dir_report.pdf");
    }

    #[test]
    fn rejects_traversal() {
        for bad in ["../etc/passwd", "a/../b.pdf", "/etc/passwd", "\\share\\x.pdf", "C:evil.pdf", "c:\\x.pdf"] {
            assert!(
                matches!(safe_name(bad, MAX), Err(IngestError::UnsafeName { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn bounds_base_and_keeps_extension() {
        let long = format!("{}.pdf", "b".repeat(300));
        let name = safe_name(&long, MAX).expect("safe");
        assert!(name.ends_with(".pdf"));
        assert_eq!(name.chars().count(), MAX + 4);

        let no_ext = "x".repeat(200);
        assert_eq!(safe_name(&no_ext, 10).expect("safe"), "x".repeat(10));
    }

    #[test]
    fn multibyte_names_fit_the_filesystem_limit() {
        for script in ["論", "ب", "한"] {
            let long = format!("{}.pdf", script.repeat(150));
            let name = safe_name(&long, MAX).expect("safe");
            assert!(name.ends_with(".pdf"), "{name}");
            assert!(name.len() + NAME_HEADROOM_BYTES <= MAX_NAME_BYTES, "{} bytes", name.len());
            assert!(name.starts_with(script));
        }
    }

    #[test]
    fn overlong_extension_is_bounded_with_the_name() {
        let name = safe_name(&format!("a.{}", "x".repeat(400)), MAX).expect("safe");
        assert_eq!(name.chars().count(), MAX);
        assert!(name.starts_with("a.x"));
    }

    #[test]
    fn empty_falls_back() {
        for empty in ["", "...", "   "] {
            let name = safe_name(empty, MAX).expect("safe");
            assert!(name.starts_with("file_"), "{empty:?} gave {name}");
        }
    }
}
