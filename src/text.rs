/// Strip Unicode bidirectional override/isolate control points
/// (U+202A..U+202E, U+2066..U+2069) from user-supplied text before it is
/// stored. These characters can reorder rendered text and are never
/// legitimate content in handles, display names, or post bodies.
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'))
        .collect()
}

pub fn sanitize_opt(input: Option<&str>) -> Option<String> {
    input.map(sanitize)
}

pub fn sanitize_all<I, S>(inputs: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    inputs.into_iter().map(|s| sanitize(s.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_directional_overrides() {
        assert_eq!(sanitize("hi\u{202E}there"), "hithere");
        assert_eq!(sanitize("\u{2066}a\u{2067}b\u{2068}c\u{2069}"), "abc");
        assert_eq!(sanitize("\u{202A}\u{202B}\u{202C}\u{202D}"), "");
    }

    #[test]
    fn leaves_ordinary_text_alone() {
        assert_eq!(sanitize("hello, world"), "hello, world");
        // RTL text itself is fine, only the override controls go.
        assert_eq!(sanitize("שלום"), "שלום");
        assert_eq!(sanitize("emoji 🦋 stays"), "emoji 🦋 stays");
    }

    #[test]
    fn sanitizes_collections() {
        let langs = sanitize_all(vec!["en", "he\u{202E}"]);
        assert_eq!(langs, vec!["en", "he"]);
        assert_eq!(sanitize_opt(Some("a\u{2066}b")), Some("ab".to_string()));
        assert_eq!(sanitize_opt(None), None);
    }
}
