//! DNS label normalisation for user-supplied names.

use uuid::Uuid;

/// Maximum length of a single DNS label.
pub const MAX_LABEL_LEN: usize = 63;

/// Prefix used when a generated hostname is required.
pub const DEFAULT_HOSTNAME_PREFIX: &str = "hangar";

/// Normalises an arbitrary display string into a DNS-label-safe token.
///
/// The input is trimmed and lowercased, every run of characters outside
/// `[a-z0-9]` collapses to a single `-`, leading and trailing dashes are
/// removed, and the result is truncated to [`MAX_LABEL_LEN`] characters.
/// An empty result means the input holds no usable hostname.
///
/// # Examples
///
/// ```
/// use hangar::hostname::sanitize_hostname;
///
/// assert_eq!(sanitize_hostname("My Cool App!!"), "my-cool-app");
/// assert_eq!(sanitize_hostname("  ---  "), "");
/// ```
#[must_use]
pub fn sanitize_hostname(input: &str) -> String {
    let lowered = input.trim().to_lowercase();
    let mut label = String::with_capacity(lowered.len().min(MAX_LABEL_LEN));
    let mut pending_dash = false;

    for ch in lowered.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !label.is_empty() {
                label.push('-');
            }
            pending_dash = false;
            label.push(ch);
        } else {
            pending_dash = true;
        }
    }

    // The label is pure ASCII at this point, so byte truncation is safe.
    label.truncate(MAX_LABEL_LEN);
    while label.ends_with('-') {
        label.pop();
    }
    label
}

/// Returns the sanitised hostname, or a generated `hangar-xxxxxxxx` label when
/// the input sanitises to nothing.
#[must_use]
pub fn hostname_or_default(input: &str, seed: &Uuid) -> String {
    let label = sanitize_hostname(input);
    if !label.is_empty() {
        return label;
    }

    let simple = seed.simple().to_string();
    let suffix: String = simple.chars().take(8).collect();
    format!("{DEFAULT_HOSTNAME_PREFIX}-{suffix}")
}

/// Sanitises each label of a dotted domain name, dropping labels that become
/// empty. Returns `None` when fewer than two labels survive.
#[must_use]
pub fn sanitize_domain(input: &str) -> Option<String> {
    let labels: Vec<String> = input
        .trim()
        .trim_end_matches('.')
        .split('.')
        .map(sanitize_hostname)
        .filter(|label| !label.is_empty())
        .collect();

    if labels.len() < 2 {
        return None;
    }
    Some(labels.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("My Cool App!!", "my-cool-app")]
    #[case("  Nextcloud  ", "nextcloud")]
    #[case("a__b--c", "a-b-c")]
    #[case("--edge--", "edge")]
    #[case("Ünïcode Host", "n-code-host")]
    #[case("", "")]
    #[case("!!!", "")]
    fn sanitizes_examples(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_hostname(input), expected);
    }

    #[rstest]
    #[case("My Cool App!!")]
    #[case("  Nextcloud  ")]
    #[case("-x-")]
    #[case("a.b.c")]
    #[case("Ünïcode Høst 😀 42")]
    #[case("UPPER_snake_Case--9")]
    #[case("\tmixed \n whitespace\r\n")]
    #[case(&"Long Name ".repeat(20))]
    #[case(&format!("{}-tail", "a".repeat(62)))]
    #[case(&format!("{}!!b", "z".repeat(63)))]
    fn sanitized_labels_are_stable_and_well_formed(#[case] input: &str) {
        let label = sanitize_hostname(input);

        assert_eq!(sanitize_hostname(&label), label, "not idempotent for {input:?}");
        assert!(label.len() <= MAX_LABEL_LEN, "{label:?} too long");
        assert!(
            label
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-'),
            "{label:?} has characters outside [a-z0-9-]"
        );
        assert!(!label.starts_with('-') && !label.ends_with('-'), "{label:?}");
    }

    #[test]
    fn truncation_drops_trailing_dash() {
        let input = format!("{}-tail", "a".repeat(62));
        let label = sanitize_hostname(&input);

        assert_eq!(label.len(), 62);
        assert!(!label.ends_with('-'));
    }

    #[test]
    fn default_hostname_used_for_empty_label() {
        let seed = Uuid::nil();
        assert_eq!(hostname_or_default("???", &seed), "hangar-00000000");
        assert_eq!(hostname_or_default("Blog", &seed), "blog");
    }

    #[rstest]
    #[case("Apps.Example.COM", Some("apps.example.com"))]
    #[case("my app.example.com.", Some("my-app.example.com"))]
    #[case("localhost", None)]
    #[case("..", None)]
    fn sanitizes_domains(#[case] input: &str, #[case] expected: Option<&str>) {
        assert_eq!(sanitize_domain(input).as_deref(), expected);
    }
}
