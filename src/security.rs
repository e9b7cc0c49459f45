use std::sync::LazyLock;

use regex::Regex;

const MASK: &str = "***";

static CREDENTIAL_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?P<key>password|passphrase|passwd|token)(?P<sep>\s*[:=]\s*)[^\s"']+"#)
        .expect("invalid credential assignment regex")
});

static PRIVATE_KEY_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----")
        .expect("invalid private key block regex")
});

/// Masks the given secret values, `password=...` style assignments and
/// PEM private key blocks. Longer secrets are masked first so a secret that
/// contains another one is never half-revealed.
pub fn redact_text(input: &str, secrets: &[String]) -> String {
    let mut ordered = secrets
        .iter()
        .map(String::as_str)
        .filter(|secret| !secret.trim().is_empty())
        .collect::<Vec<_>>();
    ordered.sort_by_key(|secret| std::cmp::Reverse(secret.len()));

    let masked = ordered
        .into_iter()
        .fold(input.to_string(), |text, secret| text.replace(secret, MASK));
    let masked = CREDENTIAL_ASSIGNMENT.replace_all(&masked, format!("${{key}}${{sep}}{MASK}"));
    PRIVATE_KEY_BLOCK
        .replace_all(&masked, "[REDACTED_PRIVATE_KEY]")
        .into_owned()
}
