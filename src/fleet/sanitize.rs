//! Masking of secrets in remote command output.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

const MASK: &str = "***";

const PRIVATE_KEY_PLACEHOLDER: &str = "[REDACTED PRIVATE KEY]";

static PRIVATE_KEY_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)-----BEGIN ([A-Z0-9 ]*)PRIVATE KEY-----.*?-----END ([A-Z0-9 ]*)PRIVATE KEY-----")
        .expect("private key pattern is valid")
});

/// `key=value`, `key: value` and `"key": "value"` forms of well known secret names.
static SECRET_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b((?:[a-z0-9_]*_)?(?:password|passwd|pwd|secret|token|api[_-]?key|access[_-]?key|auth[_-]?token))("?\s*[:=]\s*"?)([^\s"',;]+)"#,
    )
    .expect("secret assignment pattern is valid")
});

static BEARER_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bearer\s+)[a-z0-9\-._~+/]+=*").expect("bearer pattern is valid")
});

static AWS_ACCESS_KEY_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(AKIA|ASIA)[0-9A-Z]{16}\b").expect("aws key pattern is valid")
});

/// Replace secrets in `output` with masked placeholders.
///
/// Returns the input unchanged (borrowed) when nothing matched.
pub fn sanitize_output(output: &str) -> Cow<'_, str> {
    let mut text = Cow::Borrowed(output);

    if PRIVATE_KEY_BLOCK.is_match(&text) {
        text = Cow::Owned(
            PRIVATE_KEY_BLOCK
                .replace_all(&text, PRIVATE_KEY_PLACEHOLDER)
                .into_owned(),
        );
    }

    if SECRET_ASSIGNMENT.is_match(&text) {
        text = Cow::Owned(
            SECRET_ASSIGNMENT
                .replace_all(&text, format!("${{1}}${{2}}{}", MASK).as_str())
                .into_owned(),
        );
    }

    if BEARER_TOKEN.is_match(&text) {
        text = Cow::Owned(
            BEARER_TOKEN
                .replace_all(&text, format!("${{1}}{}", MASK).as_str())
                .into_owned(),
        );
    }

    if AWS_ACCESS_KEY_ID.is_match(&text) {
        text = Cow::Owned(
            AWS_ACCESS_KEY_ID
                .replace_all(&text, "${1}****************")
                .into_owned(),
        );
    }

    text
}
