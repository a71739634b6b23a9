use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B[@-_][0-?]*[ -/]*[@-~]").expect("ANSI escape pattern"));

/// Remove terminal escape sequences before handing log text to callers.
pub fn strip_ansi_codes(text: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(text, "").into_owned()
}
