//! Environment variable interpolation for job configuration files.
//!
//! Recognised forms:
//! - `${VAR}` - value of `VAR`, error if unset
//! - `${VAR:-default}` - `default` when `VAR` is unset or empty
//! - `$$` - a literal `$`
//!
//! Any other `$` is left untouched so values such as JDBC-style placeholders
//! survive unchanged.

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .expect("placeholder pattern is valid")
});

/// Outcome of interpolating a configuration document.
#[derive(Debug)]
pub struct InterpolationResult {
    /// Text with every resolvable placeholder substituted.
    pub text: String,
    /// One message per placeholder that could not be resolved.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    /// Returns true if every placeholder resolved.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Substitute environment variables into `input`.
///
/// Errors are collected rather than returned on the first miss so a single
/// run reports every missing variable.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();

    let text = PLACEHOLDER
        .replace_all(input, |caps: &Captures<'_>| resolve(caps, &mut errors))
        .into_owned();

    InterpolationResult { text, errors }
}

fn resolve(caps: &Captures<'_>, errors: &mut Vec<String>) -> String {
    let Some(name) = caps.get(1).map(|m| m.as_str()) else {
        return "$".to_string();
    };
    let default = caps.get(3).map(|m| m.as_str());

    match (env::var(name), default) {
        (Ok(value), _) if value.contains(['\n', '\r']) => {
            errors.push(format!("environment variable '{name}' contains a newline"));
            caps[0].to_string()
        }
        (Ok(value), Some(default)) if value.is_empty() => default.to_string(),
        (Ok(value), _) => value,
        (Err(_), Some(default)) => default.to_string(),
        (Err(_), None) => {
            errors.push(format!("environment variable '{name}' is not set"));
            caps[0].to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitutes_braced_variable() {
        // SAFETY: the variable name is unique to this test.
        unsafe { env::set_var("TABLETSINK_TEST_MASTER", "master-1:7051") };
        let result = interpolate("master: ${TABLETSINK_TEST_MASTER}");
        assert!(result.is_ok());
        assert_eq!(result.text, "master: master-1:7051");
    }

    #[test]
    fn test_missing_variable_is_reported() {
        // SAFETY: the variable name is unique to this test.
        unsafe { env::remove_var("TABLETSINK_TEST_ABSENT") };
        let result = interpolate("a: ${TABLETSINK_TEST_ABSENT}\nb: ${TABLETSINK_TEST_ABSENT}");
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].contains("TABLETSINK_TEST_ABSENT"));
        assert!(result.text.contains("${TABLETSINK_TEST_ABSENT}"));
    }

    #[test]
    fn test_default_applies_to_unset_and_empty() {
        // SAFETY: the variable names are unique to this test.
        unsafe {
            env::remove_var("TABLETSINK_TEST_UNSET");
            env::set_var("TABLETSINK_TEST_EMPTY", "");
        }
        let result = interpolate("${TABLETSINK_TEST_UNSET:-500} ${TABLETSINK_TEST_EMPTY:-250}");
        assert!(result.is_ok());
        assert_eq!(result.text, "500 250");
    }

    #[test]
    fn test_escape_and_bare_dollar() {
        let result = interpolate("cost: $$5 and $bare");
        assert!(result.is_ok());
        assert_eq!(result.text, "cost: $5 and $bare");
    }
}
