use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating empty values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Parse an env var into `T`, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse a boolean env var (`true/false`, `1/0`, `yes/no`, `on/off`).
pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{}'", raw),
            }),
        },
        None => Ok(default),
    }
}

pub(crate) fn parse_string_env(key: &str, default: impl Into<String>) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Keys are unique per test so parallel tests never race on the environment.

    #[test]
    fn unset_values_use_defaults() {
        assert_eq!(parse_optional_env("DOCKYARD_TEST_UNSET_NUM", 42u16).unwrap(), 42);
        assert!(parse_bool_env("DOCKYARD_TEST_UNSET_BOOL", true).unwrap());
        assert_eq!(
            parse_string_env("DOCKYARD_TEST_UNSET_STR", "nginx:alpine").unwrap(),
            "nginx:alpine"
        );
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_key() {
        // SAFETY: test-only key not read by any other test.
        unsafe { std::env::set_var("DOCKYARD_TEST_BAD_PORT", "eighty") };
        let err = parse_optional_env::<u16>("DOCKYARD_TEST_BAD_PORT", 80).unwrap_err();
        assert!(err.to_string().contains("DOCKYARD_TEST_BAD_PORT"));
        unsafe { std::env::remove_var("DOCKYARD_TEST_BAD_PORT") };
    }

    #[test]
    fn bool_spellings() {
        unsafe { std::env::set_var("DOCKYARD_TEST_BOOL_SPELLING", "off") };
        assert!(!parse_bool_env("DOCKYARD_TEST_BOOL_SPELLING", true).unwrap());
        unsafe { std::env::set_var("DOCKYARD_TEST_BOOL_SPELLING", "maybe") };
        assert!(parse_bool_env("DOCKYARD_TEST_BOOL_SPELLING", true).is_err());
        unsafe { std::env::remove_var("DOCKYARD_TEST_BOOL_SPELLING") };
    }
}
