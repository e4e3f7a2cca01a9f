//! Helpers for reading configuration from environment variables with
//! errors that name the offending variable.

use std::{env, fmt::Display, str::FromStr};

use anyhow::{anyhow, Context};

/// Read a required env var.
pub fn var(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{name} was not set"))
}

/// Read an optional env var. Unset and empty are both [`None`].
pub fn opt_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

/// Read an env var, falling back to a default if unset.
pub fn var_or(name: &str, default: &str) -> String {
    opt_var(name).unwrap_or_else(|| default.to_owned())
}

/// Read and parse a required env var.
pub fn parse_var<T>(name: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let value = var(name)?;
    T::from_str(&value)
        .map_err(|err| anyhow!("Invalid {name} '{value}': {err}"))
}

/// Read and parse an env var, falling back to a default if unset.
pub fn parse_var_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match opt_var(name) {
        Some(value) => T::from_str(&value)
            .map_err(|err| anyhow!("Invalid {name} '{value}': {err}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // All env manipulation lives in this one test to avoid racing other
    // tests over process-global state.
    #[test]
    fn read_and_parse() {
        let name = "TOLLGATE_ENV_TEST_VAR";
        std::env::remove_var(name);
        assert!(var(name).is_err());
        assert_eq!(opt_var(name), None);
        assert_eq!(var_or(name, "fallback"), "fallback");
        assert_eq!(parse_var_or::<u16>(name, 7).unwrap(), 7);

        std::env::set_var(name, "42");
        assert_eq!(var(name).unwrap(), "42");
        assert_eq!(parse_var::<u16>(name).unwrap(), 42);
        assert_eq!(parse_var_or::<u16>(name, 7).unwrap(), 42);

        std::env::set_var(name, "not-a-number");
        assert!(parse_var::<u16>(name).is_err());
        assert!(parse_var_or::<u16>(name, 7).is_err());

        std::env::set_var(name, "");
        assert_eq!(opt_var(name), None);

        std::env::remove_var(name);
    }
}
