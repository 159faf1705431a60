//! Normalized mount process arguments.
//!
//! Arguments arrive as a mix of `--key=value`, `--key value`, and bare
//! `--key` flags. [`MountArgs`] normalizes them into a keyed set so
//! individual options can be inspected, overridden, or relocated into the
//! environment before the final command line is rendered.

use std::collections::BTreeMap;

/// Retry count option; moved into the environment rather than passed on the
/// command line.
pub const ARG_AWS_MAX_ATTEMPTS: &str = "--aws-max-attempts";
/// User agent prefix option, always set by the driver.
pub const ARG_USER_AGENT_PREFIX: &str = "--user-agent-prefix";

/// A keyed set of mount process arguments. An empty value renders as a bare
/// flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountArgs {
    inner: BTreeMap<String, String>,
}

impl MountArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw argument list. `--key=value` splits on the first `=`;
    /// anything else is a bare flag.
    pub fn parse<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = Self::new();
        for arg in raw {
            let arg = arg.as_ref();
            match arg.split_once('=') {
                Some((key, value)) => args.set(key, value),
                None => args.set(arg, ""),
            }
        }
        args
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(key.into(), value.into());
    }

    /// Remove an argument, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.inner.remove(key)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Render the final command line, sorted by key for stable output.
    pub fn sorted(&self) -> Vec<String> {
        self.inner
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{key}={value}")
                }
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_and_bare_flags() {
        let args = MountArgs::parse(["--read-only", "--region=eu-west-1"]);
        assert!(args.has("--read-only"));
        assert_eq!(args.value("--region"), Some("eu-west-1"));
    }

    #[test]
    fn last_duplicate_wins() {
        let args = MountArgs::parse(["--region=us-east-1", "--region=eu-west-1"]);
        assert_eq!(args.value("--region"), Some("eu-west-1"));
    }

    #[test]
    fn renders_sorted_command_line() {
        let mut args = MountArgs::new();
        args.set("--read-only", "");
        args.set("--aws-max-attempts", "10");
        assert_eq!(
            args.sorted(),
            vec!["--aws-max-attempts=10".to_owned(), "--read-only".to_owned()]
        );
    }

    #[test]
    fn remove_returns_previous_value() {
        let mut args = MountArgs::parse(["--aws-max-attempts=3"]);
        assert_eq!(args.remove(ARG_AWS_MAX_ATTEMPTS), Some("3".to_owned()));
        assert!(args.is_empty());
    }
}
