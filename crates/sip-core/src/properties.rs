//! `key = value` configuration files.
//!
//! Lines starting with `#` or `!` are comments, `:` is accepted as a
//! separator and whitespace around keys and values is ignored.

use std::{collections::BTreeMap, path::Path, str::FromStr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("missing required key {0}")]
    Missing(String),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let split = line.find(['=', ':']).map(|pos| (&line[..pos], &line[pos + 1..]));
            let (key, value) = split.unwrap_or((line, ""));
            entries.insert(key.trim().to_owned(), value.trim().to_owned());
        }
        Self { entries }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Returns the value of `key`, treating empty values as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_owned()))
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_owned(),
                    value: value.to_owned(),
                }),
        }
    }

    /// Reads a `yes`/`no` style switch.
    pub fn get_flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key).map(str::to_ascii_lowercase).as_deref() {
            None => Ok(None),
            Some("yes" | "true" | "on") => Ok(Some(true)),
            Some("no" | "false" | "off") => Ok(Some(false)),
            Some(other) => Err(ConfigError::InvalidValue {
                key: key.to_owned(),
                value: other.to_owned(),
            }),
        }
    }

    /// Splits a comma separated value, dropping empty items.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the keys below `prefix.` with the prefix stripped.
    pub fn subset(&self, prefix: &str) -> Properties {
        let dotted = format!("{}.", prefix);
        let entries = self
            .entries
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&dotted)
                    .map(|rest| (rest.to_owned(), value.clone()))
            })
            .collect();
        Properties { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment
! also a comment
registrar.binding.expire.time.min = 30
registrar.authentication.enabled: yes
registrar.domains = openjsip.net, example.com ,
proxy.interface.1.addr=10.0.0.1
empty.value =
";

    #[test]
    fn parses_separators_and_comments() {
        let props = Properties::parse(SAMPLE);
        assert_eq!(props.get("registrar.binding.expire.time.min"), Some("30"));
        assert_eq!(props.get("proxy.interface.1.addr"), Some("10.0.0.1"));
        assert_eq!(props.get("empty.value"), None);
        assert_eq!(props.get_flag("registrar.authentication.enabled").unwrap(), Some(true));
    }

    #[test]
    fn subset_strips_prefix() {
        let registrar = Properties::parse(SAMPLE).subset("registrar");
        assert_eq!(registrar.get_parsed::<u64>("binding.expire.time.min").unwrap(), Some(30));
        assert_eq!(registrar.get_list("domains"), vec!["openjsip.net", "example.com"]);
        assert!(registrar.get("proxy.interface.1.addr").is_none());
    }

    #[test]
    fn invalid_values_are_reported() {
        let mut props = Properties::default();
        props.set("port", "fifty");
        props.set("flag", "maybe");
        assert!(matches!(
            props.get_parsed::<u16>("port"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(props.get_flag("flag").is_err());
        assert!(matches!(props.require("absent"), Err(ConfigError::Missing(_))));
    }
}
