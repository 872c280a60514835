//! Minimal `key = value` property files.
//!
//! Supported syntax:
//! - `key = value` or `key: value`, whitespace around the separator trimmed
//! - `#` and `!` comment lines, blank lines
//! - a trailing `\` continues the value on the next line
//!
//! Lists are comma separated; argument vectors are whitespace separated.

use crate::error::{PipelineError, PipelineResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut lines = content.lines();

        while let Some(line) = lines.next() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }

            let mut logical = line.to_string();
            while ends_with_continuation(&logical) {
                logical.pop();
                match lines.next() {
                    Some(next) => logical.push_str(next.trim_start()),
                    None => break,
                }
            }

            let (key, value) = match logical.find(|c: char| c == '=' || c == ':') {
                Some(pos) => (&logical[..pos], &logical[pos + 1..]),
                None => (logical.as_str(), ""),
            };
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }

        Self { entries }
    }

    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read property file {:?}: {}", path, e))
        })?;
        Ok(Self::parse(&content))
    }

    /// Overlay `other`; its keys win.
    pub fn merge(&mut self, other: Properties) {
        self.entries.extend(other.entries);
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> PipelineResult<&str> {
        self.get(key)
            .ok_or_else(|| PipelineError::Config(format!("Missing required key '{}'", key)))
    }

    /// Comma-separated list; empty entries are dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key).map(split_list).unwrap_or_default()
    }

    /// Whitespace-separated words.
    pub fn words(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn parsed<T: FromStr>(&self, key: &str) -> PipelineResult<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|v| {
                v.parse::<T>().map_err(|e| {
                    PipelineError::Config(format!("Invalid value '{}' for '{}': {}", v, key, e))
                })
            })
            .transpose()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn ends_with_continuation(line: &str) -> bool {
    let slashes = line.bytes().rev().take_while(|&b| b == b'\\').count();
    slashes % 2 == 1
}

/// Split a comma-separated list, trimming entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
