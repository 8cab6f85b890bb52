//! Environment block parsing.
//!
//! Accepts `KEY=VALUE` entries separated by newlines (as IDE debugger settings
//! store them) or by NUL (as a native Windows block, optionally double-NUL
//! terminated). An empty block means "inherit the parent environment".

use std::str::FromStr;

use super::LaunchError;

/// Ordered environment for the child process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvironmentBlock {
    entries: Vec<(String, String)>,
}

impl EnvironmentBlock {
    /// Inherit the parent environment
    pub fn inherit() -> Self {
        Self::default()
    }

    /// Build from explicit pairs, keeping their order
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, LaunchError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entries = Vec::new();
        for (key, value) in pairs {
            let (key, value) = (key.into(), value.into());
            check_key(&key, &format!("{}={}", key, value))?;
            if value.contains('\0') {
                return Err(LaunchError::InvalidArgument(value));
            }
            entries.push((key, value));
        }
        Ok(Self { entries })
    }

    /// `true` when the child should see the parent's environment unchanged
    pub fn is_inherited(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// `KEY=VALUE` strings in block order
    pub fn to_assignments(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    /// Native Windows block: UTF-16, NUL separated, double-NUL terminated
    pub fn to_wide_block(&self) -> Vec<u16> {
        let mut block: Vec<u16> = Vec::new();
        for assignment in self.to_assignments() {
            block.extend(assignment.encode_utf16());
            block.push(0);
        }
        if block.is_empty() {
            block.push(0);
        }
        block.push(0);
        block
    }
}

impl FromStr for EnvironmentBlock {
    type Err = LaunchError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut entries = Vec::new();

        for line in raw.split(['\n', '\0']) {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.trim().is_empty() {
                continue;
            }

            // Skip the first byte so `=C:=C:\dir` style drive entries parse
            let split_at = line
                .char_indices()
                .skip(1)
                .find(|(_, c)| *c == '=')
                .map(|(i, _)| i)
                .ok_or_else(|| LaunchError::MalformedEnvironment {
                    entry: line.to_string(),
                    reason: "expected KEY=VALUE",
                })?;

            let (key, value) = (&line[..split_at], &line[split_at + 1..]);
            check_key(key, line)?;
            entries.push((key.to_string(), value.to_string()));
        }

        Ok(Self { entries })
    }
}

fn check_key(key: &str, entry: &str) -> Result<(), LaunchError> {
    let name = key.strip_prefix('=').unwrap_or(key);
    if name.is_empty() {
        return Err(LaunchError::MalformedEnvironment {
            entry: entry.to_string(),
            reason: "empty variable name",
        });
    }
    if name.contains('=') || name.contains('\0') {
        return Err(LaunchError::MalformedEnvironment {
            entry: entry.to_string(),
            reason: "variable name contains '=' or NUL",
        });
    }
    Ok(())
}
