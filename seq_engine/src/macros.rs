//! Launch macros.
//!
//! A macro definition string looks like `"name=demo, unit = 3 ,debug"`:
//!
//! - names match `[A-Za-z][A-Za-z0-9_]*`
//! - blanks around names, `=` and values are skipped
//! - a value ends at a blank, a comma or the end of input
//! - a name without `=` is recorded without a value
//! - later definitions override earlier ones
//!
//! Parsing stops at the first malformed entry; everything parsed before
//! it is kept. PV name templates reference macros as `{name}`.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::error;

/// Malformed macro definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid macro definition at offset {offset}: {text:?}")]
pub struct MacroParseError {
    /// Byte offset of the offending entry.
    pub offset: usize,
    /// Remaining input starting at that entry.
    pub text: String,
}

/// Macro definitions of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroTable {
    entries: HashMap<String, Option<String>>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `input`, logging and returning the partial table on error.
    pub fn parse(input: &str) -> Self {
        let mut table = Self::new();
        if let Err(e) = table.extend_from(input) {
            error!("{e}");
        }
        table
    }

    /// Add the definitions in `input` to this table.
    ///
    /// # Errors
    /// `MacroParseError` at the first malformed entry. Definitions before
    /// it have been added.
    pub fn extend_from(&mut self, input: &str) -> Result<(), MacroParseError> {
        let bytes = input.as_bytes();
        let mut pos = 0;
        let skip_blanks = |pos: &mut usize| {
            while *pos < bytes.len() && bytes[*pos].is_ascii_whitespace() {
                *pos += 1;
            }
        };

        loop {
            skip_blanks(&mut pos);
            while pos < bytes.len() && bytes[pos] == b',' {
                pos += 1;
                skip_blanks(&mut pos);
            }
            if pos >= bytes.len() {
                return Ok(());
            }

            let start = pos;
            let malformed = || MacroParseError {
                offset: start,
                text: input[start..].to_string(),
            };
            if !bytes[pos].is_ascii_alphabetic() {
                return Err(malformed());
            }
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            let name = &input[start..pos];

            skip_blanks(&mut pos);
            if pos >= bytes.len() || bytes[pos] == b',' {
                self.entries.insert(name.to_string(), None);
                continue;
            }
            if bytes[pos] != b'=' {
                return Err(malformed());
            }
            pos += 1;
            skip_blanks(&mut pos);

            let value_start = pos;
            while pos < bytes.len() && bytes[pos] != b',' && !bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            self.entries
                .insert(name.to_string(), Some(input[value_start..pos].to_string()));
        }
    }

    /// Define or override `name`.
    pub fn set(&mut self, name: impl Into<String>, value: Option<String>) {
        self.entries.insert(name.into(), value);
    }

    /// Value of `name`. `None` if undefined or defined without a value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).and_then(|v| v.as_deref())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse the value of `name`, logging values that don't parse.
    pub fn get_parsed<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        let raw = self.get(name)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                error!(macro_name = name, value = raw, "invalid macro value, ignored");
                None
            }
        }
    }

    /// Substitute every `{name}` in `template`. Unknown names (and names
    /// without value) become the empty string; an unclosed `{` is copied.
    pub fn eval(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    out.push_str(self.get(&after[..close]).unwrap_or_default());
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl fmt::Display for MacroTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        for (i, name) in names.into_iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match &self.entries[name] {
                Some(value) => write!(f, "{name}={value}")?,
                None => f.write_str(name)?,
            }
        }
        Ok(())
    }
}
