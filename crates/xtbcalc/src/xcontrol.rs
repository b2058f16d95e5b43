//! The xtb detailed-input ("xcontrol") file: `$section` blocks of `key=value`
//! lines, each closed by `$end`.

use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};

/// A scalar value in an xcontrol entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(true) => write!(f, "true"),
            Value::Bool(false) => write!(f, "false"),
            Value::Int(i) => write!(f, "{i}"),
            // keep the decimal point on whole numbers, 1.0 rather than 1
            Value::Float(x) if x.is_finite() && x.fract() == 0.0 => {
                write!(f, "{x:.1}")
            }
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

macro_rules! value_from {
    ($($variant:ident => $($t:ty),*;)*) => {
        $($(
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v.into())
            }
        }
        )*)*
    }
}

value_from! {
    Bool => bool;
    Int => i64, i32, u32;
    Float => f64;
    Str => String, &str;
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

pub type Section = BTreeMap<String, Value>;

/// Sections and their entries. Both levels are kept sorted, so rendering the
/// same logical contents always produces the same text.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct XControl(BTreeMap<String, Section>);

impl XControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// set `key` in `section` to `value`, creating the section if needed
    pub fn set(
        &mut self,
        section: &str,
        key: &str,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.0
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned(), value.into());
        self
    }

    #[must_use]
    pub fn with(
        mut self,
        section: &str,
        key: &str,
        value: impl Into<Value>,
    ) -> Self {
        self.set(section, key, value);
        self
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.0.get(name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.0.get(section).and_then(|s| s.get(key))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// merge `other` into `self`. a section present in both is replaced
    /// wholesale by the one from `other`
    pub fn update(&mut self, other: &XControl) {
        for (name, section) in &other.0 {
            self.0.insert(name.clone(), section.clone());
        }
    }

    /// render the control file. there is no trailing newline after the final
    /// `$end`
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        for (name, entries) in &self.0 {
            lines.push(format!("${name}"));
            for (key, value) in entries {
                lines.push(format!("    {key}={value}"));
            }
            lines.push("$end".to_owned());
        }
        lines.join("\n")
    }
}

impl Display for XControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl<S: Into<String>> FromIterator<(S, Section)> for XControl {
    fn from_iter<T: IntoIterator<Item = (S, Section)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
