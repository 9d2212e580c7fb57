//! Secret lookup and output redaction.
//!
//! Secrets are looked up by `(environment, name)` one at a time; a store
//! never hands out its contents in bulk. Values live in the environment of a
//! single step invocation and every byte of captured output passes through a
//! [`Redactor`] before it is logged, persisted or returned.

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::fmt;

use crate::{ExecutorErrorKind, ExecutorResult};

/// Replacement written over every secret occurrence
pub const MASK: &str = "***";

/// Compiled size allowed for the mask pattern
const PATTERN_SIZE_LIMIT: usize = 64 * (1 << 20);

/// Opaque secret value; `Debug` never prints it
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wraps a value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plaintext, for injection into a step environment
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

/// Keyed, environment-scoped secret lookup
pub trait SecretStore: Send + Sync + fmt::Debug {
    /// Looks up `name` within `environment`
    fn get(&self, environment: &str, name: &str) -> Option<SecretValue>;
}

/// In-memory store, provisioned from configuration
#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    values: HashMap<(String, String), SecretValue>,
}

impl StaticSecretStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisions a secret
    pub fn insert(&mut self, environment: impl Into<String>, name: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert((environment.into(), name.into()), SecretValue::new(value));
    }

    /// Provisions a secret, builder style
    #[must_use]
    pub fn with_secret(
        mut self,
        environment: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.insert(environment, name, value);
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn get(&self, environment: &str, name: &str) -> Option<SecretValue> {
        self.values
            .get(&(environment.to_string(), name.to_string()))
            .cloned()
    }
}

/// Store reading `SHIPYARD_SECRET_<ENVIRONMENT>_<NAME>` from the process environment
#[derive(Debug, Default, Clone)]
pub struct ProcessEnvSecretStore;

impl ProcessEnvSecretStore {
    /// Variable name holding `name` for `environment`
    #[must_use]
    pub fn variable(environment: &str, name: &str) -> String {
        let normalize = |s: &str| -> String {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect()
        };
        format!(
            "{}{}_{}",
            crate::runner::RESERVED_ENV_PREFIX,
            normalize(environment),
            normalize(name)
        )
    }
}

impl SecretStore for ProcessEnvSecretStore {
    fn get(&self, environment: &str, name: &str) -> Option<SecretValue> {
        std::env::var(Self::variable(environment, name))
            .ok()
            .map(SecretValue::new)
    }
}

/// Looks in the first store, then the second
#[derive(Debug)]
pub struct LayeredSecretStore<A, B> {
    first: A,
    second: B,
}

impl<A: SecretStore, B: SecretStore> LayeredSecretStore<A, B> {
    /// Layers `first` over `second`
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: SecretStore, B: SecretStore> SecretStore for LayeredSecretStore<A, B> {
    fn get(&self, environment: &str, name: &str) -> Option<SecretValue> {
        self.first
            .get(environment, name)
            .or_else(|| self.second.get(environment, name))
    }
}

/// Masks known secret values in text
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    pattern: Option<Regex>,
}

impl Redactor {
    /// Builds a redactor for `values`; empty values are ignored
    ///
    /// Fails when the pattern cannot be compiled, never falling back to
    /// passing output through unmasked.
    pub fn new<'a>(values: impl IntoIterator<Item = &'a SecretValue>) -> ExecutorResult<Self> {
        Self::with_size_limit(values, PATTERN_SIZE_LIMIT)
    }

    pub(crate) fn with_size_limit<'a>(
        values: impl IntoIterator<Item = &'a SecretValue>,
        size_limit: usize,
    ) -> ExecutorResult<Self> {
        let mut literals: Vec<&str> = values
            .into_iter()
            .map(SecretValue::expose)
            .filter(|v| !v.is_empty())
            .collect();
        if literals.is_empty() {
            return Ok(Self { pattern: None });
        }
        // Longest first, so a secret containing another is masked whole.
        literals.sort_by_key(|v| std::cmp::Reverse(v.len()));
        literals.dedup();
        let alternation = literals
            .iter()
            .map(|v| regex::escape(v))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = RegexBuilder::new(&alternation)
            .size_limit(size_limit)
            .build()
            .map_err(|e| ExecutorErrorKind::Redaction {
                reason: format!("{} secret value(s): {}", literals.len(), error_kind(&e)),
            })?;
        Ok(Self { pattern: Some(pattern) })
    }

    /// Returns true if there is nothing to mask
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pattern.is_none()
    }

    /// Masks every occurrence of every known value
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        match &self.pattern {
            Some(pattern) => pattern.replace_all(text, MASK).into_owned(),
            None => text.to_string(),
        }
    }
}

/// Describes a regex failure without echoing the pattern, which holds secrets
fn error_kind(error: &regex::Error) -> &'static str {
    match error {
        regex::Error::CompiledTooBig(_) => "pattern exceeds the compiled size limit",
        _ => "pattern rejected",
    }
}
