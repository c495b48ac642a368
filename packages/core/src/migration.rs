//! Migration chain: an ordered, append-only sequence of named data transforms.
//!
//! On load, a record's `appliedMigrations` is compared prefix-wise against
//! the configured chain. Any chain suffix not yet applied is run in order;
//! a record whose applied list diverges from the chain (wrong order, or a
//! name the chain no longer recognizes at that position) is a fatal load
//! error -- the record must not be overwritten.

use serde_json::Value;

use crate::error::StoreError;

/// A single named transform in a [`MigrationChain`].
pub struct Migration {
    name: String,
    apply: Box<dyn Fn(Value) -> Value + Send + Sync>,
}

impl Migration {
    /// Creates a migration with the given name and transform.
    pub fn new(name: impl Into<String>, apply: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            apply: Box::new(apply),
        }
    }

    /// The migration's name, used for prefix matching against `appliedMigrations`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An ordered, append-only sequence of [`Migration`]s.
///
/// # Panics
///
/// `MigrationChain::new` panics if two migrations share a name -- migration
/// names must be unique within a chain, by specification.
#[derive(Default)]
pub struct MigrationChain {
    migrations: Vec<Migration>,
}

impl MigrationChain {
    /// Builds a chain from an ordered list of migrations.
    #[must_use]
    pub fn new(migrations: Vec<Migration>) -> Self {
        let mut seen = std::collections::HashSet::with_capacity(migrations.len());
        for m in &migrations {
            assert!(
                seen.insert(m.name.clone()),
                "migration name {:?} is not unique within the chain",
                m.name
            );
        }
        Self { migrations }
    }

    /// An empty chain -- `apply_pending` is then always a no-op.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Applies every migration in the chain not yet present in `applied`,
    /// in order, returning the transformed data and the full updated
    /// `appliedMigrations` list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MigrationMismatch`] if `applied` is not a
    /// prefix of this chain's names (a name absent from the chain, or
    /// present but out of order).
    pub fn apply_pending(
        &self,
        key: &str,
        mut data: Value,
        applied: &[String],
    ) -> Result<(Value, Vec<String>), StoreError> {
        for (i, applied_name) in applied.iter().enumerate() {
            match self.migrations.get(i) {
                Some(m) if m.name() == applied_name => {}
                Some(m) => {
                    return Err(StoreError::MigrationMismatch(
                        key.to_string(),
                        format!(
                            "applied migration {applied_name:?} at position {i} does not match chain migration {:?}",
                            m.name()
                        ),
                    ))
                }
                None => {
                    return Err(StoreError::MigrationMismatch(
                        key.to_string(),
                        format!(
                            "applied migration {applied_name:?} at position {i} has no counterpart in the current chain"
                        ),
                    ))
                }
            }
        }

        let mut result = applied.to_vec();
        for m in self.migrations.iter().skip(applied.len()) {
            data = (m.apply)(data);
            result.push(m.name().to_string());
        }
        Ok((data, result))
    }
}
