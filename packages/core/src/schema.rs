//! The schema-check contract consumed by `Session`/`Store`.
//!
//! The validator's implementation is an external collaborator (out of
//! scope for this crate); only its contract is consumed here: a predicate
//! over a JSON value that either accepts it or rejects it with a reason.

use serde_json::Value;

/// A schema validator, called on every validated data boundary (`setData`,
/// the mutable and immutable `update` paths, and after migration on load).
pub trait SchemaCheck: Send + Sync {
    /// Validates `value`. `Err(reason)` rejects the write with that reason.
    fn check(&self, value: &Value) -> Result<(), String>;
}

impl<F> SchemaCheck for F
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync,
{
    fn check(&self, value: &Value) -> Result<(), String> {
        self(value)
    }
}

/// A [`SchemaCheck`] that accepts every value. Used as the default when a
/// store is configured without a validator.
pub struct AcceptAll;

impl SchemaCheck for AcceptAll {
    fn check(&self, _value: &Value) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accept_all_never_rejects() {
        assert!(AcceptAll.check(&json!(null)).is_ok());
    }

    #[test]
    fn closure_blanket_impl_works() {
        let check = |v: &Value| -> Result<(), String> {
            if v.get("coins").and_then(Value::as_i64).unwrap_or(0) >= 0 {
                Ok(())
            } else {
                Err("coins must be non-negative".to_string())
            }
        };
        assert!(check.check(&json!({"coins": 1})).is_ok());
        assert!(check.check(&json!({"coins": -1})).is_err());
    }
}
