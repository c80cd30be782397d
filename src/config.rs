// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;
use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::hasher::ContentHash;
use crate::value::Value;

/// An immutable key/value environment parametrising one analysis.
///
/// Configurations are plain maps from variable name to expression value.
/// They are compared and hashed structurally, so two configurations that
/// bind the same variables to the same values are the same configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Configuration {
    expr: Value,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

impl Configuration {
    pub fn new() -> Configuration {
        Configuration {
            expr: Value::empty_map(),
        }
    }

    pub fn from_map(expr: Value) -> Result<Configuration> {
        if !expr.is_map() {
            bail!("a configuration has to be a map, but found {expr}");
        }
        Ok(Configuration { expr })
    }

    /// The underlying map value.
    pub fn expr(&self) -> &Value {
        &self.expr
    }

    pub fn lookup(&self, var: &str) -> Value {
        self.expr.get(var).cloned().unwrap_or(Value::Null)
    }

    /// True iff the variable is bound, even if bound to null.
    pub fn variable_fixed(&self, var: &str) -> bool {
        self.expr.get(var).is_some()
    }

    /// Restrict the domain to exactly `vars`; variables not bound in this
    /// configuration are fixed to null in the result, so pruning with the
    /// same variable set always yields the same configuration.
    pub fn prune<'a>(&self, vars: impl IntoIterator<Item = &'a String>) -> Configuration {
        let mut entries = BTreeMap::new();
        for var in vars {
            entries.insert(var.clone(), self.lookup(var));
        }
        Configuration {
            expr: Value::from(entries),
        }
    }

    /// Layer an overlay map on top of this configuration; overlay bindings
    /// win, including bindings to null.
    pub fn update(&self, overlay: &Value) -> Result<Configuration> {
        let overlay_entries = overlay.as_map()?;
        if overlay_entries.is_empty() {
            return Ok(self.clone());
        }
        let mut entries = self.expr.as_map()?.clone();
        for (k, v) in overlay_entries {
            entries.insert(k.clone(), v.clone());
        }
        Ok(Configuration {
            expr: Value::from(entries),
        })
    }

    pub fn hash(&self) -> ContentHash {
        self.expr.to_hash()
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> Configuration {
        Configuration::from_map(Value::from_json_str(json).unwrap()).unwrap()
    }

    #[test]
    fn prune_fixes_missing_vars_to_null() {
        let c = config(r#"{"A": "x"}"#);
        let vars = vec!["A".to_string(), "B".to_string()];
        let pruned = c.prune(&vars);
        assert_eq!(pruned.lookup("A"), Value::from("x"));
        assert!(pruned.variable_fixed("B"));
        assert_eq!(pruned.lookup("B"), Value::Null);
    }

    #[test]
    fn update_layers_override() -> Result<()> {
        let c = config(r#"{"A": "x", "B": "y"}"#);
        let updated = c.update(&Value::from_json_str(r#"{"B": "z"}"#)?)?;
        assert_eq!(updated.lookup("A"), Value::from("x"));
        assert_eq!(updated.lookup("B"), Value::from("z"));
        Ok(())
    }

    #[test]
    fn hash_ignores_insertion_order() -> Result<()> {
        let a = config(r#"{"A": 1, "B": 2}"#);
        let b = config(r#"{"B": 2, "A": 1}"#);
        assert_eq!(a.hash(), b.hash());
        Ok(())
    }
}
