// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use crate::async_map::{AsyncMapConsumer, Reader};
use crate::json_maps::JsonFileMap;
use crate::name::{EntityName, NamedTarget};
use crate::value::Value;

/// An anonymous-target definition of a rule: construct additional targets
/// from the nodes a dependency exposes under a provider key.
#[derive(Debug, Clone)]
pub struct AnonymousDefinition {
    pub target: String,
    pub provider: String,
    pub rule_map: Value,
}

/// A user-defined rule loaded from a rules file.
#[derive(Debug)]
pub struct UserRule {
    pub config_fields: Vec<String>,
    pub string_fields: Vec<String>,
    pub target_fields: Vec<String>,
    pub implicit_targets: BTreeMap<String, Vec<EntityName>>,
    pub implicit_target_exps: BTreeMap<String, Value>,
    pub anonymous_definitions: BTreeMap<String, AnonymousDefinition>,
    pub config_vars: Vec<String>,
    pub config_transitions: BTreeMap<String, Value>,
    pub tainted: BTreeSet<String>,
    pub expression: Value,
    expected_fields: BTreeSet<String>,
}

const RULE_FIELDS: &[&str] = &[
    "config_fields",
    "string_fields",
    "target_fields",
    "implicit",
    "anonymous",
    "config_vars",
    "config_transitions",
    "tainted",
    "expression",
    "doc",
];

/// The identity transition: analyse the dependency under the unchanged
/// configuration.
fn identity_transition() -> Value {
    Value::from(vec![Value::empty_map()])
}

impl UserRule {
    /// Field names a target descriptor using this rule may set.
    pub fn expected_fields(&self) -> &BTreeSet<String> {
        &self.expected_fields
    }

    /// Parse a rule description; `location` is the rule's own name, used to
    /// resolve target references inside the description.
    pub fn from_value(location: &NamedTarget, desc: &Value) -> Result<UserRule> {
        let entries = desc
            .as_map()
            .map_err(|_| anyhow!("rule description has to be a map, but found {desc}"))?;
        for key in entries.keys() {
            if !RULE_FIELDS.contains(&key.as_str()) {
                bail!("unknown field '{key}' in rule description");
            }
        }
        let string_list = |field: &str| -> Result<Vec<String>> {
            match desc.get(field) {
                None => Ok(Vec::new()),
                Some(v) => v
                    .as_list()
                    .with_context(|| format!("field '{field}'"))?
                    .iter()
                    .map(|entry| {
                        entry
                            .as_str()
                            .map(str::to_string)
                            .with_context(|| format!("field '{field}'"))
                    })
                    .collect(),
            }
        };

        let config_fields = string_list("config_fields")?;
        let string_fields = string_list("string_fields")?;
        let target_fields = string_list("target_fields")?;
        let config_vars = string_list("config_vars")?;
        let tainted: BTreeSet<String> = string_list("tainted")?.into_iter().collect();

        let mut implicit_targets = BTreeMap::new();
        let mut implicit_target_exps = BTreeMap::new();
        if let Some(implicit) = desc.get("implicit") {
            for (field_name, refs) in implicit.as_map().context("field 'implicit'")? {
                let mut targets = Vec::new();
                let mut names = Vec::new();
                for reference in refs.as_list().with_context(|| {
                    format!("implicit field '{field_name}' has to be a list of target names")
                })? {
                    let target = EntityName::parse(reference, location)
                        .with_context(|| format!("in implicit field '{field_name}'"))?;
                    names.push(Value::from(target.clone()));
                    targets.push(target);
                }
                implicit_targets.insert(field_name.clone(), targets);
                implicit_target_exps.insert(field_name.clone(), Value::from(names));
            }
        }

        let mut anonymous_definitions = BTreeMap::new();
        if let Some(anonymous) = desc.get("anonymous") {
            for (field_name, def) in anonymous.as_map().context("field 'anonymous'")? {
                let target = def
                    .index("target")
                    .and_then(|t| t.as_str().map(str::to_string))
                    .with_context(|| format!("in anonymous definition '{field_name}'"))?;
                let provider = def
                    .index("provider")
                    .and_then(|p| p.as_str().map(str::to_string))
                    .with_context(|| format!("in anonymous definition '{field_name}'"))?;
                let rule_map_desc = def
                    .index("rule_map")
                    .with_context(|| format!("in anonymous definition '{field_name}'"))?;
                let mut rule_map = BTreeMap::new();
                for (node_type, rule_ref) in rule_map_desc
                    .as_map()
                    .with_context(|| format!("rule_map of anonymous definition '{field_name}'"))?
                {
                    let rule_name = EntityName::parse(rule_ref, location).with_context(|| {
                        format!("rule_map of anonymous definition '{field_name}'")
                    })?;
                    rule_map.insert(node_type.clone(), Value::from(rule_name));
                }
                if !target_fields.contains(&target) && !implicit_targets.contains_key(&target) {
                    bail!(
                        "anonymous definition '{field_name}' refers to unknown \
                         target field '{target}'"
                    );
                }
                anonymous_definitions.insert(
                    field_name.clone(),
                    AnonymousDefinition {
                        target,
                        provider,
                        rule_map: Value::from(rule_map),
                    },
                );
            }
        }

        // Field names of the different kinds have to be pairwise disjoint.
        let mut seen: BTreeSet<&String> = BTreeSet::new();
        for field_name in config_fields
            .iter()
            .chain(string_fields.iter())
            .chain(target_fields.iter())
            .chain(implicit_targets.keys())
            .chain(anonymous_definitions.keys())
        {
            if !seen.insert(field_name) {
                bail!("field name '{field_name}' used for more than one field kind");
            }
        }

        let mut config_transitions = BTreeMap::new();
        if let Some(transitions) = desc.get("config_transitions") {
            for (field_name, transition) in
                transitions.as_map().context("field 'config_transitions'")?
            {
                if !seen.contains(field_name)
                    || config_fields.contains(field_name)
                    || string_fields.contains(field_name)
                {
                    bail!("config transition for unknown target field '{field_name}'");
                }
                config_transitions.insert(field_name.clone(), transition.clone());
            }
        }
        for field_name in target_fields
            .iter()
            .chain(implicit_targets.keys())
            .chain(anonymous_definitions.keys())
        {
            config_transitions
                .entry(field_name.clone())
                .or_insert_with(identity_transition);
        }

        let expression = desc
            .get("expression")
            .cloned()
            .ok_or_else(|| anyhow!("rule description lacks a defining expression"))?;

        let mut expected_fields: BTreeSet<String> =
            ["type", "arguments_config", "tainted", "doc"]
                .into_iter()
                .map(str::to_string)
                .collect();
        expected_fields.extend(config_fields.iter().cloned());
        expected_fields.extend(string_fields.iter().cloned());
        expected_fields.extend(target_fields.iter().cloned());

        Ok(UserRule {
            config_fields,
            string_fields,
            target_fields,
            implicit_targets,
            implicit_target_exps,
            anonymous_definitions,
            config_vars,
            tainted,
            config_transitions,
            expression,
            expected_fields,
        })
    }
}

/// Map from rule name to the loaded rule description.
pub type RuleMap = AsyncMapConsumer<EntityName, Arc<UserRule>>;

/// A rule's `expression` field either holds the defining expression inline
/// or names an entry of the module's expression file.
fn expression_reference(expression: &Value, location: &NamedTarget) -> Option<EntityName> {
    match expression {
        Value::String(_) | Value::List(_) => EntityName::parse(expression, location).ok(),
        _ => None,
    }
}

pub fn create_rule_map(
    rules_file_map: &JsonFileMap,
    expression_file_map: &JsonFileMap,
) -> RuleMap {
    let rules_file_map = rules_file_map.clone();
    let expression_file_map = expression_file_map.clone();
    let reader: Reader<EntityName, Arc<UserRule>> =
        Arc::new(move |ts, setter, logger, _subcaller, key| {
            let location = match key.named() {
                Ok(named) => named.clone(),
                Err(e) => {
                    logger(&format!("{e:#}"), true);
                    return;
                }
            };
            let module = match key.to_module() {
                Ok(module) => module,
                Err(e) => {
                    logger(&format!("{e:#}"), true);
                    return;
                }
            };
            let expression_file_map = expression_file_map.clone();
            let ts_inner = Arc::clone(ts);
            let fail_logger = crate::async_map::wrap_logger(&logger, {
                let location = location.clone();
                move |msg| format!("while reading rules file for {location}:\n{msg}")
            });
            rules_file_map.consume_after_keys_ready(
                ts,
                &[module],
                move |values| {
                    let rules_file = &values[0];
                    let Some(desc) = rules_file.get(&location.name) else {
                        logger(
                            &format!("rule {location} not found in rules file"),
                            true,
                        );
                        return;
                    };
                    let mut rule = match UserRule::from_value(&location, desc) {
                        Ok(rule) => rule,
                        Err(e) => {
                            logger(&format!("invalid rule {location}:\n{e:#}"), true);
                            return;
                        }
                    };
                    match expression_reference(&rule.expression, &location) {
                        None => setter(Arc::new(rule)),
                        Some(expression_name) => {
                            // The defining expression lives in an expression
                            // file; fetch it and splice it in.
                            let Ok(expression_module) = expression_name.to_module() else {
                                logger(
                                    &format!(
                                        "invalid expression reference in rule {location}"
                                    ),
                                    true,
                                );
                                return;
                            };
                            let named = match expression_name.named() {
                                Ok(named) => named.clone(),
                                Err(e) => {
                                    logger(&format!("{e:#}"), true);
                                    return;
                                }
                            };
                            let fail_logger = crate::async_map::wrap_logger(&logger, {
                                let location = location.clone();
                                move |msg| {
                                    format!(
                                        "while reading expression file for {location}:\n{msg}"
                                    )
                                }
                            });
                            expression_file_map.consume_after_keys_ready(
                                &ts_inner,
                                &[expression_module],
                                move |values| {
                                    let expression_file = &values[0];
                                    match expression_file.get(&named.name) {
                                        Some(expression) => {
                                            rule.expression = expression.clone();
                                            setter(Arc::new(rule));
                                        }
                                        None => logger(
                                            &format!(
                                                "expression {named} not found in \
                                                 expression file"
                                            ),
                                            true,
                                        ),
                                    }
                                },
                                fail_logger,
                            );
                        }
                    }
                },
                fail_logger,
            );
        });
    AsyncMapConsumer::new(reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> NamedTarget {
        NamedTarget::target("", "rules", "my_rule")
    }

    fn parse(json: &str) -> Result<UserRule> {
        UserRule::from_value(&location(), &Value::from_json_str(json)?)
    }

    #[test]
    fn minimal_rule_gets_identity_transitions() -> Result<()> {
        let rule = parse(
            r#"{"target_fields": ["deps"],
                "expression": {"type": "RESULT"}}"#,
        )?;
        assert_eq!(
            rule.config_transitions.get("deps"),
            Some(&identity_transition())
        );
        Ok(())
    }

    #[test]
    fn unknown_rule_field_is_rejected() {
        assert!(parse(r#"{"expression": [], "no_such_field": 1}"#).is_err());
    }

    #[test]
    fn overlapping_field_kinds_are_rejected() {
        let err = parse(
            r#"{"config_fields": ["x"], "string_fields": ["x"],
                "expression": []}"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("more than one field kind"));
    }

    #[test]
    fn anonymous_definition_must_name_target_field() {
        let err = parse(
            r#"{"target_fields": ["deps"],
                "anonymous": {"a": {"target": "other", "provider": "p", "rule_map": {}}},
                "expression": []}"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("unknown target field"));
    }

    #[test]
    fn implicit_targets_are_parsed_relative_to_rule() -> Result<()> {
        let rule = parse(
            r#"{"implicit": {"tool": [["./", "..", "the-tool"]]},
                "expression": []}"#,
        )?;
        let targets = rule.implicit_targets.get("tool").unwrap();
        assert_eq!(targets[0].named()?.module, ".");
        Ok(())
    }

    #[test]
    fn transitions_only_for_target_like_fields() {
        let err = parse(
            r#"{"string_fields": ["s"],
                "config_transitions": {"s": [{}]},
                "expression": []}"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("unknown target field"));
    }
}
