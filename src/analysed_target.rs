// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde_json::json;

use crate::artifact::ArtifactDescription;
use crate::hasher::ContentHash;
use crate::value::{TargetResult, Value};

/// A single action of the action graph: a command over staged inputs that
/// produces declared output files and directories.
///
/// The identifier is the content hash of the canonical JSON serialisation,
/// so semantically equal actions have equal identifiers across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescription {
    outputs: Vec<String>,
    output_dirs: Vec<String>,
    command: Vec<String>,
    env: BTreeMap<String, String>,
    may_fail: Option<String>,
    no_cache: bool,
    inputs: BTreeMap<String, ArtifactDescription>,
    id: String,
}

impl ActionDescription {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut outputs: Vec<String>,
        mut output_dirs: Vec<String>,
        command: Vec<String>,
        env: BTreeMap<String, String>,
        may_fail: Option<String>,
        no_cache: bool,
        inputs: BTreeMap<String, ArtifactDescription>,
    ) -> Result<Arc<ActionDescription>> {
        if outputs.is_empty() && output_dirs.is_empty() {
            bail!("either output files or output directories must be declared");
        }
        if command.is_empty() {
            bail!("the command of an action must not be empty");
        }
        outputs.sort();
        output_dirs.sort();
        if outputs.iter().any(|out| output_dirs.binary_search(out).is_ok()) {
            bail!("output files and output directories must be disjoint");
        }
        let mut action = ActionDescription {
            outputs,
            output_dirs,
            command,
            env,
            may_fail,
            no_cache,
            inputs,
            id: String::new(),
        };
        action.id = ContentHash::of(action.to_json().to_string()).hex();
        Ok(Arc::new(action))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn output_dirs(&self) -> &[String] {
        &self.output_dirs
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn inputs(&self) -> &BTreeMap<String, ArtifactDescription> {
        &self.inputs
    }

    pub fn may_fail(&self) -> Option<&str> {
        self.may_fail.as_deref()
    }

    pub fn no_cache(&self) -> bool {
        self.no_cache
    }

    /// Canonical serialisation; optional parts appear only when set.
    pub fn to_json(&self) -> serde_json::Value {
        let mut desc = serde_json::Map::new();
        desc.insert("command".into(), json!(self.command));
        if !self.outputs.is_empty() {
            desc.insert("output".into(), json!(self.outputs));
        }
        if !self.output_dirs.is_empty() {
            desc.insert("output_dirs".into(), json!(self.output_dirs));
        }
        if !self.inputs.is_empty() {
            let mut inputs = serde_json::Map::new();
            for (input_path, artifact) in &self.inputs {
                inputs.insert(input_path.clone(), artifact.to_json());
            }
            desc.insert("input".into(), serde_json::Value::Object(inputs));
        }
        if !self.env.is_empty() {
            desc.insert("env".into(), json!(self.env));
        }
        if let Some(msg) = &self.may_fail {
            desc.insert("may_fail".into(), json!(msg));
        }
        if self.no_cache {
            desc.insert("no_cache".into(), json!(true));
        }
        serde_json::Value::Object(desc)
    }

    /// Re-parse an action description, validating the format invariants.
    pub fn from_json(desc: &serde_json::Value) -> Result<Arc<ActionDescription>> {
        let obj = desc
            .as_object()
            .ok_or_else(|| anyhow!("action description must be an object"))?;
        let string_list = |key: &str| -> Result<Vec<String>> {
            match obj.get(key) {
                None => Ok(Vec::new()),
                Some(v) => serde_json::from_value(v.clone())
                    .map_err(|_| anyhow!("'{key}' must be an array of strings")),
            }
        };
        let outputs = string_list("output")?;
        let output_dirs = string_list("output_dirs")?;
        let command = string_list("command")?;
        let mut inputs = BTreeMap::new();
        if let Some(input) = obj.get("input") {
            let input = input
                .as_object()
                .ok_or_else(|| anyhow!("'input' must be an object"))?;
            for (input_path, artifact) in input {
                inputs.insert(input_path.clone(), ArtifactDescription::from_json(artifact)?);
            }
        }
        let env = match obj.get("env") {
            None => BTreeMap::new(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|_| anyhow!("'env' must be an object of strings"))?,
        };
        let may_fail = match obj.get("may_fail") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(msg)) => Some(msg.clone()),
            Some(_) => bail!("'may_fail' must be null or a string"),
        };
        let no_cache = match obj.get("no_cache") {
            None => false,
            Some(serde_json::Value::Bool(b)) => *b,
            Some(_) => bail!("'no_cache' must be a boolean"),
        };
        ActionDescription::new(outputs, output_dirs, command, env, may_fail, no_cache, inputs)
    }
}

/// A staged directory: a conflict-free mapping from path to artifact,
/// identified by the hash of its canonical serialisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    artifacts: BTreeMap<String, ArtifactDescription>,
    id: String,
}

impl Tree {
    pub fn new(artifacts: BTreeMap<String, ArtifactDescription>) -> Arc<Tree> {
        let mut tree = Tree {
            artifacts,
            id: String::new(),
        };
        tree.id = ContentHash::of(tree.to_json().to_string()).hex();
        Arc::new(tree)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn artifacts(&self) -> &BTreeMap<String, ArtifactDescription> {
        &self.artifacts
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (tree_path, artifact) in &self.artifacts {
            obj.insert(tree_path.clone(), artifact.to_json());
        }
        serde_json::Value::Object(obj)
    }
}

/// The purely functional description of an analysed target: its result
/// value together with the actions, blobs and trees needed to realise it,
/// the configuration variables it actually read, and its taint.
#[derive(Debug, Clone)]
pub struct AnalysedTarget {
    result: TargetResult,
    actions: Vec<Arc<ActionDescription>>,
    blobs: Vec<String>,
    trees: Vec<Arc<Tree>>,
    vars: BTreeSet<String>,
    tainted: BTreeSet<String>,
}

impl AnalysedTarget {
    pub fn new(
        result: TargetResult,
        actions: Vec<Arc<ActionDescription>>,
        blobs: Vec<String>,
        trees: Vec<Arc<Tree>>,
        vars: BTreeSet<String>,
        tainted: BTreeSet<String>,
    ) -> AnalysedTarget {
        AnalysedTarget {
            result,
            actions,
            blobs,
            trees,
            vars,
            tainted,
        }
    }

    pub fn result(&self) -> &TargetResult {
        &self.result
    }

    pub fn artifacts(&self) -> &Value {
        &self.result.artifacts
    }

    pub fn runfiles(&self) -> &Value {
        &self.result.runfiles
    }

    pub fn provides(&self) -> &Value {
        &self.result.provides
    }

    pub fn actions(&self) -> &[Arc<ActionDescription>] {
        &self.actions
    }

    pub fn blobs(&self) -> &[String] {
        &self.blobs
    }

    pub fn trees(&self) -> &[Arc<Tree>] {
        &self.trees
    }

    pub fn vars(&self) -> &BTreeSet<String> {
        &self.vars
    }

    pub fn tainted(&self) -> &BTreeSet<String> {
        &self.tainted
    }

    pub fn is_cacheable(&self) -> bool {
        self.result.is_cacheable
    }

    /// The structural hash of the result projection; the cache key of this
    /// analysis.
    pub fn result_hash(&self) -> ContentHash {
        ContentHash::of(self.result.to_json().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action() -> Arc<ActionDescription> {
        ActionDescription::new(
            vec!["out".to_string()],
            vec![],
            vec!["cp".to_string(), "in.c".to_string(), "out".to_string()],
            BTreeMap::new(),
            None,
            false,
            BTreeMap::from([(
                "in.c".to_string(),
                ArtifactDescription::Local {
                    path: "m/in.c".to_string(),
                    repository: "".to_string(),
                },
            )]),
        )
        .unwrap()
    }

    #[test]
    fn id_is_hash_of_canonical_serialisation() {
        let a = action();
        assert_eq!(a.id(), ContentHash::of(a.to_json().to_string()).hex());
    }

    #[test]
    fn json_round_trip_preserves_id() -> Result<()> {
        let a = action();
        let b = ActionDescription::from_json(&a.to_json())?;
        assert_eq!(a.id(), b.id());
        Ok(())
    }

    #[test]
    fn empty_outputs_are_rejected() {
        assert!(ActionDescription::new(
            vec![],
            vec![],
            vec!["true".to_string()],
            BTreeMap::new(),
            None,
            false,
            BTreeMap::new(),
        )
        .is_err());
    }
}
