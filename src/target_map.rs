// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The analysis engine proper: the map from configured target to analysed
//! target. The reader dispatches on the reference kind, loads rule and
//! target descriptions through the base maps, evaluates fields and config
//! transitions, requests dependencies under the transitioned
//! configurations, and finally evaluates the rule's defining expression
//! with a function table that closes over the resolved dependencies.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;

use crate::analysed_target::{ActionDescription, AnalysedTarget, Tree};
use crate::artifact::ArtifactDescription;
use crate::async_map::{wrap_logger, AsyncMapConsumer, Logger, Reader, Setter, SubCaller};
use crate::config::Configuration;
use crate::eval::{Evaluator, FunctionMap};
use crate::hasher::ContentHash;
use crate::json_maps::{DirectoryEntriesMap, JsonFileMap};
use crate::name::{AnonymousTarget, EntityName, ModuleName, NamedTarget, ReferenceKind};
use crate::path;
use crate::result_map::ResultTargetMap;
use crate::rule::{RuleMap, UserRule};
use crate::source_map::SourceTargetMap;
use crate::task_system::TaskSystem;
use crate::value::{TargetNode, TargetResult, Value};

/// The key of the engine: a target name under a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfiguredTarget {
    pub target: EntityName,
    pub config: Configuration,
}

impl fmt::Display for ConfiguredTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.target, self.config)
    }
}

pub type TargetMap = AsyncMapConsumer<ConfiguredTarget, Arc<AnalysedTarget>>;

pub type TargetSubCaller = SubCaller<ConfiguredTarget, Arc<AnalysedTarget>>;

pub type TargetSetter = Setter<Arc<AnalysedTarget>>;

/// The collaborators one analysis run shares between all requests.
pub struct AnalysisContext {
    pub source_map: SourceTargetMap,
    pub targets_file_map: JsonFileMap,
    pub rule_map: RuleMap,
    pub directory_entries: DirectoryEntriesMap,
    pub result_map: Arc<ResultTargetMap>,
}

impl fmt::Debug for AnalysisContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisContext")
            .field("result_map", &self.result_map)
            .finish()
    }
}

/// Per-target collectors the `ACTION`/`BLOB`/`TREE` primitives append to.
#[derive(Default)]
struct Collectors {
    actions: Mutex<Vec<Arc<ActionDescription>>>,
    blobs: Mutex<Vec<String>>,
    trees: Mutex<Vec<Arc<Tree>>>,
}

/// The field expressions of one target, read either from its targets-file
/// entry or from an abstract target node.
struct TargetData {
    target_vars: Vec<String>,
    config_exprs: HashMap<String, Value>,
    string_exprs: HashMap<String, Value>,
    target_exprs: HashMap<String, Value>,
    tainted_expr: Value,
    parse_target_names: bool,
}

impl TargetData {
    fn from_field_reader(rule: &UserRule, desc: &Value) -> Result<TargetData> {
        let entries = desc
            .as_map()
            .map_err(|_| anyhow!("target description has to be a map, but found {desc}"))?;
        for key in entries.keys() {
            if !rule.expected_fields().contains(key) {
                bail!("unknown field '{key}' in target definition");
            }
        }
        let target_vars = match desc.get("arguments_config") {
            None => Vec::new(),
            Some(v) => string_list("arguments_config", v)?,
        };
        let tainted_expr = desc
            .get("tainted")
            .cloned()
            .unwrap_or_else(Value::empty_list);
        let field_exprs = |names: &[String]| -> HashMap<String, Value> {
            names
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        desc.get(name).cloned().unwrap_or_else(Value::empty_list),
                    )
                })
                .collect()
        };
        Ok(TargetData {
            target_vars,
            config_exprs: field_exprs(&rule.config_fields),
            string_exprs: field_exprs(&rule.string_fields),
            target_exprs: field_exprs(&rule.target_fields),
            tainted_expr,
            parse_target_names: true,
        })
    }

    fn from_target_node(
        rule: &UserRule,
        node_type: &str,
        string_fields: &Value,
        target_fields: &Value,
        rule_map: &Value,
    ) -> Result<TargetData> {
        let strings = string_fields.as_map()?;
        let targets = target_fields.as_map()?;
        let mut config_exprs = HashMap::new();
        let mut string_exprs = HashMap::new();
        let mut target_exprs = HashMap::new();
        for field_name in rule.config_fields.iter().chain(&rule.string_fields) {
            if targets.contains_key(field_name) {
                bail!(
                    "expected field '{field_name}' in string_fields of abstract \
                     node type '{node_type}', and not in target_fields"
                );
            }
            let expr = strings
                .get(field_name)
                .cloned()
                .unwrap_or_else(Value::empty_list);
            string_list(field_name, &expr)?;
            if rule.config_fields.contains(field_name) {
                config_exprs.insert(field_name.clone(), expr);
            } else {
                string_exprs.insert(field_name.clone(), expr);
            }
        }
        for field_name in &rule.target_fields {
            if strings.contains_key(field_name) {
                bail!(
                    "expected field '{field_name}' in target_fields of abstract \
                     node type '{node_type}', and not in string_fields"
                );
            }
            let nodes = targets
                .get(field_name)
                .cloned()
                .unwrap_or_else(Value::empty_list);
            let mut anonymous = Vec::new();
            for node in nodes.as_list()? {
                if !node.is_node() {
                    bail!(
                        "entry of target field '{field_name}' of abstract node \
                         type '{node_type}' is not a target node: {node}"
                    );
                }
                anonymous.push(Value::from(EntityName::Anonymous(AnonymousTarget {
                    rule_map: rule_map.clone(),
                    target_node: node.clone(),
                })));
            }
            target_exprs.insert(field_name.clone(), Value::from(anonymous));
        }
        Ok(TargetData {
            target_vars: Vec::new(),
            config_exprs,
            string_exprs,
            target_exprs,
            tainted_expr: Value::empty_list(),
            parse_target_names: false,
        })
    }
}

fn string_list(what: &str, value: &Value) -> Result<Vec<String>> {
    value
        .as_list()
        .map_err(|_| anyhow!("{what} has to be a list of strings, but found {value}"))?
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .map(str::to_string)
                .map_err(|_| anyhow!("{what} has to be a list of strings, but found entry {entry}"))
        })
        .collect()
}

/// Read an evaluated `outs`/`out_dirs` expression.
fn action_outputs(what: &str, value: &Value) -> Result<Vec<String>> {
    string_list(what, value)
}

/// Evaluated artifact stage: map of path to artifact, lexically normalized
/// and checked for tree conflicts.
fn artifact_stage(what: &str, value: &Value) -> Result<BTreeMap<String, ArtifactDescription>> {
    let entries = value
        .as_map()
        .map_err(|_| anyhow!("{what} has to be a map of artifacts, but found {value}"))?;
    let mut stage = BTreeMap::new();
    for (stage_path, artifact) in entries {
        let artifact = artifact.as_artifact().map_err(|_| {
            anyhow!("{what} has to be a map of artifacts, but found {artifact} for {stage_path}")
        })?;
        let norm_path = path::normalize(stage_path);
        if stage.insert(norm_path.clone(), artifact.clone()).is_some() {
            bail!("{what} conflicts on path {norm_path}");
        }
    }
    if let Some(conflict) = path::tree_conflict(&stage) {
        bail!("{what} conflicts on subtree {conflict}");
    }
    Ok(stage)
}

fn keys_expr(map: &Value) -> Result<Value> {
    Ok(Value::from(
        map.as_map()?
            .keys()
            .map(|k| Value::from(k.as_str()))
            .collect::<Vec<_>>(),
    ))
}

type DepsByTransition = Arc<HashMap<ConfiguredTarget, Arc<AnalysedTarget>>>;

fn obtain_target(
    eval: &Evaluator,
    expr: &Value,
    env: &Configuration,
    deps: &DepsByTransition,
) -> Result<Arc<AnalysedTarget>> {
    let dep = eval.eval(expr.index("dep")?, env)?;
    let name = dep
        .as_name()
        .map_err(|_| anyhow!("argument 'dep' has to be a target name, but found {dep}"))?;
    let transition = eval.eval(expr.get_or("transition", &Value::empty_map()), env)?;
    let config = Configuration::from_map(transition)?;
    let key = ConfiguredTarget {
        target: name.as_ref().clone(),
        config,
    };
    deps.get(&key)
        .cloned()
        .ok_or_else(|| anyhow!("dependency {} not analysed under the requested transition", key))
}

fn obtain_target_by_name(
    eval: &Evaluator,
    expr: &Value,
    env: &Configuration,
    current: &EntityName,
    deps: &DepsByTransition,
) -> Result<Arc<AnalysedTarget>> {
    let dep = eval.eval(expr.index("dep")?, env)?;
    let name = match &dep {
        Value::Name(name) => name.as_ref().clone(),
        _ => {
            let named = current
                .named()
                .context("cannot resolve a target name relative to an anonymous target")?;
            EntityName::parse(&dep, named)?
        }
    };
    let transition = eval.eval(expr.get_or("transition", &Value::empty_map()), env)?;
    let config = Configuration::from_map(transition)?;
    let key = ConfiguredTarget {
        target: name,
        config,
    };
    deps.get(&key)
        .cloned()
        .ok_or_else(|| anyhow!("dependency {} not analysed under the requested transition", key))
}

fn field_functions(params: &Arc<HashMap<String, Value>>) -> FunctionMap {
    let mut fcts = FunctionMap::new();
    let params = Arc::clone(params);
    fcts.insert("FIELD", move |eval, expr, env| {
        let name = eval.eval(expr.index("name")?, env)?;
        let name = name.as_str().map_err(|_| {
            anyhow!("FIELD argument 'name' should evaluate to a string, but got {name}")
        })?;
        params
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("FIELD '{name}' unknown"))
    });
    fcts
}

/// Validate an evaluated config transition: a list of configuration
/// overlays.
fn check_transition(transition: &Value) -> Result<()> {
    let entries = transition
        .as_list()
        .map_err(|_| anyhow!("expected list, but got {transition}"))?;
    for entry in entries {
        if !entry.is_map() {
            bail!("expected list of maps, but found {transition}");
        }
    }
    Ok(())
}

pub fn create_target_map(ctx: &Arc<AnalysisContext>) -> TargetMap {
    let ctx = Arc::clone(ctx);
    let reader: Reader<ConfiguredTarget, Arc<AnalysedTarget>> =
        Arc::new(move |ts, setter, logger, subcaller, key| {
            match &key.target {
                EntityName::Anonymous(_) => {
                    with_target_node(&ctx, key.clone(), ts, subcaller, setter, logger);
                }
                EntityName::Named(named) => match named.reference {
                    ReferenceKind::Tree => {
                        let wrapped = wrap_logger(&logger, {
                            let target = key.target.clone();
                            move |msg| {
                                format!(
                                    "while analysing {target} as explicit tree reference:\n{msg}"
                                )
                            }
                        });
                        tree_target(&ctx, key.clone(), ts, subcaller, setter, wrapped);
                    }
                    ReferenceKind::File => {
                        delegate_to_source(
                            &ctx,
                            key,
                            ts,
                            setter,
                            &logger,
                            "as explicit source target",
                        );
                    }
                    ReferenceKind::Target => {
                        let module = match key.target.to_module() {
                            Ok(module) => module,
                            Err(e) => {
                                logger(&format!("{e:#}"), true);
                                return;
                            }
                        };
                        let ctx = Arc::clone(&ctx);
                        let key = key.clone();
                        let ts_inner = Arc::clone(ts);
                        let fail_logger = wrap_logger(&logger, {
                            let target = key.target.clone();
                            move |msg| {
                                format!(
                                    "while searching targets description for {target}:\n{msg}"
                                )
                            }
                        });
                        ctx.targets_file_map.clone().consume_after_keys_ready(
                            ts,
                            &[module],
                            move |values| {
                                with_targets_file(
                                    &ctx,
                                    key,
                                    values[0].clone(),
                                    &ts_inner,
                                    subcaller,
                                    setter,
                                    logger,
                                );
                            },
                            fail_logger,
                        );
                    }
                },
            }
        });
    AsyncMapConsumer::new(reader)
}

fn delegate_to_source(
    ctx: &Arc<AnalysisContext>,
    key: &ConfiguredTarget,
    ts: &Arc<TaskSystem>,
    setter: TargetSetter,
    logger: &Logger,
    what: &'static str,
) {
    let fail_logger = wrap_logger(logger, {
        let target = key.target.clone();
        move |msg| format!("while analysing {target} {what}:\n{msg}")
    });
    ctx.source_map.consume_after_keys_ready(
        ts,
        &[key.target.clone()],
        move |values| setter(values[0].clone()),
        fail_logger,
    );
}

fn with_targets_file(
    ctx: &Arc<AnalysisContext>,
    key: ConfiguredTarget,
    targets_file: Value,
    ts: &Arc<TaskSystem>,
    subcaller: TargetSubCaller,
    setter: TargetSetter,
    logger: Logger,
) {
    let named = match key.target.named() {
        Ok(named) => named.clone(),
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let Some(desc) = targets_file.get(&named.name) else {
        // Not a defined target; treat it as an implicit source target.
        delegate_to_source(ctx, &key, ts, setter, &logger, "as implicit source target");
        return;
    };
    let desc = desc.clone();
    let Some(rule_ref) = desc.get("type") else {
        logger(
            &format!(
                "no type specified in the definition of target {}",
                key.target
            ),
            true,
        );
        return;
    };
    if let Ok(rule_name) = rule_ref.as_str() {
        if let Some(handler) = crate::built_in_rules::lookup(rule_name) {
            handler(desc.clone(), key, ctx, ts, subcaller, setter, logger);
            return;
        }
    }
    let rule_name = match EntityName::parse(rule_ref, &named) {
        Ok(rule_name) => rule_name,
        Err(e) => {
            logger(
                &format!(
                    "parsing rule name {rule_ref} for target {} failed with:\n{e:#}",
                    key.target
                ),
                true,
            );
            return;
        }
    };
    let fail_logger = wrap_logger(&logger, {
        let target = key.target.clone();
        move |msg| format!("while looking up rule for {target}:\n{msg}")
    });
    let result_map = Arc::clone(&ctx.result_map);
    let rule_name_inner = rule_name.clone();
    ctx.rule_map.clone().consume_after_keys_ready(
        ts,
        &[rule_name],
        move |values| {
            let rule = values[0].clone();
            let data = match TargetData::from_field_reader(&rule, &desc) {
                Ok(data) => data,
                Err(e) => {
                    logger(
                        &format!(
                            "failed to read data from target {} with rule {rule_name_inner}:\n{e:#}",
                            key.target
                        ),
                        true,
                    );
                    return;
                }
            };
            let wrapped = wrap_logger(&logger, {
                let target = key.target.clone();
                move |msg| {
                    format!("while analysing {rule_name_inner} target {target}:\n{msg}")
                }
            });
            with_rule_definition(rule, Arc::new(data), key, subcaller, setter, wrapped, result_map);
        },
        fail_logger,
    );
}

fn with_target_node(
    ctx: &Arc<AnalysisContext>,
    key: ConfiguredTarget,
    ts: &Arc<TaskSystem>,
    subcaller: TargetSubCaller,
    setter: TargetSetter,
    logger: Logger,
) {
    let anon = match key.target.anonymous() {
        Ok(anon) => anon.clone(),
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let node = match anon.target_node.as_node() {
        Ok(node) => Arc::clone(node),
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    match node.as_ref() {
        TargetNode::Value(value) => {
            // A fixed value node analyses to its stored result.
            match value.as_result() {
                Ok(result) => setter(Arc::new(AnalysedTarget::new(
                    result.as_ref().clone(),
                    vec![],
                    vec![],
                    vec![],
                    Default::default(),
                    Default::default(),
                ))),
                Err(e) => logger(&format!("{e:#}"), true),
            }
        }
        TargetNode::Abstract {
            node_type,
            string_fields,
            target_fields,
        } => {
            let Some(rule_ref) = anon.rule_map.get(node_type) else {
                logger(
                    &format!(
                        "cannot resolve type of node {} via rule map {}",
                        anon.target_node, anon.rule_map
                    ),
                    true,
                );
                return;
            };
            let rule_name = match rule_ref.as_name() {
                Ok(rule_name) => rule_name.as_ref().clone(),
                Err(e) => {
                    logger(&format!("invalid rule map entry for '{node_type}': {e:#}"), true);
                    return;
                }
            };
            let fail_logger = wrap_logger(&logger, {
                let target = key.target.clone();
                move |msg| format!("while looking up rule for {target}:\n{msg}")
            });
            let result_map = Arc::clone(&ctx.result_map);
            let node_type = node_type.clone();
            let string_fields = string_fields.clone();
            let target_fields = target_fields.clone();
            let rule_map_value = anon.rule_map.clone();
            let rule_name_inner = rule_name.clone();
            ctx.rule_map.clone().consume_after_keys_ready(
                ts,
                &[rule_name],
                move |values| {
                    let rule = values[0].clone();
                    let data = match TargetData::from_target_node(
                        &rule,
                        &node_type,
                        &string_fields,
                        &target_fields,
                        &rule_map_value,
                    ) {
                        Ok(data) => data,
                        Err(e) => {
                            logger(
                                &format!(
                                    "failed to read data from target {} with rule \
                                     {rule_name_inner}:\n{e:#}",
                                    key.target
                                ),
                                true,
                            );
                            return;
                        }
                    };
                    let wrapped = wrap_logger(&logger, {
                        let target = key.target.clone();
                        move |msg| {
                            format!("while analysing {rule_name_inner} target {target}:\n{msg}")
                        }
                    });
                    with_rule_definition(
                        rule,
                        Arc::new(data),
                        key,
                        subcaller,
                        setter,
                        wrapped,
                        result_map,
                    );
                },
                fail_logger,
            );
        }
    }
}

fn tree_target(
    ctx: &Arc<AnalysisContext>,
    key: ConfiguredTarget,
    ts: &Arc<TaskSystem>,
    subcaller: TargetSubCaller,
    setter: TargetSetter,
    logger: Logger,
) {
    let named = match key.target.named() {
        Ok(named) => named.clone(),
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let dir_name = path::join(&named.module, &named.name);
    let module = ModuleName {
        repository: named.repository.clone(),
        module: dir_name.clone(),
    };
    let result_map = Arc::clone(&ctx.result_map);
    let fail_logger = wrap_logger(&logger, {
        let target = key.target.clone();
        move |msg| format!("while analysing entries of {target}:\n{msg}")
    });
    ctx.directory_entries.clone().consume_after_keys_ready(
        ts,
        &[module],
        move |values| {
            let entries = values[0].clone();
            let mut inner: Vec<ConfiguredTarget> = Vec::new();
            for file in &entries.files {
                inner.push(ConfiguredTarget {
                    target: EntityName::Named(NamedTarget {
                        repository: named.repository.clone(),
                        module: dir_name.clone(),
                        name: file.clone(),
                        reference: ReferenceKind::File,
                    }),
                    config: Configuration::new(),
                });
            }
            for tree in &entries.trees {
                inner.push(ConfiguredTarget {
                    target: EntityName::Named(NamedTarget {
                        repository: named.repository.clone(),
                        module: dir_name.clone(),
                        name: tree.clone(),
                        reference: ReferenceKind::Tree,
                    }),
                    config: Configuration::new(),
                });
            }
            let inner_logger = logger.clone();
            let name = named.name.clone();
            let target = key.target.clone();
            subcaller.call(
                &inner,
                move |values| {
                    let mut stage: BTreeMap<String, ArtifactDescription> = BTreeMap::new();
                    for value in values {
                        let runfiles = match value.runfiles().as_map() {
                            Ok(runfiles) => runfiles,
                            Err(e) => {
                                inner_logger(&format!("{e:#}"), true);
                                return;
                            }
                        };
                        for (stage_path, artifact) in runfiles {
                            let artifact = match artifact.as_artifact() {
                                Ok(artifact) => artifact.clone(),
                                Err(e) => {
                                    inner_logger(&format!("{e:#}"), true);
                                    return;
                                }
                            };
                            stage.insert(path::normalize(stage_path), artifact);
                        }
                    }
                    let tree = Tree::new(stage);
                    let tree_artifact = Value::from(ArtifactDescription::Tree {
                        id: tree.id().to_string(),
                    });
                    let tree_map = Value::singleton_map(name.clone(), tree_artifact);
                    let analysed = Arc::new(AnalysedTarget::new(
                        TargetResult {
                            artifacts: tree_map.clone(),
                            runfiles: tree_map,
                            provides: Value::empty_map(),
                            is_cacheable: true,
                        },
                        vec![],
                        vec![],
                        vec![tree],
                        Default::default(),
                        Default::default(),
                    ));
                    let analysed = result_map.add(target, &Configuration::new(), analysed);
                    setter(analysed);
                },
                logger.clone(),
            );
        },
        fail_logger,
    );
}

fn with_rule_definition(
    rule: Arc<UserRule>,
    data: Arc<TargetData>,
    key: ConfiguredTarget,
    subcaller: TargetSubCaller,
    setter: TargetSetter,
    logger: Logger,
    result_map: Arc<ResultTargetMap>,
) {
    let param_config = key.config.prune(&data.target_vars);
    let no_functions = FunctionMap::new();

    // Evaluate the config fields.
    let mut params: HashMap<String, Value> = HashMap::new();
    for field_name in &rule.config_fields {
        let field_expression = &data.config_exprs[field_name];
        let field_value = match field_expression.evaluate(&param_config, &no_functions) {
            Ok(value) => value,
            Err(e) => {
                logger(
                    &format!("while evaluating config field {field_name}:\n{e:#}"),
                    true,
                );
                return;
            }
        };
        if let Err(e) = string_list(&format!("config field {field_name}"), &field_value) {
            logger(&format!("{e:#}"), true);
            return;
        }
        params.insert(field_name.clone(), field_value);
    }

    // Evaluate the config transitions with access to the config fields.
    let config_trans_fcts = field_functions(&Arc::new(params.clone()));
    let expression_config = key.config.prune(&rule.config_vars);
    let mut config_transitions: HashMap<String, Value> = HashMap::new();
    for (field_name, transition_expr) in &rule.config_transitions {
        let transition =
            match transition_expr.evaluate(&expression_config, &config_trans_fcts) {
                Ok(transition) => transition,
                Err(e) => {
                    logger(
                        &format!(
                            "while evaluating config transition for {field_name}:\n{e:#}"
                        ),
                        true,
                    );
                    return;
                }
            };
        if let Err(e) = check_transition(&transition) {
            logger(
                &format!("while evaluating config transition for {field_name}:\n{e:#}"),
                true,
            );
            return;
        }
        config_transitions.insert(field_name.clone(), transition);
    }

    // Resolve dependency references and request them under their
    // transitioned configurations.
    let mut anon_positions: HashMap<String, Vec<usize>> = rule
        .anonymous_definitions
        .values()
        .map(|def| (def.target.clone(), Vec::new()))
        .collect();
    let mut dependency_keys: Vec<ConfiguredTarget> = Vec::new();
    let mut transition_keys: Vec<ConfiguredTarget> = Vec::new();

    let mut request_deps = |field_name: &String,
                            dep_names: Vec<EntityName>,
                            anon_positions: &mut HashMap<String, Vec<usize>>|
     -> Result<()> {
        let transitions = config_transitions[field_name].as_list()?;
        for transition in transitions {
            let transitioned_config = key.config.update(transition)?;
            for dep in &dep_names {
                if let Some(positions) = anon_positions.get_mut(field_name) {
                    positions.push(dependency_keys.len());
                }
                dependency_keys.push(ConfiguredTarget {
                    target: dep.clone(),
                    config: transitioned_config.clone(),
                });
                transition_keys.push(ConfiguredTarget {
                    target: dep.clone(),
                    config: Configuration::from_map(transition.clone())?,
                });
            }
        }
        Ok(())
    };

    for field_name in &rule.target_fields {
        let deps_expression = &data.target_exprs[field_name];
        let deps_names = match deps_expression.evaluate(&param_config, &no_functions) {
            Ok(value) => value,
            Err(e) => {
                logger(
                    &format!("while evaluating target field {field_name}:\n{e:#}"),
                    true,
                );
                return;
            }
        };
        let entries = match deps_names.as_list() {
            Ok(entries) => entries,
            Err(_) => {
                logger(
                    &format!(
                        "target field {field_name} should evaluate to a list, \
                         but got {deps_names}"
                    ),
                    true,
                );
                return;
            }
        };
        let mut dep_names: Vec<EntityName> = Vec::new();
        let mut dep_exprs: Vec<Value> = Vec::new();
        for entry in entries {
            let name = if data.parse_target_names {
                let named = match key.target.named() {
                    Ok(named) => named,
                    Err(e) => {
                        logger(&format!("{e:#}"), true);
                        return;
                    }
                };
                match EntityName::parse(entry, named) {
                    Ok(name) => name,
                    Err(e) => {
                        logger(
                            &format!(
                                "parsing entry {entry} in target field {field_name} \
                                 failed with:\n{e:#}"
                            ),
                            true,
                        );
                        return;
                    }
                }
            } else {
                match entry.as_name() {
                    Ok(name) => name.as_ref().clone(),
                    Err(e) => {
                        logger(
                            &format!("in target field {field_name}:\n{e:#}"),
                            true,
                        );
                        return;
                    }
                }
            };
            dep_exprs.push(Value::from(name.clone()));
            dep_names.push(name);
        }
        if let Err(e) = request_deps(field_name, dep_names, &mut anon_positions) {
            logger(
                &format!("while requesting dependencies of {field_name}:\n{e:#}"),
                true,
            );
            return;
        }
        params.insert(field_name.clone(), Value::from(dep_exprs));
    }
    for (field_name, implicit_targets) in &rule.implicit_targets {
        if let Err(e) = request_deps(field_name, implicit_targets.clone(), &mut anon_positions) {
            logger(
                &format!(
                    "while requesting implicit dependencies of {field_name}:\n{e:#}"
                ),
                true,
            );
            return;
        }
    }
    for (field_name, exps) in &rule.implicit_target_exps {
        params.insert(field_name.clone(), exps.clone());
    }

    let subcaller_inner = subcaller.clone();
    let logger_inner = logger.clone();
    subcaller.call(
        &dependency_keys,
        move |values| {
            // All regular dependencies are analysed; read their provides
            // maps to construct and request the anonymous targets.
            let dependency_values: Vec<Arc<AnalysedTarget>> = values.to_vec();
            let mut params = params;
            let mut transition_keys = transition_keys;
            let mut anonymous_keys: Vec<ConfiguredTarget> = Vec::new();
            for (name, def) in &rule.anonymous_definitions {
                let mut anon_names: Vec<Value> = Vec::new();
                let positions = anon_positions.get(&def.target).cloned().unwrap_or_default();
                for pos in positions {
                    let provides = dependency_values[pos].provides();
                    let Some(provider_value) = provides.get(&def.provider) else {
                        logger_inner(
                            &format!(
                                "provider {} in {} does not exist",
                                def.provider, def.target
                            ),
                            true,
                        );
                        return;
                    };
                    let nodes = match provider_value.as_list() {
                        Ok(nodes) => nodes,
                        Err(_) => {
                            logger_inner(
                                &format!(
                                    "provider {} in {} must be a list of target \
                                     nodes but found: {provider_value}",
                                    def.provider, def.target
                                ),
                                true,
                            );
                            return;
                        }
                    };
                    for node in nodes {
                        if !node.is_node() {
                            logger_inner(
                                &format!(
                                    "entry in provider {} in {} must be a target \
                                     node but found: {node}",
                                    def.provider, def.target
                                ),
                                true,
                            );
                            return;
                        }
                        anon_names.push(Value::from(EntityName::Anonymous(AnonymousTarget {
                            rule_map: def.rule_map.clone(),
                            target_node: node.clone(),
                        })));
                    }
                }
                let transitions = match config_transitions[name].as_list() {
                    Ok(transitions) => transitions,
                    Err(e) => {
                        logger_inner(&format!("{e:#}"), true);
                        return;
                    }
                };
                for transition in transitions {
                    let transitioned_config = match key.config.update(transition) {
                        Ok(config) => config,
                        Err(e) => {
                            logger_inner(&format!("{e:#}"), true);
                            return;
                        }
                    };
                    let transition_config = match Configuration::from_map(transition.clone()) {
                        Ok(config) => config,
                        Err(e) => {
                            logger_inner(&format!("{e:#}"), true);
                            return;
                        }
                    };
                    for anon in &anon_names {
                        let target = match anon.as_name() {
                            Ok(name) => name.as_ref().clone(),
                            Err(e) => {
                                logger_inner(&format!("{e:#}"), true);
                                return;
                            }
                        };
                        anonymous_keys.push(ConfiguredTarget {
                            target: target.clone(),
                            config: transitioned_config.clone(),
                        });
                        transition_keys.push(ConfiguredTarget {
                            target,
                            config: transition_config.clone(),
                        });
                    }
                }
                params.insert(name.clone(), Value::from(anon_names));
            }
            let logger_join = logger_inner.clone();
            subcaller_inner.call(
                &anonymous_keys,
                move |anonymous_values| {
                    let mut dependency_values = dependency_values;
                    dependency_values.extend(anonymous_values.iter().cloned());
                    with_dependencies(
                        transition_keys,
                        dependency_values,
                        rule,
                        data,
                        key,
                        params,
                        setter,
                        logger_join,
                        result_map,
                    );
                },
                logger_inner,
            );
        },
        logger,
    );
}

#[allow(clippy::too_many_arguments)]
fn with_dependencies(
    transition_keys: Vec<ConfiguredTarget>,
    dependency_values: Vec<Arc<AnalysedTarget>>,
    rule: Arc<UserRule>,
    data: Arc<TargetData>,
    key: ConfiguredTarget,
    mut params: HashMap<String, Value>,
    setter: TargetSetter,
    logger: Logger,
    result_map: Arc<ResultTargetMap>,
) {
    // Associate dependency keys with values.
    let mut deps_by_transition: HashMap<ConfiguredTarget, Arc<AnalysedTarget>> =
        HashMap::with_capacity(transition_keys.len());
    for (transition, value) in transition_keys.iter().zip(&dependency_values) {
        deps_by_transition.insert(transition.clone(), Arc::clone(value));
    }

    // Compute the effective dependency on config variables.
    let mut effective_vars: BTreeSet<String> = data.target_vars.iter().cloned().collect();
    effective_vars.extend(rule.config_vars.iter().cloned());
    for (transition, value) in transition_keys.iter().zip(&dependency_values) {
        for var in value.vars() {
            if !transition.config.variable_fixed(var) {
                effective_vars.insert(var.clone());
            }
        }
    }
    let effective_conf = key.config.prune(&effective_vars);

    // Compute and verify taintedness.
    let param_config = key.config.prune(&data.target_vars);
    let no_functions = FunctionMap::new();
    let tainted_value = match data.tainted_expr.evaluate(&param_config, &no_functions) {
        Ok(value) => value,
        Err(e) => {
            logger(&format!("while evaluating tainted attribute:\n{e:#}"), true);
            return;
        }
    };
    let mut tainted: BTreeSet<String> = match string_list("tainted", &tainted_value) {
        Ok(strings) => strings.into_iter().collect(),
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    tainted.extend(rule.tainted.iter().cloned());
    for value in &dependency_values {
        if !value.tainted().is_subset(&tainted) {
            let missing: Vec<&String> = value.tainted().difference(&tainted).collect();
            logger(
                &format!(
                    "not tainted with all strings the dependencies are tainted \
                     with; missing: {missing:?}"
                ),
                true,
            );
            return;
        }
    }

    // Evaluate the string fields; they may inspect dependency outputs.
    let deps_by_transition: DepsByTransition = Arc::new(deps_by_transition);
    let mut string_fields_fcts = FunctionMap::new();
    {
        let deps = Arc::clone(&deps_by_transition);
        let current = key.target.clone();
        string_fields_fcts.insert("outs", move |eval, expr, env| {
            keys_expr(obtain_target_by_name(eval, expr, env, &current, &deps)?.artifacts())
        });
    }
    {
        let deps = Arc::clone(&deps_by_transition);
        let current = key.target.clone();
        string_fields_fcts.insert("runfiles", move |eval, expr, env| {
            keys_expr(obtain_target_by_name(eval, expr, env, &current, &deps)?.runfiles())
        });
    }
    for field_name in &rule.string_fields {
        let field_exp = &data.string_exprs[field_name];
        let field_value = match field_exp.evaluate(&param_config, &string_fields_fcts) {
            Ok(value) => value,
            Err(e) => {
                logger(
                    &format!("while evaluating string field {field_name}:\n{e:#}"),
                    true,
                );
                return;
            }
        };
        if let Err(e) = string_list(&format!("string field {field_name}"), &field_value) {
            logger(&format!("{e:#}"), true);
            return;
        }
        params.insert(field_name.clone(), field_value);
    }

    // Evaluate the defining expression.
    let collectors = Arc::new(Collectors::default());
    let params = Arc::new(params);
    let mut main_fcts = field_functions(&params);
    {
        let deps = Arc::clone(&deps_by_transition);
        main_fcts.insert("DEP_ARTIFACTS", move |eval, expr, env| {
            Ok(obtain_target(eval, expr, env, &deps)?.artifacts().clone())
        });
    }
    {
        let deps = Arc::clone(&deps_by_transition);
        main_fcts.insert("DEP_RUNFILES", move |eval, expr, env| {
            Ok(obtain_target(eval, expr, env, &deps)?.runfiles().clone())
        });
    }
    {
        let deps = Arc::clone(&deps_by_transition);
        main_fcts.insert("DEP_PROVIDES", move |eval, expr, env| {
            let provided = obtain_target(eval, expr, env, &deps)?;
            let provider = eval.eval(expr.index("provider")?, env)?;
            match provided.provides().get(provider.as_str()?) {
                Some(value) => Ok(value.clone()),
                None => eval.eval(expr.get_or("default", &Value::empty_list()), env),
            }
        });
    }
    {
        let collectors = Arc::clone(&collectors);
        let rule = Arc::clone(&rule);
        main_fcts.insert("ACTION", move |eval, expr, env| {
            action_primitive(eval, expr, env, &rule, &collectors)
        });
    }
    {
        let collectors = Arc::clone(&collectors);
        main_fcts.insert("BLOB", move |eval, expr, env| {
            let data = eval.eval(expr.get_or("data", &Value::from("")), env)?;
            let data = data
                .as_str()
                .map_err(|_| anyhow!("BLOB data has to be a string, but got {data}"))?;
            collectors.blobs.lock().push(data.to_string());
            Ok(Value::from(ArtifactDescription::Known {
                id: ContentHash::of(data),
                size: data.len(),
                file_type: crate::artifact::ObjectType::File,
            }))
        });
    }
    {
        let collectors = Arc::clone(&collectors);
        main_fcts.insert("TREE", move |eval, expr, env| {
            let val = eval.eval(expr.get_or("$1", &Value::empty_map()), env)?;
            let entries = val
                .as_map()
                .map_err(|_| anyhow!("TREE argument has to be a map of artifacts, but found {val}"))?;
            // A single entry staged at "." or "" must itself be a tree and
            // is passed through unchanged.
            for (stage_path, artifact) in entries {
                if path::normalize(stage_path) != "." {
                    continue;
                }
                if entries.len() > 1 {
                    bail!(
                        "input path '.' or '' for TREE is only allowed for \
                         trees with a single input artifact"
                    );
                }
                if !artifact
                    .as_artifact()
                    .map(ArtifactDescription::is_tree)
                    .unwrap_or(false)
                {
                    bail!("input path '.' or '' for TREE must be a tree artifact");
                }
                return Ok(artifact.clone());
            }
            let stage = artifact_stage("TREE argument", &val)?;
            let tree = Tree::new(stage);
            let id = tree.id().to_string();
            collectors.trees.lock().push(tree);
            Ok(Value::from(ArtifactDescription::Tree { id }))
        });
    }
    main_fcts.insert("VALUE_NODE", |eval, expr, env| {
        let val = eval.eval(expr.get_or("$1", &Value::Null), env)?;
        if !val.is_result() {
            bail!("argument '$1' for VALUE_NODE is not a RESULT value");
        }
        Ok(Value::from(TargetNode::Value(val)))
    });
    main_fcts.insert("ABSTRACT_NODE", abstract_node_primitive);
    main_fcts.insert("RESULT", |eval, expr, env| {
        let artifacts = eval.eval(expr.get_or("artifacts", &Value::empty_map()), env)?;
        let runfiles = eval.eval(expr.get_or("runfiles", &Value::empty_map()), env)?;
        let provides = eval.eval(expr.get_or("provides", &Value::empty_map()), env)?;
        for (what, value) in [("artifacts", &artifacts), ("runfiles", &runfiles)] {
            let entries = value
                .as_map()
                .map_err(|_| anyhow!("{what} has to be a map of artifacts, but found {value}"))?;
            for (stage_path, entry) in entries {
                if !entry.is_artifact() {
                    bail!(
                        "{what} has to be a map of artifacts, but found {entry} \
                         for {stage_path}"
                    );
                }
            }
        }
        if !provides.is_map() {
            bail!("provides has to be a map, but found {provides}");
        }
        let is_cacheable = provides.is_cacheable();
        Ok(Value::from(TargetResult {
            artifacts,
            runfiles,
            provides,
            is_cacheable,
        }))
    });

    let expression_config = key.config.prune(&rule.config_vars);
    let result = match rule.expression.evaluate(&expression_config, &main_fcts) {
        Ok(result) => result,
        Err(e) => {
            logger(
                &format!("while evaluating defining expression of rule:\n{e:#}"),
                true,
            );
            return;
        }
    };
    let result = match result.as_result() {
        Ok(result) => result.as_ref().clone(),
        Err(_) => {
            logger(
                &format!(
                    "defining expression should evaluate to a RESULT, but got: {result}"
                ),
                true,
            );
            return;
        }
    };
    let actions = std::mem::take(&mut *collectors.actions.lock());
    let blobs = std::mem::take(&mut *collectors.blobs.lock());
    let trees = std::mem::take(&mut *collectors.trees.lock());
    let analysed = Arc::new(AnalysedTarget::new(
        result,
        actions,
        blobs,
        trees,
        effective_vars,
        tainted,
    ));
    let analysed = result_map.add(key.target.clone(), &effective_conf, analysed);
    setter(analysed);
}

fn action_primitive(
    eval: &Evaluator,
    expr: &Value,
    env: &Configuration,
    rule: &UserRule,
    collectors: &Collectors,
) -> Result<Value> {
    let inputs_exp = eval.eval(expr.get_or("inputs", &Value::empty_map()), env)?;
    let inputs = artifact_stage("inputs", &inputs_exp)?;

    let outputs = action_outputs("outs", &eval.eval(expr.get_or("outs", &Value::empty_list()), env)?)?;
    let output_dirs = action_outputs(
        "out_dirs",
        &eval.eval(expr.get_or("out_dirs", &Value::empty_list()), env)?,
    )?;
    if outputs.is_empty() && output_dirs.is_empty() {
        bail!("either outs or out_dirs must be specified for ACTION");
    }
    let output_set: BTreeSet<&String> = outputs.iter().collect();
    if output_dirs.iter().any(|dir| output_set.contains(dir)) {
        bail!("outs and out_dirs for ACTION must be disjoint");
    }

    let cmd = eval.eval(expr.get_or("cmd", &Value::empty_list()), env)?;
    let command = string_list("cmd", &cmd)?;
    if command.is_empty() {
        bail!("cmd must not be an empty list");
    }
    let env_exp = eval.eval(expr.get_or("env", &Value::empty_map()), env)?;
    let mut action_env = BTreeMap::new();
    for (var, value) in env_exp
        .as_map()
        .map_err(|_| anyhow!("env has to be a map of strings, but found {env_exp}"))?
    {
        let value = value
            .as_str()
            .map_err(|_| anyhow!("env has to be a map of strings, but found {env_exp}"))?;
        action_env.insert(var.clone(), value.to_string());
    }

    // may_fail and no_cache are lists of taint strings; every entry must be
    // covered by the rule's taint.
    let taint_list = |field: &str| -> Result<Vec<String>> {
        let entries = string_list(field, expr.get_or(field, &Value::empty_list()))?;
        for entry in &entries {
            if !rule.tainted.contains(entry) {
                bail!("{field} contains entry '{entry}' the rule is not tainted with");
            }
        }
        Ok(entries)
    };
    let may_fail_entries = taint_list("may_fail")?;
    let may_fail = if may_fail_entries.is_empty() {
        None
    } else {
        let fail_msg = eval.eval(expr.get_or("fail_message", &Value::from("action failed")), env)?;
        let fail_msg = fail_msg
            .as_str()
            .map_err(|_| anyhow!("fail_message has to evaluate to a string, but got {fail_msg}"))?;
        Some(fail_msg.to_string())
    };
    let no_cache = !taint_list("no_cache")?.is_empty();

    let action = ActionDescription::new(
        outputs.clone(),
        output_dirs.clone(),
        command,
        action_env,
        may_fail,
        no_cache,
        inputs,
    )?;
    let action_id = action.id().to_string();
    collectors.actions.lock().push(action);
    let mut result = BTreeMap::new();
    for out in outputs.iter().chain(output_dirs.iter()) {
        result.insert(
            out.clone(),
            Value::from(ArtifactDescription::Action {
                id: action_id.clone(),
                path: out.clone(),
            }),
        );
    }
    Ok(Value::from(result))
}

fn abstract_node_primitive(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let node_type = eval.eval(expr.get_or("node_type", &Value::Null), env)?;
    let node_type = node_type
        .as_str()
        .map_err(|_| anyhow!("argument 'node_type' for ABSTRACT_NODE is not a string"))?
        .to_string();
    let string_fields = eval.eval(expr.get_or("string_fields", &Value::empty_map()), env)?;
    let target_fields = eval.eval(expr.get_or("target_fields", &Value::empty_map()), env)?;
    let strings = string_fields
        .as_map()
        .map_err(|_| anyhow!("argument 'string_fields' for ABSTRACT_NODE is not a map"))?;
    let targets = target_fields
        .as_map()
        .map_err(|_| anyhow!("argument 'target_fields' for ABSTRACT_NODE is not a map"))?;
    for (field_name, list) in strings {
        if targets.contains_key(field_name) {
            bail!(
                "string_fields and target_fields are not disjoint maps, found \
                 duplicate key: {field_name}"
            );
        }
        string_list(&format!("string field '{field_name}' for ABSTRACT_NODE"), list)?;
    }
    for (field_name, list) in targets {
        for entry in list.as_list().map_err(|_| {
            anyhow!("value for key {field_name} in argument 'target_fields' is not a list")
        })? {
            if !entry.is_node() {
                bail!(
                    "list entry for {field_name} in argument 'target_fields' for \
                     ABSTRACT_NODE is not a target node: {entry}"
                );
            }
        }
    }
    Ok(Value::from(TargetNode::Abstract {
        node_type,
        string_fields,
        target_fields,
    }))
}
