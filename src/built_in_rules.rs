// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rules implemented directly by the engine. Each handler honours the same
//! analysed-target contract as user rules: it either produces a fully
//! analysed target or fails through the logger.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use crate::analysed_target::{ActionDescription, AnalysedTarget, Tree};
use crate::artifact::{ArtifactDescription, ObjectType};
use crate::async_map::{wrap_logger, Logger};
use crate::config::Configuration;
use crate::eval::FunctionMap;
use crate::hasher::ContentHash;
use crate::name::{EntityName, NamedTarget};
use crate::path;
use crate::target_map::{
    AnalysisContext, ConfiguredTarget, TargetSetter, TargetSubCaller,
};
use crate::task_system::TaskSystem;
use crate::value::{TargetResult, Value};

pub type BuiltinRule = fn(
    Value,
    ConfiguredTarget,
    &Arc<AnalysisContext>,
    &Arc<TaskSystem>,
    TargetSubCaller,
    TargetSetter,
    Logger,
);

pub fn lookup(rule_type: &str) -> Option<BuiltinRule> {
    match rule_type {
        "generic" => Some(generic_rule),
        "file_gen" => Some(file_gen_rule),
        "tree" => Some(tree_rule),
        "install" => Some(install_rule),
        "export" => Some(export_rule),
        "configure" => Some(configure_rule),
        _ => None,
    }
}

fn check_fields(desc: &Value, allowed: &[&str]) -> Result<()> {
    for key in desc.as_map()?.keys() {
        if key != "type" && key != "doc" && !allowed.contains(&key.as_str()) {
            bail!("unknown field '{key}' in target definition");
        }
    }
    Ok(())
}

fn literal_string_list(desc: &Value, field: &str) -> Result<Vec<String>> {
    match desc.get(field) {
        None => Ok(Vec::new()),
        Some(value) => value
            .as_list()
            .map_err(|_| anyhow!("field '{field}' has to be a list of strings"))?
            .iter()
            .map(|entry| {
                entry
                    .as_str()
                    .map(str::to_string)
                    .map_err(|_| anyhow!("field '{field}' has to be a list of strings"))
            })
            .collect(),
    }
}

fn eval_string_list(desc: &Value, field: &str, config: &Configuration) -> Result<Vec<String>> {
    let value = desc
        .get_or(field, &Value::empty_list())
        .evaluate(config, &FunctionMap::new())?;
    value
        .as_list()
        .map_err(|_| anyhow!("field '{field}' has to evaluate to a list of strings"))?
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .map(str::to_string)
                .map_err(|_| anyhow!("field '{field}' has to evaluate to a list of strings"))
        })
        .collect()
}

fn parse_refs(desc: &Value, field: &str, current: &NamedTarget) -> Result<Vec<EntityName>> {
    match desc.get(field) {
        None => Ok(Vec::new()),
        Some(list) => list
            .as_list()
            .map_err(|_| anyhow!("field '{field}' has to be a list of target references"))?
            .iter()
            .map(|entry| EntityName::parse(entry, current))
            .collect(),
    }
}

/// Union dependency artifact stages, rejecting conflicting entries.
fn stage_union(
    deps: &[Arc<AnalysedTarget>],
    select: impl Fn(&AnalysedTarget) -> &Value,
) -> Result<BTreeMap<String, ArtifactDescription>> {
    let mut stage: BTreeMap<String, ArtifactDescription> = BTreeMap::new();
    for dep in deps {
        for (stage_path, artifact) in select(dep.as_ref()).as_map()? {
            let artifact = artifact.as_artifact()?.clone();
            let norm_path = path::normalize(stage_path);
            if let Some(existing) = stage.get(&norm_path) {
                if *existing != artifact {
                    bail!("staging conflict for path {norm_path}");
                }
            }
            stage.insert(norm_path, artifact);
        }
    }
    if let Some(conflict) = path::tree_conflict(&stage) {
        bail!("staging conflicts on subtree {conflict}");
    }
    Ok(stage)
}

fn stage_value(stage: &BTreeMap<String, ArtifactDescription>) -> Value {
    Value::from(
        stage
            .iter()
            .map(|(stage_path, artifact)| (stage_path.clone(), Value::from(artifact.clone())))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn union_tainted(deps: &[Arc<AnalysedTarget>]) -> BTreeSet<String> {
    deps.iter()
        .flat_map(|dep| dep.tainted().iter().cloned())
        .collect()
}

fn union_vars(base: &[String], deps: &[Arc<AnalysedTarget>]) -> BTreeSet<String> {
    let mut vars: BTreeSet<String> = base.iter().cloned().collect();
    for dep in deps {
        vars.extend(dep.vars().iter().cloned());
    }
    vars
}

fn file_gen_rule(
    desc: Value,
    key: ConfiguredTarget,
    ctx: &Arc<AnalysisContext>,
    _ts: &Arc<TaskSystem>,
    _subcaller: TargetSubCaller,
    setter: TargetSetter,
    logger: Logger,
) {
    let logger = wrap_logger(&logger, {
        let target = key.target.clone();
        move |msg| format!("while analysing file_gen target {target}:\n{msg}")
    });
    let analysed = (|| -> Result<AnalysedTarget> {
        check_fields(&desc, &["arguments_config", "name", "data"])?;
        let vars = literal_string_list(&desc, "arguments_config")?;
        let param_config = key.config.prune(&vars);
        let no_functions = FunctionMap::new();
        let name = desc
            .get_or("name", &Value::from(""))
            .evaluate(&param_config, &no_functions)?;
        let name = name
            .as_str()
            .map_err(|_| anyhow!("field 'name' has to evaluate to a string"))?;
        let data = desc
            .get_or("data", &Value::from(""))
            .evaluate(&param_config, &no_functions)?;
        let data = data
            .as_str()
            .map_err(|_| anyhow!("field 'data' has to evaluate to a string"))?;
        let artifact = Value::from(ArtifactDescription::Known {
            id: ContentHash::of(data),
            size: data.len(),
            file_type: ObjectType::File,
        });
        let stage = Value::singleton_map(name, artifact);
        Ok(AnalysedTarget::new(
            TargetResult {
                artifacts: stage.clone(),
                runfiles: stage,
                provides: Value::empty_map(),
                is_cacheable: true,
            },
            vec![],
            vec![data.to_string()],
            vec![],
            vars.iter().cloned().collect(),
            Default::default(),
        ))
    })();
    match analysed {
        Ok(analysed) => {
            let vars: Vec<String> = analysed.vars().iter().cloned().collect();
            let effective_conf = key.config.prune(&vars);
            setter(
                ctx.result_map
                    .add(key.target.clone(), &effective_conf, Arc::new(analysed)),
            );
        }
        Err(e) => logger(&format!("{e:#}"), true),
    }
}

fn generic_rule(
    desc: Value,
    key: ConfiguredTarget,
    ctx: &Arc<AnalysisContext>,
    _ts: &Arc<TaskSystem>,
    subcaller: TargetSubCaller,
    setter: TargetSetter,
    logger: Logger,
) {
    let logger = wrap_logger(&logger, {
        let target = key.target.clone();
        move |msg| format!("while analysing generic target {target}:\n{msg}")
    });
    let named = match key.target.named() {
        Ok(named) => named.clone(),
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let prepared = (|| -> Result<(Vec<String>, Vec<EntityName>)> {
        check_fields(
            &desc,
            &["arguments_config", "deps", "cmds", "outs", "out_dirs", "env"],
        )?;
        let vars = literal_string_list(&desc, "arguments_config")?;
        let deps = parse_refs(&desc, "deps", &named)?;
        Ok((vars, deps))
    })();
    let (vars, deps) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let dependency_keys: Vec<ConfiguredTarget> = deps
        .iter()
        .map(|dep| ConfiguredTarget {
            target: dep.clone(),
            config: key.config.clone(),
        })
        .collect();
    let ctx = Arc::clone(ctx);
    let fail_logger = logger.clone();
    subcaller.call(
        &dependency_keys,
        move |values| {
            let analysed = (|| -> Result<AnalysedTarget> {
                let param_config = key.config.prune(&vars);
                let cmds = eval_string_list(&desc, "cmds", &param_config)?;
                if cmds.is_empty() {
                    bail!("cmds must not be empty");
                }
                let outs = eval_string_list(&desc, "outs", &param_config)?;
                let out_dirs = eval_string_list(&desc, "out_dirs", &param_config)?;
                let env_value = desc
                    .get_or("env", &Value::empty_map())
                    .evaluate(&param_config, &FunctionMap::new())?;
                let mut action_env = BTreeMap::new();
                for (var, value) in env_value.as_map()? {
                    action_env.insert(
                        var.clone(),
                        value
                            .as_str()
                            .map_err(|_| anyhow!("field 'env' has to be a map of strings"))?
                            .to_string(),
                    );
                }
                let inputs = stage_union(values, AnalysedTarget::artifacts)?;
                let action = ActionDescription::new(
                    outs.clone(),
                    out_dirs.clone(),
                    vec!["sh".to_string(), "-c".to_string(), cmds.join("\n")],
                    action_env,
                    None,
                    false,
                    inputs,
                )?;
                let action_id = action.id().to_string();
                let mut artifacts = BTreeMap::new();
                for out in outs.iter().chain(out_dirs.iter()) {
                    artifacts.insert(
                        out.clone(),
                        Value::from(ArtifactDescription::Action {
                            id: action_id.clone(),
                            path: out.clone(),
                        }),
                    );
                }
                Ok(AnalysedTarget::new(
                    TargetResult {
                        artifacts: Value::from(artifacts),
                        runfiles: Value::empty_map(),
                        provides: Value::empty_map(),
                        is_cacheable: true,
                    },
                    vec![action],
                    vec![],
                    vec![],
                    union_vars(&vars, values),
                    union_tainted(values),
                ))
            })();
            match analysed {
                Ok(analysed) => {
                    let effective_conf = key.config.prune(analysed.vars());
                    setter(ctx.result_map.add(
                        key.target.clone(),
                        &effective_conf,
                        Arc::new(analysed),
                    ));
                }
                Err(e) => logger(&format!("{e:#}"), true),
            }
        },
        fail_logger,
    );
}

fn tree_rule(
    desc: Value,
    key: ConfiguredTarget,
    ctx: &Arc<AnalysisContext>,
    _ts: &Arc<TaskSystem>,
    subcaller: TargetSubCaller,
    setter: TargetSetter,
    logger: Logger,
) {
    let logger = wrap_logger(&logger, {
        let target = key.target.clone();
        move |msg| format!("while analysing tree target {target}:\n{msg}")
    });
    let named = match key.target.named() {
        Ok(named) => named.clone(),
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let deps = match check_fields(&desc, &["deps"])
        .and_then(|()| parse_refs(&desc, "deps", &named))
    {
        Ok(deps) => deps,
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let dependency_keys: Vec<ConfiguredTarget> = deps
        .iter()
        .map(|dep| ConfiguredTarget {
            target: dep.clone(),
            config: key.config.clone(),
        })
        .collect();
    let ctx = Arc::clone(ctx);
    let fail_logger = logger.clone();
    subcaller.call(
        &dependency_keys,
        move |values| {
            let analysed = (|| -> Result<AnalysedTarget> {
                let stage = stage_union(values, AnalysedTarget::artifacts)?;
                let tree = Tree::new(stage);
                let tree_artifact = Value::from(ArtifactDescription::Tree {
                    id: tree.id().to_string(),
                });
                let stage = Value::singleton_map(named.name.clone(), tree_artifact);
                Ok(AnalysedTarget::new(
                    TargetResult {
                        artifacts: stage.clone(),
                        runfiles: stage,
                        provides: Value::empty_map(),
                        is_cacheable: true,
                    },
                    vec![],
                    vec![],
                    vec![tree],
                    union_vars(&[], values),
                    union_tainted(values),
                ))
            })();
            match analysed {
                Ok(analysed) => {
                    let effective_conf = key.config.prune(analysed.vars());
                    setter(ctx.result_map.add(
                        key.target.clone(),
                        &effective_conf,
                        Arc::new(analysed),
                    ));
                }
                Err(e) => logger(&format!("{e:#}"), true),
            }
        },
        fail_logger,
    );
}

fn install_rule(
    desc: Value,
    key: ConfiguredTarget,
    ctx: &Arc<AnalysisContext>,
    _ts: &Arc<TaskSystem>,
    subcaller: TargetSubCaller,
    setter: TargetSetter,
    logger: Logger,
) {
    let logger = wrap_logger(&logger, {
        let target = key.target.clone();
        move |msg| format!("while analysing install target {target}:\n{msg}")
    });
    let named = match key.target.named() {
        Ok(named) => named.clone(),
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    // Collect all referenced targets: plain deps, file mappings, and
    // directory stagings, in that order.
    let prepared = (|| -> Result<(Vec<EntityName>, Vec<String>, Vec<(EntityName, String)>)> {
        check_fields(&desc, &["deps", "files", "dirs"])?;
        let deps = parse_refs(&desc, "deps", &named)?;
        let mut file_paths = Vec::new();
        let mut file_refs = Vec::new();
        if let Some(files) = desc.get("files") {
            for (file_path, reference) in files.as_map()? {
                file_paths.push(file_path.clone());
                file_refs.push(EntityName::parse(reference, &named)?);
            }
        }
        let mut dirs = Vec::new();
        if let Some(dir_list) = desc.get("dirs") {
            for entry in dir_list.as_list()? {
                let reference = EntityName::parse(entry.at(0)?, &named)?;
                let dir_path = entry.at(1)?.as_str()?.to_string();
                dirs.push((reference, dir_path));
            }
        }
        let mut all = deps;
        all.extend(file_refs);
        Ok((all, file_paths, dirs))
    })();
    let (mut all_refs, file_paths, dirs) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let dep_count = all_refs.len() - file_paths.len();
    let dir_start = all_refs.len();
    all_refs.extend(dirs.iter().map(|(reference, _)| reference.clone()));
    let dependency_keys: Vec<ConfiguredTarget> = all_refs
        .iter()
        .map(|dep| ConfiguredTarget {
            target: dep.clone(),
            config: key.config.clone(),
        })
        .collect();
    let ctx = Arc::clone(ctx);
    let fail_logger = logger.clone();
    subcaller.call(
        &dependency_keys,
        move |values| {
            let analysed = (|| -> Result<AnalysedTarget> {
                let mut stage = stage_union(&values[..dep_count], AnalysedTarget::runfiles)?;
                for (file_path, value) in file_paths.iter().zip(&values[dep_count..dir_start]) {
                    let artifacts = value.artifacts().as_map()?;
                    if artifacts.len() != 1 {
                        bail!(
                            "target installed at {file_path} has to have exactly \
                             one artifact"
                        );
                    }
                    let artifact = artifacts
                        .values()
                        .next()
                        .and_then(|a| a.as_artifact().ok())
                        .ok_or_else(|| anyhow!("invalid artifact for {file_path}"))?;
                    let norm_path = path::normalize(file_path);
                    if stage.insert(norm_path.clone(), artifact.clone()).is_some() {
                        bail!("staging conflict for path {norm_path}");
                    }
                }
                for ((_, dir_path), value) in dirs.iter().zip(&values[dir_start..]) {
                    for (stage_path, artifact) in value.artifacts().as_map()? {
                        let norm_path = path::join(dir_path, stage_path);
                        let artifact = artifact.as_artifact()?.clone();
                        if let Some(existing) = stage.get(&norm_path) {
                            if *existing != artifact {
                                bail!("staging conflict for path {norm_path}");
                            }
                        }
                        stage.insert(norm_path, artifact);
                    }
                }
                if let Some(conflict) = path::tree_conflict(&stage) {
                    bail!("staging conflicts on subtree {conflict}");
                }
                let stage = stage_value(&stage);
                Ok(AnalysedTarget::new(
                    TargetResult {
                        artifacts: stage.clone(),
                        runfiles: stage,
                        provides: Value::empty_map(),
                        is_cacheable: true,
                    },
                    vec![],
                    vec![],
                    vec![],
                    union_vars(&[], values),
                    union_tainted(values),
                ))
            })();
            match analysed {
                Ok(analysed) => {
                    let effective_conf = key.config.prune(analysed.vars());
                    setter(ctx.result_map.add(
                        key.target.clone(),
                        &effective_conf,
                        Arc::new(analysed),
                    ));
                }
                Err(e) => logger(&format!("{e:#}"), true),
            }
        },
        fail_logger,
    );
}

fn export_rule(
    desc: Value,
    key: ConfiguredTarget,
    ctx: &Arc<AnalysisContext>,
    _ts: &Arc<TaskSystem>,
    subcaller: TargetSubCaller,
    setter: TargetSetter,
    logger: Logger,
) {
    let logger = wrap_logger(&logger, {
        let target = key.target.clone();
        move |msg| format!("while analysing export target {target}:\n{msg}")
    });
    let named = match key.target.named() {
        Ok(named) => named.clone(),
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let prepared = (|| -> Result<(EntityName, Vec<String>, Configuration)> {
        check_fields(&desc, &["target", "flexible_config", "fixed_config"])?;
        let reference = desc
            .get("target")
            .ok_or_else(|| anyhow!("export targets need a 'target' field"))?;
        let target = EntityName::parse(reference, &named)?;
        let flexible = literal_string_list(&desc, "flexible_config")?;
        let empty = Value::empty_map();
        let fixed = desc.get_or("fixed_config", &empty);
        for var in fixed.as_map()?.keys() {
            if flexible.contains(var) {
                bail!("fixed_config and flexible_config must be disjoint, found '{var}'");
            }
        }
        let target_config = key.config.prune(&flexible).update(fixed)?;
        Ok((target, flexible, target_config))
    })();
    let (target, flexible, target_config) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let ctx = Arc::clone(ctx);
    let fail_logger = logger.clone();
    subcaller.call(
        &[ConfiguredTarget {
            target,
            config: target_config,
        }],
        move |values| {
            let exported = &values[0];
            let analysed = AnalysedTarget::new(
                exported.result().clone(),
                vec![],
                vec![],
                vec![],
                flexible.iter().cloned().collect(),
                exported.tainted().clone(),
            );
            let effective_conf = key.config.prune(&flexible);
            setter(
                ctx.result_map
                    .add(key.target.clone(), &effective_conf, Arc::new(analysed)),
            );
        },
        fail_logger,
    );
}

fn configure_rule(
    desc: Value,
    key: ConfiguredTarget,
    ctx: &Arc<AnalysisContext>,
    _ts: &Arc<TaskSystem>,
    subcaller: TargetSubCaller,
    setter: TargetSetter,
    logger: Logger,
) {
    let logger = wrap_logger(&logger, {
        let target = key.target.clone();
        move |msg| format!("while analysing configure target {target}:\n{msg}")
    });
    let named = match key.target.named() {
        Ok(named) => named.clone(),
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let prepared = (|| -> Result<(EntityName, Vec<String>, Value, Configuration)> {
        check_fields(&desc, &["arguments_config", "target", "config"])?;
        let vars = literal_string_list(&desc, "arguments_config")?;
        let param_config = key.config.prune(&vars);
        let reference = desc
            .get("target")
            .ok_or_else(|| anyhow!("configure targets need a 'target' field"))?;
        let target = EntityName::parse(reference, &named)?;
        let overlay = desc
            .get_or("config", &Value::empty_map())
            .evaluate(&param_config, &FunctionMap::new())?;
        if !overlay.is_map() {
            bail!("field 'config' has to evaluate to a map, but got {overlay}");
        }
        let target_config = key.config.update(&overlay)?;
        Ok((target, vars, overlay, target_config))
    })();
    let (target, vars, overlay, target_config) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            logger(&format!("{e:#}"), true);
            return;
        }
    };
    let ctx = Arc::clone(ctx);
    let fail_logger = logger.clone();
    subcaller.call(
        &[ConfiguredTarget {
            target,
            config: target_config,
        }],
        move |values| {
            let configured = &values[0];
            let overlay_config = match Configuration::from_map(overlay.clone()) {
                Ok(config) => config,
                Err(e) => {
                    logger(&format!("{e:#}"), true);
                    return;
                }
            };
            let mut effective_vars: BTreeSet<String> = vars.iter().cloned().collect();
            for var in configured.vars() {
                if !overlay_config.variable_fixed(var) {
                    effective_vars.insert(var.clone());
                }
            }
            let analysed = AnalysedTarget::new(
                configured.result().clone(),
                vec![],
                vec![],
                vec![],
                effective_vars.clone(),
                configured.tainted().clone(),
            );
            let effective_conf = key.config.prune(&effective_vars);
            setter(
                ctx.result_map
                    .add(key.target.clone(), &effective_conf, Arc::new(analysed)),
            );
        },
        fail_logger,
    );
}
