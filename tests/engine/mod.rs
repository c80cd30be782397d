// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use anyhow::Result;
use quarry::roots::MemoryRoot;
use quarry::*;

fn engine(files: &[(&str, &str)]) -> Engine {
    let mut root = MemoryRoot::new();
    for (file_path, content) in files {
        root = root.add_file(file_path, *content);
    }
    Engine::new(RepositoryConfig::new().add("", Repository::new(Arc::new(root)))).with_jobs(4)
}

fn target(module: &str, name: &str) -> EntityName {
    EntityName::Named(NamedTarget::target("", module, name))
}

fn reference(module: &str, name: &str, kind: ReferenceKind) -> EntityName {
    EntityName::Named(NamedTarget {
        repository: "".to_string(),
        module: module.to_string(),
        name: name.to_string(),
        reference: kind,
    })
}

fn config(json: &str) -> Configuration {
    Configuration::from_map(Value::from_json_str(json).unwrap()).unwrap()
}

fn local(path: &str) -> Value {
    Value::from(ArtifactDescription::Local {
        path: path.to_string(),
        repository: "".to_string(),
    })
}

#[test]
fn source_file_as_target() -> Result<()> {
    let engine = engine(&[("m/a.c", "int main() { return 0; }")]);
    let analysed = engine.analyse(
        reference("m", "a.c", ReferenceKind::File),
        Configuration::new(),
    )?;
    assert_eq!(
        *analysed.artifacts(),
        Value::singleton_map("a.c", local("m/a.c"))
    );
    assert_eq!(analysed.runfiles(), analysed.artifacts());
    assert!(analysed.actions().is_empty());
    Ok(())
}

#[test]
fn undefined_target_is_implicit_source() -> Result<()> {
    let engine = engine(&[
        ("m/TARGETS", r#"{"other": {"type": "generic", "cmds": ["true"], "outs": ["o"]}}"#),
        ("m/b.c", "b"),
    ]);
    let analysed = engine.analyse(target("m", "b.c"), Configuration::new())?;
    assert_eq!(
        *analysed.artifacts(),
        Value::singleton_map("b.c", local("m/b.c"))
    );
    Ok(())
}

#[test]
fn missing_source_file_fails() {
    let engine = engine(&[("m/TARGETS", "{}")]);
    let err = engine
        .analyse(target("m", "nope.c"), Configuration::new())
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn generic_action() -> Result<()> {
    let engine = engine(&[
        (
            "m/TARGETS",
            r#"{"hello": {"type": "generic", "cmds": ["cp in.c out"],
                          "deps": ["in.c"], "outs": ["out"]}}"#,
        ),
        ("m/in.c", "int in;"),
    ]);
    let analysed = engine.analyse(target("m", "hello"), Configuration::new())?;
    assert_eq!(analysed.actions().len(), 1);
    let action = &analysed.actions()[0];
    assert_eq!(action.command(), ["sh", "-c", "cp in.c out"]);
    assert_eq!(action.outputs(), ["out"]);
    assert_eq!(
        action.inputs().get("in.c"),
        Some(&ArtifactDescription::Local {
            path: "m/in.c".to_string(),
            repository: "".to_string(),
        })
    );
    // The action identifier is the hash of the canonical serialisation and
    // the output artifact points back at it.
    assert_eq!(
        action.id(),
        ContentHash::of(action.to_json().to_string()).hex()
    );
    assert_eq!(
        *analysed.artifacts(),
        Value::singleton_map(
            "out",
            Value::from(ArtifactDescription::Action {
                id: action.id().to_string(),
                path: "out".to_string(),
            })
        )
    );
    Ok(())
}

#[test]
fn overlapping_outs_and_out_dirs_fail() {
    let engine = engine(&[(
        "m/TARGETS",
        r#"{"bad": {"type": "generic", "cmds": ["true"],
                    "outs": ["o"], "out_dirs": ["o"]}}"#,
    )]);
    let err = engine
        .analyse(target("m", "bad"), Configuration::new())
        .unwrap_err();
    assert!(err.to_string().contains("disjoint"));
}

const TRANSITION_RULES: &str = r#"
{"R": {"target_fields": ["deps"],
       "config_transitions": {"deps": [{"M": "dbg"}, {"M": "opt"}]},
       "expression":
         {"type": "RESULT", "provides":
           {"dbg": {"type": "foreach", "var": "d",
                    "range": {"type": "FIELD", "name": "deps"},
                    "body": {"type": "DEP_ARTIFACTS",
                             "dep": {"type": "var", "name": "d"},
                             "transition": {"type": "'", "$1": {"M": "dbg"}}}},
            "opt": {"type": "foreach", "var": "d",
                    "range": {"type": "FIELD", "name": "deps"},
                    "body": {"type": "DEP_ARTIFACTS",
                             "dep": {"type": "var", "name": "d"},
                             "transition": {"type": "'", "$1": {"M": "opt"}}}}}}}}
"#;

const TRANSITION_TARGETS: &str = r#"
{"x": {"type": ["rules", "R"], "deps": ["y"]},
 "y": {"type": "file_gen", "arguments_config": ["M"],
       "name": {"type": "var", "name": "M"}, "data": "d"}}
"#;

#[test]
fn config_transitions_analyse_dependencies_per_overlay() -> Result<()> {
    let engine = engine(&[
        ("rules/RULES", TRANSITION_RULES),
        ("m/TARGETS", TRANSITION_TARGETS),
    ]);
    let (outcome, registry) =
        engine.analyse_with_registry(target("m", "x"), config(r#"{"M": "orig"}"#));
    let analysed = outcome?;
    let blob = Value::from(ArtifactDescription::Known {
        id: ContentHash::of("d"),
        size: 1,
        file_type: ObjectType::File,
    });
    let mut expected = std::collections::BTreeMap::new();
    expected.insert(
        "dbg".to_string(),
        Value::from(vec![Value::singleton_map("dbg", blob.clone())]),
    );
    expected.insert(
        "opt".to_string(),
        Value::from(vec![Value::singleton_map("opt", blob)]),
    );
    assert_eq!(*analysed.provides(), Value::from(expected));
    // y was analysed once per transition, plus x itself.
    assert_eq!(registry.len(), 3);
    Ok(())
}

#[test]
fn effective_config_prunes_fixed_variables() -> Result<()> {
    // Both transitions fix M, so x itself does not depend on any variable
    // and analysing under an unrelated configuration yields the same value.
    let files = [
        ("rules/RULES", TRANSITION_RULES),
        ("m/TARGETS", TRANSITION_TARGETS),
    ];
    let a = engine(&files).analyse(target("m", "x"), config(r#"{"M": "orig"}"#))?;
    let b = engine(&files).analyse(target("m", "x"), Configuration::new())?;
    assert_eq!(a.result_hash(), b.result_hash());
    assert!(a.vars().is_empty());
    Ok(())
}

#[test]
fn analysis_is_deterministic_across_runs() -> Result<()> {
    let files = [
        ("rules/RULES", TRANSITION_RULES),
        ("m/TARGETS", TRANSITION_TARGETS),
    ];
    let a = engine(&files).analyse(target("m", "x"), config(r#"{"M": "a"}"#))?;
    let b = engine(&files).analyse(target("m", "x"), config(r#"{"M": "a"}"#))?;
    assert_eq!(a.result_hash(), b.result_hash());
    Ok(())
}

const ANONYMOUS_RULES: &str = r#"
{"P": {"expression":
        {"type": "RESULT", "provides":
          {"nodes": [{"type": "ABSTRACT_NODE", "node_type": "N",
                      "string_fields": {"strs": ["v1", "v2"]}}]}}},
 "R2": {"string_fields": ["strs"],
        "expression":
          {"type": "RESULT", "provides":
            {"got": {"type": "FIELD", "name": "strs"}}}},
 "R1": {"target_fields": ["deps"],
        "anonymous": {"anon": {"target": "deps", "provider": "nodes",
                               "rule_map": {"N": ["rules", "R2"]}}},
        "expression":
          {"type": "RESULT", "provides":
            {"collected": {"type": "foreach", "var": "d",
                           "range": {"type": "FIELD", "name": "anon"},
                           "body": {"type": "DEP_PROVIDES",
                                    "dep": {"type": "var", "name": "d"},
                                    "provider": "got"}}}}}}
"#;

#[test]
fn anonymous_targets_are_instantiated_from_providers() -> Result<()> {
    let engine = engine(&[
        ("rules/RULES", ANONYMOUS_RULES),
        (
            "m/TARGETS",
            r#"{"x": {"type": ["rules", "R1"], "deps": ["p"]},
                "p": {"type": ["rules", "P"]}}"#,
        ),
    ]);
    let analysed = engine.analyse(target("m", "x"), Configuration::new())?;
    assert_eq!(
        *analysed.provides(),
        Value::singleton_map(
            "collected",
            Value::from_json_str(r#"[["v1", "v2"]]"#)?
        )
    );
    Ok(())
}

#[test]
fn missing_provider_fails() {
    let engine = engine(&[
        ("rules/RULES", ANONYMOUS_RULES),
        (
            "m/TARGETS",
            r#"{"x": {"type": ["rules", "R1"], "deps": ["q"]},
                "q": {"type": ["rules", "R2"]}}"#,
        ),
    ]);
    let err = engine
        .analyse(target("m", "x"), Configuration::new())
        .unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn dependency_cycles_are_reported() {
    let engine = engine(&[
        (
            "rules/RULES",
            r#"{"C": {"target_fields": ["deps"], "expression": {"type": "RESULT"}}}"#,
        ),
        (
            "m/TARGETS",
            r#"{"a": {"type": ["rules", "C"], "deps": ["b"]},
                "b": {"type": ["rules", "C"], "deps": ["a"]}}"#,
        ),
    ]);
    let err = engine
        .analyse(target("m", "a"), Configuration::new())
        .unwrap_err();
    assert!(err.to_string().contains("cycle"));
}

const TAINT_RULES: &str = r#"
{"T": {"tainted": ["test"], "expression": {"type": "RESULT"}},
 "U": {"target_fields": ["deps"], "expression": {"type": "RESULT"}}}
"#;

#[test]
fn uncovered_dependency_taint_fails() {
    let engine = engine(&[
        ("rules/RULES", TAINT_RULES),
        (
            "m/TARGETS",
            r#"{"dep": {"type": ["rules", "T"]},
                "parent": {"type": ["rules", "U"], "deps": ["dep"]}}"#,
        ),
    ]);
    let err = engine
        .analyse(target("m", "parent"), Configuration::new())
        .unwrap_err();
    assert!(err.to_string().contains("tainted"));
}

#[test]
fn taint_propagates_to_covering_consumers() -> Result<()> {
    let engine = engine(&[
        ("rules/RULES", TAINT_RULES),
        (
            "m/TARGETS",
            r#"{"dep": {"type": ["rules", "T"]},
                "parent": {"type": ["rules", "U"], "deps": ["dep"],
                           "tainted": ["test"]}}"#,
        ),
    ]);
    let analysed = engine.analyse(target("m", "parent"), Configuration::new())?;
    assert!(analysed.tainted().contains("test"));
    Ok(())
}

#[test]
fn configure_built_in_overlays_the_configuration() -> Result<()> {
    let engine = engine(&[(
        "m/TARGETS",
        r#"{"c": {"type": "configure", "target": "y", "config": {"M": "opt"}},
            "y": {"type": "file_gen", "arguments_config": ["M"],
                  "name": {"type": "var", "name": "M"}, "data": "z"}}"#,
    )]);
    let analysed = engine.analyse(target("m", "c"), Configuration::new())?;
    assert!(analysed.artifacts().get("opt").is_some());
    // M is fixed by the overlay, so it is not an effective variable.
    assert!(analysed.vars().is_empty());
    Ok(())
}

#[test]
fn export_built_in_restricts_to_flexible_variables() -> Result<()> {
    let files = [(
        "m/TARGETS",
        r#"{"e": {"type": "export", "target": "y", "flexible_config": ["M"]},
            "y": {"type": "file_gen", "arguments_config": ["M"],
                  "name": {"type": "var", "name": "M"}, "data": "z"}}"#,
    )];
    let a = engine(&files).analyse(target("m", "e"), config(r#"{"M": "v", "EXTRA": 1}"#))?;
    let b = engine(&files).analyse(target("m", "e"), config(r#"{"M": "v"}"#))?;
    assert!(a.artifacts().get("v").is_some());
    assert_eq!(a.result_hash(), b.result_hash());
    Ok(())
}

#[test]
fn install_built_in_stages_files() -> Result<()> {
    let engine = engine(&[
        (
            "m/TARGETS",
            r#"{"i": {"type": "install", "deps": ["data.txt"],
                      "files": {"renamed/in.c": "in.c"}}}"#,
        ),
        ("m/data.txt", "d"),
        ("m/in.c", "i"),
    ]);
    let analysed = engine.analyse(target("m", "i"), Configuration::new())?;
    let artifacts = analysed.artifacts().as_map()?;
    assert_eq!(artifacts.get("data.txt"), Some(&local("m/data.txt")));
    assert_eq!(artifacts.get("renamed/in.c"), Some(&local("m/in.c")));
    Ok(())
}

#[test]
fn tree_built_in_bundles_dependency_artifacts() -> Result<()> {
    let engine = engine(&[
        (
            "m/TARGETS",
            r#"{"bundle": {"type": "tree", "deps": ["a.txt", "b.txt"]}}"#,
        ),
        ("m/a.txt", "a"),
        ("m/b.txt", "b"),
    ]);
    let analysed = engine.analyse(target("m", "bundle"), Configuration::new())?;
    assert_eq!(analysed.trees().len(), 1);
    let tree = &analysed.trees()[0];
    assert!(tree.artifacts().contains_key("a.txt"));
    assert!(tree.artifacts().contains_key("b.txt"));
    assert_eq!(
        *analysed.artifacts(),
        Value::singleton_map(
            "bundle",
            Value::from(ArtifactDescription::Tree {
                id: tree.id().to_string(),
            })
        )
    );
    Ok(())
}

#[test]
fn explicit_tree_reference_stages_the_directory() -> Result<()> {
    let engine = engine(&[
        ("m/dir/f1.txt", "1"),
        ("m/dir/sub/f2.txt", "2"),
    ]);
    let analysed = engine.analyse(
        reference("m", "dir", ReferenceKind::Tree),
        Configuration::new(),
    )?;
    assert_eq!(analysed.trees().len(), 1);
    let artifacts = analysed.artifacts().as_map()?;
    let dir = artifacts
        .get("dir")
        .and_then(|a| a.as_artifact().ok())
        .cloned();
    assert!(matches!(dir, Some(ArtifactDescription::Tree { .. })));
    let stage = analysed.trees()[0].artifacts();
    assert!(stage.contains_key("f1.txt"));
    assert!(matches!(
        stage.get("sub"),
        Some(ArtifactDescription::Tree { .. })
    ));
    Ok(())
}

const TREE_DOT_RULES: &str = r#"
{"Tr": {"expression":
         {"type": "let*",
          "bindings": [["inner", {"type": "TREE",
                                  "$1": {"sub": {"type": "BLOB", "data": "x"}}}]],
          "body": {"type": "RESULT",
                   "artifacts": {"type": "singleton_map", "key": "out",
                                 "value": {"type": "TREE",
                                           "$1": {"type": "singleton_map",
                                                  "key": ".",
                                                  "value": {"type": "var",
                                                            "name": "inner"}}}}}}},
 "TrBad": {"expression":
            {"type": "RESULT",
             "artifacts": {"type": "singleton_map", "key": "out",
                           "value": {"type": "TREE",
                                     "$1": {"type": "singleton_map", "key": ".",
                                            "value": {"type": "BLOB",
                                                      "data": "x"}}}}}}}
"#;

#[test]
fn tree_dot_passes_single_tree_through() -> Result<()> {
    let engine = engine(&[
        ("rules/RULES", TREE_DOT_RULES),
        ("m/TARGETS", r#"{"t": {"type": ["rules", "Tr"]}}"#),
    ]);
    let analysed = engine.analyse(target("m", "t"), Configuration::new())?;
    assert_eq!(analysed.trees().len(), 1);
    assert_eq!(analysed.blobs(), ["x"]);
    let tree_id = analysed.trees()[0].id().to_string();
    assert_eq!(
        *analysed.artifacts(),
        Value::singleton_map("out", Value::from(ArtifactDescription::Tree { id: tree_id }))
    );
    Ok(())
}

#[test]
fn tree_dot_rejects_non_tree_artifacts() {
    let engine = engine(&[
        ("rules/RULES", TREE_DOT_RULES),
        ("m/TARGETS", r#"{"t": {"type": ["rules", "TrBad"]}}"#),
    ]);
    let err = engine
        .analyse(target("m", "t"), Configuration::new())
        .unwrap_err();
    assert!(err.to_string().contains("tree artifact"));
}

#[test]
fn defining_expression_can_live_in_the_expression_file() -> Result<()> {
    let engine = engine(&[
        ("rules/RULES", r#"{"E": {"expression": "defexpr"}}"#),
        (
            "rules/EXPRESSIONS",
            r#"{"defexpr": {"type": "RESULT", "provides": {"from_file": [true]}}}"#,
        ),
        ("m/TARGETS", r#"{"t": {"type": ["rules", "E"]}}"#),
    ]);
    let analysed = engine.analyse(target("m", "t"), Configuration::new())?;
    assert_eq!(
        *analysed.provides(),
        Value::singleton_map("from_file", Value::from(vec![Value::Bool(true)]))
    );
    Ok(())
}

#[test]
fn unknown_target_fields_are_rejected() {
    let engine = engine(&[
        (
            "rules/RULES",
            r#"{"C": {"target_fields": ["deps"], "expression": {"type": "RESULT"}}}"#,
        ),
        (
            "m/TARGETS",
            r#"{"bad": {"type": ["rules", "C"], "nope": 1}}"#,
        ),
    ]);
    let err = engine
        .analyse(target("m", "bad"), Configuration::new())
        .unwrap_err();
    assert!(err.to_string().contains("unknown field"));
}

#[test]
fn unknown_repository_fails() {
    let engine = engine(&[]);
    let err = engine
        .analyse(
            EntityName::Named(NamedTarget::target("elsewhere", "m", "t")),
            Configuration::new(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("unknown repository"));
}

#[test]
fn string_fields_can_inspect_dependency_outputs() -> Result<()> {
    let engine = engine(&[
        (
            "rules/RULES",
            r#"{"S": {"target_fields": ["deps"], "string_fields": ["names"],
                      "expression": {"type": "RESULT",
                                     "provides": {"names": {"type": "FIELD",
                                                            "name": "names"}}}}}"#,
        ),
        (
            "m/TARGETS",
            r#"{"s": {"type": ["rules", "S"], "deps": ["f.txt"],
                      "names": {"type": "outs", "dep": "f.txt"}}}"#,
        ),
        ("m/f.txt", "f"),
    ]);
    let analysed = engine.analyse(target("m", "s"), Configuration::new())?;
    assert_eq!(
        *analysed.provides(),
        Value::singleton_map("names", Value::from(vec![Value::from("f.txt")]))
    );
    Ok(())
}
