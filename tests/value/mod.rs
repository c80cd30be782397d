// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use quarry::*;

#[test]
fn json_round_trip() -> Result<()> {
    let inputs = [
        "null",
        "true",
        "42",
        "-1.5",
        r#""hello""#,
        r#"[1, [2, "x"], {"a": null}]"#,
        r#"{"outer": {"inner": [true, false]}, "other": "y"}"#,
    ];
    for input in inputs {
        let json: serde_json::Value = serde_json::from_str(input)?;
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(JsonMode::SerializeAll), json);
    }
    Ok(())
}

#[test]
fn hash_is_deterministic_for_equal_values() -> Result<()> {
    let a = Value::from_json_str(r#"{"k": [1, 2, {"n": "v"}]}"#)?;
    let b = Value::from_json_str(r#"{"k": [1, 2, {"n": "v"}]}"#)?;
    assert_eq!(a, b);
    assert_eq!(a.to_hash(), b.to_hash());
    Ok(())
}

#[test]
fn hash_is_independent_of_map_order() -> Result<()> {
    let a = Value::from_json_str(r#"{"x": 1, "y": 2}"#)?;
    let b = Value::from_json_str(r#"{"y": 2, "x": 1}"#)?;
    assert_eq!(a.to_hash(), b.to_hash());
    Ok(())
}

#[test]
fn hash_is_sensitive_to_leaf_changes() -> Result<()> {
    let a = Value::from_json_str(r#"{"x": [1, 2, 3]}"#)?;
    let b = Value::from_json_str(r#"{"x": [1, 2, 4]}"#)?;
    assert_ne!(a.to_hash(), b.to_hash());
    Ok(())
}

#[test]
fn atoms_of_different_kinds_hash_differently() {
    // The sigil prefixes keep an artifact from colliding with the map that
    // serialises identically.
    let artifact = Value::from(ArtifactDescription::Local {
        path: "a".to_string(),
        repository: "".to_string(),
    });
    let plain = Value::from_json(&artifact.to_json(JsonMode::SerializeAll));
    assert_ne!(artifact.to_hash(), plain.to_hash());
}

#[test]
fn concurrent_hashing_agrees() -> Result<()> {
    let value = Value::from_json_str(r#"{"deep": [[1, 2], [3, 4], {"k": "v"}]}"#)?;
    let shared = Arc::new(value);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || shared.to_hash())
        })
        .collect();
    let mut digests = Vec::new();
    for handle in handles {
        digests.push(handle.join().map_err(|_| anyhow::anyhow!("thread panicked"))?);
    }
    assert!(digests.windows(2).all(|pair| pair[0] == pair[1]));
    Ok(())
}

#[test]
fn names_are_never_cacheable() {
    let name = Value::from(EntityName::Named(NamedTarget::target("", "m", "t")));
    assert!(!name.is_cacheable());
    let nested = Value::from(vec![Value::from(1i64), Value::from(vec![name])]);
    assert!(!nested.is_cacheable());
}

#[test]
fn cacheability_recurses_through_maps() {
    let result = Value::from(TargetResult {
        artifacts: Value::empty_map(),
        runfiles: Value::empty_map(),
        provides: Value::empty_map(),
        is_cacheable: false,
    });
    let mut entries = BTreeMap::new();
    entries.insert("ok".to_string(), Value::from(1i64));
    entries.insert("bad".to_string(), result);
    assert!(!Value::from(entries).is_cacheable());
}

#[test]
fn node_serialisation_modes() -> Result<()> {
    let result = TargetResult {
        artifacts: Value::empty_map(),
        runfiles: Value::empty_map(),
        provides: Value::empty_map(),
        is_cacheable: true,
    };
    let node = Value::from(TargetNode::Value(Value::from(result)));

    let full = node.to_json(JsonMode::SerializeAll);
    assert_eq!(full["type"], "VALUE_NODE");

    let by_id = node.to_json(JsonMode::SerializeAllButNodes);
    assert_eq!(by_id["type"], "NODE");
    assert_eq!(by_id["id"], serde_json::json!(node.to_identifier()));

    assert_eq!(node.to_json(JsonMode::NullForNonJson), serde_json::Value::Null);
    Ok(())
}

#[test]
fn selectors_report_type_errors() {
    let value = Value::from("a string");
    assert!(value.as_list().is_err());
    assert!(value.as_map().is_err());
    assert!(Value::Null.index("k").is_err());
    let list = Value::from(vec![Value::Null]);
    assert!(list.at(0).is_ok());
    assert!(list.at(1).is_err());
}

#[test]
fn non_finite_numbers_become_null() {
    // serde_json cannot represent non-finite numbers; the closest we can
    // check is that enormous values survive and stay finite.
    let json: serde_json::Value = serde_json::json!(1e308);
    assert!(matches!(Value::from_json(&json), Value::Number(_)));
}
