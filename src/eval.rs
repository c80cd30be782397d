// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use lazy_static::lazy_static;

use crate::config::Configuration;
use crate::value::Value;

/// A function provided by the caller of an evaluation. Host functions are
/// resolved before built-ins of the same name and receive the unevaluated
/// call expression together with the current environment.
pub type HostFcn = Arc<dyn Fn(&Evaluator, &Value, &Configuration) -> Result<Value> + Send + Sync>;

type BuiltinFcn = fn(&Evaluator, &Value, &Configuration) -> Result<Value>;

/// Table of host functions for one evaluation.
#[derive(Clone, Default)]
pub struct FunctionMap {
    entries: HashMap<String, HostFcn>,
}

impl FunctionMap {
    pub fn new() -> FunctionMap {
        FunctionMap::default()
    }

    pub fn insert<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Evaluator, &Value, &Configuration) -> Result<Value> + Send + Sync + 'static,
    {
        self.entries.insert(name.to_string(), Arc::new(f));
    }

    fn get(&self, name: &str) -> Option<&HostFcn> {
        self.entries.get(name)
    }
}

impl std::fmt::Debug for FunctionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionMap")
            .field("names", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Interprets expression values against a configuration environment and a
/// host function table.
///
/// A map expression with a string `type` entry is a call; everything else
/// evaluates to itself after evaluating its children. Evaluation is pure:
/// the same expression under the same environment yields the same value.
#[derive(Debug)]
pub struct Evaluator<'a> {
    functions: &'a FunctionMap,
}

impl<'a> Evaluator<'a> {
    pub fn new(functions: &'a FunctionMap) -> Evaluator<'a> {
        Evaluator { functions }
    }

    pub fn eval(&self, expr: &Value, env: &Configuration) -> Result<Value> {
        match expr {
            Value::List(list) => {
                let mut items = Vec::with_capacity(list.items().len());
                for item in list.items() {
                    items.push(self.eval(item, env)?);
                }
                Ok(Value::from(items))
            }
            Value::Map(map) => match map.entries().get("type") {
                Some(ty) => {
                    let name = ty
                        .as_str()
                        .with_context(|| format!("call type in {expr} is not a string"))?;
                    self.apply(name, expr, env)
                        .with_context(|| format!("in call to '{name}'"))
                }
                None => {
                    let mut entries = BTreeMap::new();
                    for (k, v) in map.entries() {
                        entries.insert(k.clone(), self.eval(v, env)?);
                    }
                    Ok(Value::from(entries))
                }
            },
            _ => Ok(expr.clone()),
        }
    }

    fn apply(&self, name: &str, expr: &Value, env: &Configuration) -> Result<Value> {
        if let Some(f) = self.functions.get(name) {
            return f(self, expr, env);
        }
        match BUILTINS.get(name) {
            Some(f) => f(self, expr, env),
            None => bail!("unknown function '{name}'"),
        }
    }

    /// Evaluate the sub-expression stored under `key`, or the default.
    fn eval_field(&self, expr: &Value, key: &str, default: &Value, env: &Configuration) -> Result<Value> {
        self.eval(expr.get_or(key, default), env)
            .with_context(|| format!("while evaluating argument '{key}'"))
    }
}

impl Value {
    /// Evaluate this value as an expression.
    pub fn evaluate(&self, env: &Configuration, functions: &FunctionMap) -> Result<Value> {
        Evaluator::new(functions).eval(self, env)
    }
}

lazy_static! {
    static ref BUILTINS: HashMap<&'static str, BuiltinFcn> = {
        let mut m: HashMap<&'static str, BuiltinFcn> = HashMap::new();
        m.insert("var", var);
        m.insert("'", quote);
        m.insert("if", cond);
        m.insert("==", equal);
        m.insert("and", and);
        m.insert("or", or);
        m.insert("not", not);
        m.insert("++", concat_lists);
        m.insert("+", add);
        m.insert("*", mul);
        m.insert("join", join);
        m.insert("basename", basename);
        m.insert("change_ending", change_ending);
        m.insert("map_union", map_union);
        m.insert("disjoint_map_union", disjoint_map_union);
        m.insert("singleton_map", singleton_map);
        m.insert("lookup", lookup);
        m.insert("keys", keys);
        m.insert("values", values);
        m.insert("empty_map", empty_map);
        m.insert("range", range);
        m.insert("enumerate", enumerate);
        m.insert("nub_right", nub_right);
        m.insert("foreach", foreach);
        m.insert("foreach_map", foreach_map);
        m.insert("foldl", foldl);
        m.insert("let*", let_star);
        m.insert("env", env_restrict);
        m.insert("context", context_call);
        m.insert("assert_non_empty", assert_non_empty);
        m.insert("fail", fail);
        m
    };
    static ref EMPTY_LIST: Value = Value::empty_list();
    static ref EMPTY_MAP: Value = Value::empty_map();
}

/// Read a literal (unevaluated) string argument such as a variable name.
fn literal_string<'v>(expr: &'v Value, key: &str, default: &'v str) -> Result<&'v str> {
    match expr.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_str()
            .map_err(|_| anyhow!("argument '{key}' has to be a literal string, but found {v}")),
    }
}

fn ensure_string_list<'v>(what: &str, v: &'v Value) -> Result<Vec<&'v str>> {
    let items = v
        .as_list()
        .map_err(|_| anyhow!("{what} has to be a list of strings, but found {v}"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map_err(|_| anyhow!("{what} has to be a list of strings, but found entry {item}"))
        })
        .collect()
}

fn var(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let name = literal_string(expr, "name", "_")?;
    let value = env.lookup(name);
    if value.is_null() {
        if let Some(default) = expr.get("default") {
            return eval.eval(default, env);
        }
    }
    Ok(value)
}

fn quote(_eval: &Evaluator, expr: &Value, _env: &Configuration) -> Result<Value> {
    Ok(expr.get_or("$1", &EMPTY_LIST).clone())
}

fn cond(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let test = eval.eval_field(expr, "cond", &Value::Null, env)?;
    if test.is_true() {
        eval.eval_field(expr, "then", &EMPTY_LIST, env)
    } else {
        eval.eval_field(expr, "else", &EMPTY_LIST, env)
    }
}

fn equal(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let lhs = eval.eval_field(expr, "$1", &Value::Null, env)?;
    let rhs = eval.eval_field(expr, "$2", &Value::Null, env)?;
    Ok(Value::Bool(lhs == rhs))
}

fn and(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    // Arguments are kept unevaluated for short-circuiting.
    for arg in expr.get_or("$1", &EMPTY_LIST).as_list()? {
        if !eval.eval(arg, env)?.is_true() {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn or(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    for arg in expr.get_or("$1", &EMPTY_LIST).as_list()? {
        if eval.eval(arg, env)?.is_true() {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn not(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    Ok(Value::Bool(!eval.eval_field(expr, "$1", &Value::Null, env)?.is_true()))
}

fn concat_lists(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let lists = eval.eval_field(expr, "$1", &EMPTY_LIST, env)?;
    let mut items = Vec::new();
    for entry in lists
        .as_list()
        .map_err(|_| anyhow!("'++' expects a list of lists, but found {lists}"))?
    {
        items.extend_from_slice(
            entry
                .as_list()
                .map_err(|_| anyhow!("'++' expects a list of lists, but found entry {entry}"))?,
        );
    }
    Ok(Value::from(items))
}

fn add(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let args = eval.eval_field(expr, "$1", &EMPTY_LIST, env)?;
    let mut sum = 0f64;
    for arg in args.as_list()? {
        sum += arg.as_number()?.as_f64();
    }
    Ok(Value::from(sum))
}

fn mul(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let args = eval.eval_field(expr, "$1", &EMPTY_LIST, env)?;
    let mut product = 1f64;
    for arg in args.as_list()? {
        product *= arg.as_number()?.as_f64();
    }
    Ok(Value::from(product))
}

fn join(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let separator = eval.eval_field(expr, "separator", &Value::from(""), env)?;
    let parts = eval.eval_field(expr, "$1", &EMPTY_LIST, env)?;
    if let Ok(s) = parts.as_str() {
        return Ok(Value::from(s));
    }
    let parts = ensure_string_list("'join' argument", &parts)?;
    Ok(Value::from(parts.join(separator.as_str()?)))
}

fn basename(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let path = eval.eval_field(expr, "$1", &Value::Null, env)?;
    let path = path.as_str()?;
    Ok(Value::from(path.rsplit('/').next().unwrap_or(path)))
}

fn change_ending(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let path = eval.eval_field(expr, "$1", &Value::Null, env)?;
    let ending = eval.eval_field(expr, "ending", &Value::from(""), env)?;
    let path = path.as_str()?;
    let stem_end = match (path.rfind('/'), path.rfind('.')) {
        (Some(slash), Some(dot)) if dot > slash => dot,
        (None, Some(dot)) => dot,
        _ => path.len(),
    };
    Ok(Value::from(format!("{}{}", &path[..stem_end], ending.as_str()?)))
}

fn map_union(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let maps = eval.eval_field(expr, "$1", &EMPTY_LIST, env)?;
    let mut union = BTreeMap::new();
    for entry in maps
        .as_list()
        .map_err(|_| anyhow!("'map_union' expects a list of maps, but found {maps}"))?
    {
        for (k, v) in entry.as_map()? {
            union.insert(k.clone(), v.clone());
        }
    }
    Ok(Value::from(union))
}

fn disjoint_map_union(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let maps = eval.eval_field(expr, "$1", &EMPTY_LIST, env)?;
    let mut union: BTreeMap<String, Value> = BTreeMap::new();
    for entry in maps.as_list()? {
        for (k, v) in entry.as_map()? {
            if let Some(existing) = union.get(k) {
                if existing != v {
                    bail!("conflicting values for key '{k}': {existing} and {v}");
                }
            }
            union.insert(k.clone(), v.clone());
        }
    }
    Ok(Value::from(union))
}

fn singleton_map(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let key = eval.eval_field(expr, "key", &Value::Null, env)?;
    let value = eval.eval_field(expr, "value", &EMPTY_LIST, env)?;
    Ok(Value::singleton_map(key.as_str()?, value))
}

fn lookup(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let key = eval.eval_field(expr, "key", &Value::Null, env)?;
    let map = eval.eval_field(expr, "map", &EMPTY_MAP, env)?;
    let value = map.as_map()?.get(key.as_str()?).cloned();
    match value {
        Some(v) if !v.is_null() => Ok(v),
        _ => eval.eval_field(expr, "default", &EMPTY_LIST, env),
    }
}

fn keys(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let map = eval.eval_field(expr, "$1", &EMPTY_MAP, env)?;
    Ok(Value::from(
        map.as_map()?
            .keys()
            .map(|k| Value::from(k.as_str()))
            .collect::<Vec<_>>(),
    ))
}

fn values(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let map = eval.eval_field(expr, "$1", &EMPTY_MAP, env)?;
    Ok(Value::from(map.as_map()?.values().cloned().collect::<Vec<_>>()))
}

fn empty_map(_eval: &Evaluator, _expr: &Value, _env: &Configuration) -> Result<Value> {
    Ok(Value::empty_map())
}

fn range(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let bound = eval.eval_field(expr, "$1", &Value::from(0i64), env)?;
    let count = match &bound {
        Value::String(s) => s
            .parse::<usize>()
            .map_err(|_| anyhow!("'range' expects a number, but found {bound}"))?,
        _ => bound.as_number()?.as_usize()?,
    };
    Ok(Value::from(
        (0..count).map(|i| Value::from(i.to_string())).collect::<Vec<_>>(),
    ))
}

fn enumerate(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let items = eval.eval_field(expr, "$1", &EMPTY_LIST, env)?;
    let mut entries = BTreeMap::new();
    for (i, item) in items.as_list()?.iter().enumerate() {
        entries.insert(format!("{i:010}"), item.clone());
    }
    Ok(Value::from(entries))
}

fn nub_right(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let items = eval.eval_field(expr, "$1", &EMPTY_LIST, env)?;
    let items = items.as_list()?;
    let mut keep = vec![true; items.len()];
    for (i, item) in items.iter().enumerate() {
        if items[i + 1..].contains(item) {
            keep[i] = false;
        }
    }
    Ok(Value::from(
        items
            .iter()
            .zip(keep)
            .filter_map(|(item, keep)| keep.then(|| item.clone()))
            .collect::<Vec<_>>(),
    ))
}

fn foreach(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let var = literal_string(expr, "var", "_")?;
    let items = eval.eval_field(expr, "range", &EMPTY_LIST, env)?;
    let body = expr.get_or("body", &EMPTY_LIST);
    let mut results = Vec::new();
    for item in items.as_list()? {
        let scope = env.update(&Value::singleton_map(var, item.clone()))?;
        results.push(eval.eval(body, &scope)?);
    }
    Ok(Value::from(results))
}

fn foreach_map(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let var_key = literal_string(expr, "var_key", "_")?;
    let var_val = literal_string(expr, "var_val", "$_")?;
    let entries = eval.eval_field(expr, "range", &EMPTY_MAP, env)?;
    let body = expr.get_or("body", &EMPTY_LIST);
    let mut results = Vec::new();
    for (k, v) in entries.as_map()? {
        let mut bindings = BTreeMap::new();
        bindings.insert(var_key.to_string(), Value::from(k.as_str()));
        bindings.insert(var_val.to_string(), v.clone());
        let scope = env.update(&Value::from(bindings))?;
        results.push(eval.eval(body, &scope)?);
    }
    Ok(Value::from(results))
}

fn foldl(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let var = literal_string(expr, "var", "_")?;
    let accum_var = literal_string(expr, "accum_var", "$1")?;
    let items = eval.eval_field(expr, "range", &EMPTY_LIST, env)?;
    let body = expr.get_or("body", &EMPTY_LIST);
    let mut accum = eval.eval_field(expr, "start", &EMPTY_LIST, env)?;
    for item in items.as_list()? {
        let mut bindings = BTreeMap::new();
        bindings.insert(var.to_string(), item.clone());
        bindings.insert(accum_var.to_string(), accum);
        let scope = env.update(&Value::from(bindings))?;
        accum = eval.eval(body, &scope)?;
    }
    Ok(accum)
}

fn let_star(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let mut scope = env.clone();
    for binding in expr.get_or("bindings", &EMPTY_LIST).as_list()? {
        let name = binding
            .at(0)?
            .as_str()
            .with_context(|| format!("binding name in {binding}"))?;
        let value = eval
            .eval(binding.at(1)?, &scope)
            .with_context(|| format!("while evaluating binding of '{name}'"))?;
        scope = scope.update(&Value::singleton_map(name, value))?;
    }
    eval.eval_field(expr, "body", &EMPTY_LIST, &scope)
}

fn env_restrict(_eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let vars = ensure_string_list("'env' argument 'vars'", expr.get_or("vars", &EMPTY_LIST))?;
    let mut entries = BTreeMap::new();
    for var in vars {
        entries.insert(var.to_string(), env.lookup(var));
    }
    Ok(Value::from(entries))
}

fn context_call(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let msg = eval.eval_field(expr, "msg", &EMPTY_LIST, env)?;
    eval.eval_field(expr, "$1", &EMPTY_LIST, env)
        .with_context(|| format!("in context {msg}"))
}

fn assert_non_empty(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let value = eval.eval_field(expr, "$1", &Value::Null, env)?;
    let empty = match &value {
        Value::String(s) => s.is_empty(),
        Value::List(l) => l.items().is_empty(),
        Value::Map(m) => m.entries().is_empty(),
        _ => false,
    };
    if empty {
        let msg = eval.eval_field(expr, "msg", &Value::from("expected non-empty value"), env)?;
        bail!("{}", display_message(&msg));
    }
    Ok(value)
}

fn fail(eval: &Evaluator, expr: &Value, env: &Configuration) -> Result<Value> {
    let msg = eval.eval_field(expr, "msg", &Value::from("explicit failure"), env)?;
    bail!("{}", display_message(&msg))
}

fn display_message(msg: &Value) -> String {
    match msg {
        Value::String(s) => s.to_string(),
        _ => msg.dump(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_json(expr: &str, env: &str) -> Result<Value> {
        let expr = Value::from_json_str(expr)?;
        let env = Configuration::from_map(Value::from_json_str(env)?)?;
        expr.evaluate(&env, &FunctionMap::new())
    }

    #[test]
    fn literals_evaluate_to_themselves() -> Result<()> {
        assert_eq!(eval_json(r#"[1, "a", true]"#, "{}")?, Value::from_json_str(r#"[1, "a", true]"#)?);
        Ok(())
    }

    #[test]
    fn var_reads_environment() -> Result<()> {
        let v = eval_json(r#"{"type": "var", "name": "X"}"#, r#"{"X": "hello"}"#)?;
        assert_eq!(v, Value::from("hello"));
        Ok(())
    }

    #[test]
    fn var_default_applies_when_unset() -> Result<()> {
        let v = eval_json(r#"{"type": "var", "name": "X", "default": "d"}"#, "{}")?;
        assert_eq!(v, Value::from("d"));
        Ok(())
    }

    #[test]
    fn let_star_scopes_lexically() -> Result<()> {
        let v = eval_json(
            r#"{"type": "let*",
                "bindings": [["x", "a"], ["x", {"type": "join", "$1": [{"type": "var", "name": "x"}, "b"]}]],
                "body": {"type": "var", "name": "x"}}"#,
            "{}",
        )?;
        assert_eq!(v, Value::from("ab"));
        Ok(())
    }

    #[test]
    fn short_circuit_or_skips_failing_branch() -> Result<()> {
        let v = eval_json(
            r#"{"type": "or", "$1": [true, {"type": "fail", "msg": "boom"}]}"#,
            "{}",
        )?;
        assert_eq!(v, Value::Bool(true));
        Ok(())
    }

    #[test]
    fn foreach_maps_over_range() -> Result<()> {
        let v = eval_json(
            r#"{"type": "foreach", "var": "x", "range": ["1", "2"],
                "body": {"type": "join", "$1": [{"type": "var", "name": "x"}, "!"]}}"#,
            "{}",
        )?;
        assert_eq!(v, Value::from_json_str(r#"["1!", "2!"]"#)?);
        Ok(())
    }

    #[test]
    fn foldl_accumulates_in_order() -> Result<()> {
        let v = eval_json(
            r#"{"type": "foldl", "var": "x", "accum_var": "acc", "range": ["a", "b"], "start": "s",
                "body": {"type": "join", "$1": [{"type": "var", "name": "acc"}, {"type": "var", "name": "x"}]}}"#,
            "{}",
        )?;
        assert_eq!(v, Value::from("sab"));
        Ok(())
    }

    #[test]
    fn unknown_function_is_an_error() {
        let err = eval_json(r#"{"type": "no_such"}"#, "{}").unwrap_err();
        assert!(format!("{err:#}").contains("unknown function 'no_such'"));
    }

    #[test]
    fn fail_carries_breadcrumbs() {
        let err = eval_json(
            r#"{"type": "context", "msg": "outer",
                "$1": {"type": "fail", "msg": "inner"}}"#,
            "{}",
        )
        .unwrap_err();
        let report = format!("{err:#}");
        assert!(report.contains("outer"));
        assert!(report.contains("inner"));
    }

    #[test]
    fn host_functions_shadow_builtins() -> Result<()> {
        let mut functions = FunctionMap::new();
        functions.insert("join", |_, _, _| Ok(Value::from("shadowed")));
        let expr = Value::from_json_str(r#"{"type": "join", "$1": ["a", "b"]}"#)?;
        let v = expr.evaluate(&Configuration::new(), &functions)?;
        assert_eq!(v, Value::from("shadowed"));
        Ok(())
    }

    #[test]
    fn evaluation_is_pure() -> Result<()> {
        let expr = Value::from_json_str(
            r#"{"type": "map_union", "$1": [{"a": 1}, {"b": {"type": "var", "name": "X"}}]}"#,
        )?;
        let env = Configuration::from_map(Value::from_json_str(r#"{"X": [1, 2]}"#)?)?;
        let first = expr.evaluate(&env, &FunctionMap::new())?;
        let second = expr.evaluate(&env, &FunctionMap::new())?;
        assert_eq!(first.to_hash(), second.to_hash());
        Ok(())
    }
}
