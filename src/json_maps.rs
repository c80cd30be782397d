// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use crate::async_map::{AsyncMapConsumer, Reader};
use crate::name::ModuleName;
use crate::path;
use crate::repo::{Repository, RepositoryConfig};
use crate::roots::DirectoryEntries;
use crate::value::Value;

/// Map from module to the parsed content of one of its description files.
pub type JsonFileMap = AsyncMapConsumer<ModuleName, Value>;

/// Map from module to its direct directory entries.
pub type DirectoryEntriesMap = AsyncMapConsumer<ModuleName, Arc<DirectoryEntries>>;

pub fn create_targets_file_map(repos: &Arc<RepositoryConfig>) -> JsonFileMap {
    create_json_file_map(repos, |r| &r.targets_file_name, false)
}

pub fn create_rules_file_map(repos: &Arc<RepositoryConfig>) -> JsonFileMap {
    create_json_file_map(repos, |r| &r.rules_file_name, true)
}

pub fn create_expression_file_map(repos: &Arc<RepositoryConfig>) -> JsonFileMap {
    create_json_file_map(repos, |r| &r.expression_file_name, true)
}

/// Resolve a module against its repository, rejecting modules that escape
/// the repository root.
fn module_path(key: &ModuleName) -> Result<String, String> {
    let module = path::normalize(&key.module);
    if key.module.starts_with('/') || path::escapes_root(&module) {
        return Err(format!(
            "modules have to live inside their repository, but found {}",
            key.module
        ));
    }
    Ok(module)
}

fn create_json_file_map(
    repos: &Arc<RepositoryConfig>,
    file_name: fn(&Repository) -> &String,
    mandatory: bool,
) -> JsonFileMap {
    let repos = Arc::clone(repos);
    let reader: Reader<ModuleName, Value> =
        Arc::new(move |_ts, setter, logger, _subcaller, key| {
            let Some(repository) = repos.repository(&key.repository) else {
                logger(&format!("unknown repository {}", key.repository), true);
                return;
            };
            let module = match module_path(key) {
                Ok(module) => module,
                Err(msg) => {
                    logger(&msg, true);
                    return;
                }
            };
            let file_path = path::join(&module, file_name(repository));
            if !repository.root.is_file(&file_path) {
                if mandatory {
                    logger(&format!("JSON file {file_path} does not exist"), true);
                } else {
                    setter(Value::empty_map());
                }
                return;
            }
            let Some(content) = repository.root.read_file(&file_path) else {
                logger(&format!("cannot read JSON file {file_path}"), true);
                return;
            };
            let json: serde_json::Value = match serde_json::from_slice(&content) {
                Ok(json) => json,
                Err(e) => {
                    logger(
                        &format!("JSON file {file_path} does not contain valid JSON: {e}"),
                        true,
                    );
                    return;
                }
            };
            if !json.is_object() {
                logger(&format!("JSON in {file_path} is not an object"), true);
                return;
            }
            setter(Value::from_json(&json));
        });
    AsyncMapConsumer::new(reader)
}

pub fn create_directory_entries_map(repos: &Arc<RepositoryConfig>) -> DirectoryEntriesMap {
    let repos = Arc::clone(repos);
    let reader: Reader<ModuleName, Arc<DirectoryEntries>> =
        Arc::new(move |_ts, setter, logger, _subcaller, key| {
            let Some(repository) = repos.repository(&key.repository) else {
                logger(&format!("unknown repository {}", key.repository), true);
                return;
            };
            let module = match module_path(key) {
                Ok(module) => module,
                Err(msg) => {
                    logger(&msg, true);
                    return;
                }
            };
            match repository.root.list(&module) {
                Some(entries) => setter(Arc::new(entries)),
                None => logger(&format!("directory {module} does not exist"), true),
            }
        });
    AsyncMapConsumer::new(reader)
}
