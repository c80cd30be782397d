// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use crate::analysed_target::AnalysedTarget;
use crate::artifact::ArtifactDescription;
use crate::async_map::{wrap_logger, AsyncMapConsumer, Reader};
use crate::json_maps::DirectoryEntriesMap;
use crate::name::EntityName;
use crate::path;
use crate::value::{TargetResult, Value};

/// Map from source-file reference to its analysed target: a single local
/// artifact staged under the file's name, with no actions and no variable
/// dependency.
pub type SourceTargetMap = AsyncMapConsumer<EntityName, Arc<AnalysedTarget>>;

pub fn create_source_target_map(directory_entries: &DirectoryEntriesMap) -> SourceTargetMap {
    let directory_entries = directory_entries.clone();
    let reader: Reader<EntityName, Arc<AnalysedTarget>> =
        Arc::new(move |ts, setter, logger, _subcaller, key| {
            let named = match key.named() {
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
            if named.name.contains('/') {
                // Source files live directly in their module; reference the
                // deeper module instead.
                logger(
                    &format!(
                        "source file names must not contain '/', but found {}",
                        named.name
                    ),
                    true,
                );
                return;
            }
            let fail_logger = wrap_logger(&logger, {
                let named = named.clone();
                move |msg| format!("while reading directory entries for {named}:\n{msg}")
            });
            directory_entries.consume_after_keys_ready(
                ts,
                &[module],
                move |values| {
                    let entries = &values[0];
                    if !entries.files.contains(&named.name) {
                        logger(
                            &format!("source file {} not found in module", named.name),
                            true,
                        );
                        return;
                    }
                    let artifact = Value::from(ArtifactDescription::Local {
                        path: path::join(&named.module, &named.name),
                        repository: named.repository.clone(),
                    });
                    let stage = Value::singleton_map(named.name.clone(), artifact);
                    setter(Arc::new(AnalysedTarget::new(
                        TargetResult {
                            artifacts: stage.clone(),
                            runfiles: stage,
                            provides: Value::empty_map(),
                            is_cacheable: true,
                        },
                        vec![],
                        vec![],
                        vec![],
                        Default::default(),
                        Default::default(),
                    )));
                },
                fail_logger,
            );
        });
    AsyncMapConsumer::new(reader)
}
