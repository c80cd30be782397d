// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::analysed_target::AnalysedTarget;
use crate::async_map::Logger;
use crate::config::Configuration;
use crate::json_maps::{
    create_directory_entries_map, create_expression_file_map, create_rules_file_map,
    create_targets_file_map,
};
use crate::name::EntityName;
use crate::repo::RepositoryConfig;
use crate::result_map::ResultTargetMap;
use crate::rule::create_rule_map;
use crate::source_map::create_source_target_map;
use crate::target_map::{create_target_map, AnalysisContext, ConfiguredTarget};
use crate::task_system::TaskSystem;

/// Failure of one analysis request.
#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    /// The target could not be analysed; the report carries the breadcrumb
    /// trail from the failing site outwards.
    #[error("while analysing {target}:\n{report}")]
    Failed { target: String, report: String },
    /// The engine terminated without producing either a value or a report.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The engine facade: owns the repository table and runs analysis requests
/// over a fresh set of maps and a fresh worker pool per call.
#[derive(Debug, Clone)]
pub struct Engine {
    repos: Arc<RepositoryConfig>,
    jobs: usize,
}

impl Engine {
    pub fn new(repos: RepositoryConfig) -> Engine {
        Engine {
            repos: Arc::new(repos),
            jobs: 0,
        }
    }

    /// Fix the worker-pool size; zero means one thread per hardware core.
    pub fn with_jobs(mut self, jobs: usize) -> Engine {
        self.jobs = jobs;
        self
    }

    /// Analyse `target` under `config`, producing the analysed target
    /// together with the registry of everything analysed along the way.
    pub fn analyse_with_registry(
        &self,
        target: EntityName,
        config: Configuration,
    ) -> (Result<Arc<AnalysedTarget>, AnalysisError>, Arc<ResultTargetMap>) {
        debug!("analysing {target}");
        let targets_file_map = create_targets_file_map(&self.repos);
        let rules_file_map = create_rules_file_map(&self.repos);
        let expression_file_map = create_expression_file_map(&self.repos);
        let directory_entries = create_directory_entries_map(&self.repos);
        let source_map = create_source_target_map(&directory_entries);
        let rule_map = create_rule_map(&rules_file_map, &expression_file_map);
        let result_map = Arc::new(ResultTargetMap::new());
        let ctx = Arc::new(AnalysisContext {
            source_map,
            targets_file_map,
            rule_map,
            directory_entries,
            result_map: Arc::clone(&result_map),
        });
        let target_map = create_target_map(&ctx);

        let ts = TaskSystem::new(self.jobs);
        let result: Arc<Mutex<Option<Arc<AnalysedTarget>>>> = Arc::new(Mutex::new(None));
        let report: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let report_slot = Arc::clone(&report);
        let root_logger: Logger = Arc::new(move |msg, fatal| {
            if fatal {
                // Keep the first report; later failures are consequences.
                report_slot.lock().get_or_insert_with(|| msg.to_string());
            }
        });
        let result_slot = Arc::clone(&result);
        target_map.consume_after_keys_ready(
            &ts,
            &[ConfiguredTarget {
                target: target.clone(),
                config,
            }],
            move |values| {
                *result_slot.lock() = Some(values[0].clone());
            },
            root_logger,
        );
        ts.finish();

        let outcome = match result.lock().take() {
            Some(analysed) => Ok(analysed),
            None => match report.lock().take() {
                Some(report) => Err(AnalysisError::Failed {
                    target: target.to_string(),
                    report,
                }),
                None => Err(AnalysisError::Internal(
                    "analysis terminated without producing a result".to_string(),
                )),
            },
        };
        (outcome, result_map)
    }

    /// Analyse `target` under `config`.
    pub fn analyse(
        &self,
        target: EntityName,
        config: Configuration,
    ) -> Result<Arc<AnalysedTarget>, AnalysisError> {
        self.analyse_with_registry(target, config).0
    }
}
