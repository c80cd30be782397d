// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::sync::Arc;

use crate::roots::FileRoot;

/// Description of one logical repository: its content root and the names of
/// the description files the engine reads per module.
#[derive(Clone)]
pub struct Repository {
    pub root: Arc<dyn FileRoot>,
    pub targets_file_name: String,
    pub rules_file_name: String,
    pub expression_file_name: String,
}

impl Repository {
    pub fn new(root: Arc<dyn FileRoot>) -> Repository {
        Repository {
            root,
            targets_file_name: "TARGETS".to_string(),
            rules_file_name: "RULES".to_string(),
            expression_file_name: "EXPRESSIONS".to_string(),
        }
    }

    pub fn with_file_names(
        mut self,
        targets: impl Into<String>,
        rules: impl Into<String>,
        expressions: impl Into<String>,
    ) -> Repository {
        self.targets_file_name = targets.into();
        self.rules_file_name = rules.into();
        self.expression_file_name = expressions.into();
        self
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("targets_file_name", &self.targets_file_name)
            .field("rules_file_name", &self.rules_file_name)
            .field("expression_file_name", &self.expression_file_name)
            .finish()
    }
}

/// The repository-lookup capability injected into every map instance.
#[derive(Debug, Default)]
pub struct RepositoryConfig {
    repositories: HashMap<String, Repository>,
}

impl RepositoryConfig {
    pub fn new() -> RepositoryConfig {
        RepositoryConfig::default()
    }

    pub fn add(mut self, name: impl Into<String>, repository: Repository) -> RepositoryConfig {
        self.repositories.insert(name.into(), repository);
        self
    }

    pub fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.get(name)
    }
}
