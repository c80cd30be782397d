// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Unsafe code should not be used.
// Hard to reason about correctness, and maintainability.
#![forbid(unsafe_code)]
// Ensure that all lint names are valid.
#![deny(unknown_lints)]
#![deny(
    clippy::panic,
    clippy::unreachable,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::dbg_macro
)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

//! The analysis engine of a multi-repository, content-addressed build tool.
//!
//! Given a target reference and a configuration, the engine produces an
//! [`AnalysedTarget`]: a purely functional value describing the artifacts,
//! run-files, providers, and action graph realising that target. Analysis is
//! demand-driven over a shared worker pool; every intermediate step (file
//! loads, rule lookups, dependency analyses) is memoised in a keyed map with
//! per-key at-most-once computation and request-cycle detection.
//!
//! The engine consumes two injected capabilities, a repository lookup
//! ([`RepositoryConfig`]) and a file root ([`roots::FileRoot`]), and exposes
//! one operation, [`Engine::analyse`].

mod analysed_target;
mod artifact;
pub mod async_map;
mod built_in_rules;
mod config;
mod engine;
pub mod eval;
mod hasher;
mod json_maps;
mod name;
mod number;
mod path;
mod repo;
mod result_map;
pub mod roots;
mod rule;
mod source_map;
mod target_map;
pub mod task_system;
mod value;

pub use analysed_target::{ActionDescription, AnalysedTarget, Tree};
pub use artifact::{ArtifactDescription, ObjectType};
pub use config::Configuration;
pub use engine::{AnalysisError, Engine};
pub use hasher::{ContentHash, Hasher, DIGEST_LENGTH};
pub use name::{AnonymousTarget, EntityName, ModuleName, NamedTarget, ReferenceKind};
pub use number::Number;
pub use repo::{Repository, RepositoryConfig};
pub use result_map::ResultTargetMap;
pub use rule::UserRule;
pub use target_map::{AnalysisContext, ConfiguredTarget};
pub use value::{JsonMode, TargetNode, TargetResult, Value};
