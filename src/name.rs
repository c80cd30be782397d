// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;

use anyhow::{anyhow, bail, Result};
use serde_json::json;

use crate::path;
use crate::value::Value;

/// What a named reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Target,
    File,
    Tree,
}

/// A target name addressed by repository, module, and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedTarget {
    pub repository: String,
    pub module: String,
    pub name: String,
    pub reference: ReferenceKind,
}

/// A target defined by a rule map and an abstract target node instead of an
/// entry in a targets file. Identity is structural over both components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnonymousTarget {
    pub rule_map: Value,
    pub target_node: Value,
}

/// The name of a build unit: either a reference into a module's targets
/// file or an anonymous target synthesised during analysis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityName {
    Named(NamedTarget),
    Anonymous(AnonymousTarget),
}

/// Key of the per-module file maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleName {
    pub repository: String,
    pub module: String,
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[\"{}\",\"{}\"]", self.repository, self.module)
    }
}

impl NamedTarget {
    pub fn target(repository: impl Into<String>, module: &str, name: impl Into<String>) -> Self {
        NamedTarget {
            repository: repository.into(),
            module: path::normalize(module),
            name: name.into(),
            reference: ReferenceKind::Target,
        }
    }
}

impl EntityName {
    pub fn to_module(&self) -> Result<ModuleName> {
        match self {
            EntityName::Named(t) => Ok(ModuleName {
                repository: t.repository.clone(),
                module: t.module.clone(),
            }),
            EntityName::Anonymous(_) => bail!("anonymous targets do not live in a module"),
        }
    }

    pub fn named(&self) -> Result<&NamedTarget> {
        match self {
            EntityName::Named(t) => Ok(t),
            EntityName::Anonymous(_) => bail!("expected a named target"),
        }
    }

    pub fn anonymous(&self) -> Result<&AnonymousTarget> {
        match self {
            EntityName::Anonymous(t) => Ok(t),
            EntityName::Named(t) => bail!("expected an anonymous target, got {}", t),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            EntityName::Named(t) => {
                let tag = match t.reference {
                    ReferenceKind::Target => "@",
                    ReferenceKind::File => "FILE",
                    ReferenceKind::Tree => "TREE",
                };
                json!([tag, t.repository, t.module, t.name])
            }
            EntityName::Anonymous(t) => json!({
                "anonymous": {
                    "rule_map": t.rule_map.to_identifier(),
                    "target_node": t.target_node.to_identifier(),
                }
            }),
        }
    }

    /// Parse a target reference relative to the target currently being
    /// analysed. References are either a plain string (a target in the
    /// current module) or one of the list forms:
    ///
    /// - `["./", relpath, name]` — module relative to the current one
    /// - `["@", repository, module, name]` — fully qualified
    /// - `["FILE", null, name]` — file in the current module
    /// - `["TREE", null, name]` — tree in the current module
    /// - `[module, name]` — module in the current repository
    pub fn parse(reference: &Value, current: &NamedTarget) -> Result<EntityName> {
        match reference {
            Value::Name(name) => Ok(name.as_ref().clone()),
            Value::String(name) => Ok(EntityName::Named(NamedTarget {
                repository: current.repository.clone(),
                module: current.module.clone(),
                name: name.to_string(),
                reference: ReferenceKind::Target,
            })),
            Value::List(_) => Self::parse_list(reference, current),
            _ => bail!("invalid target reference {reference}"),
        }
    }

    fn parse_list(reference: &Value, current: &NamedTarget) -> Result<EntityName> {
        let items = reference.as_list()?;
        let string_at = |pos: usize| -> Result<&str> {
            items
                .get(pos)
                .ok_or_else(|| anyhow!("target reference {reference} is too short"))?
                .as_str()
                .map_err(|e| anyhow!("in target reference {reference}: {e}"))
        };
        match items.first() {
            Some(Value::String(tag)) if tag.as_ref() == "./" => {
                let module = path::join(&current.module, string_at(1)?);
                if path::escapes_root(&module) {
                    bail!("relative module {module} escapes repository root");
                }
                Ok(EntityName::Named(NamedTarget {
                    repository: current.repository.clone(),
                    module,
                    name: string_at(2)?.to_string(),
                    reference: ReferenceKind::Target,
                }))
            }
            Some(Value::String(tag)) if tag.as_ref() == "@" => {
                Ok(EntityName::Named(NamedTarget {
                    repository: string_at(1)?.to_string(),
                    module: path::normalize(string_at(2)?),
                    name: string_at(3)?.to_string(),
                    reference: ReferenceKind::Target,
                }))
            }
            Some(Value::String(tag)) if tag.as_ref() == "FILE" || tag.as_ref() == "TREE" => {
                let kind = if tag.as_ref() == "FILE" {
                    ReferenceKind::File
                } else {
                    ReferenceKind::Tree
                };
                if !matches!(items.get(1), Some(Value::Null)) {
                    bail!(
                        "explicit file or tree references are restricted to \
                         the current module, but got {reference}"
                    );
                }
                Ok(EntityName::Named(NamedTarget {
                    repository: current.repository.clone(),
                    module: current.module.clone(),
                    name: string_at(2)?.to_string(),
                    reference: kind,
                }))
            }
            Some(Value::String(_)) if items.len() == 2 => {
                let module = path::normalize(string_at(0)?);
                if path::escapes_root(&module) {
                    bail!("module {module} escapes repository root");
                }
                Ok(EntityName::Named(NamedTarget {
                    repository: current.repository.clone(),
                    module,
                    name: string_at(1)?.to_string(),
                    reference: ReferenceKind::Target,
                }))
            }
            _ => bail!("invalid target reference {reference}"),
        }
    }
}

impl fmt::Display for NamedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[\"{}\",\"{}\",\"{}\"]", self.repository, self.module, self.name)
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityName::Named(t) => write!(f, "{t}"),
            EntityName::Anonymous(t) => {
                write!(f, "#[{}]", t.target_node.to_identifier())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current() -> NamedTarget {
        NamedTarget::target("r", "lib/sub", "tgt")
    }

    #[test]
    fn plain_string_stays_in_module() -> Result<()> {
        let name = EntityName::parse(&Value::from("other"), &current())?;
        let named = name.named()?;
        assert_eq!(named.module, "lib/sub");
        assert_eq!(named.name, "other");
        assert_eq!(named.reference, ReferenceKind::Target);
        Ok(())
    }

    #[test]
    fn relative_module_is_joined() -> Result<()> {
        let reference = Value::from(vec![
            Value::from("./"),
            Value::from("../peer"),
            Value::from("x"),
        ]);
        let name = EntityName::parse(&reference, &current())?;
        assert_eq!(name.named()?.module, "lib/peer");
        Ok(())
    }

    #[test]
    fn escaping_module_is_rejected() {
        let reference = Value::from(vec![
            Value::from("./"),
            Value::from("../../../up"),
            Value::from("x"),
        ]);
        assert!(EntityName::parse(&reference, &current()).is_err());
    }

    #[test]
    fn file_reference_in_current_module() -> Result<()> {
        let reference = Value::from(vec![
            Value::from("FILE"),
            Value::Null,
            Value::from("data.txt"),
        ]);
        let name = EntityName::parse(&reference, &current())?;
        assert_eq!(name.named()?.reference, ReferenceKind::File);
        Ok(())
    }
}
