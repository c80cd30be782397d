// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;

use anyhow::{anyhow, bail, Result};
use serde_json::json;

use crate::hasher::ContentHash;

/// Kind of a content-addressed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectType {
    File,
    Executable,
    Tree,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::File => "f",
            ObjectType::Executable => "x",
            ObjectType::Tree => "t",
        }
    }

    pub fn from_str(s: &str) -> Result<ObjectType> {
        match s {
            "f" => Ok(ObjectType::File),
            "x" => Ok(ObjectType::Executable),
            "t" => Ok(ObjectType::Tree),
            _ => bail!("invalid object type '{s}'"),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content-addressable handle to a file or tree.
///
/// Artifacts are not the objects themselves but descriptions sufficient to
/// locate or produce them: a path in a repository root, a known digest, the
/// output of an action, or a staged tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactDescription {
    Local {
        path: String,
        repository: String,
    },
    Known {
        id: ContentHash,
        size: usize,
        file_type: ObjectType,
    },
    Action {
        id: String,
        path: String,
    },
    Tree {
        id: String,
    },
}

impl ArtifactDescription {
    pub fn is_tree(&self) -> bool {
        matches!(
            self,
            ArtifactDescription::Tree { .. }
                | ArtifactDescription::Known {
                    file_type: ObjectType::Tree,
                    ..
                }
        )
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ArtifactDescription::Local { path, repository } => json!({
                "type": "LOCAL",
                "data": {"path": path, "repository": repository},
            }),
            ArtifactDescription::Known {
                id,
                size,
                file_type,
            } => json!({
                "type": "KNOWN",
                "data": {"id": id.hex(), "size": size, "file_type": file_type.as_str()},
            }),
            ArtifactDescription::Action { id, path } => json!({
                "type": "ACTION",
                "data": {"id": id, "path": path},
            }),
            ArtifactDescription::Tree { id } => json!({
                "type": "TREE",
                "data": {"id": id},
            }),
        }
    }

    pub fn from_json(desc: &serde_json::Value) -> Result<ArtifactDescription> {
        let obj = desc
            .as_object()
            .ok_or_else(|| anyhow!("artifact description must be an object, got {desc}"))?;
        let type_ = obj
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow!("artifact description lacks a string 'type' field"))?;
        let data = obj
            .get("data")
            .and_then(|d| d.as_object())
            .ok_or_else(|| anyhow!("artifact description lacks an object 'data' field"))?;
        let str_field = |name: &str| -> Result<String> {
            data.get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow!("artifact data lacks a string '{name}' field"))
        };
        match type_ {
            "LOCAL" => Ok(ArtifactDescription::Local {
                path: str_field("path")?,
                repository: str_field("repository")?,
            }),
            "KNOWN" => {
                let hex = str_field("id")?;
                let size = data
                    .get("size")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| anyhow!("artifact data lacks a numeric 'size' field"))?;
                Ok(ArtifactDescription::Known {
                    id: parse_hex_digest(&hex)?,
                    size: size as usize,
                    file_type: ObjectType::from_str(&str_field("file_type")?)?,
                })
            }
            "ACTION" => Ok(ArtifactDescription::Action {
                id: str_field("id")?,
                path: str_field("path")?,
            }),
            "TREE" => Ok(ArtifactDescription::Tree {
                id: str_field("id")?,
            }),
            _ => bail!("unknown artifact type '{type_}'"),
        }
    }
}

fn parse_hex_digest(hex: &str) -> Result<ContentHash> {
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(hex.get(i..i + 2).unwrap_or(""), 16)
                .map_err(|_| anyhow!("invalid digest '{hex}'"))
        })
        .collect::<Result<Vec<u8>>>()?;
    let arr: [u8; crate::hasher::DIGEST_LENGTH] = bytes
        .try_into()
        .map_err(|_| anyhow!("digest '{hex}' has the wrong length"))?;
    Ok(ContentHash::from_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() -> Result<()> {
        let artifacts = [
            ArtifactDescription::Local {
                path: "src/main.c".into(),
                repository: "".into(),
            },
            ArtifactDescription::Known {
                id: ContentHash::of("data"),
                size: 4,
                file_type: ObjectType::File,
            },
            ArtifactDescription::Action {
                id: ContentHash::of("action").hex(),
                path: "out".into(),
            },
            ArtifactDescription::Tree {
                id: ContentHash::of("tree").hex(),
            },
        ];
        for artifact in artifacts {
            assert_eq!(ArtifactDescription::from_json(&artifact.to_json())?, artifact);
        }
        Ok(())
    }
}
