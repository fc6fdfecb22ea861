//! Shared data-model types used across discovery, caching, and search (§3).

use serde::{Deserialize, Serialize};

use crate::schema::SchemaNode;

/// `{name, version}` reported by a backend during handshake; used for
/// version-triggered cache invalidation alongside `configHash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// One tool as reported by a backend, structurally identical across L1 and
/// the wire: `name` is unique within its backend, `inputSchema` is the
/// tagged-variant schema tree from `crate::schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: SchemaNode,
}

impl ToolDescriptor {
    /// `backend:tool`, the on-wire identity for search results and invocations.
    pub fn qualified_id(&self, backend: &str) -> String {
        format!("{backend}:{}", self.name)
    }

    /// One-line parameter summary fed into the embed source text (§4.5).
    pub fn param_summary(&self) -> String {
        match &self.input_schema {
            SchemaNode::Object { properties, .. } => {
                if properties.is_empty() {
                    "none".to_string()
                } else {
                    properties.keys().cloned().collect::<Vec<_>>().join(", ")
                }
            }
            _ => "none".to_string(),
        }
    }
}

/// Split a qualified tool id into `(backend, tool)`. Returns `None` if there
/// is no colon or either half is empty (§4.10 step 1, `InvalidToolId`).
pub fn split_qualified_id(qualified: &str) -> Option<(&str, &str)> {
    let (backend, tool) = qualified.split_once(':')?;
    if backend.is_empty() || tool.is_empty() {
        return None;
    }
    Some((backend, tool))
}
