//! Exposed-name tool registry and dispatch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{Error, Result, ToolError};
use crate::message::InputMap;
use crate::model::ToolDefinition;

use super::pack::{ConflictPolicy, ToolPack};
use super::{SharedTool, ToolExecCtx, ToolResponse};

struct ToolEntry {
    pack_id: String,
    priority: i32,
    tool: SharedTool,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, ToolEntry>,
    packs: HashMap<String, Arc<ToolPack>>,
}

/// Maps exposed tool names to pack-owned tools and dispatches execution.
#[derive(Default)]
pub struct ToolManager {
    registry: RwLock<Registry>,
}

impl ToolManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pack, resolving each tool name against the registry.
    ///
    /// `reject` fails the whole registration on any clash; `first-wins`
    /// keeps the incumbent unless the new pack has strictly higher
    /// priority; `namespace-prefix` exposes every tool under
    /// `namespace.name` and resolves residual clashes by priority, keeping
    /// the incumbent on ties.
    pub fn register(&self, pack: ToolPack) -> Result<()> {
        let pack = Arc::new(pack);
        let mut registry = self.registry.write().expect("tool registry poisoned");

        if pack.conflict_policy == ConflictPolicy::Reject {
            for tool in pack.tools() {
                let exposed = pack.exposed_name(tool.name());
                if registry.entries.contains_key(&exposed) {
                    return Err(Error::configuration(format!(
                        "tool name '{exposed}' from pack '{}' clashes with an existing registration",
                        pack.id
                    )));
                }
            }
        }

        for tool in pack.tools() {
            let exposed = pack.exposed_name(tool.name());
            match registry.entries.get(&exposed) {
                Some(existing) if existing.priority >= pack.priority => {
                    debug!(
                        name = %exposed,
                        incumbent = %existing.pack_id,
                        pack = %pack.id,
                        "keeping incumbent tool registration"
                    );
                    continue;
                }
                _ => {
                    registry.entries.insert(
                        exposed,
                        ToolEntry {
                            pack_id: pack.id.clone(),
                            priority: pack.priority,
                            tool: Arc::clone(tool),
                        },
                    );
                }
            }
        }
        registry.packs.insert(pack.id.clone(), pack);
        Ok(())
    }

    /// Remove a pack and every entry it owns.
    pub fn unregister(&self, pack_id: &str) {
        let mut registry = self.registry.write().expect("tool registry poisoned");
        registry.entries.retain(|_, entry| entry.pack_id != pack_id);
        registry.packs.remove(pack_id);
    }

    /// Whether a tool is registered under the exposed name.
    #[must_use]
    pub fn contains(&self, exposed_name: &str) -> bool {
        self.registry
            .read()
            .expect("tool registry poisoned")
            .entries
            .contains_key(exposed_name)
    }

    /// Number of exposed tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry
            .read()
            .expect("tool registry poisoned")
            .entries
            .len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Definitions for every exposed tool, under their exposed names.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let registry = self.registry.read().expect("tool registry poisoned");
        let mut defs: Vec<ToolDefinition> = registry
            .entries
            .iter()
            .map(|(exposed, entry)| entry.tool.definition().renamed(exposed))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Dispatch a call to the tool registered under the exposed name.
    ///
    /// The owning pack's audit hook runs with the raw input before the tool.
    pub async fn execute(
        &self,
        exposed_name: &str,
        ctx: &ToolExecCtx,
        input: InputMap,
    ) -> std::result::Result<ToolResponse, ToolError> {
        let (pack, tool) = {
            let registry = self.registry.read().expect("tool registry poisoned");
            let entry = registry
                .entries
                .get(exposed_name)
                .ok_or_else(|| ToolError::NotFound(exposed_name.to_string()))?;
            let pack = registry
                .packs
                .get(&entry.pack_id)
                .map(Arc::clone)
                .ok_or_else(|| ToolError::NotFound(exposed_name.to_string()))?;
            (pack, Arc::clone(&entry.tool))
        };

        pack.audit(exposed_name, &input);
        debug!(tool = %exposed_name, pack = %pack.id, "dispatching tool call");
        Ok(tool.call(ctx, input).await)
    }
}

impl std::fmt::Debug for ToolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read().expect("tool registry poisoned");
        let mut names: Vec<&String> = registry.entries.keys().collect();
        names.sort();
        f.debug_struct("ToolManager")
            .field("tools", &names)
            .finish_non_exhaustive()
    }
}
