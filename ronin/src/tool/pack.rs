//! Namespaced, versioned bundles of tools.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::message::InputMap;

use super::SharedTool;

/// How a pack's tool names are resolved against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Registration fails on any name clash.
    #[default]
    Reject,
    /// An existing entry under the same name is kept.
    FirstWins,
    /// Every tool is exposed as `namespace.tool-name`, avoiding clashes.
    NamespacePrefix,
}

/// What a pack is allowed to touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackPermissions {
    /// Whether the pack's tools may reach the network.
    pub network: bool,
    /// Whether tool invocations are audited.
    pub audit: bool,
    /// Paths the pack's tools may operate on; empty means unrestricted.
    pub allowed_paths: Vec<PathBuf>,
}

/// Callback invoked with the raw input before each tool execution.
pub type AuditHook = Arc<dyn Fn(&str, &InputMap) + Send + Sync>;

/// A namespaced bundle of tools registered into the [`ToolManager`](super::ToolManager).
#[derive(Clone)]
pub struct ToolPack {
    /// Unique pack identifier.
    pub id: String,
    /// Namespace used for prefixed exposure.
    pub namespace: String,
    /// Pack version string.
    pub version: String,
    /// Priority for conflict resolution; higher wins.
    pub priority: i32,
    /// Name-conflict policy.
    pub conflict_policy: ConflictPolicy,
    /// Declared capabilities (informational).
    pub capabilities: Vec<String>,
    /// Pack permissions.
    pub permissions: PackPermissions,
    tools: Vec<SharedTool>,
    audit_hook: Option<AuditHook>,
}

impl ToolPack {
    /// Start building a pack.
    #[must_use]
    pub fn builder(id: impl Into<String>, namespace: impl Into<String>) -> ToolPackBuilder {
        ToolPackBuilder::new(id, namespace)
    }

    /// The pack's tools in registration order.
    #[must_use]
    pub fn tools(&self) -> &[SharedTool] {
        &self.tools
    }

    /// Exposed name for one of this pack's tools.
    ///
    /// Only the namespace-prefix policy prefixes; the other policies expose
    /// the bare tool name and resolve clashes at registration.
    #[must_use]
    pub fn exposed_name(&self, tool_name: &str) -> String {
        match self.conflict_policy {
            ConflictPolicy::NamespacePrefix => format!("{}.{}", self.namespace, tool_name),
            ConflictPolicy::Reject | ConflictPolicy::FirstWins => tool_name.to_string(),
        }
    }

    /// Run the pack's audit hook, if any, with the raw input.
    pub fn audit(&self, tool_name: &str, input: &InputMap) {
        if let Some(hook) = &self.audit_hook {
            hook(tool_name, input);
        }
    }
}

impl std::fmt::Debug for ToolPack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolPack")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("version", &self.version)
            .field("priority", &self.priority)
            .field("conflict_policy", &self.conflict_policy)
            .field(
                "tools",
                &self.tools.iter().map(|t| t.name().to_string()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Builder for [`ToolPack`].
pub struct ToolPackBuilder {
    id: String,
    namespace: String,
    version: String,
    priority: i32,
    conflict_policy: ConflictPolicy,
    capabilities: Vec<String>,
    permissions: PackPermissions,
    tools: Vec<SharedTool>,
    audit_hook: Option<AuditHook>,
}

impl ToolPackBuilder {
    fn new(id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            version: "0.1.0".to_string(),
            priority: 0,
            conflict_policy: ConflictPolicy::default(),
            capabilities: Vec::new(),
            permissions: PackPermissions::default(),
            tools: Vec::new(),
            audit_hook: None,
        }
    }

    /// Set the pack version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the registration priority; higher wins conflicts.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the conflict policy.
    #[must_use]
    pub const fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Declare a capability.
    #[must_use]
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Set the permissions.
    #[must_use]
    pub fn permissions(mut self, permissions: PackPermissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Add a tool.
    #[must_use]
    pub fn tool(mut self, tool: SharedTool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Set the audit hook.
    #[must_use]
    pub fn audit_hook(mut self, hook: AuditHook) -> Self {
        self.audit_hook = Some(hook);
        self
    }

    /// Build the pack.
    #[must_use]
    pub fn build(self) -> ToolPack {
        ToolPack {
            id: self.id,
            namespace: self.namespace,
            version: self.version,
            priority: self.priority,
            conflict_policy: self.conflict_policy,
            capabilities: self.capabilities,
            permissions: self.permissions,
            tools: self.tools,
            audit_hook: self.audit_hook,
        }
    }
}

impl std::fmt::Debug for ToolPackBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolPackBuilder")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
