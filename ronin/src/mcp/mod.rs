//! Bridge an external Model Context Protocol server into the tool registry.
//!
//! The bridge wraps one server as a [`ToolPack`]: `connect` (idempotent)
//! starts the transport and lists tools, each remote tool passing the
//! allowlist becomes a [`Tool`], and `dispose` tears the transport down.
//! Transport errors during execution surface as tool failures, never as
//! panics or `Err` to the loop.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use rmcp::{
    model::{CallToolRequestParam, ClientCapabilities, Implementation, InitializeRequestParams},
    service::ServerSink,
    transport::{child_process::TokioChildProcess, StreamableHttpClientTransport},
    ServiceExt,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::message::InputMap;
use crate::tool::{ConflictPolicy, Tool, ToolExecCtx, ToolPack, ToolResponse};

/// Replacement for redacted audit fields.
const REDACTED: &str = "[REDACTED]";

/// How to reach the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpTransport {
    /// Launch a child process and speak JSON-RPC over stdio.
    Stdio {
        /// The command to execute.
        command: String,
        /// Command arguments.
        args: Vec<String>,
        /// Extra environment variables.
        env: HashMap<String, String>,
        /// Working directory for the child.
        cwd: Option<PathBuf>,
    },
    /// Open a streaming HTTP connection to the configured URL.
    Http {
        /// The server URL.
        url: String,
    },
}

impl McpTransport {
    /// A stdio transport for a local server process.
    #[must_use]
    pub fn stdio(command: impl Into<String>, args: &[&str]) -> Self {
        Self::Stdio {
            command: command.into(),
            args: args.iter().map(ToString::to_string).collect(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// An HTTP transport for a remote server.
    #[must_use]
    pub fn http(url: impl Into<String>) -> Self {
        Self::Http { url: url.into() }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Pack id and namespace for the bridged tools.
    pub namespace: String,
    /// How to reach the server.
    pub transport: McpTransport,
    /// Only these tool names are exposed; `None` exposes everything.
    pub allowed_tools: Option<HashSet<String>>,
    /// Input fields replaced with `[REDACTED]` in audit records.
    pub redact_input_fields: Vec<String>,
    /// Regexes applied globally to output text.
    pub redact_output_patterns: Vec<String>,
}

impl McpServerConfig {
    /// Configure a bridge.
    #[must_use]
    pub fn new(namespace: impl Into<String>, transport: McpTransport) -> Self {
        Self {
            namespace: namespace.into(),
            transport,
            allowed_tools: None,
            redact_input_fields: Vec::new(),
            redact_output_patterns: Vec::new(),
        }
    }

    /// Restrict the exposed tools.
    #[must_use]
    pub fn allow_tools(mut self, names: &[&str]) -> Self {
        self.allowed_tools = Some(names.iter().map(ToString::to_string).collect());
        self
    }

    /// Redact an input field in audit records.
    #[must_use]
    pub fn redact_input_field(mut self, field: impl Into<String>) -> Self {
        self.redact_input_fields.push(field.into());
        self
    }

    /// Redact output text matching a regex.
    #[must_use]
    pub fn redact_output_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.redact_output_patterns.push(pattern.into());
        self
    }
}

struct Connection {
    sink: ServerSink,
    tools: Vec<rmcp::model::Tool>,
    handle: JoinHandle<()>,
}

/// A connected (or connectable) MCP server exposed as a tool pack.
pub struct McpBridge {
    config: McpServerConfig,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl McpBridge {
    /// Create a bridge; nothing connects until [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the transport and list the server's tools. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Ok(());
        }

        let client_info = InitializeRequestParams {
            meta: None,
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "ronin".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        };

        let (sink, tools, handle) = match &self.config.transport {
            McpTransport::Http { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.as_str());
                let service = client_info.serve(transport).await.map_err(|e| {
                    Error::configuration(format!("mcp connect to {url} failed: {e}"))
                })?;
                let sink = service.peer().clone();
                let tools = service
                    .peer()
                    .list_tools(Default::default())
                    .await
                    .map_err(|e| Error::configuration(format!("mcp list_tools failed: {e}")))?
                    .tools;
                let handle = tokio::spawn(async move {
                    let _ = service.waiting().await;
                });
                (sink, tools, handle)
            }
            McpTransport::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);
                for (key, value) in env {
                    cmd.env(key, value);
                }
                if let Some(dir) = cwd {
                    cmd.current_dir(dir);
                }

                let transport = TokioChildProcess::new(cmd).map_err(|e| {
                    Error::configuration(format!("mcp spawn '{command}' failed: {e}"))
                })?;
                let service = client_info.serve(transport).await.map_err(|e| {
                    Error::configuration(format!("mcp handshake with '{command}' failed: {e}"))
                })?;
                let sink = service.peer().clone();
                let tools = service
                    .peer()
                    .list_tools(Default::default())
                    .await
                    .map_err(|e| Error::configuration(format!("mcp list_tools failed: {e}")))?
                    .tools;
                let handle = tokio::spawn(async move {
                    let _ = service.waiting().await;
                });
                (sink, tools, handle)
            }
        };

        debug!(
            namespace = %self.config.namespace,
            tools = tools.len(),
            "mcp server connected"
        );
        *connection = Some(Connection {
            sink,
            tools,
            handle,
        });
        Ok(())
    }

    /// Connect if needed and wrap the allowed tools as a pack.
    pub async fn tool_pack(&self) -> Result<ToolPack> {
        self.connect().await?;
        let connection = self.connection.lock().await;
        let connection = connection
            .as_ref()
            .ok_or_else(|| Error::invalid_state("mcp bridge lost its connection"))?;

        let patterns = compile_patterns(&self.config.redact_output_patterns);
        let mut builder = ToolPack::builder(&self.config.namespace, &self.config.namespace)
            .conflict_policy(ConflictPolicy::NamespacePrefix)
            .capability("mcp");

        for tool in &connection.tools {
            let name = tool.name.to_string();
            if let Some(allowed) = &self.config.allowed_tools {
                if !allowed.contains(&name) {
                    debug!(tool = %name, "mcp tool not in allowlist; skipped");
                    continue;
                }
            }
            builder = builder.tool(Arc::new(McpRemoteTool {
                name,
                description: tool
                    .description
                    .as_deref()
                    .unwrap_or("Remote MCP tool")
                    .to_string(),
                input_schema: Value::Object((*tool.input_schema).clone()),
                sink: connection.sink.clone(),
                redact_fields: self.config.redact_input_fields.clone(),
                patterns: Arc::new(patterns.clone()),
            }));
        }
        Ok(builder.build())
    }

    /// Close the transport and forget the tool list.
    pub async fn dispose(&self) {
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.take() {
            connection.handle.abort();
            debug!(namespace = %self.config.namespace, "mcp server disposed");
        }
    }
}

impl std::fmt::Debug for McpBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpBridge")
            .field("namespace", &self.config.namespace)
            .finish_non_exhaustive()
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(error) => {
                warn!(pattern, error = %error, "invalid redaction pattern; skipped");
                None
            }
        })
        .collect()
}

fn redact_input(input: &InputMap, fields: &[String]) -> InputMap {
    let mut redacted = input.clone();
    for field in fields {
        if redacted.contains_key(field) {
            redacted.insert(field.clone(), Value::String(REDACTED.to_string()));
        }
    }
    redacted
}

struct McpRemoteTool {
    name: String,
    description: String,
    input_schema: Value,
    sink: ServerSink,
    redact_fields: Vec<String>,
    patterns: Arc<Vec<Regex>>,
}

#[async_trait::async_trait]
impl Tool for McpRemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    async fn call(&self, ctx: &ToolExecCtx, input: InputMap) -> ToolResponse {
        let audited = redact_input(&input, &self.redact_fields);
        info!(
            target: "audit",
            tool = %self.name,
            request = %ctx.request_id(),
            input = %Value::Object(audited),
            "mcp tool call"
        );

        let result = self
            .sink
            .call_tool(CallToolRequestParam {
                name: self.name.clone().into(),
                arguments: Some(input),
            })
            .await;

        let result = match result {
            Ok(result) => result,
            Err(error) => return ToolResponse::fail(format!("mcp transport error: {error}")),
        };

        let mut text = result
            .content
            .iter()
            .filter_map(|part| part.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n");
        for pattern in self.patterns.iter() {
            text = pattern.replace_all(&text, REDACTED).into_owned();
        }

        if result.is_error.unwrap_or(false) {
            let mut response = ToolResponse::fail("mcp server reported an error");
            if !text.is_empty() {
                response.output = text;
            }
            response
        } else {
            ToolResponse::ok(text)
        }
    }
}
