//! MCP Manager (C9): client lifecycle, qualified tool catalogue, and routing
//! of tool calls to the owning client's transport.
//!
//! Grounded in the pack's `McpManager`/`McpServer` split — manager owns a map
//! of named clients, each client owns one transport plus its tool list and
//! connection state — extended with the explicit state machine, qualified
//! tool names, and allow/deny filtering this core requires.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use ferrogate_common::CoreError;

use crate::protocol::{self, McpToolDef, ToolCallResult, ToolsListResult};
use crate::transport::{McpTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Stdio,
    Http,
    Sse,
    InProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// One configured MCP server connection.
pub struct McpClient {
    pub name: String,
    pub conn_type: ConnType,
    transport: Box<dyn McpTransport>,
    state: RwLock<ClientState>,
    tools: RwLock<Vec<McpToolDef>>,
    /// If non-empty, only these tool names are exposed; takes precedence
    /// over `denylist` (§3 invariant).
    allowlist: RwLock<Vec<String>>,
    denylist: RwLock<Vec<String>>,
}

impl McpClient {
    pub fn new(name: impl Into<String>, conn_type: ConnType, transport: Box<dyn McpTransport>) -> Self {
        Self {
            name: name.into(),
            conn_type,
            transport,
            state: RwLock::new(ClientState::Connecting),
            tools: RwLock::new(Vec::new()),
            allowlist: RwLock::new(Vec::new()),
            denylist: RwLock::new(Vec::new()),
        }
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// `Connecting -> Connected` on successful handshake; `-> Failed` on
    /// transport error or protocol violation.
    pub async fn connect(&self) -> Result<(), McpError> {
        *self.state.write().await = ClientState::Connecting;

        let init_params = protocol::initialize_params();
        let params = serde_json::to_value(&init_params)
            .map_err(|e| McpError::Protocol(format!("failed to serialize initialize params: {e}")))?;

        let resp = match self.transport.send_request("initialize", Some(params)).await {
            Ok(resp) => resp,
            Err(e) => {
                *self.state.write().await = ClientState::Failed;
                return Err(McpError::Transport(e));
            }
        };
        if resp.is_error() {
            *self.state.write().await = ClientState::Failed;
            return Err(McpError::Protocol(format!(
                "initialize failed: {}",
                resp.error.unwrap()
            )));
        }

        if let Err(e) = self
            .transport
            .send_notification("notifications/initialized")
            .await
        {
            *self.state.write().await = ClientState::Failed;
            return Err(McpError::Transport(e));
        }

        let tools_resp = match self.transport.send_request("tools/list", None).await {
            Ok(resp) => resp,
            Err(e) => {
                *self.state.write().await = ClientState::Failed;
                return Err(McpError::Transport(e));
            }
        };

        let tools = if tools_resp.is_error() {
            Vec::new()
        } else {
            let raw = tools_resp.result.unwrap_or(Value::Null);
            serde_json::from_value::<ToolsListResult>(raw)
                .map(|r| r.tools)
                .unwrap_or_default()
        };
        *self.tools.write().await = tools;
        *self.state.write().await = ClientState::Connected;
        Ok(())
    }

    /// Clean close: `Connected -> Disconnected`.
    pub async fn disconnect(&self) {
        self.transport.shutdown().await;
        *self.state.write().await = ClientState::Disconnected;
    }

    /// `EditTools`: updates the per-client allow/deny lists that filter the
    /// catalogue and execution.
    pub async fn edit_filters(&self, add_allow: Vec<String>, remove_allow: Vec<String>) {
        let mut allow = self.allowlist.write().await;
        allow.retain(|t| !remove_allow.contains(t));
        for t in add_allow {
            if !allow.contains(&t) {
                allow.push(t);
            }
        }
    }

    pub async fn set_denylist(&self, denylist: Vec<String>) {
        *self.denylist.write().await = denylist;
    }

    /// Tools visible from this client after allow/deny filtering.
    pub async fn visible_tools(&self) -> Vec<McpToolDef> {
        let tools = self.tools.read().await;
        let allow = self.allowlist.read().await;
        let deny = self.denylist.read().await;
        tools
            .iter()
            .filter(|t| {
                if !allow.is_empty() {
                    allow.contains(&t.name)
                } else {
                    !deny.contains(&t.name)
                }
            })
            .cloned()
            .collect()
    }

    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        if !self.transport.is_alive() {
            return Err(McpError::ClientDown(self.name.clone()));
        }
        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        let resp = self
            .transport
            .send_request("tools/call", Some(params))
            .await
            .map_err(McpError::Transport)?;

        if resp.is_error() {
            return Err(McpError::Protocol(format!(
                "tools/call failed: {}",
                resp.error.unwrap()
            )));
        }
        let raw = resp.result.unwrap_or(Value::Null);
        serde_json::from_value(raw)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/call result: {e}")))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("MCP protocol error: {0}")]
    Protocol(String),
    #[error("MCP client not found: {0}")]
    ClientNotFound(String),
    #[error("MCP client is down: {0}")]
    ClientDown(String),
    #[error("tool denied by per-request filter: {0}")]
    ToolDenied(String),
}

impl From<McpError> for CoreError {
    fn from(e: McpError) -> Self {
        CoreError::mcp_fault(e.to_string())
    }
}

/// A resolved tool call awaiting execution.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Per-request include/exclude filters (§4.9 "Per-request filtering").
/// Include-lists take precedence over exclude-lists.
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    pub include_clients: Vec<String>,
    pub exclude_clients: Vec<String>,
    pub include_tools: Vec<String>,
    pub exclude_tools: Vec<String>,
}

impl ToolFilter {
    fn allows_client(&self, client: &str) -> bool {
        if !self.include_clients.is_empty() {
            self.include_clients.iter().any(|c| c == client)
        } else {
            !self.exclude_clients.iter().any(|c| c == client)
        }
    }

    fn allows_tool(&self, qualified: &str, unqualified: &str) -> bool {
        if !self.include_tools.is_empty() {
            self.include_tools
                .iter()
                .any(|t| t == qualified || t == unqualified)
        } else {
            !self
                .exclude_tools
                .iter()
                .any(|t| t == qualified || t == unqualified)
        }
    }
}

/// Manager owning all configured MCP clients (§4.9).
pub struct McpManager {
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    registration_order: RwLock<Vec<String>>,
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpManager {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            registration_order: RwLock::new(Vec::new()),
        }
    }

    /// `Add(cfg)`: registers and connects a new client.
    pub async fn add(&self, client: McpClient) -> Result<(), McpError> {
        let name = client.name.clone();
        client.connect().await?;
        let client = Arc::new(client);
        self.clients.write().await.insert(name.clone(), client);
        let mut order = self.registration_order.write().await;
        if !order.contains(&name) {
            order.push(name);
        }
        Ok(())
    }

    /// `Remove(name)`.
    pub async fn remove(&self, name: &str) -> Result<(), McpError> {
        let client = self
            .clients
            .write()
            .await
            .remove(name)
            .ok_or_else(|| McpError::ClientNotFound(name.to_string()))?;
        client.disconnect().await;
        self.registration_order.write().await.retain(|n| n != name);
        Ok(())
    }

    /// `Reconnect(name)`: only valid from `Disconnected`/`Failed`.
    pub async fn reconnect(&self, name: &str) -> Result<(), McpError> {
        let clients = self.clients.read().await;
        let client = clients
            .get(name)
            .ok_or_else(|| McpError::ClientNotFound(name.to_string()))?;
        client.connect().await
    }

    pub async fn edit_tools(
        &self,
        name: &str,
        add_allow: Vec<String>,
        remove_allow: Vec<String>,
    ) -> Result<(), McpError> {
        let clients = self.clients.read().await;
        let client = clients
            .get(name)
            .ok_or_else(|| McpError::ClientNotFound(name.to_string()))?;
        client.edit_filters(add_allow, remove_allow).await;
        Ok(())
    }

    /// `List()`.
    pub async fn list(&self) -> Vec<(String, ClientState)> {
        let clients = self.clients.read().await;
        let mut out = Vec::new();
        for client in clients.values() {
            out.push((client.name.clone(), client.state().await));
        }
        out
    }

    /// Qualified catalogue: `clientName/toolName -> McpToolDef`. The
    /// unqualified form resolves to the first-registered owning client.
    pub async fn catalogue(&self) -> Vec<(String, McpToolDef)> {
        let order = self.registration_order.read().await;
        let clients = self.clients.read().await;
        let mut out = Vec::new();
        for name in order.iter() {
            let Some(client) = clients.get(name) else {
                continue;
            };
            if client.state().await != ClientState::Connected {
                continue;
            }
            for tool in client.visible_tools().await {
                out.push((format!("{}/{}", client.name, tool.name), tool));
            }
        }
        out
    }

    /// The catalogue narrowed by a per-request [`ToolFilter`] (§4.9
    /// "Per-request filtering"), for merging into `Req.Params.Tools` before
    /// dispatch.
    pub async fn catalogue_filtered(&self, filter: &ToolFilter) -> Vec<(String, McpToolDef)> {
        self.catalogue()
            .await
            .into_iter()
            .filter(|(qualified, _)| {
                let client_name = qualified.split('/').next().unwrap_or(qualified);
                let unqualified = qualified.rsplit('/').next().unwrap_or(qualified);
                filter.allows_client(client_name) && filter.allows_tool(qualified, unqualified)
            })
            .collect()
    }

    /// Resolves a (possibly unqualified) tool name to its owning client.
    async fn resolve_client(&self, tool_name: &str) -> Option<String> {
        if let Some((client_name, _)) = tool_name.split_once('/') {
            let clients = self.clients.read().await;
            if clients.contains_key(client_name) {
                return Some(client_name.to_string());
            }
        }
        let order = self.registration_order.read().await;
        let clients = self.clients.read().await;
        for name in order.iter() {
            if let Some(client) = clients.get(name)
                && client.visible_tools().await.iter().any(|t| t.name == tool_name)
            {
                return Some(name.clone());
            }
        }
        None
    }

    /// `ExecuteTool(ctx, ToolCall) -> ToolResult` (§4.9).
    pub async fn execute_tool(
        &self,
        call: &ToolCall,
        filter: &ToolFilter,
    ) -> Result<ToolCallResult, McpError> {
        let client_name = self
            .resolve_client(&call.name)
            .await
            .ok_or_else(|| McpError::ClientNotFound(call.name.clone()))?;

        let unqualified = call.name.rsplit_once('/').map(|(_, t)| t).unwrap_or(&call.name);
        let qualified = format!("{client_name}/{unqualified}");

        if !filter.allows_client(&client_name) || !filter.allows_tool(&qualified, unqualified) {
            return Err(McpError::ToolDenied(qualified));
        }

        let clients = self.clients.read().await;
        let client = clients
            .get(&client_name)
            .ok_or_else(|| McpError::ClientNotFound(client_name.clone()))?;
        client.call_tool(unqualified, call.arguments.clone()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    pub async fn shutdown(&self) {
        let clients = self.clients.read().await;
        let futs: Vec<_> = clients.values().map(|c| c.disconnect()).collect();
        futures_util::future::join_all(futs).await;
    }
}
