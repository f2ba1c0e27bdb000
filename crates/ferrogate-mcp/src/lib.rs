//! MCP Tool Subsystem (C9): multi-transport client lifecycle, qualified
//! tool catalogue, and tool execution routing.

pub mod manager;
pub mod protocol;
pub mod transport;

pub use manager::{ClientState, ConnType, McpClient, McpError, McpManager, ToolCall, ToolFilter};
pub use protocol::{McpToolDef, ToolCallResult, ToolsListResult};
pub use transport::{HttpTransport, InProcessTransport, McpTransport, SseTransport, StdioTransport, TransportError};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn echo_transport() -> InProcessTransport<impl Fn(&str, Option<serde_json::Value>) -> Result<serde_json::Value, TransportError>> {
        InProcessTransport::new(|method, params| match method {
            "initialize" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": [{ "name": "echo", "description": "echoes input" }] })),
            "tools/call" => Ok(json!({
                "content": [{ "type": "text", "text": params.map(|p| p.to_string()).unwrap_or_default() }],
                "isError": false,
            })),
            _ => Ok(json!({})),
        })
    }

    #[tokio::test]
    async fn client_connects_and_lists_its_tool() {
        let client = McpClient::new("demo", ConnType::InProcess, Box::new(echo_transport()));
        client.connect().await.unwrap();
        assert_eq!(client.state().await, ClientState::Connected);
        let tools = client.visible_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn manager_catalogues_qualified_tool_names() {
        let manager = McpManager::new();
        let client = McpClient::new("demo", ConnType::InProcess, Box::new(echo_transport()));
        manager.add(client).await.unwrap();

        let catalogue = manager.catalogue().await;
        assert_eq!(catalogue.len(), 1);
        assert_eq!(catalogue[0].0, "demo/echo");
    }

    #[tokio::test]
    async fn execute_tool_resolves_unqualified_name_to_first_owning_client() {
        let manager = McpManager::new();
        let client = McpClient::new("demo", ConnType::InProcess, Box::new(echo_transport()));
        manager.add(client).await.unwrap();

        let result = manager
            .execute_tool(
                &ToolCall {
                    name: "echo".to_string(),
                    arguments: json!({"x": 1}),
                },
                &ToolFilter::default(),
            )
            .await
            .unwrap();
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn per_request_exclude_filter_denies_tool() {
        let manager = McpManager::new();
        let client = McpClient::new("demo", ConnType::InProcess, Box::new(echo_transport()));
        manager.add(client).await.unwrap();

        let filter = ToolFilter {
            exclude_tools: vec!["echo".to_string()],
            ..Default::default()
        };
        let err = manager
            .execute_tool(
                &ToolCall {
                    name: "demo/echo".to_string(),
                    arguments: json!({}),
                },
                &filter,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ToolDenied(_)));
    }

    #[allow(dead_code)]
    fn assert_send_sync<T: Send + Sync>() {}
    #[test]
    fn manager_is_send_sync() {
        assert_send_sync::<Arc<McpManager>>();
    }
}
