//! Capability discovery run after the handshake.

use std::{collections::HashSet, sync::Arc};

use {
    serde::de::DeserializeOwned,
    tracing::{debug, info, warn},
};

use crate::{
    capability::{Capabilities, Prompt, Resource, ResourceTemplate, Tool},
    error::{Error, Result},
    session::Session,
    types::{ListPage, McpPromptDef, McpResourceDef, McpResourceTemplateDef, McpToolDef},
};

/// Send `notifications/initialized`, then list tools, resources, resource
/// templates and prompts.
///
/// A listing the server declines with a JSON-RPC error is empty. A decline
/// on a later page keeps the pages already listed. Transport failures
/// propagate.
pub async fn discover(session: &Arc<Session>) -> Result<Capabilities> {
    session.notify("notifications/initialized", None).await?;

    let weak = Arc::downgrade(session);
    let tools: Vec<McpToolDef> = list_all(session, "tools/list").await?;
    let resources: Vec<McpResourceDef> = list_all(session, "resources/list").await?;
    let templates: Vec<McpResourceTemplateDef> =
        list_all(session, "resources/templates/list").await?;
    let prompts: Vec<McpPromptDef> = list_all(session, "prompts/list").await?;

    let caps = Capabilities {
        tools: tools
            .into_iter()
            .map(|def| Tool::new(def, weak.clone()))
            .collect(),
        resources: resources
            .into_iter()
            .map(|def| Resource::new(def, weak.clone()))
            .collect(),
        resource_templates: templates.into_iter().map(ResourceTemplate::from).collect(),
        prompts: prompts
            .into_iter()
            .map(|def| Prompt::new(def, weak.clone()))
            .collect(),
    };

    info!(
        tools = caps.tools.len(),
        resources = caps.resources.len(),
        resource_templates = caps.resource_templates.len(),
        prompts = caps.prompts.len(),
        "capabilities discovered"
    );
    Ok(caps)
}

/// Follow `nextCursor` until the listing is exhausted.
async fn list_all<T: DeserializeOwned>(session: &Session, method: &str) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen = HashSet::new();

    loop {
        let params = cursor
            .as_ref()
            .map(|c| serde_json::json!({ "cursor": c }));
        let page: ListPage<T> = match session.request_typed(method, params).await {
            Ok(page) => page,
            Err(Error::Rpc { code, message, .. }) if cursor.is_none() => {
                warn!(method, code, message = %message, "server declined listing, treating as empty");
                return Ok(Vec::new());
            },
            Err(Error::Rpc { code, message, .. }) => {
                warn!(
                    method,
                    code,
                    message = %message,
                    kept = items.len(),
                    "server declined a later page, keeping what was listed"
                );
                break;
            },
            Err(e) => return Err(e),
        };
        items.extend(page.items);

        match page.next_cursor {
            Some(next) if !next.is_empty() => {
                if !seen.insert(next.clone()) {
                    warn!(method, cursor = %next, "server repeated a cursor, stopping pagination");
                    break;
                }
                debug!(method, cursor = %next, "fetching next page");
                cursor = Some(next);
            },
            _ => break,
        }
    }

    Ok(items)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{session::tests::ScriptedTransport, types::METHOD_NOT_FOUND},
    };

    #[tokio::test]
    async fn lists_everything_and_follows_cursors() {
        let transport = ScriptedTransport::new(vec![
            (
                "tools/list",
                Ok(serde_json::json!({"tools":[{"name":"add"}],"nextCursor":"2"})),
            ),
            ("tools/list", Ok(serde_json::json!({"tools":[{"name":"echo"}]}))),
            (
                "resources/list",
                Ok(serde_json::json!({"resources":[{"uri":"file:///a","name":"a"}]})),
            ),
            (
                "resources/templates/list",
                Ok(serde_json::json!({"resourceTemplates":[{"uriTemplate":"file:///{p}","name":"p"}]})),
            ),
            (
                "prompts/list",
                Ok(serde_json::json!({"prompts":[{"name":"greet"}]})),
            ),
        ]);
        let session = Arc::new(Session::new(1, transport.clone()));

        let caps = discover(&session).await.unwrap();
        assert_eq!(
            caps.tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            ["add", "echo"]
        );
        assert_eq!(caps.resources.len(), 1);
        assert_eq!(caps.resource_templates[0].uri_template, "file:///{p}");
        assert_eq!(caps.prompts.len(), 1);

        assert_eq!(transport.notified.lock().unwrap().as_slice(), [
            "notifications/initialized"
        ]);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[1].params.as_ref().unwrap()["cursor"], "2");
    }

    #[tokio::test]
    async fn declined_listings_are_empty() {
        let transport = ScriptedTransport::new(vec![
            ("tools/list", Ok(serde_json::json!({"tools":[{"name":"add"}]}))),
            ("resources/list", Err(METHOD_NOT_FOUND)),
            ("resources/templates/list", Err(METHOD_NOT_FOUND)),
            ("prompts/list", Err(METHOD_NOT_FOUND)),
        ]);
        let session = Arc::new(Session::new(1, transport));

        let caps = discover(&session).await.unwrap();
        assert_eq!(caps.tools.len(), 1);
        assert!(caps.resources.is_empty());
        assert!(caps.resource_templates.is_empty());
        assert!(caps.prompts.is_empty());
    }

    #[tokio::test]
    async fn repeated_cursor_stops_pagination() {
        let transport = ScriptedTransport::new(vec![
            ("tools/list", Ok(serde_json::json!({"tools":[{"name":"a"}],"nextCursor":"x"}))),
            ("tools/list", Ok(serde_json::json!({"tools":[{"name":"b"}],"nextCursor":"x"}))),
            ("resources/list", Ok(serde_json::json!({"resources":[]}))),
            ("resources/templates/list", Ok(serde_json::json!({}))),
            ("prompts/list", Ok(serde_json::json!({"prompts":[]}))),
        ]);
        let session = Arc::new(Session::new(1, transport));
        let caps = discover(&session).await.unwrap();
        assert_eq!(caps.tools.len(), 2);
    }

    #[tokio::test]
    async fn declined_later_page_keeps_earlier_items() {
        let transport = ScriptedTransport::new(vec![
            (
                "tools/list",
                Ok(serde_json::json!({"tools":[{"name":"a"},{"name":"b"}],"nextCursor":"p2"})),
            ),
            ("tools/list", Err(-32602)),
            ("resources/list", Ok(serde_json::json!({"resources":[]}))),
            ("resources/templates/list", Ok(serde_json::json!({}))),
            ("prompts/list", Ok(serde_json::json!({"prompts":[]}))),
        ]);
        let session = Arc::new(Session::new(1, transport.clone()));
        let caps = discover(&session).await.unwrap();
        assert_eq!(
            caps.tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[1].params.as_ref().unwrap()["cursor"], "p2");
    }

    #[tokio::test]
    async fn transport_failure_propagates() {
        let transport = ScriptedTransport::new(vec![(
            "tools/list",
            Ok(serde_json::json!({"tools":[]})),
        )]);
        let session = Arc::new(Session::new(1, transport));
        let err = discover(&session).await.unwrap_err();
        assert!(err.is_transport_level());
    }
}
