//! Capability entries published in the snapshot.
//!
//! Each entry keeps a weak handle to the session that listed it. Calling
//! through an entry whose session is gone fails with not-connected rather
//! than keeping the session alive.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use serde::Serialize;

use crate::{
    error::{Error, Result},
    session::Session,
    types::{
        McpPromptDef, McpResourceDef, McpResourceTemplateDef, McpToolDef, PromptArgument,
        PromptGetResult, ResourceReadResult, ToolsCallResult,
    },
};

fn upgrade(session: &Weak<Session>) -> Result<Arc<Session>> {
    session
        .upgrade()
        .ok_or_else(|| Error::NotConnected("session closed".into()))
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
    #[serde(skip)]
    session: Weak<Session>,
}

impl Tool {
    pub(crate) fn new(def: McpToolDef, session: Weak<Session>) -> Self {
        Self {
            name: def.name,
            title: def.title,
            description: def.description,
            input_schema: def.input_schema,
            session,
        }
    }

    pub async fn call(&self, arguments: serde_json::Value) -> Result<ToolsCallResult> {
        upgrade(&self.session)?.call_tool(&self.name, arguments).await
    }
}

impl PartialEq for Tool {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.title == other.title
            && self.description == other.description
            && self.input_schema == other.input_schema
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip)]
    session: Weak<Session>,
}

impl Resource {
    pub(crate) fn new(def: McpResourceDef, session: Weak<Session>) -> Self {
        Self {
            uri: def.uri,
            name: def.name,
            title: def.title,
            description: def.description,
            mime_type: def.mime_type,
            session,
        }
    }

    pub async fn read(&self) -> Result<ResourceReadResult> {
        upgrade(&self.session)?.read_resource(&self.uri).await
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
            && self.name == other.name
            && self.title == other.title
            && self.description == other.description
            && self.mime_type == other.mime_type
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("uri", &self.uri)
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

/// Parameterized resource. Reading one goes through
/// [`McpManager::read_resource`](crate::McpManager::read_resource) with an
/// expanded URI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    pub uri_template: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl From<McpResourceTemplateDef> for ResourceTemplate {
    fn from(def: McpResourceTemplateDef) -> Self {
        Self {
            uri_template: def.uri_template,
            name: def.name,
            title: def.title,
            description: def.description,
            mime_type: def.mime_type,
        }
    }
}

#[derive(Clone, Serialize)]
pub struct Prompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
    #[serde(skip)]
    session: Weak<Session>,
}

impl Prompt {
    pub(crate) fn new(def: McpPromptDef, session: Weak<Session>) -> Self {
        Self {
            name: def.name,
            title: def.title,
            description: def.description,
            arguments: def.arguments,
            session,
        }
    }

    /// Render the prompt. Missing required arguments are rejected locally.
    pub async fn get(
        &self,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<PromptGetResult> {
        if let Some(missing) = self.arguments.iter().find(|arg| {
            arg.required
                && !arguments
                    .as_ref()
                    .is_some_and(|args| args.contains_key(&arg.name))
        }) {
            return Err(Error::message(format!(
                "prompt '{}' requires argument '{}'",
                self.name, missing.name
            )));
        }
        upgrade(&self.session)?.get_prompt(&self.name, arguments).await
    }
}

impl PartialEq for Prompt {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.title == other.title
            && self.description == other.description
            && self.arguments == other.arguments
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prompt")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

/// Everything one discovery pass produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
}

impl Capabilities {
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    #[must_use]
    pub fn prompt(&self, name: &str) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.name == name)
    }
}
