//! Provider-neutral conversation content shared by the REST and live paths.
//!
//! The shapes mirror the Gemini `Content`/`Part` JSON so they can be sent on the
//! wire unchanged, but downstream code matches on [`Part`] variants instead of
//! probing optional fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Who authored a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// An ordered list of parts from a single author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Some(Role::User),
            parts: vec![Part::text(text)],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Some(Role::Model),
            parts: vec![Part::text(text)],
        }
    }

    /// Role-less content, as used for system instructions.
    pub fn instruction(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }

    /// The batched answer to one round of function calls.
    pub fn function_responses(responses: Vec<FunctionResponse>) -> Self {
        Self {
            role: Some(Role::User),
            parts: responses
                .into_iter()
                .map(|function_response| Part::FunctionResponse { function_response })
                .collect(),
        }
    }

    /// Concatenates the text parts in arrival order, skipping model "thought" parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text, thought } if !thought.unwrap_or(false) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall { function_call } => Some(function_call.clone()),
                _ => None,
            })
            .collect()
    }
}

/// One element of a [`Content`].
///
/// Unknown part kinds (executable code, file data, ...) are preserved as raw
/// JSON so a response never fails to parse because of a part we do not use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<bool>,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
    Other(Value),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            thought: None,
        }
    }
}

/// Base64 payload tagged with its MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

/// A model request to run a named local capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// The result of a [`FunctionCall`], sent back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: Value,
}

/// A locally callable function advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Entry of the `tools` array in setup and generate requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolSpec {
    FunctionDeclarations(Vec<FunctionDeclaration>),
    GoogleSearch(Map<String, Value>),
}

/// The full set of capabilities offered to the model for one connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolManifest {
    pub functions: Vec<FunctionDeclaration>,
    pub google_search: bool,
}

impl ToolManifest {
    /// Keeps the local function declarations and drops the built-in search tool.
    pub fn without_search(&self) -> Self {
        Self {
            functions: self.functions.clone(),
            google_search: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && !self.google_search
    }

    /// Wire form: `[{functionDeclarations:[..]}, {googleSearch:{}}]`.
    pub fn to_specs(&self) -> Vec<ToolSpec> {
        let mut specs = Vec::new();
        if !self.functions.is_empty() {
            specs.push(ToolSpec::FunctionDeclarations(self.functions.clone()));
        }
        if self.google_search {
            specs.push(ToolSpec::GoogleSearch(Map::new()));
        }
        specs
    }
}

/// A web source the model grounded its answer on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    pub uri: String,
    pub title: Option<String>,
}
