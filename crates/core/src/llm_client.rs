use crate::{
    error::LlmError,
    generic_types::{Citation, Content, ToolSpec},
};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tracing::debug;

/// Default REST endpoint for content generation.
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// A non-streaming or streaming content generation request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl GenerateContentResponse {
    /// The first candidate's content, which is the only one we request.
    pub fn content(&self) -> Option<&Content> {
        self.candidates.first().and_then(|c| c.content.as_ref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub finish_reason: Option<String>,
    pub grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    #[serde(default)]
    pub grounding_chunks: Vec<GroundingChunk>,
    #[serde(default)]
    pub web_search_queries: Vec<String>,
}

impl GroundingMetadata {
    /// Web sources in the order the model cited them, without duplicates.
    pub fn citations(&self) -> Vec<Citation> {
        let mut out: Vec<Citation> = Vec::new();
        for web in self.grounding_chunks.iter().filter_map(|c| c.web.as_ref()) {
            if out.iter().any(|c| c.uri == web.uri) {
                continue;
            }
            out.push(Citation {
                uri: web.uri.clone(),
                title: web.title.clone(),
            });
        }
        out
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroundingChunk {
    pub web: Option<WebSource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebSource {
    pub uri: String,
    pub title: Option<String>,
}

/// A stream of partial responses.
pub type ContentStream =
    Pin<Box<dyn Stream<Item = Result<GenerateContentResponse, LlmError>> + Send>>;

/// A client for a content generation service.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Makes a single, non-streaming call.
    async fn generate(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, LlmError>;

    /// Makes a streaming call, yielding partial responses as they arrive.
    async fn stream(&self, request: &GenerateContentRequest) -> Result<ContentStream, LlmError>;
}

/// An implementation of [`ContentGenerator`] for the Gemini REST API.
///
/// Construction is cheap; build a new client when the API key changes.
pub struct GeminiRestClient {
    http: reqwest::Client,
    api_key: SecretString,
    api_base: String,
    model: String,
}

impl GeminiRestClient {
    /// Creates a new client.
    ///
    /// # Arguments
    ///
    /// * `api_key` - The key sent in the `x-goog-api-key` header.
    /// * `model` - The model identifier, e.g. `models/gemini-2.5-flash`.
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        let model = model.into();
        let model = if model.starts_with("models/") {
            model
        } else {
            format!("models/{model}")
        };
        Self {
            http: reqwest::Client::new(),
            api_key,
            api_base: DEFAULT_API_BASE.to_string(),
            model,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}:{}", self.api_base.trim_end_matches('/'), self.model, method)
    }

    async fn post(
        &self,
        url: String,
        request: &GenerateContentRequest,
    ) -> Result<reqwest::Response, LlmError> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ContentGenerator for GeminiRestClient {
    async fn generate(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, LlmError> {
        debug!(model = %self.model, contents = request.contents.len(), "generateContent");
        let body = self
            .post(self.endpoint("generateContent"), request)
            .await?
            .text()
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn stream(&self, request: &GenerateContentRequest) -> Result<ContentStream, LlmError> {
        debug!(model = %self.model, contents = request.contents.len(), "streamGenerateContent");
        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let bytes = self.post(url, request).await?.bytes_stream();
        Ok(Box::pin(decode_events(bytes)))
    }
}

/// Decodes a server-sent-event byte stream into partial responses.
fn decode_events<S, B, E>(bytes: S) -> impl Stream<Item = Result<GenerateContentResponse, LlmError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    bytes.eventsource().filter_map(|event| async move {
        match event {
            Ok(event) if event.data.trim().is_empty() => None,
            Ok(event) => Some(serde_json::from_str(&event.data).map_err(LlmError::from)),
            Err(e) => Some(Err(LlmError::Stream(e.to_string()))),
        }
    })
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunks(parts: Vec<Vec<u8>>) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> {
        futures::stream::iter(parts.into_iter().map(Ok))
    }

    fn texts(responses: Vec<Result<GenerateContentResponse, LlmError>>) -> Vec<String> {
        responses
            .into_iter()
            .map(|r| r.unwrap().content().map(Content::text).unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn sse_events_are_framed_across_chunks() {
        let one = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"a"}]}}]}"#;
        let two = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"b"}]}}]}"#;
        let body = format!("data: {one}\r\n\r\n: keep-alive\n\ndata: {two}\n\n").into_bytes();
        let (head, tail) = body.split_at(20);

        let responses = decode_events(chunks(vec![head.to_vec(), tail.to_vec()]))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(texts(responses), ["a", "b"]);
    }

    #[tokio::test]
    async fn multibyte_text_split_between_chunks_is_preserved() {
        let body = r#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"canción"}]}}]}"#
            .to_string()
            + "\n\n";
        let body = body.into_bytes();
        // Split between the two bytes of 'ó'.
        let cut = body.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let responses = decode_events(chunks(vec![body[..cut].to_vec(), body[cut..].to_vec()]))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(texts(responses), ["canción"]);
    }

    #[tokio::test]
    async fn transport_errors_end_up_in_the_stream() {
        let failing = futures::stream::iter(vec![Err::<Vec<u8>, _>(std::io::Error::other("reset"))]);
        let responses = decode_events(failing).collect::<Vec<_>>().await;
        assert!(matches!(responses.as_slice(), [Err(LlmError::Stream(_))]));
    }

    #[test]
    fn citations_are_deduplicated_in_order() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "answer"}]},
                "groundingMetadata": {
                    "webSearchQueries": ["rust async"],
                    "groundingChunks": [
                        {"web": {"uri": "https://a.example", "title": "A"}},
                        {"web": {"uri": "https://b.example"}},
                        {"web": {"uri": "https://a.example", "title": "A again"}}
                    ]
                }
            }]
        }))
        .unwrap();

        let metadata = response.candidates[0].grounding_metadata.as_ref().unwrap();
        let citations = metadata.citations();
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].title.as_deref(), Some("A"));
        assert_eq!(citations[1].uri, "https://b.example");
        assert_eq!(metadata.web_search_queries, ["rust async"]);
        assert_eq!(response.content().map(Content::text).as_deref(), Some("answer"));
    }

    #[test]
    fn request_serializes_camel_case_and_omits_empty_tools() {
        let request = GenerateContentRequest {
            contents: vec![Content::user_text("hi")],
            system_instruction: Some(Content::instruction("be brief")),
            tools: vec![],
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["systemInstruction"]["parts"][0]["text"], json!("be brief"));
        assert!(wire.get("tools").is_none());
    }

    #[test]
    fn api_error_message_prefers_structured_error() {
        assert_eq!(
            api_error_message(r#"{"error":{"code":400,"message":"API key not valid"}}"#),
            "API key not valid"
        );
        assert_eq!(api_error_message("plain failure"), "plain failure");
    }

    #[test]
    fn model_name_is_prefixed() {
        let client = GeminiRestClient::new(SecretString::from("k".to_string()), "gemini-2.5-flash");
        assert_eq!(
            client.endpoint("generateContent"),
            format!("{DEFAULT_API_BASE}/models/gemini-2.5-flash:generateContent")
        );
    }
}
