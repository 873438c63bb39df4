use std::io::Cursor;
use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{JudgeRequest, VisionJudge};
use crate::config::JudgeConfig;
use crate::error::JudgeError;
use crate::grid::flatten_on_white;

const MAX_OUTPUT_TOKENS: u64 = 1200;

/// Vision judge backed by the OpenAI Responses API.
pub struct OpenAiJudge {
    config: JudgeConfig,
    http: reqwest::Client,
}

impl OpenAiJudge {
    pub fn new(config: JudgeConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn build_payload(&self, request: &JudgeRequest, data_url: &str) -> Value {
        json!({
            "model": self.config.model,
            "input": [{
                "role": "user",
                "content": [
                    {"type": "input_text", "text": request.instructions},
                    {"type": "input_image", "image_url": data_url},
                ],
            }],
            "text": {
                "format": {
                    "type": "json_schema",
                    "name": "image_selection",
                    "strict": true,
                    "schema": selection_schema(request.total),
                }
            },
            "max_output_tokens": MAX_OUTPUT_TOKENS,
        })
    }
}

#[async_trait]
impl VisionJudge for OpenAiJudge {
    fn name(&self) -> &str {
        "openai"
    }

    async fn judge(&self, request: &JudgeRequest) -> Result<String, JudgeError> {
        let api_key = self
            .config
            .api_key
            .clone()
            .ok_or_else(|| JudgeError::MissingApiKey(self.name().to_string()))?;
        let raw = tokio::fs::read(&request.grid_path)
            .await
            .map_err(|source| JudgeError::ReadGrid {
                path: request.grid_path.display().to_string(),
                source,
            })?;
        let data_url = vision_data_url(&raw, &request.grid_path, self.config.max_dim);
        let payload = self.build_payload(request, &data_url);

        let endpoint = format!("{}/responses", self.config.api_base);
        debug!(model = self.model(), endpoint = %endpoint, "sending grid to judge");
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.config.timeout)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JudgeError::Status {
                status: status.as_u16(),
                body: truncate(&body, 400),
            });
        }
        let body: ResponsesBody = response.json().await?;
        selection_text(body)
    }
}

fn selection_schema(total: usize) -> Value {
    json!({
        "type": "object",
        "properties": {
            "best_images": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "number": {"type": "integer", "minimum": 1, "maximum": total.max(1)},
                        "reason": {"type": "string"},
                    },
                    "required": ["number", "reason"],
                    "additionalProperties": false,
                }
            }
        },
        "required": ["best_images"],
        "additionalProperties": false,
    })
}

/// Flattens onto white, bounds the long edge and re-encodes as JPEG. Falls
/// back to the raw bytes when the grid cannot be decoded.
fn vision_data_url(raw: &[u8], path: &Path, max_dim: u32) -> String {
    let (bytes, mime) = match prepare_vision_image(raw, max_dim) {
        Some(bytes) => (bytes, "image/jpeg"),
        None => (raw.to_vec(), guess_image_mime(path)),
    };
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

fn prepare_vision_image(raw: &[u8], max_dim: u32) -> Option<Vec<u8>> {
    let dim = max_dim.max(128);
    let decoded = image::load_from_memory(raw).ok()?;
    let mut image = DynamicImage::ImageRgb8(flatten_on_white(&decoded));
    if image.width() > dim || image.height() > dim {
        image = image.resize(dim, dim, FilterType::Triangle);
    }
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(Cursor::new(&mut bytes), 90);
    encoder.encode_image(&image.to_rgb8()).ok()?;
    Some(bytes)
}

fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

/// The parts of a Responses API body a structured-output call can carry.
#[derive(Debug, Default, Deserialize)]
struct ResponsesBody {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<MessagePart>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessagePart {
    OutputText { text: String },
    Refusal { refusal: String },
    #[serde(other)]
    Other,
}

/// The `image_selection` JSON the model wrote, or its refusal.
fn selection_text(body: ResponsesBody) -> Result<String, JudgeError> {
    let mut text = String::new();
    let mut refusal = None;
    let parts = body.output.into_iter().flat_map(|item| match item {
        OutputItem::Message { content } => content,
        OutputItem::Other => Vec::new(),
    });
    for part in parts {
        match part {
            MessagePart::OutputText { text: chunk } => text.push_str(&chunk),
            MessagePart::Refusal { refusal: reason } => refusal = Some(reason),
            MessagePart::Other => {}
        }
    }
    if !text.trim().is_empty() {
        return Ok(text.trim().to_string());
    }
    match refusal {
        Some(reason) => Err(JudgeError::Refused(reason)),
        None => Err(JudgeError::EmptyResponse),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::test_support::png_bytes;

    fn body(raw: Value) -> anyhow::Result<ResponsesBody> {
        Ok(serde_json::from_value(raw)?)
    }

    #[test]
    fn selection_text_joins_message_output() -> anyhow::Result<()> {
        let reply = body(json!({
            "id": "resp_1",
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "role": "assistant", "content": [
                    {"type": "output_text", "text": "{\"best_images\": ", "annotations": []},
                    {"type": "output_text", "text": "[{\"number\": 2, \"reason\": \"bold\"}]}"},
                ]},
            ]
        }))?;
        assert_eq!(
            selection_text(reply)?,
            r#"{"best_images": [{"number": 2, "reason": "bold"}]}"#
        );
        Ok(())
    }

    #[test]
    fn refusal_and_empty_output_are_errors() -> anyhow::Result<()> {
        let refused = body(json!({
            "output": [{"type": "message", "content": [
                {"type": "refusal", "refusal": "cannot rank these"},
            ]}]
        }))?;
        assert!(matches!(
            selection_text(refused),
            Err(JudgeError::Refused(reason)) if reason == "cannot rank these"
        ));
        assert!(matches!(
            selection_text(body(json!({"output": []}))?),
            Err(JudgeError::EmptyResponse)
        ));
        assert!(matches!(
            selection_text(body(json!({}))?),
            Err(JudgeError::EmptyResponse)
        ));
        Ok(())
    }

    #[test]
    fn grid_is_reencoded_as_bounded_jpeg() -> anyhow::Result<()> {
        let raw = png_bytes(600, 200, [10, 200, 30])?;
        let url = vision_data_url(&raw, Path::new("grid.png"), 300);
        let encoded = url
            .strip_prefix("data:image/jpeg;base64,")
            .ok_or_else(|| anyhow::anyhow!("unexpected prefix in {url}"))?;
        let decoded = image::load_from_memory(&BASE64.decode(encoded)?)?;
        assert_eq!((decoded.width(), decoded.height()), (300, 100));
        Ok(())
    }

    #[test]
    fn undecodable_grid_is_sent_raw() {
        let url = vision_data_url(b"not an image", Path::new("grid.webp"), 512);
        assert!(url.starts_with("data:image/webp;base64,"));
    }

    #[test]
    fn payload_carries_schema_bounds_and_image() {
        let judge = OpenAiJudge::new(JudgeConfig::default());
        let request = JudgeRequest {
            grid_path: PathBuf::from("grid.png"),
            instructions: "pick".to_string(),
            total: 6,
            limit: 3,
        };
        let payload = judge.build_payload(&request, "data:image/jpeg;base64,AAAA");
        assert_eq!(payload["model"], judge.model());
        assert_eq!(payload["input"][0]["content"][1]["image_url"], "data:image/jpeg;base64,AAAA");
        assert_eq!(
            payload["text"]["format"]["schema"]["properties"]["best_images"]["items"]["properties"]
                ["number"]["maximum"],
            6
        );
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let judge = OpenAiJudge::new(JudgeConfig::default());
        let request = JudgeRequest {
            grid_path: PathBuf::from("/nonexistent/grid.png"),
            instructions: "pick".to_string(),
            total: 2,
            limit: 1,
        };
        let result = judge.judge(&request).await;
        assert!(matches!(result, Err(JudgeError::MissingApiKey(_))));
    }
}
