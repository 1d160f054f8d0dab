use crate::config::GeminiConfig;
use crate::error::GenerateError;
use crate::model::{Character, ScriptAnalysis};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Attempts per logical request, including the first. Non-quota failures
/// get one retry with a rewritten prompt; quota failures propagate at once
/// since retrying against an exhausted quota only burns more of it.
const MAX_ATTEMPTS: usize = 2;

/// House style appended to every image prompt so the whole asset set stays
/// visually consistent.
const IMAGE_STYLE_SUFFIX: &str = "\n\nCore style: technical-analysis infographic / \
accident-investigation graphic. Mandatory requirements: exact 16:9 widescreen aspect \
ratio; ultra-detailed photorealistic 3D render quality; holographic UI overlays with \
data labels and callout lines marking points of failure; cutaway or x-ray views of \
internal mechanisms where relevant; serious, analytical documentary tone.";

/// Base64 image plus its mime type, as carried inside a data URI asset.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: String,
}

impl ImagePayload {
    pub fn from_data_uri(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("data:")?;
        let (mime_type, data) = rest.split_once(";base64,")?;
        if mime_type.is_empty() || data.is_empty() {
            return None;
        }
        Some(Self {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        })
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// Contract the orchestrator and wizard expect from the generative service.
/// Every operation settles with an asset or the two-kind failure taxonomy.
#[async_trait]
pub trait GenerationClient: Send + Sync + Debug {
    /// Generate one image, returned as a data URI.
    async fn generate_image(&self, prompt: &str) -> Result<String, GenerateError>;

    /// Generate one image keeping the given characters visually consistent.
    async fn generate_image_with_references(
        &self,
        prompt: &str,
        references: &[Character],
    ) -> Result<String, GenerateError>;

    /// Extract setting and character profiles from a free-text script.
    async fn extract_structured_details(
        &self,
        script: &str,
    ) -> Result<ScriptAnalysis, GenerateError>;

    /// Produce an ordered list of video-direction prompts.
    async fn generate_video_prompts(
        &self,
        script: &str,
        characters: &[Character],
    ) -> Result<Vec<String>, GenerateError>;

    /// Thumbnail for the whole piece; delegates to image generation.
    async fn generate_thumbnail(
        &self,
        topic: &str,
        script: &str,
    ) -> Result<String, GenerateError>;

    /// Edit an existing image per a text instruction, returning a data URI.
    async fn edit_image(
        &self,
        instruction: &str,
        source: &ImagePayload,
        language: &str,
    ) -> Result<String, GenerateError>;
}

#[derive(Debug)]
pub struct GeminiClient {
    api_key: String,
    text_model: String,
    image_model: String,
    edit_model: String,
    base_url: String,
    language: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig, language: &str) -> Self {
        Self {
            api_key: config.api_key.clone(),
            text_model: config.text_model.clone(),
            image_model: config.image_model.clone(),
            edit_model: config.edit_model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            language: language.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn post_json<T: Serialize>(&self, url: &str, body: &T) -> Result<String, GenerateError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| GenerateError::from_message(format!("request failed: {}", e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| GenerateError::from_message(format!("failed to read response: {}", e)))?;

        // 429 is the structured quota signal; the message heuristic in
        // from_message only covers providers that bury it in error text.
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerateError::RateLimitExceeded(text));
        }
        if !status.is_success() {
            return Err(GenerateError::from_message(format!(
                "API error ({}): {}",
                status, text
            )));
        }
        Ok(text)
    }

    /// Single text-generation attempt against the generateContent endpoint.
    async fn text_call(&self, prompt: &str) -> Result<String, GenerateError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.text_model, self.api_key
        );
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart::text(prompt)],
            }],
        };

        let text = self.post_json(&url, &body).await?;
        let result: GeminiResponse = serde_json::from_str(&text).map_err(|e| {
            GenerateError::from_message(format!("failed to parse response: {}. Body: {}", e, text))
        })?;
        result.into_text()
    }

    /// Single image-generation attempt against the predict endpoint.
    async fn image_call(&self, prompt: &str) -> Result<String, GenerateError> {
        let url = format!(
            "{}/models/{}:predict?key={}",
            self.base_url, self.image_model, self.api_key
        );
        let body = ImagenRequest {
            instances: vec![ImagenInstance {
                prompt: prompt.to_string(),
            }],
            parameters: ImagenParameters {
                sample_count: 1,
                aspect_ratio: "16:9".to_string(),
                output_mime_type: "image/png".to_string(),
            },
        };

        let text = self.post_json(&url, &body).await?;
        let result: ImagenResponse = serde_json::from_str(&text).map_err(|e| {
            GenerateError::from_message(format!("failed to parse response: {}. Body: {}", e, text))
        })?;

        if let Some(err) = result.error {
            return Err(GenerateError::from_message(err.message));
        }
        let prediction = result
            .predictions
            .into_iter()
            .find(|p| p.bytes_base64_encoded.is_some())
            .ok_or_else(|| {
                GenerateError::GenerationFailed("no image data in the response".to_string())
            })?;
        let payload = ImagePayload {
            mime_type: prediction
                .mime_type
                .unwrap_or_else(|| "image/png".to_string()),
            data: prediction.bytes_base64_encoded.unwrap_or_default(),
        };
        Ok(payload.to_data_uri())
    }

    /// Single image-edit attempt: source image as inline data plus the
    /// instruction text.
    async fn edit_call(
        &self,
        prompt: &str,
        source: &ImagePayload,
    ) -> Result<String, GenerateError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.edit_model, self.api_key
        );
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![
                    GeminiPart::inline(source.mime_type.clone(), source.data.clone()),
                    GeminiPart::text(prompt),
                ],
            }],
        };

        let text = self.post_json(&url, &body).await?;
        let result: GeminiResponse = serde_json::from_str(&text).map_err(|e| {
            GenerateError::from_message(format!("failed to parse response: {}. Body: {}", e, text))
        })?;
        result.into_image()
    }

    /// Rewrite a failed prompt into a more specific variant via a secondary
    /// text call. A degenerate result (too short, identical) or a failed
    /// rewrite falls back to a deterministic embellishment rather than
    /// aborting the retry.
    async fn rewrite_prompt(&self, original: &str, language: &str) -> String {
        let instruction = format!(
            "Act as a prompt engineer. The following image-generation prompt failed. \
            Rewrite it in {} so it becomes more descriptive, clear and specific, with a \
            higher chance of producing a successful image while keeping the original \
            intent.\n\nOriginal prompt: \"{}\"\n\nReturn only the rewritten prompt, \
            without any explanation, quotes or extra formatting.",
            language, original
        );

        match self.text_call(&instruction).await {
            Ok(candidate) => match accept_rewrite(original, &candidate) {
                Some(rewritten) => {
                    info!("rewrote failed prompt: {:?} -> {:?}", original, rewritten);
                    rewritten
                }
                None => embellish_prompt(original),
            },
            Err(err) => {
                warn!("prompt rewrite failed ({}), using fallback", err);
                embellish_prompt(original)
            }
        }
    }

    /// Shared bounded retry loop for all image generation variants.
    async fn generate_styled_image(
        &self,
        prompt: &str,
        consistency: &str,
    ) -> Result<String, GenerateError> {
        let mut subject = prompt.to_string();
        let mut attempt = 1;
        loop {
            let full_prompt = compose_image_prompt(&subject, consistency);
            match self.image_call(&full_prompt).await {
                Ok(asset) => return Ok(asset),
                Err(err) if err.is_rate_limit() => return Err(err),
                Err(err) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(GenerateError::GenerationFailed(err.message().to_string()));
                    }
                    warn!(
                        "image generation attempt {}/{} failed: {}",
                        attempt, MAX_ATTEMPTS, err
                    );
                    subject = self.rewrite_prompt(prompt, &self.language).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl GenerationClient for GeminiClient {
    async fn generate_image(&self, prompt: &str) -> Result<String, GenerateError> {
        self.generate_styled_image(prompt, "").await
    }

    async fn generate_image_with_references(
        &self,
        prompt: &str,
        references: &[Character],
    ) -> Result<String, GenerateError> {
        let consistency = consistency_block(references);
        self.generate_styled_image(prompt, &consistency).await
    }

    async fn extract_structured_details(
        &self,
        script: &str,
    ) -> Result<ScriptAnalysis, GenerateError> {
        let prompt = format!(
            "As a professional visual director and script analyst, read the following \
            script carefully. Extract extremely precise details about the setting, and \
            identify EVERY 'character' with the potential for a unique, vivid visual \
            angle: vehicles and machinery, named people and roles, specific components \
            and systems, environments, organizations, and visualizable abstract \
            concepts. Do not skip anything that could become an interesting shot.\n\n\
            Return a SINGLE JSON object with this exact structure:\n\
            {{\n\
              \"setting\": {{\n\
                \"place\": \"...\", \"time\": \"...\", \"weather\": \"...\",\n\
                \"season\": \"...\", \"mood\": \"...\", \"social_context\": \"...\",\n\
                \"theme\": {{ \"central_idea\": \"...\", \"thematic_question\": \"...\" }}\n\
              }},\n\
              \"characters\": [\n\
                {{\n\
                  \"name\": \"...\", \"is_main\": true,\n\
                  \"goal\": \"...\", \"motivation\": \"...\", \"conflict\": \"...\",\n\
                  \"appearance_and_behavior\": \"...\", \"backstory\": \"...\",\n\
                  \"character_arc\": \"...\"\n\
                }}\n\
              ]\n\
            }}\n\n\
            SCRIPT:\n---\n{}\n---\n\
            IMPORTANT: return only the JSON object, with no other explanatory text.",
            script
        );

        let response = self.text_call(&prompt).await?;
        let clean = strip_code_blocks(&response);
        serde_json::from_str(&clean).map_err(|e| {
            GenerateError::GenerationFailed(format!(
                "failed to parse script analysis: {}. Body: {}",
                e, clean
            ))
        })
    }

    async fn generate_video_prompts(
        &self,
        script: &str,
        characters: &[Character],
    ) -> Result<Vec<String>, GenerateError> {
        let profiles = characters
            .iter()
            .map(|c| {
                format!(
                    "Character profile {}: {}",
                    c.name,
                    serde_json::to_string_pretty(c).unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = format!(
            "Based on the script and character profiles below, produce a list of \
            detailed video-generation prompts. Each prompt is one shot, describing \
            action, camera angle and emotion, in the technical-documentary style.\n\n\
            SCRIPT:\n{}\n\nCHARACTER PROFILES:\n{}\n\n\
            Return a JSON array of strings, each string being one prompt. \
            Example: [\"Prompt 1\", \"Prompt 2\"]",
            script, profiles
        );

        let response = self.text_call(&prompt).await?;
        let clean = strip_code_blocks(&response);
        serde_json::from_str(&clean).map_err(|e| {
            GenerateError::GenerationFailed(format!(
                "failed to parse video prompts: {}. Body: {}",
                e, clean
            ))
        })
    }

    async fn generate_thumbnail(
        &self,
        topic: &str,
        script: &str,
    ) -> Result<String, GenerateError> {
        let prompt = format!(
            "Create a 4K YouTube thumbnail for a video on the topic \"{}\". The \
            thumbnail must follow a dramatic, serious, technical-documentary 3D style. \
            The main title on the thumbnail must be large and clear, in yellow with a \
            black outline. Base the scene on the following script: {}",
            topic, script
        );
        self.generate_image(&prompt).await
    }

    async fn edit_image(
        &self,
        instruction: &str,
        source: &ImagePayload,
        language: &str,
    ) -> Result<String, GenerateError> {
        let mut request = instruction.to_string();
        let mut attempt = 1;
        loop {
            let full_prompt = format!(
                "The edit requested for this image, in {}, is: \"{}\". AFTER EDITING, \
                the new image MUST STRICTLY FOLLOW these technical requirements:{}",
                language, request, IMAGE_STYLE_SUFFIX
            );
            match self.edit_call(&full_prompt, source).await {
                Ok(asset) => return Ok(asset),
                Err(err) if err.is_rate_limit() => return Err(err),
                Err(err) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(GenerateError::GenerationFailed(err.message().to_string()));
                    }
                    warn!(
                        "image edit attempt {}/{} failed: {}",
                        attempt, MAX_ATTEMPTS, err
                    );
                    request = self.rewrite_prompt(instruction, language).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn compose_image_prompt(subject: &str, consistency: &str) -> String {
    format!(
        "Main subject of the image: \"{}\".{}{}",
        subject, consistency, IMAGE_STYLE_SUFFIX
    )
}

/// Appearance notes for the characters the user pinned a reference image
/// on, so series frames stay consistent with the approved portraits.
fn consistency_block(references: &[Character]) -> String {
    let described: Vec<String> = references
        .iter()
        .filter(|c| c.reference_image.is_some())
        .map(|c| format!("- {}: {}", c.name, c.appearance_and_behavior))
        .collect();
    if described.is_empty() {
        String::new()
    } else {
        format!(
            "\n\nKEEP THESE CHARACTERS VISUALLY CONSISTENT:\n{}\n",
            described.join("\n")
        )
    }
}

/// Accept a rewritten prompt only if it is non-degenerate: long enough and
/// actually different from the original.
fn accept_rewrite(original: &str, candidate: &str) -> Option<String> {
    let rewritten = candidate.trim().trim_matches('"').to_string();
    if rewritten.chars().count() > 10 && rewritten != original {
        Some(rewritten)
    } else {
        None
    }
}

/// Deterministic fallback when the rewrite call fails or degenerates.
pub fn embellish_prompt(prompt: &str) -> String {
    format!("A cinematic, ultra-detailed rendition of: {}", prompt)
}

/// Models wrap JSON answers in markdown fences often enough that every
/// structured response goes through this first.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}

// --- Wire types ---

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "inlineData")]
    inline_data: Option<GeminiInlineData>,
}

impl GeminiPart {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            inline_data: None,
        }
    }

    fn inline(mime_type: String, data: String) -> Self {
        Self {
            text: None,
            inline_data: Some(GeminiInlineData { mime_type, data }),
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct GeminiInlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiApiError>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

impl GeminiResponse {
    fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
    }

    fn into_text(self) -> Result<String, GenerateError> {
        if let Some(err) = &self.error {
            return Err(GenerateError::from_message(err.message.clone()));
        }
        if let Some(candidates) = &self.candidates {
            if let Some(first) = candidates.first() {
                if let Some(content) = &first.content {
                    if let Some(text) = content.parts.iter().find_map(|p| p.text.as_ref()) {
                        return Ok(text.clone());
                    }
                }
                let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
                return Err(GenerateError::GenerationFailed(format!(
                    "empty response, finish reason: {}",
                    reason
                )));
            }
        }
        if let Some(reason) = self.block_reason() {
            return Err(GenerateError::GenerationFailed(format!(
                "blocked by safety filter: {}",
                reason
            )));
        }
        Err(GenerateError::GenerationFailed(
            "response empty or in an unexpected format".to_string(),
        ))
    }

    fn into_image(self) -> Result<String, GenerateError> {
        if let Some(err) = &self.error {
            return Err(GenerateError::from_message(err.message.clone()));
        }
        if let Some(candidates) = &self.candidates {
            if let Some(first) = candidates.first() {
                if let Some(content) = &first.content {
                    if let Some(inline) = content.parts.iter().find_map(|p| p.inline_data.as_ref())
                    {
                        let payload = ImagePayload {
                            mime_type: inline.mime_type.clone(),
                            data: inline.data.clone(),
                        };
                        return Ok(payload.to_data_uri());
                    }
                }
            }
        }
        if let Some(reason) = self.block_reason() {
            return Err(GenerateError::GenerationFailed(format!(
                "blocked by safety filter: {}",
                reason
            )));
        }
        Err(GenerateError::GenerationFailed(
            "no edited image data in the response".to_string(),
        ))
    }
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "inlineData")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Deserialize, Debug)]
struct GeminiApiError {
    message: String,
}

#[derive(Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Serialize)]
struct ImagenRequest {
    instances: Vec<ImagenInstance>,
    parameters: ImagenParameters,
}

#[derive(Serialize)]
struct ImagenInstance {
    prompt: String,
}

#[derive(Serialize)]
struct ImagenParameters {
    #[serde(rename = "sampleCount")]
    sample_count: u32,
    #[serde(rename = "aspectRatio")]
    aspect_ratio: String,
    #[serde(rename = "outputMimeType")]
    output_mime_type: String,
}

#[derive(Deserialize)]
struct ImagenResponse {
    #[serde(default)]
    predictions: Vec<ImagenPrediction>,
    error: Option<GeminiApiError>,
}

#[derive(Deserialize)]
struct ImagenPrediction {
    #[serde(rename = "bytesBase64Encoded")]
    bytes_base64_encoded: Option<String>,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n[]\n```"), "[]");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }

    #[test]
    fn data_uri_round_trip() {
        let payload = ImagePayload {
            mime_type: "image/png".to_string(),
            data: "QUJD".to_string(),
        };
        let uri = payload.to_data_uri();
        assert_eq!(uri, "data:image/png;base64,QUJD");
        assert_eq!(ImagePayload::from_data_uri(&uri).unwrap(), payload);
        assert!(ImagePayload::from_data_uri("not a data uri").is_none());
        assert!(ImagePayload::from_data_uri("data:;base64,QUJD").is_none());
    }

    #[test]
    fn rewrite_acceptance_rejects_degenerate_results() {
        assert!(accept_rewrite("a plane on a runway", "short").is_none());
        assert!(accept_rewrite("a plane on a runway", "a plane on a runway").is_none());
        assert!(accept_rewrite("a plane on a runway", "\"a plane on a runway\"").is_none());
        assert_eq!(
            accept_rewrite("a plane", "\"a wide-body cargo aircraft on a wet runway\"").as_deref(),
            Some("a wide-body cargo aircraft on a wet runway")
        );
    }

    #[test]
    fn embellish_keeps_original_prompt_visible() {
        let out = embellish_prompt("the cockpit at night");
        assert!(out.contains("the cockpit at night"));
        assert!(out.len() > "the cockpit at night".len());
    }

    #[test]
    fn consistency_block_only_lists_characters_with_references() {
        let mut pinned = Character::blank("Flight 214");
        pinned.appearance_and_behavior = "wide-body cargo jet".into();
        pinned.reference_image = Some("data:image/png;base64,QUJD".into());
        let unpinned = Character::blank("Tower controller");

        let block = consistency_block(&[pinned, unpinned]);
        assert!(block.contains("Flight 214"));
        assert!(block.contains("wide-body cargo jet"));
        assert!(!block.contains("Tower controller"));

        assert_eq!(consistency_block(&[]), "");
    }

    #[test]
    fn gemini_response_safety_block() {
        let json = r#"{
            "candidates": [
                { "finishReason": "SAFETY", "index": 0 }
            ]
        }"#;
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let err = result.into_text().unwrap_err();
        assert!(err.message().contains("SAFETY"));
    }

    #[test]
    fn gemini_response_text_success() {
        let json = r#"{
            "candidates": [
                {
                    "content": { "parts": [ { "text": "Hello world" } ], "role": "model" },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.into_text().unwrap(), "Hello world");
    }

    #[test]
    fn gemini_response_api_error_with_quota_wording_is_rate_limit() {
        let json = r#"{ "error": { "message": "Quota exceeded for requests per day" } }"#;
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert!(result.into_text().unwrap_err().is_rate_limit());
    }

    #[test]
    fn gemini_response_edit_returns_inline_image() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [
                            { "text": "here is your image" },
                            { "inlineData": { "mimeType": "image/png", "data": "QUJD" } }
                        ]
                    }
                }
            ]
        }"#;
        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            result.into_image().unwrap(),
            "data:image/png;base64,QUJD"
        );
    }

    #[test]
    fn imagen_response_parses_prediction() {
        let json = r#"{
            "predictions": [
                { "bytesBase64Encoded": "QUJD", "mimeType": "image/png" }
            ]
        }"#;
        let result: ImagenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            result.predictions[0].bytes_base64_encoded.as_deref(),
            Some("QUJD")
        );
    }

    #[test]
    fn script_analysis_parses_from_fenced_json() {
        let response = r#"```json
        {
          "setting": {
            "place": "Louisville airport",
            "time": "night",
            "weather": "rain",
            "season": "autumn",
            "mood": "tense",
            "social_context": "modern aviation",
            "theme": { "central_idea": "mechanical failure", "thematic_question": "who is accountable?" }
          },
          "characters": [
            { "name": "Flight 214", "is_main": true, "appearance_and_behavior": "cargo jet" }
          ]
        }
        ```"#;
        let clean = strip_code_blocks(response);
        let analysis: ScriptAnalysis = serde_json::from_str(&clean).unwrap();
        assert_eq!(analysis.setting.place, "Louisville airport");
        assert_eq!(analysis.characters.len(), 1);
        assert!(analysis.characters[0].is_main);
        assert_eq!(analysis.characters[0].goal, "");
    }
}
