//! Gemini wire format shared by the public API and Code Assist

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Error;
use crate::providers::types::{
    system_text, CompletionOptions, CompletionResponse, Message, Role, ToolCallRequest,
    ToolDefinition, Usage,
};
use crate::Result;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Part {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UsageMetadata {
    pub prompt_token_count: Option<usize>,
    pub candidates_token_count: Option<usize>,
    pub total_token_count: Option<usize>,
}

/// Convert the conversation into Gemini `contents`.
///
/// With `fold_system` the system text becomes a leading user turn (Code
/// Assist); otherwise system messages are dropped and sent separately as
/// `systemInstruction`.
pub(crate) fn build_contents(messages: &[Message], fold_system: bool) -> Vec<Value> {
    let mut contents = Vec::with_capacity(messages.len() + 1);
    if fold_system {
        if let Some(system) = system_text(messages) {
            contents.push(json!({"role": "user", "parts": [{"text": system}]}));
        }
    }

    for m in messages.iter().filter(|m| m.role != Role::System) {
        let content = match m.role {
            Role::Tool => {
                let name = m
                    .tool_name
                    .as_deref()
                    .or(m.tool_call_id.as_deref())
                    .unwrap_or("unknown");
                json!({
                    "role": "model",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": {"result": m.content}
                        }
                    }]
                })
            }
            Role::Assistant if !m.tool_calls.is_empty() => {
                let mut parts: Vec<Value> = Vec::new();
                if !m.content.is_empty() {
                    parts.push(json!({"text": m.content}));
                }
                parts.extend(m.tool_calls.iter().map(|tc| {
                    json!({"functionCall": {"name": tc.name, "args": tc.arguments}})
                }));
                json!({"role": "model", "parts": parts})
            }
            Role::Assistant => json!({"role": "model", "parts": [{"text": m.content}]}),
            _ => json!({"role": "user", "parts": [{"text": m.content}]}),
        };
        contents.push(content);
    }
    contents
}

/// Native `systemInstruction` block
pub(crate) fn system_instruction(messages: &[Message]) -> Option<Value> {
    system_text(messages).map(|text| json!({"parts": [{"text": text}]}))
}

pub(crate) fn generation_config(options: &CompletionOptions) -> Value {
    let mut config = json!({"maxOutputTokens": options.max_tokens});
    if let Some(temperature) = options.temperature {
        config["temperature"] = json!(temperature);
    }
    config
}

pub(crate) fn convert_tools(tools: &[ToolDefinition]) -> Option<Value> {
    if tools.is_empty() {
        return None;
    }

    let declarations: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters
            })
        })
        .collect();
    Some(json!([{"functionDeclarations": declarations}]))
}

pub(crate) fn into_completion(
    response: GenerateContentResponse,
    requested_model: &str,
) -> Result<CompletionResponse> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::DecodeFailed("response has no candidates".to_string()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(fc) = part.function_call {
            tool_calls.push(ToolCallRequest {
                id: format!("call_{}", tool_calls.len()),
                name: fc.name,
                arguments: fc.args,
            });
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        "tool_calls".to_string()
    } else {
        match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => "length".to_string(),
            Some("STOP") | None => "stop".to_string(),
            Some(other) => other.to_ascii_lowercase(),
        }
    };

    let usage = response
        .usage_metadata
        .map(|u| Usage {
            prompt_tokens: u.prompt_token_count.unwrap_or(0),
            completion_tokens: u.candidates_token_count.unwrap_or(0),
            total_tokens: u.total_token_count.unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(CompletionResponse {
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls,
        finish_reason,
        usage,
        model: response
            .model_version
            .unwrap_or_else(|| requested_model.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_system_into_leading_user_turn() {
        let messages = vec![Message::system("Be brief."), Message::user("hi")];

        let folded = build_contents(&messages, true);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0]["role"], "user");
        assert_eq!(folded[0]["parts"][0]["text"], "Be brief.");

        let native = build_contents(&messages, false);
        assert_eq!(native.len(), 1);
        assert_eq!(native[0]["parts"][0]["text"], "hi");
        assert_eq!(
            system_instruction(&messages).unwrap()["parts"][0]["text"],
            "Be brief."
        );
    }

    #[test]
    fn test_tool_result_uses_model_role_and_tool_name() {
        let messages = vec![Message::tool_result("call_0", "read_file", "contents")];
        let contents = build_contents(&messages, false);
        assert_eq!(contents[0]["role"], "model");
        assert_eq!(
            contents[0]["parts"][0]["functionResponse"]["name"],
            "read_file"
        );
    }

    #[test]
    fn test_function_calls_parsed() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "lookup", "args": {"q": "rust"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5}
        }))
        .unwrap();

        let completion = into_completion(response, "gemini-2.5-pro").unwrap();
        assert!(completion.content.is_none());
        assert_eq!(completion.finish_reason, "tool_calls");
        assert_eq!(completion.tool_calls[0].arguments["q"], "rust");
        assert_eq!(completion.usage.total_tokens, 5);
        assert_eq!(completion.model, "gemini-2.5-pro");
    }

    #[test]
    fn test_empty_candidates_is_decode_error() {
        let response: GenerateContentResponse =
            serde_json::from_value(json!({"candidates": []})).unwrap();
        assert!(matches!(
            into_completion(response, "m"),
            Err(Error::DecodeFailed(_))
        ));
    }
}
