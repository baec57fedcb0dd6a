//! Upstream request body construction
//!
//! Builds the CloudCode `generateContent` envelope: the model, the wrapped
//! request (contents, generation config, optional system instruction and
//! tools), and the billed project id.

use serde_json::{Value, json};

use crate::executor::{ExecutorConfig, GenerateOptions};

/// Assemble the JSON body for one generate call.
pub fn build_request_body(
    config: &ExecutorConfig,
    options: &GenerateOptions,
    project_id: &str,
) -> Value {
    let mut generation_config = json!({
        "maxOutputTokens": options.max_output_tokens.unwrap_or(config.max_output_tokens),
        "temperature": options.temperature.unwrap_or(config.temperature),
        "topP": options.top_p.unwrap_or(config.top_p),
    });
    if let Some(mime) = &options.response_mime_type {
        generation_config["responseMimeType"] = json!(mime);
    }
    if let Some(schema) = &options.response_json_schema {
        generation_config["responseJsonSchema"] = schema.clone();
    }
    if config.thinking_enabled {
        generation_config["thinkingConfig"] = json!({
            "thinkingBudget": options.thinking_budget.unwrap_or(config.thinking_budget),
        });
    }

    let mut request = json!({
        "contents": [{
            "role": "user",
            "parts": [{"text": options.prompt}],
        }],
        "generationConfig": generation_config,
    });
    if let Some(instruction) = &options.system_instruction {
        request["systemInstruction"] = json!({"parts": [{"text": instruction}]});
    }
    if options.use_google_search {
        request["tools"] = json!([{"googleSearch": {}}]);
    }

    json!({
        "model": options.model.clone().unwrap_or_else(|| config.model.clone()),
        "request": request,
        "project": project_id,
    })
}
