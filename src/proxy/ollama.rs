// Ollama dialect translation.
//
// Ollama is the one supported backend that does not speak the OpenAI wire
// format: chat goes to /api/chat, embeddings to /api/embed, and streaming
// responses are NDJSON lines rather than SSE. Requests are mapped field by
// field; responses are reverse-mapped into OpenAI envelopes so clients see
// no difference.

use chrono::Utc;
use serde_json::{json, Value};

use crate::models::{ApiFamily, Usage};

/// Upstream path for a capability.
pub fn upstream_path(family: ApiFamily) -> Option<&'static str> {
    match family {
        ApiFamily::ChatCompletions => Some("/api/chat"),
        ApiFamily::Embeddings => Some("/api/embed"),
        _ => None,
    }
}

/// OpenAI chat request -> Ollama /api/chat body.
pub fn translate_chat_request(body: &Value, stream: bool) -> Value {
    let mut options = json!({});
    if let Some(v) = body.get("temperature") {
        options["temperature"] = v.clone();
    }
    if let Some(v) = body.get("top_p") {
        options["top_p"] = v.clone();
    }
    if let Some(v) = body.get("max_tokens").or_else(|| body.get("max_completion_tokens")) {
        options["num_predict"] = v.clone();
    }

    let mut out = json!({
        "model": body["model"],
        "messages": body["messages"],
        "stream": stream,
    });
    if options.as_object().is_some_and(|o| !o.is_empty()) {
        out["options"] = options;
    }
    out
}

/// Ollama unary /api/chat response -> OpenAI chat.completion.
pub fn translate_chat_response(resp: &Value, model: &str) -> (Value, Usage) {
    let usage = extract_usage(resp);
    let content = resp["message"]["content"].as_str().unwrap_or_default();
    let finish = if resp["done_reason"].as_str() == Some("length") {
        "length"
    } else {
        "stop"
    };
    let envelope = json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": finish,
        }],
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        }
    });
    (envelope, usage)
}

/// One NDJSON streaming line -> OpenAI chat.completion.chunk. The final
/// line (done: true) yields the usage-bearing finish chunk.
pub fn translate_chat_chunk(
    line: &Value,
    model: &str,
    stream_id: &str,
    created: i64,
) -> (Value, Option<Usage>) {
    let done = line["done"].as_bool().unwrap_or(false);
    if done {
        let usage = extract_usage(line);
        let chunk = json!({
            "id": stream_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_tokens": usage.total_tokens,
            }
        });
        (chunk, Some(usage))
    } else {
        let content = line["message"]["content"].as_str().unwrap_or_default();
        let chunk = json!({
            "id": stream_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": { "content": content },
                "finish_reason": Value::Null,
            }],
        });
        (chunk, None)
    }
}

/// OpenAI embeddings request -> Ollama /api/embed body.
pub fn translate_embeddings_request(body: &Value) -> Value {
    json!({
        "model": body["model"],
        "input": body["input"],
    })
}

/// Ollama /api/embed response -> OpenAI embeddings envelope.
pub fn translate_embeddings_response(resp: &Value, model: &str) -> (Value, Usage) {
    let usage = extract_usage(resp);
    let data: Vec<Value> = resp["embeddings"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .enumerate()
                .map(|(i, emb)| {
                    json!({
                        "object": "embedding",
                        "index": i,
                        "embedding": emb,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let envelope = json!({
        "object": "list",
        "data": data,
        "model": model,
        "usage": {
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": 0,
            "total_tokens": usage.total_tokens.max(usage.prompt_tokens),
        }
    });
    (envelope, usage)
}

/// Ollama reports token counts as prompt_eval_count / eval_count.
fn extract_usage(value: &Value) -> Usage {
    let prompt = value["prompt_eval_count"].as_u64().unwrap_or(0);
    let completion = value["eval_count"].as_u64().unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    }
}
