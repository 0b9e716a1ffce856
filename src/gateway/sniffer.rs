//! Extracts assistant text and token usage from a captured backend body,
//! whether it was a single JSON document or a Server-Sent-Events stream.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseChoice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    delta: Option<ChoiceMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct UsagePayload {
    #[serde(default, alias = "input_tokens")]
    prompt_tokens: Option<Value>,
    #[serde(default, alias = "output_tokens")]
    completion_tokens: Option<Value>,
    #[serde(default)]
    total_tokens: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    model: Option<Value>,
    #[serde(default)]
    choices: Option<Vec<ResponseChoice>>,
    #[serde(default)]
    usage: Option<UsagePayload>,
    #[serde(default)]
    error: Option<Value>,
}

impl ResponseEnvelope {
    fn model(&self) -> Option<String> {
        self.model
            .as_ref()
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(str::to_string)
    }

    fn error_message(&self) -> Option<&str> {
        let message = match self.error.as_ref()? {
            Value::String(message) => Some(message.as_str()),
            Value::Object(obj) => obj.get("message").and_then(Value::as_str),
            _ => None,
        };
        message.filter(|message| !message.is_empty())
    }

    fn push_text(&self, out: &mut String) {
        for choice in self.choices.iter().flatten() {
            for part in [choice.message.as_ref(), choice.delta.as_ref()]
                .into_iter()
                .flatten()
            {
                // Structured (non-string) deltas contribute nothing.
                if let Some(Value::String(text)) = part.content.as_ref() {
                    out.push_str(text);
                }
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub model: Option<String>,
    pub error_message: Option<String>,
}

impl UsageSummary {
    fn apply_model_and_error(&mut self, envelope: &ResponseEnvelope) {
        if let Some(model) = envelope.model() {
            self.model = Some(model);
        }
        if let Some(message) = envelope.error_message() {
            self.error_message = Some(message.to_string());
        }
    }

    /// Returns whether any usage counter was present.
    fn apply_usage(&mut self, envelope: &ResponseEnvelope) -> bool {
        let Some(usage) = envelope.usage.as_ref() else {
            return false;
        };
        let prompt = usage.prompt_tokens.as_ref().and_then(number_to_u64);
        let completion = usage.completion_tokens.as_ref().and_then(number_to_u64);
        let total = usage.total_tokens.as_ref().and_then(number_to_u64);

        if let Some(prompt) = prompt {
            self.input_tokens = prompt;
        }
        if let Some(completion) = completion {
            self.output_tokens = completion;
        }
        match (total, prompt, completion) {
            (Some(total), _, _) => self.total_tokens = total,
            (None, Some(prompt), Some(completion)) => {
                self.total_tokens = prompt.saturating_add(completion);
            }
            _ => {}
        }
        prompt.is_some() || completion.is_some() || total.is_some()
    }
}

/// Concatenated assistant text plus the backend-reported model, if any.
pub fn extract_assistant_text(body: &[u8]) -> (String, Option<String>) {
    let mut json_model = None;
    if let Ok(envelope) = serde_json::from_slice::<ResponseEnvelope>(body) {
        let mut text = String::new();
        envelope.push_text(&mut text);
        if !text.is_empty() {
            return (text, envelope.model());
        }
        json_model = envelope.model();
    }

    let mut text = String::new();
    let mut model = None;
    for envelope in sse_envelopes(body) {
        if model.is_none() {
            model = envelope.model();
        }
        envelope.push_text(&mut text);
    }
    (text, model.or(json_model))
}

pub fn extract_usage(body: &[u8]) -> UsageSummary {
    let mut summary = UsageSummary::default();
    if body.is_empty() {
        return summary;
    }

    if let Ok(envelope) = serde_json::from_slice::<ResponseEnvelope>(body) {
        summary.apply_model_and_error(&envelope);
        if summary.apply_usage(&envelope) {
            return summary;
        }
    }

    let mut last = None;
    let mut last_with_usage = None;
    for envelope in sse_envelopes(body) {
        if envelope.usage.is_some() {
            last_with_usage = Some(envelope);
        } else {
            last = Some(envelope);
        }
    }
    if let Some(envelope) = last_with_usage.or(last) {
        summary.apply_model_and_error(&envelope);
        summary.apply_usage(&envelope);
    }
    summary
}

fn sse_envelopes(body: &[u8]) -> impl Iterator<Item = ResponseEnvelope> {
    sse_data_blocks(body)
        .into_iter()
        .filter(|data| data.as_slice() != b"[DONE]")
        .filter_map(|data| serde_json::from_slice::<ResponseEnvelope>(&data).ok())
}

/// Splits an event stream into the joined `data:` payload of each event.
fn sse_data_blocks(body: &[u8]) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    let mut current = Vec::<u8>::new();
    for line in body.split(|b| *b == b'\n') {
        let line = trim_ascii_whitespace(line);
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        let Some(rest) = line.strip_prefix(b"data:") else {
            continue;
        };
        let rest = trim_ascii_whitespace(rest);
        if rest.is_empty() {
            continue;
        }
        if !current.is_empty() {
            current.push(b'\n');
        }
        current.extend_from_slice(rest);
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

fn number_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_i64().map(|n| n.max(0) as u64))
            .or_else(|| number.as_f64().filter(|f| f.is_finite()).map(|f| f.max(0.0) as u64)),
        _ => None,
    }
}
