use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub function_call: Option<Value>,
}

/// Inbound chat completion body. Unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<Value>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    /// Rough prompt size: a third of the characters of each message, summed.
    pub fn estimated_prompt_tokens(&self) -> u64 {
        self.messages
            .iter()
            .map(|m| m.content.as_deref().map_or(0, |c| c.chars().count() as u64 / 3))
            .sum()
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Builds the upstream body: the model is pinned to `target_model`,
/// `name`/`function_call` survive only on messages with a truthy
/// `function_call`, and falsy top-level fields are omitted.
pub fn normalize(request: &CompletionRequest, target_model: &str) -> Map<String, Value> {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            let mut out = Map::new();
            out.insert("role".to_string(), Value::String(message.role.clone()));
            out.insert(
                "content".to_string(),
                message
                    .content
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );
            if let Some(call) = message.function_call.as_ref().filter(|c| is_truthy(c)) {
                if let Some(name) = &message.name {
                    out.insert("name".to_string(), Value::String(name.clone()));
                }
                out.insert("function_call".to_string(), call.clone());
            }
            Value::Object(out)
        })
        .collect();

    let mut fields = Map::new();
    fields.insert("messages".to_string(), Value::Array(messages));
    fields.insert("model".to_string(), Value::String(target_model.to_string()));
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            fields.insert(key.to_string(), value);
        }
    };
    put("temperature", request.temperature.map(Value::from));
    put("top_p", request.top_p.map(Value::from));
    put("n", request.n.map(Value::from));
    put("max_tokens", request.max_tokens.map(Value::from));
    put("stop", request.stop.clone());
    put("presence_penalty", request.presence_penalty.map(Value::from));
    put("frequency_penalty", request.frequency_penalty.map(Value::from));
    put("user", request.user.clone().map(Value::from));
    put("stream", Some(Value::Bool(request.stream)));

    fields.retain(|_, value| is_truthy(value));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: Value) -> CompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn drops_falsy_fields_and_message_name() {
        let req = parse(json!({
            "model": "x",
            "temperature": 0,
            "messages": [{"role": "user", "content": "hi", "name": "n"}]
        }));
        let body = normalize(&req, "target");
        assert!(!body.contains_key("temperature"));
        assert!(!body.contains_key("stream"));
        assert_eq!(body["model"], "target");
        assert_eq!(body["messages"][0], json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn keeps_name_when_function_call_is_truthy() {
        let req = parse(json!({
            "messages": [
                {"role": "assistant", "content": null, "name": "f",
                 "function_call": {"name": "lookup", "arguments": "{}"}},
                {"role": "user", "content": "x", "name": "n", "function_call": {}}
            ],
            "stream": true,
            "max_tokens": 16,
            "stop": []
        }));
        let body = normalize(&req, "target");
        assert_eq!(body["messages"][0]["name"], "f");
        assert_eq!(body["messages"][0]["function_call"]["name"], "lookup");
        assert!(body["messages"][1].get("name").is_none());
        assert!(body["messages"][1].get("function_call").is_none());
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 16);
        assert!(!body.contains_key("stop"));
    }

    #[test]
    fn truthiness_follows_json_emptiness() {
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!(0.7)));
        assert!(is_truthy(&json!(["\n"])));
    }

    #[test]
    fn prompt_estimate_is_per_message_thirds() {
        let req = parse(json!({
            "messages": [
                {"role": "system", "content": "abcde"},
                {"role": "user", "content": "abcdefgh"},
                {"role": "assistant", "content": null}
            ]
        }));
        assert_eq!(req.estimated_prompt_tokens(), 1 + 2);
    }
}
