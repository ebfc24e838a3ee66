use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

/// One line on stdout. Exactly one of `result`/`error` is present.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: &'a str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody<'a>>,
}

fn to_value(env: Envelope<'_>) -> serde_json::Value {
    serde_json::to_value(env).unwrap_or_else(|_| serde_json::json!({ "ok": false }))
}

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    to_value(Envelope {
        id,
        ok: true,
        result: Some(result),
        error: None,
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    to_value(Envelope {
        id,
        ok: false,
        result: None,
        error: Some(ErrorBody {
            code,
            message: message.into(),
            details,
        }),
    })
}
