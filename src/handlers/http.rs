use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde_json::{Value, json};
use crate::handlers::{TaskEvent, TaskFailure, TaskHandler, TaskStream};
use crate::handlers::failure::{FailureKind, classify_reqwest};
use crate::runtime::context::Context;
use anyhow::{Result, anyhow};
use reqwest::Client;

/// Atomic HTTP call. Non-2xx responses fail with a status-derived class.
#[derive(Debug)]
pub struct HttpHandler {
    client: Client,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    async fn call(&self, params: Value) -> std::result::Result<Value, TaskFailure> {
        let url = params.get("url").and_then(|v| v.as_str())
            .ok_or_else(|| TaskFailure::new(FailureKind::MalformedRequest, "Invalid url"))?;

        let method_str = params.get("method").and_then(|v| v.as_str()).unwrap_or("GET");
        let method = method_str.parse::<reqwest::Method>()
            .map_err(|_| TaskFailure::new(FailureKind::MalformedRequest, format!("Invalid HTTP method: {}", method_str)))?;

        let mut builder = self.client.request(method, url);

        if let Some(body) = params.get("body") {
            builder = builder.json(body);
        }

        if let Some(headers) = params.get("headers").and_then(|v| v.as_object()) {
            for (k, v) in headers {
                if let Some(v_str) = v.as_str() {
                    builder = builder.header(k, v_str);
                }
            }
        }

        let response = builder.send().await
            .map_err(|e| TaskFailure::new(classify_reqwest(&e), e.to_string()))?;
        let status = response.status().as_u16();

        if let Some(kind) = FailureKind::from_status(status) {
            let body = response.text().await.unwrap_or_default();
            return Err(TaskFailure::new(kind, format!("HTTP {} from {}: {}", status, url, body)));
        }

        // non-JSON bodies come back as null data
        let data = response.json::<Value>().await.unwrap_or(Value::Null);

        Ok(json!({
            "status": status,
            "data": data
        }))
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for HttpHandler {
    fn name(&self) -> &str {
        "http"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        if params.get("url").is_none() {
            return Err(anyhow!("Missing required parameter: url"));
        }
        Ok(())
    }

    fn execute<'a>(&'a self, params: Value, _ctx: Context) -> TaskStream<'a> {
        stream::once(async move {
            match self.call(params).await {
                Ok(v) => TaskEvent::Completed(v),
                Err(f) => TaskEvent::Failed(f),
            }
        }).boxed()
    }
}
