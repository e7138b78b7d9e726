use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde_json::{Value, json};
use std::time::Duration;
use evalexpr::eval_with_context;
use tracing::info;
use crate::handlers::{ExecutionMode, FailureKind, TaskEvent, TaskFailure, TaskHandler, TaskStream};
use crate::runtime::context::{Context, from_eval_value};
use anyhow::{Result, anyhow};

fn completed<'a>(value: Value) -> TaskStream<'a> {
    stream::once(async move { TaskEvent::Completed(value) }).boxed()
}

fn failed<'a>(failure: TaskFailure) -> TaskStream<'a> {
    stream::once(async move { TaskEvent::Failed(failure) }).boxed()
}

#[derive(Debug)]
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    fn execute<'a>(&'a self, params: Value, ctx: Context) -> TaskStream<'a> {
        if let Some(msg) = params.get("msg").and_then(|v| v.as_str()) {
            info!(instance_id = %ctx.instance_id, "[LOG] {}", msg);
        } else {
            info!(instance_id = %ctx.instance_id, "[LOG] {:?}", params);
        }
        completed(Value::Null)
    }
}

/// Sets variables from `assignments`, an `expression` ("x = a + 1"), and
/// returns `value` (or the bare expression result).
#[derive(Debug)]
pub struct AssignHandler;

impl AssignHandler {
    fn apply(&self, params: &Value, ctx: &Context) -> std::result::Result<Value, TaskFailure> {
        if let Some(list) = params.get("assignments").and_then(|v| v.as_array()) {
            for item in list {
                if let (Some(k), Some(v)) = (item.get("key").and_then(|s| s.as_str()), item.get("value")) {
                    ctx.set_var(k, v.clone());
                }
            }
        }

        if let Some(expr) = params.get("expression").and_then(|v| v.as_str()) {
            let (target_var, rhs) = match expr.split_once('=') {
                Some((left, right)) if !right.starts_with('=') && !left.ends_with(['!', '<', '>', '=']) => {
                    (Some(left.trim()), right.trim())
                }
                _ => (None, expr),
            };

            let eval_ctx = ctx.eval_context();
            let result = eval_with_context(rhs, &eval_ctx).map_err(|e| {
                TaskFailure::new(FailureKind::MalformedRequest, format!("expression '{}' failed: {}", rhs, e))
            })?;
            let json_val = from_eval_value(result).ok_or_else(|| {
                TaskFailure::new(FailureKind::MalformedRequest, format!("expression '{}' has no JSON value", rhs))
            })?;

            match target_var {
                Some(var_name) => ctx.set_var(var_name, json_val),
                None if params.get("value").is_none() => return Ok(json_val),
                None => {}
            }
        }

        Ok(params.get("value").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl TaskHandler for AssignHandler {
    fn name(&self) -> &str {
        "assign"
    }

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    fn execute<'a>(&'a self, params: Value, ctx: Context) -> TaskStream<'a> {
        match self.apply(&params, &ctx) {
            Ok(v) => completed(v),
            Err(f) => failed(f),
        }
    }
}

/// Waits `duration_ms`, interruptible throughout.
#[derive(Debug)]
pub struct SleepHandler;

#[async_trait]
impl TaskHandler for SleepHandler {
    fn name(&self) -> &str {
        "sleep"
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Interruptible
    }

    fn validate(&self, params: &Value) -> Result<()> {
        params.get("duration_ms").and_then(|v| v.as_u64())
            .map(|_| ())
            .ok_or_else(|| anyhow!("Missing required parameter: duration_ms"))
    }

    fn execute<'a>(&'a self, params: Value, _ctx: Context) -> TaskStream<'a> {
        let ms = params.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0);
        stream::once(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            TaskEvent::Completed(json!({ "slept_ms": ms }))
        }).boxed()
    }
}

/// Streams the `chunks` array one item per `interval_ms`, then completes
/// with all chunks joined (strings) or collected (anything else).
#[derive(Debug)]
pub struct EmitHandler;

#[async_trait]
impl TaskHandler for EmitHandler {
    fn name(&self) -> &str {
        "emit"
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Streamed
    }

    fn validate(&self, params: &Value) -> Result<()> {
        if params.get("chunks").and_then(|v| v.as_array()).is_none() {
            return Err(anyhow!("Missing required parameter: chunks"));
        }
        Ok(())
    }

    fn execute<'a>(&'a self, params: Value, _ctx: Context) -> TaskStream<'a> {
        let chunks = params.get("chunks").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let interval = Duration::from_millis(params.get("interval_ms").and_then(|v| v.as_u64()).unwrap_or(0));

        stream! {
            for chunk in &chunks {
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                yield TaskEvent::Chunk(chunk.clone());
            }
            let result = if chunks.iter().all(|c| c.is_string()) {
                Value::String(chunks.iter().filter_map(|c| c.as_str()).collect())
            } else {
                Value::Array(chunks.clone())
            };
            yield TaskEvent::Completed(result);
        }.boxed()
    }
}
