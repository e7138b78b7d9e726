use std::collections::HashMap;
use std::sync::Arc;
use dashmap::DashMap;
use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, Node as EvalNode};
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

/// Process-instance variables. Cheap to clone (just an `Arc`).
#[derive(Debug, Clone)]
pub struct Context {
    pub instance_id: Uuid,
    pub process_id: String,
    variables: Arc<DashMap<String, Value>>,
}

impl Context {
    pub fn new(instance_id: Uuid, process_id: String, initial: HashMap<String, Value>) -> Self {
        Self {
            instance_id,
            process_id,
            variables: Arc::new(initial.into_iter().collect()),
        }
    }

    pub fn get_var(&self, key: &str) -> Option<Value> {
        self.variables.get(key).map(|v| v.value().clone())
    }

    pub fn set_var(&self, key: &str, value: Value) {
        self.variables.insert(key.to_string(), value);
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.variables.iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    /// Replaces whole-string `${var}` parameter values with the variable.
    pub fn resolve_params(&self, params: &Value) -> Value {
        let mut resolved = params.clone();
        if let Some(obj) = resolved.as_object_mut() {
            for (_, v) in obj.iter_mut() {
                if let Some(s) = v.as_str() {
                    if s.starts_with("${") && s.ends_with('}') {
                        let var_name = &s[2..s.len() - 1];
                        if let Some(val) = self.get_var(var_name) {
                            *v = val;
                        }
                    }
                }
            }
        }
        resolved
    }

    pub fn eval_context(&self) -> HashMapContext<DefaultNumericTypes> {
        let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
        for r in self.variables.iter() {
            if let Some(ev) = to_eval_value(r.value()) {
                let _ = eval_ctx.set_value(r.key().clone(), ev);
            }
        }
        eval_ctx
    }

    /// Evaluation errors (unknown variable, type mismatch) count as `false`.
    pub fn eval_condition(&self, raw: &str, tree: &EvalNode) -> bool {
        let eval_ctx = self.eval_context();
        tree.eval_boolean_with_context(&eval_ctx).unwrap_or_else(|e| {
            warn!(condition = raw, error = %e, "Condition evaluation failed");
            false
        })
    }
}

pub fn to_eval_value(v: &Value) -> Option<evalexpr::Value<DefaultNumericTypes>> {
    match v {
        Value::String(s) => Some(evalexpr::Value::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() { Some(evalexpr::Value::Int(i)) }
            else { n.as_f64().map(evalexpr::Value::Float) }
        }
        Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
        _ => None,
    }
}

pub fn from_eval_value(v: evalexpr::Value<DefaultNumericTypes>) -> Option<Value> {
    match v {
        evalexpr::Value::String(s) => Some(Value::String(s)),
        evalexpr::Value::Int(i) => Some(json!(i)),
        evalexpr::Value::Float(f) => Some(json!(f)),
        evalexpr::Value::Boolean(b) => Some(Value::Bool(b)),
        _ => None,
    }
}
