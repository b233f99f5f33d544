//! Agent Dispatcher (C10): a single `{action, params}` endpoint backed by
//! a name → schema → handler registry, with per-API-key rate limiting and
//! OpenAPI generation from the same registry (spec §4.7).

pub mod actions;
pub mod openapi;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};

pub use actions::DispatchContext;

pub type ActionFuture = Pin<Box<dyn Future<Output = BridgeResult<Value>> + Send>>;
pub type ActionHandler = Arc<dyn Fn(Value, Arc<DispatchContext>) -> ActionFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Number,
    Bool,
    Object,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub required: bool,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitClass {
    Global,
    Orders,
    Collab,
    Evals,
}

impl RateLimitClass {
    fn per_minute(self) -> u32 {
        match self {
            RateLimitClass::Global => 100,
            RateLimitClass::Orders => 10,
            RateLimitClass::Collab => 30,
            RateLimitClass::Evals => 10,
        }
    }

    fn label(self) -> &'static str {
        match self {
            RateLimitClass::Global => "global",
            RateLimitClass::Orders => "orders",
            RateLimitClass::Collab => "collab",
            RateLimitClass::Evals => "evals",
        }
    }
}

pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
    pub rate_limit_class: RateLimitClass,
    pub handler: ActionHandler,
}

#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<&'static str, ActionSpec>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ActionSpec) {
        self.actions.insert(spec.name, spec);
    }

    pub fn get(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.get(name)
    }

    pub fn sorted_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.actions.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn specs(&self) -> impl Iterator<Item = &ActionSpec> {
        self.actions.values()
    }
}

/// Validate an incoming params object against an action's declared
/// schema. Missing required fields or wrong-shaped values fail with the
/// offending field named (spec §4.7 "known action with invalid params").
pub fn validate_params(spec: &ActionSpec, params: &Value) -> BridgeResult<()> {
    let object = params
        .as_object()
        .ok_or_else(|| BridgeError::validation("params", "must be a JSON object"))?;

    for param in &spec.params {
        match object.get(param.name) {
            None | Some(Value::Null) => {
                if param.required {
                    return Err(BridgeError::validation(param.name, "missing required parameter"));
                }
            }
            Some(value) => {
                let matches = match param.kind {
                    ParamKind::String => value.is_string(),
                    ParamKind::Number => value.is_number(),
                    ParamKind::Bool => value.is_boolean(),
                    ParamKind::Object => value.is_object(),
                };
                if !matches {
                    return Err(BridgeError::validation(
                        param.name,
                        format!("expected {:?}", param.kind),
                    ));
                }
            }
        }
    }
    Ok(())
}

struct WindowCounter {
    count: u32,
    window_start: Instant,
}

/// Sliding-window token bucket keyed by (api_key, rate-limit class),
/// adapted from the teacher's IP-keyed `middleware/rate_limit.rs`.
pub struct RateLimiter {
    window: Duration,
    state: Mutex<HashMap<(String, RateLimitClass), WindowCounter>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn check_one(&self, api_key: &str, class: RateLimitClass) -> BridgeResult<()> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let key = (api_key.to_string(), class);
        let entry = state.entry(key).or_insert(WindowCounter {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        if entry.count > class.per_minute() {
            let retry_after = self.window.saturating_sub(now.duration_since(entry.window_start));
            return Err(BridgeError::RateLimited {
                bucket: class.label().to_string(),
                retry_after_secs: retry_after.as_secs(),
            });
        }
        Ok(())
    }

    /// Every action consumes the global bucket plus its own declared
    /// class's bucket (spec §4.7: "global (100/min)" applies to all
    /// actions, the per-class buckets are additional).
    pub fn check(&self, api_key: &str, class: RateLimitClass) -> BridgeResult<()> {
        self.check_one(api_key, RateLimitClass::Global)?;
        if class != RateLimitClass::Global {
            self.check_one(api_key, class)?;
        }
        Ok(())
    }
}

pub struct Dispatcher {
    registry: ActionRegistry,
    rate_limiter: RateLimiter,
}

impl Dispatcher {
    pub fn new(registry: ActionRegistry) -> Self {
        Self {
            registry,
            rate_limiter: RateLimiter::default(),
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        api_key: &str,
        action: &str,
        params: Value,
        ctx: Arc<DispatchContext>,
    ) -> BridgeResult<Value> {
        let spec = self.registry.get(action).ok_or_else(|| {
            BridgeError::validation(
                "action",
                format!("unknown action; valid actions: {:?}", self.registry.sorted_names()),
            )
        })?;

        self.rate_limiter.check(api_key, spec.rate_limit_class)?;
        validate_params(spec, &params)?;

        (spec.handler)(params, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler() -> ActionHandler {
        Arc::new(|_params, _ctx| Box::pin(async { Ok(json!({"ok": true})) }))
    }

    fn registry_with_get_status() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register(ActionSpec {
            name: "get_status",
            description: "status",
            params: vec![],
            rate_limit_class: RateLimitClass::Global,
            handler: noop_handler(),
        });
        registry
    }

    #[test]
    fn unknown_action_lists_get_status() {
        let registry = registry_with_get_status();
        let names = registry.sorted_names();
        assert!(names.contains(&"get_status"));
    }

    #[test]
    fn validate_params_rejects_missing_required_field() {
        let mut registry = ActionRegistry::new();
        registry.register(ActionSpec {
            name: "submit_order",
            description: "x",
            params: vec![ParamSpec { name: "symbol", required: true, kind: ParamKind::String }],
            rate_limit_class: RateLimitClass::Orders,
            handler: noop_handler(),
        });
        let spec = registry.get("submit_order").unwrap();
        let result = validate_params(spec, &json!({}));
        assert!(matches!(result, Err(BridgeError::Validation { .. })));
    }

    #[test]
    fn rate_limiter_trips_after_class_limit() {
        let limiter = RateLimiter::default();
        for _ in 0..10 {
            limiter.check("key-1", RateLimitClass::Orders).unwrap();
        }
        let result = limiter.check("key-1", RateLimitClass::Orders);
        assert!(matches!(result, Err(BridgeError::RateLimited { .. })));
    }

    #[test]
    fn different_keys_have_independent_buckets() {
        let limiter = RateLimiter::default();
        for _ in 0..10 {
            limiter.check("key-1", RateLimitClass::Orders).unwrap();
        }
        assert!(limiter.check("key-2", RateLimitClass::Orders).is_ok());
    }
}
