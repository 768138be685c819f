//! Tool specifications, adapters, and the registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::sandbox::{SandboxContext, SandboxProfile};
use crate::ActionError;

/// How dangerous a tool is; gates which contexts may run it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyClass {
    /// Read-only or reversible.
    Low,
    /// Writes local state.
    Medium,
    /// Outward-facing effects; requires a trusted device.
    High,
    /// Never auto-runs; always quarantined for human review.
    Critical,
}

/// Declarative description of a tool. Tools are data; behaviour lives in
/// the [`ToolAdapter`] registered alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Registry id (snake_case).
    pub tool_id: String,
    /// Semantic version.
    pub version: String,
    /// Capabilities the caller must hold.
    pub caps_required: Vec<String>,
    /// Required parameter names (coarse schema: presence is validated).
    pub params_required: Vec<String>,
    /// Whether the tool has side effects (pure tools skip sandbox entry).
    pub side_effects: bool,
    /// Safety class.
    pub safety_class: SafetyClass,
    /// Dispatch deadline.
    pub timeout_ms: Option<u64>,
    /// Params fields concatenated into the idempotency key.
    pub idempotency_key_fields: Vec<String>,
    /// Sandbox profile the adapter runs under.
    pub sandbox_profile: SandboxProfile,
}

/// OS-level adapter behind a tool. Implementations must observe the
/// sandbox context cooperatively (deadline, filesystem allowlist).
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Execute with validated params inside the sandbox.
    async fn dispatch(
        &self,
        params: &serde_json::Value,
        sandbox: &SandboxContext,
    ) -> Result<serde_json::Value, ActionError>;
}

/// Thread-safe tool registry. Starts empty; tools are explicitly
/// registered with their spec and adapter.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, (ToolSpec, Arc<dyn ToolAdapter>)>>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Ids must be unique.
    pub async fn register(
        &self,
        spec: ToolSpec,
        adapter: Arc<dyn ToolAdapter>,
    ) -> Result<(), ActionError> {
        let mut tools = self.tools.write().await;
        if tools.contains_key(&spec.tool_id) {
            return Err(ActionError::InvalidParams(format!(
                "tool already registered: {}",
                spec.tool_id
            )));
        }
        info!(tool = %spec.tool_id, version = %spec.version, "tool registered");
        tools.insert(spec.tool_id.clone(), (spec, adapter));
        Ok(())
    }

    /// Look up a tool.
    pub async fn get(&self, tool_id: &str) -> Option<(ToolSpec, Arc<dyn ToolAdapter>)> {
        self.tools
            .read()
            .await
            .get(tool_id)
            .map(|(spec, adapter)| (spec.clone(), adapter.clone()))
    }

    /// Registered tool ids.
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Normalized idempotency key: tool id plus the declared fields, hashed.
pub(crate) fn idempotency_key(spec: &ToolSpec, params: &serde_json::Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(spec.tool_id.as_bytes());
    for field in &spec.idempotency_key_fields {
        hasher.update(field.as_bytes());
        let value = params
            .get(field)
            .map(|v| v.to_string())
            .unwrap_or_default();
        hasher.update(value.as_bytes());
    }
    hasher.finalize().to_hex()[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ToolSpec {
        ToolSpec {
            tool_id: "file_note".into(),
            version: "1.0.0".into(),
            caps_required: vec!["notes.write".into()],
            params_required: vec!["path".into(), "text".into()],
            side_effects: true,
            safety_class: SafetyClass::Medium,
            timeout_ms: Some(1_000),
            idempotency_key_fields: vec!["path".into(), "text".into()],
            sandbox_profile: SandboxProfile::Default,
        }
    }

    #[test]
    fn idempotency_key_depends_only_on_declared_fields() {
        let spec = spec();
        let a = idempotency_key(
            &spec,
            &serde_json::json!({ "path": "/notes/a", "text": "hi", "noise": 1 }),
        );
        let b = idempotency_key(
            &spec,
            &serde_json::json!({ "path": "/notes/a", "text": "hi", "noise": 2 }),
        );
        let c = idempotency_key(
            &spec,
            &serde_json::json!({ "path": "/notes/b", "text": "hi" }),
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        struct Nop;
        #[async_trait]
        impl ToolAdapter for Nop {
            async fn dispatch(
                &self,
                _params: &serde_json::Value,
                _sandbox: &SandboxContext,
            ) -> Result<serde_json::Value, ActionError> {
                Ok(serde_json::Value::Null)
            }
        }
        let registry = ToolRegistry::new();
        registry.register(spec(), Arc::new(Nop)).await.unwrap();
        assert!(registry.register(spec(), Arc::new(Nop)).await.is_err());
        assert_eq!(registry.list().await, vec!["file_note".to_string()]);
    }
}
