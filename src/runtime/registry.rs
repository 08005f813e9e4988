use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use super::{FnOrchestration, OrchestrationHandler};
use crate::codec::{Codec, Json};
use crate::{ActivityError, OrchestrationContext};

/// Immutable map from orchestration name to handler.
#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn OrchestrationHandler>>>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name).cloned()
    }
}

pub struct OrchestrationRegistryBuilder {
    map: HashMap<String, Arc<dyn OrchestrationHandler>>,
    errors: Vec<String>,
}

impl OrchestrationRegistryBuilder {
    fn insert(mut self, name: String, handler: Arc<dyn OrchestrationHandler>) -> Self {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate orchestration registration: {name}"));
            return self;
        }
        self.map.insert(name, handler);
        self
    }

    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)))
    }

    /// Register an orchestration with JSON-decoded input and JSON-encoded output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnOrchestration(wrapper)))
    }

    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Like `build`, but reports duplicate registrations.
    pub fn build_result(self) -> Result<OrchestrationRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, ActivityError>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, ActivityError> {
        (self.0)(input).await
    }
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistry {
    /// A builder with the built-in system activities already registered.
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
            .register(crate::SYSTEM_NOW_ACTIVITY, |_input: String| async move {
                let now_ms = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis();
                Ok(now_ms.to_string())
            })
            .register(crate::SYSTEM_NEW_GUID_ACTIVITY, |_input: String| async move {
                Ok(uuid::Uuid::new_v4().to_string())
            })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }
}

impl ActivityRegistryBuilder {
    /// Register a handler returning plain error strings; each error is
    /// classified by its text (see `ActivityError::classify`).
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_classified(name, move |input: String| {
            let f = f.clone();
            async move { f(input).await.map_err(ActivityError::from) }
        })
    }

    /// Register a handler that reports classified failures.
    pub fn register_classified<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.map.insert(name.into(), Arc::new(FnActivity(f)));
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_classified_typed(name, move |input: In| {
            let f = f.clone();
            async move { f(input).await.map_err(ActivityError::from) }
        })
    }

    /// Typed variant of `register_classified`. Undecodable input is a
    /// permanent failure.
    pub fn register_classified_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, ActivityError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&input_s).map_err(|e| ActivityError::Permanent(format!("decode: {e}")))?;
                let out: Out = (f_inner)(input).await?;
                Json::encode(&out).map_err(|e| ActivityError::Permanent(format!("encode: {e}")))
            }
        };
        self.register_classified(name, wrapper)
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}
