use super::Operation;
use crate::core::{EngineError, Result, codes};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds an operation from its decoded arguments.
pub type OperationFactory = Arc<dyn Fn(Value) -> Result<Box<dyn Operation>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct OperationRegistry {
    factories: HashMap<String, OperationFactory>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Value) -> Result<Box<dyn Operation>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(&self, name: &str, args: Value) -> Result<Box<dyn Operation>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            EngineError::functional(codes::UNKNOWN_OPERATION, format!("unknown operation '{}'", name))
        })?;
        factory(args)
    }
}

/// Decodes operation arguments, mapping failures to a functional error.
pub fn parse_args<T: serde::de::DeserializeOwned>(name: &str, args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(|err| {
        EngineError::functional(
            codes::BAD_ARGUMENTS,
            format!("invalid arguments for {}: {}", name, err),
        )
    })
}
