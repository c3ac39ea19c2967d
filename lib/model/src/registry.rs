// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Model discovery and the load-once model manager.
//!
//! A [`ModelRegistry`] maps names to factories. Binaries embedding their own models
//! register them explicitly; the built-in test model is there as a fallback.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::OnceCell;

use modelserve_runtime::Runtime;

use crate::errors::RegistryError;
use crate::model::{catch_panic, Model};
use crate::test_model;
use crate::wrapper::{ModelWrapper, WrapperOptions};

type ModelFactory = Arc<dyn Fn() -> anyhow::Result<Model> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ModelRegistry {
    factories: BTreeMap<String, ModelFactory>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.names())
            .finish()
    }
}

impl ModelRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding only the built-in test model
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(test_model::NAME, || Ok(test_model::build()));
        registry
    }

    /// Add a model factory. A later registration under the same name replaces the earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<Model> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            tracing::warn!(model = %name, "Replacing previously registered model");
        }
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the model registered as `name`.
    pub fn load(&self, name: &str) -> Result<Model, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::ModuleNotFound {
                name: name.to_string(),
                available: self.names(),
            })?;

        catch_panic(|| factory()).map_err(|err| RegistryError::Construction {
            name: name.to_string(),
            reason: format!("{err:#}"),
        })
    }

    /// Pick the model to serve.
    ///
    /// An explicit `name` must be registered. Otherwise the single registered model is
    /// chosen, ignoring the built-in test model when others exist; the test model is only
    /// served when nothing else is registered.
    pub fn resolve_name(&self, name: Option<&str>) -> Result<String, RegistryError> {
        if let Some(name) = name {
            if !self.contains(name) {
                return Err(RegistryError::ModuleNotFound {
                    name: name.to_string(),
                    available: self.names(),
                });
            }
            return Ok(name.to_string());
        }

        let candidates: Vec<String> = self
            .names()
            .into_iter()
            .filter(|n| n != test_model::NAME)
            .collect();

        match candidates.len() {
            1 => Ok(candidates[0].clone()),
            0 if self.contains(test_model::NAME) => {
                tracing::info!("No models found, loading test model");
                Ok(test_model::NAME.to_string())
            }
            0 => Err(RegistryError::NoModelsAvailable),
            _ => Err(RegistryError::MultipleModelsFound { names: candidates }),
        }
    }

    /// Resolve and build the model to serve, see [`ModelRegistry::resolve_name`].
    pub fn resolve_model(&self, name: Option<&str>) -> Result<(String, Model), RegistryError> {
        let name = self.resolve_name(name)?;
        let model = self.load(&name)?;
        Ok((name, model))
    }
}

/// Owns the registry and the single [`ModelWrapper`] of this process.
///
/// Note: Don't implement Clone for this, put it in an Arc instead.
#[derive(Debug)]
pub struct ModelManager {
    registry: ModelRegistry,
    loaded: OnceCell<Arc<ModelWrapper>>,
}

impl ModelManager {
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            loaded: OnceCell::new(),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Load and wrap `name` the first time; later calls return the same wrapper.
    pub async fn load(
        &self,
        name: &str,
        runtime: &Runtime,
        options: WrapperOptions,
    ) -> anyhow::Result<Arc<ModelWrapper>> {
        let wrapper = self
            .loaded
            .get_or_try_init(|| async {
                let model = self.registry.load(name)?;
                let wrapper = ModelWrapper::new(name, model, runtime, options).await?;
                Ok::<_, anyhow::Error>(Arc::new(wrapper))
            })
            .await?;

        if wrapper.name() != name {
            tracing::warn!(
                requested = name,
                loaded = wrapper.name(),
                "A model is already loaded, ignoring request for another one"
            );
        }
        Ok(wrapper.clone())
    }

    /// The loaded wrapper, if any
    pub fn get(&self) -> Option<Arc<ModelWrapper>> {
        self.loaded.get().cloned()
    }
}
