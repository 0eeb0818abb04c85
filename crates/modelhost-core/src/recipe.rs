//! Recipe definitions and minimal stores

use crate::traits::RecipeStore;
use crate::types::{Backend, RecipeId};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, info};

/// A named model-serving configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: RecipeId,

    /// Human readable name
    #[serde(default)]
    pub name: String,

    /// Model directory or hub reference handed to the engine
    pub model_path: String,

    pub backend: Backend,

    /// Overrides the backend's default port
    #[serde(default)]
    pub port: Option<u16>,

    /// Name exposed on the OpenAI API; defaults to the recipe id
    #[serde(default)]
    pub served_model_name: Option<String>,

    #[serde(default)]
    pub tensor_parallel_size: Option<u32>,

    #[serde(default)]
    pub max_model_len: Option<u32>,

    /// Fraction of GPU memory the engine may claim (0, 1]
    #[serde(default)]
    pub gpu_memory_utilization: Option<f32>,

    /// Appended verbatim after the generated arguments
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Recipe {
    /// Minimal recipe, mostly useful in tests
    pub fn new(id: impl Into<String>, model_path: impl Into<String>, backend: Backend) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: RecipeId::new(id),
            model_path: model_path.into(),
            backend,
            port: None,
            served_model_name: None,
            tensor_parallel_size: None,
            max_model_len: None,
            gpu_memory_utilization: None,
            extra_args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn served_model_name(&self) -> &str {
        self.served_model_name
            .as_deref()
            .unwrap_or_else(|| self.id.as_str())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.backend.default_port())
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(Error::recipe("recipe id cannot be empty"));
        }
        if self.model_path.trim().is_empty() {
            return Err(Error::recipe(format!("recipe {} has no model_path", self.id)));
        }
        if let Some(util) = self.gpu_memory_utilization {
            if !(util > 0.0 && util <= 1.0) {
                return Err(Error::recipe(format!(
                    "recipe {} gpu_memory_utilization must be in (0, 1]",
                    self.id
                )));
            }
        }
        if self.tensor_parallel_size == Some(0) {
            return Err(Error::recipe(format!(
                "recipe {} tensor_parallel_size must be > 0",
                self.id
            )));
        }
        Ok(())
    }
}

fn index(recipes: Vec<Recipe>) -> Result<BTreeMap<RecipeId, Recipe>> {
    let mut map = BTreeMap::new();
    for recipe in recipes {
        recipe.validate()?;
        if map.contains_key(&recipe.id) {
            return Err(Error::recipe(format!("duplicate recipe id: {}", recipe.id)));
        }
        map.insert(recipe.id.clone(), recipe);
    }
    Ok(map)
}

/// Recipes held in memory
#[derive(Debug, Default)]
pub struct InMemoryRecipeStore {
    recipes: RwLock<BTreeMap<RecipeId, Recipe>>,
}

impl InMemoryRecipeStore {
    pub fn new(recipes: Vec<Recipe>) -> Result<Self> {
        Ok(Self {
            recipes: RwLock::new(index(recipes)?),
        })
    }

    /// Insert or replace a recipe
    pub fn insert(&self, recipe: Recipe) -> Result<()> {
        recipe.validate()?;
        let mut recipes = self
            .recipes
            .write()
            .map_err(|_| Error::internal("recipe store lock poisoned"))?;
        recipes.insert(recipe.id.clone(), recipe);
        Ok(())
    }

    fn replace(&self, map: BTreeMap<RecipeId, Recipe>) -> Result<()> {
        let mut recipes = self
            .recipes
            .write()
            .map_err(|_| Error::internal("recipe store lock poisoned"))?;
        *recipes = map;
        Ok(())
    }
}

#[async_trait]
impl RecipeStore for InMemoryRecipeStore {
    async fn get(&self, id: &RecipeId) -> Result<Recipe> {
        let recipes = self
            .recipes
            .read()
            .map_err(|_| Error::internal("recipe store lock poisoned"))?;
        recipes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("recipe {}", id)))
    }

    async fn list(&self) -> Result<Vec<Recipe>> {
        let recipes = self
            .recipes
            .read()
            .map_err(|_| Error::internal("recipe store lock poisoned"))?;
        Ok(recipes.values().cloned().collect())
    }
}

/// Recipes read from a YAML list on disk
///
/// The file is read once at construction; call [`YamlRecipeStore::reload`]
/// to pick up edits. A failed reload keeps the previous set.
#[derive(Debug)]
pub struct YamlRecipeStore {
    path: PathBuf,
    inner: InMemoryRecipeStore,
}

impl YamlRecipeStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let recipes = Self::read(&path)?;
        info!("Loaded {} recipes from {}", recipes.len(), path.display());
        Ok(Self {
            inner: InMemoryRecipeStore::new(recipes)?,
            path,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Re-read the file, returning the number of recipes now loaded
    pub fn reload(&self) -> Result<usize> {
        let recipes = Self::read(&self.path)?;
        let map = index(recipes)?;
        let count = map.len();
        self.inner.replace(map)?;
        debug!("Reloaded {} recipes from {}", count, self.path.display());
        Ok(count)
    }

    fn read(path: &std::path::Path) -> Result<Vec<Recipe>> {
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_yaml::from_str(&content)?)
    }
}

#[async_trait]
impl RecipeStore for YamlRecipeStore {
    async fn get(&self, id: &RecipeId) -> Result<Recipe> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<Recipe>> {
        self.inner.list().await
    }
}
