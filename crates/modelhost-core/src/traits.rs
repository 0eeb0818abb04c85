//! Core traits for modelhost components
//!
//! Recipe storage lives outside the controller; these traits are the seam the
//! launch path reads it through.

use crate::recipe::Recipe;
use crate::types::RecipeId;
use crate::Result;
use async_trait::async_trait;

/// Read-only access to recipe definitions
#[async_trait]
pub trait RecipeStore: Send + Sync {
    /// Fetch one recipe, `Error::NotFound` when absent
    async fn get(&self, id: &RecipeId) -> Result<Recipe>;

    /// List all recipes ordered by id
    async fn list(&self) -> Result<Vec<Recipe>>;
}
