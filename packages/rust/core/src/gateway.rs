//! The persistence contract the expansion engine depends on.

use async_trait::async_trait;

use taxogen_shared::{Principal, Result, Taxonomy, TaxonomyId};
use taxogen_storage::Storage;

/// Loads, authorizes against, and stores taxonomies.
#[async_trait]
pub trait TaxonomyGateway: Send + Sync {
    async fn load_taxonomy(&self, id: &TaxonomyId) -> Result<Option<Taxonomy>>;

    async fn owner_of(&self, id: &TaxonomyId) -> Result<Option<Principal>>;

    /// Durably replace the stored tree of `taxonomy`.
    async fn store_taxonomy(&self, taxonomy: &Taxonomy) -> Result<()>;
}

#[async_trait]
impl TaxonomyGateway for Storage {
    async fn load_taxonomy(&self, id: &TaxonomyId) -> Result<Option<Taxonomy>> {
        self.get_taxonomy(id).await
    }

    async fn owner_of(&self, id: &TaxonomyId) -> Result<Option<Principal>> {
        Storage::owner_of(self, id).await
    }

    async fn store_taxonomy(&self, taxonomy: &Taxonomy) -> Result<()> {
        self.store_forest(&taxonomy.id, &taxonomy.forest).await?;
        Ok(())
    }
}
