//! Owner-checked taxonomy operations over [`Storage`].
//!
//! Every operation that names an existing taxonomy resolves its owner first:
//! an unknown ID is `NotFound`, someone else's taxonomy is `NotAuthorized`.

use tracing::{info, instrument, warn};

use taxogen_shared::{Forest, Principal, Result, TaxogenError, Taxonomy, TaxonomyId, TaxonomySummary};
use taxogen_storage::Storage;

/// Create an empty taxonomy for `owner`.
#[instrument(skip(storage, description))]
pub async fn create_taxonomy(
    storage: &Storage,
    owner: &Principal,
    domain: &str,
    description: &str,
) -> Result<Taxonomy> {
    let domain = domain.trim();
    if domain.is_empty() {
        return Err(TaxogenError::validation("domain must not be blank"));
    }

    let taxonomy = Taxonomy::new(owner.clone(), domain, description.trim());
    storage.insert_taxonomy(&taxonomy).await?;
    info!(id = %taxonomy.id, "created taxonomy");
    Ok(taxonomy)
}

/// Load a taxonomy the principal owns.
pub async fn get_taxonomy(
    storage: &Storage,
    owner: &Principal,
    id: &TaxonomyId,
) -> Result<Taxonomy> {
    let taxonomy = storage
        .get_taxonomy(id)
        .await?
        .ok_or_else(|| TaxogenError::not_found(id))?;
    if &taxonomy.owner != owner {
        warn!(%id, principal = %owner, "read refused");
        return Err(TaxogenError::not_authorized(id));
    }
    Ok(taxonomy)
}

pub async fn list_taxonomies(storage: &Storage, owner: &Principal) -> Result<Vec<TaxonomySummary>> {
    storage.list_taxonomies(owner).await
}

/// Replace the stored tree with `forest`.
///
/// Used for imports and for recording expansion requests made outside a round.
#[instrument(skip(storage, forest))]
pub async fn save_forest(
    storage: &Storage,
    owner: &Principal,
    id: &TaxonomyId,
    forest: Forest,
) -> Result<Taxonomy> {
    forest.validate()?;
    let mut taxonomy = get_taxonomy(storage, owner, id).await?;
    taxonomy.updated_at = storage.store_forest(id, &forest).await?;
    taxonomy.forest = forest;
    Ok(taxonomy)
}

#[instrument(skip(storage))]
pub async fn delete_taxonomy(storage: &Storage, owner: &Principal, id: &TaxonomyId) -> Result<()> {
    let stored_owner = storage
        .owner_of(id)
        .await?
        .ok_or_else(|| TaxogenError::not_found(id))?;
    if &stored_owner != owner {
        warn!(%id, principal = %owner, "delete refused");
        return Err(TaxogenError::not_authorized(id));
    }

    if !storage.delete_taxonomy(id).await? {
        return Err(TaxogenError::not_found(id));
    }
    info!(%id, "deleted taxonomy");
    Ok(())
}
