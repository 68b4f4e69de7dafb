//! Catalog metadata lookup.
//!
//! The agent only reports item ids; titles and artwork come from the
//! catalog service. The host consumes it through [`Catalog`] so the REST
//! client stays outside the control plane.

use async_trait::async_trait;

/// Display metadata for one catalog item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemMetadata {
    pub id: String,
    pub title: Option<String>,
    pub artist_name: Option<String>,
    /// May contain `{w}`/`{h}` size placeholders.
    pub artwork_url: Option<String>,
    pub content_rating: Option<String>,
}

/// Resolves item ids to display metadata.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn fetch_item(&self, id: &str) -> anyhow::Result<ItemMetadata>;
}
