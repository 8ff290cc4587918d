/// Extract Module
///
/// Obtains the bundle for a height on behalf of the importer: the prefetch
/// buffer first, then a direct fetch from the node. The direct fetch never
/// writes into the buffer.
use std::sync::Arc;

use crate::error::NodeError;
use crate::etl::prefetch::PrefetchCache;
use crate::models::Bundle;
use crate::rpc::{FetchOutcome, NodeClient};

/// Where an extracted bundle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleSource {
    Cache,
    Node,
}

#[derive(Debug, Clone)]
pub struct ExtractedBundle {
    pub bundle: Arc<Bundle>,
    pub source: BundleSource,
}

/// Get the bundle for `height`, from the buffer if present, else from the node
pub async fn extract_bundle<C: NodeClient + ?Sized>(
    cache: &PrefetchCache,
    client: &C,
    height: u64,
) -> Result<ExtractedBundle, NodeError> {
    if let Some(bundle) = cache.request(height) {
        tracing::debug!("Block {} served from the prefetch buffer", height);
        return Ok(ExtractedBundle { bundle, source: BundleSource::Cache });
    }

    match client.fetch_bundle(height).await {
        FetchOutcome::Found(bundle) => Ok(ExtractedBundle { bundle: Arc::new(bundle), source: BundleSource::Node }),
        FetchOutcome::RetryLater(e) | FetchOutcome::Failed(e) => Err(e),
    }
}
