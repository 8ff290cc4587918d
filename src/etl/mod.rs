/// ETL Module
///
/// The stages feeding the importer:
/// - Prefetch: read-ahead buffer of bundles filled in the background
/// - Extract: obtain a height's bundle, from the buffer or straight from the node
/// - Transform: assemble the persisted entity graph from a bundle
/// - Load: write that graph through the storage collaborator in a safe order
pub mod extract;
pub mod load;
pub mod prefetch;
pub mod transform;
