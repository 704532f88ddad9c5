//! Shared paging driver.
//!
//! A *slab* is the unit of work a compute flavor processes at once: one
//! storage page, or, under parallel paging, one refs-page worth of pages
//! fetched concurrently and merged in ref order.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::debug;

use verdict_store_core::GrantStore;
use verdict_types::{Effect, GrantsPage, SdkError};

/// Fetch one slab of grants for the filtered scan.
///
/// With `parallel_paging` the refs page is enumerated first and every ref
/// is fetched concurrently; the slab's `next_page_ref` is that of the refs
/// page. Requesting parallel paging against a store that does not support
/// it fails [`SdkError::ParallelPaginationNotSupported`] before any fetch.
pub(crate) async fn fetch_slab(
    storage: &Arc<dyn GrantStore>,
    effect: Option<Effect>,
    action: Option<&str>,
    page_ref: Option<&str>,
    grants_page_size: usize,
    parallel_paging: bool,
    refs_page_size: usize,
) -> Result<GrantsPage, SdkError> {
    if !parallel_paging {
        return storage
            .get_grants_page(effect, action, page_ref, grants_page_size)
            .await;
    }

    if !storage.parallel_paging_supported() {
        return Err(SdkError::ParallelPaginationNotSupported);
    }

    let refs = storage
        .get_grant_page_refs_page(effect, action, page_ref, grants_page_size, refs_page_size)
        .await?;
    debug!(refs = refs.page_refs.len(), "fetching grant pages in parallel");

    let fetches = refs.page_refs.iter().map(|r| {
        storage.get_grants_page(effect, action, Some(r.as_str()), grants_page_size)
    });
    let pages = try_join_all(fetches).await?;

    Ok(GrantsPage {
        grants: pages.into_iter().flat_map(|p| p.grants).collect(),
        next_page_ref: refs.next_page_ref,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use verdict_store_memory::MemoryStore;
    use verdict_types::{
        ContextValidation, NewGrant, QueryValidation, ResourceDefinition,
    };

    fn new_grant(name: &str) -> NewGrant {
        NewGrant {
            name: name.into(),
            description: String::new(),
            tags: BTreeMap::new(),
            effect: Effect::Allow,
            actions: vec!["Balloon:Read".into()],
            query: "`true`".into(),
            query_validation: QueryValidation::None,
            equality: true,
            data: json!({}),
            context_schema: json!({"type": "object"}),
            context_validation: ContextValidation::None,
        }
    }

    async fn store_with(n: usize) -> Arc<dyn GrantStore> {
        let store = MemoryStore::new();
        store
            .start(
                &[],
                &[ResourceDefinition {
                    resource_type: "Balloon".into(),
                    actions: vec!["Balloon:Read".into()],
                    schema: json!({"type": "object"}),
                    parent_types: vec![],
                    child_types: vec![],
                }],
            )
            .await
            .unwrap();
        for i in 0..n {
            store.enact(new_grant(&format!("g{i}"))).await.unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn parallel_slab_preserves_scan_order() {
        let storage = store_with(25).await;
        let slab = fetch_slab(
            &storage,
            Some(Effect::Allow),
            Some("Balloon:Read"),
            None,
            10,
            true,
            3,
        )
        .await
        .unwrap();
        assert_eq!(slab.grants.len(), 25);
        assert!(slab.next_page_ref.is_none());
        let names: Vec<&str> = slab.grants.iter().map(|g| g.name.as_str()).collect();
        let expected: Vec<String> = (0..25).map(|i| format!("g{i}")).collect();
        assert_eq!(names, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn parallel_slab_matches_sequential_scan() {
        let storage = store_with(12).await;

        let mut sequential = Vec::new();
        let mut page_ref: Option<String> = None;
        loop {
            let page = fetch_slab(&storage, None, None, page_ref.as_deref(), 5, false, 2)
                .await
                .unwrap();
            sequential.extend(page.grants);
            page_ref = page.next_page_ref;
            if page_ref.is_none() {
                break;
            }
        }

        let mut parallel = Vec::new();
        let mut page_ref: Option<String> = None;
        loop {
            let slab = fetch_slab(&storage, None, None, page_ref.as_deref(), 5, true, 2)
                .await
                .unwrap();
            parallel.extend(slab.grants);
            page_ref = slab.next_page_ref;
            if page_ref.is_none() {
                break;
            }
        }

        assert_eq!(sequential, parallel);
    }
}
