#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-store-memory** – In-memory storage driver for Verdict.
//!
//! A fast, non-persistent [`GrantStore`] suitable for testing, development
//! and single-process deployments. All grants and latches live in process
//! memory and are lost on shutdown.
//!
//! The store keeps three denormalized indexes (by effect, by action, by
//! effect and action) so filtered scans never walk the full grant table.
//! Grants whose action list is empty are additionally recorded under a
//! wildcard bucket of each index; filtered reads combine the
//! specific-action bucket with the wildcard bucket.
//!
//! Handles are cheap to clone and all clones share the same underlying
//! state, which is how compute workers obtain their private store handles.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use verdict_store_core::{GrantStore, StoreResult};
use verdict_types::{
    Effect, Grant, GrantsPage, IdentityDefinition, ModuleLocality, NewGrant, PageRefsPage,
    ResourceDefinition, SdkError, StorageLatch,
};

/// Index key for the action axis. `None` is the wildcard bucket holding
/// grants with an empty action list.
type ActionKey = Option<String>;

#[derive(Debug, Default)]
struct Inner {
    started: bool,
    grants: IndexMap<Uuid, Grant>,
    by_effect: HashMap<Effect, Vec<Grant>>,
    by_action: HashMap<ActionKey, Vec<Grant>>,
    by_both: HashMap<(Effect, ActionKey), Vec<Grant>>,
    latches: HashMap<Uuid, StorageLatch>,
}

impl Inner {
    fn action_keys(grant: &Grant) -> Vec<ActionKey> {
        if grant.actions.is_empty() {
            vec![None]
        } else {
            grant.actions.iter().cloned().map(Some).collect()
        }
    }

    fn insert(&mut self, grant: Grant) {
        self.by_effect
            .entry(grant.effect)
            .or_default()
            .push(grant.clone());
        for key in Self::action_keys(&grant) {
            self.by_action
                .entry(key.clone())
                .or_default()
                .push(grant.clone());
            self.by_both
                .entry((grant.effect, key))
                .or_default()
                .push(grant.clone());
        }
        self.grants.insert(grant.grant_uuid, grant);
    }

    fn remove(&mut self, grant: &Grant) {
        let uuid = grant.grant_uuid;
        if let Some(bucket) = self.by_effect.get_mut(&grant.effect) {
            bucket.retain(|g| g.grant_uuid != uuid);
        }
        for key in Self::action_keys(grant) {
            if let Some(bucket) = self.by_action.get_mut(&key) {
                bucket.retain(|g| g.grant_uuid != uuid);
            }
            if let Some(bucket) = self.by_both.get_mut(&(grant.effect, key)) {
                bucket.retain(|g| g.grant_uuid != uuid);
            }
        }
    }

    /// Snapshot of grants matching the filters, in stable scan order.
    fn filtered(&self, effect: Option<Effect>, action: Option<&str>) -> Vec<&Grant> {
        let empty: &Vec<Grant> = &EMPTY;
        match (effect, action) {
            (Some(e), Some(a)) => self
                .by_both
                .get(&(e, Some(a.to_string())))
                .unwrap_or(empty)
                .iter()
                .chain(self.by_both.get(&(e, None)).unwrap_or(empty).iter())
                .collect(),
            (Some(e), None) => self.by_effect.get(&e).unwrap_or(empty).iter().collect(),
            (None, Some(a)) => self
                .by_action
                .get(&Some(a.to_string()))
                .unwrap_or(empty)
                .iter()
                .chain(self.by_action.get(&None).unwrap_or(empty).iter())
                .collect(),
            (None, None) => self.grants.values().collect(),
        }
    }
}

static EMPTY: Vec<Grant> = Vec::new();

fn parse_page_ref(page_ref: Option<&str>) -> StoreResult<usize> {
    match page_ref {
        None => Ok(0),
        Some(s) => s
            .parse::<usize>()
            .map_err(|_| SdkError::PageReference(s.to_string())),
    }
}

/// An in-memory, non-persistent grant store.
///
/// Cloning yields another handle to the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored grants.
    pub async fn grant_count(&self) -> usize {
        self.inner.read().await.grants.len()
    }

    /// Number of live latches.
    pub async fn latch_count(&self) -> usize {
        self.inner.read().await.latches.len()
    }
}

#[async_trait]
impl GrantStore for MemoryStore {
    async fn start(
        &self,
        _identity_defs: &[IdentityDefinition],
        resource_defs: &[ResourceDefinition],
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.started {
            return Ok(());
        }
        for effect in [Effect::Allow, Effect::Deny] {
            inner.by_effect.entry(effect).or_default();
            inner.by_both.entry((effect, None)).or_default();
        }
        inner.by_action.entry(None).or_default();
        for r_def in resource_defs {
            for action in &r_def.actions {
                inner.by_action.entry(Some(action.clone())).or_default();
                for effect in [Effect::Allow, Effect::Deny] {
                    inner
                        .by_both
                        .entry((effect, Some(action.clone())))
                        .or_default();
                }
            }
        }
        inner.started = true;
        Ok(())
    }

    async fn shutdown(&self) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
        Ok(())
    }

    fn locality(&self) -> ModuleLocality {
        ModuleLocality::Process
    }

    fn parallel_paging_supported(&self) -> bool {
        true
    }

    async fn enact(&self, new_grant: NewGrant) -> StoreResult<Grant> {
        let grant = new_grant.into_grant(Uuid::new_v4());
        let mut inner = self.inner.write().await;
        inner.insert(grant.clone());
        Ok(grant)
    }

    async fn repeal(&self, grant_uuid: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let grant = inner
            .grants
            .shift_remove(&grant_uuid)
            .ok_or(SdkError::GrantNotFound(grant_uuid))?;
        inner.remove(&grant);
        Ok(())
    }

    async fn get_grant(&self, grant_uuid: Uuid) -> StoreResult<Grant> {
        let inner = self.inner.read().await;
        inner
            .grants
            .get(&grant_uuid)
            .cloned()
            .ok_or(SdkError::GrantNotFound(grant_uuid))
    }

    async fn get_grants_page(
        &self,
        effect: Option<Effect>,
        action: Option<&str>,
        page_ref: Option<&str>,
        grants_page_size: usize,
    ) -> StoreResult<GrantsPage> {
        let start = parse_page_ref(page_ref)?;
        let size = grants_page_size.max(1);
        let inner = self.inner.read().await;
        let grants = inner.filtered(effect, action);
        let page: Vec<Grant> = grants
            .iter()
            .skip(start)
            .take(size)
            .map(|g| (*g).clone())
            .collect();
        let next_page_ref = if start + size < grants.len() {
            Some((start + size).to_string())
        } else {
            None
        };
        Ok(GrantsPage {
            grants: page,
            next_page_ref,
        })
    }

    async fn get_grant_page_refs_page(
        &self,
        effect: Option<Effect>,
        action: Option<&str>,
        page_ref: Option<&str>,
        grants_page_size: usize,
        refs_page_size: usize,
    ) -> StoreResult<PageRefsPage> {
        let start = parse_page_ref(page_ref)?;
        let grants_size = grants_page_size.max(1);
        let refs_size = refs_page_size.max(1);
        let inner = self.inner.read().await;
        let total = inner.filtered(effect, action).len();
        let all_refs: Vec<String> = (0..total)
            .step_by(grants_size)
            .map(|offset| offset.to_string())
            .collect();
        let page_refs: Vec<String> = all_refs
            .iter()
            .skip(start)
            .take(refs_size)
            .cloned()
            .collect();
        let next_page_ref = if start + refs_size < all_refs.len() {
            Some((start + refs_size).to_string())
        } else {
            None
        };
        Ok(PageRefsPage {
            page_refs,
            next_page_ref,
        })
    }

    async fn create_latch(&self) -> StoreResult<StorageLatch> {
        let latch = StorageLatch {
            uuid: Uuid::new_v4(),
            set: false,
            created_at: Utc::now(),
        };
        let mut inner = self.inner.write().await;
        inner.latches.insert(latch.uuid, latch.clone());
        Ok(latch)
    }

    async fn get_latch(&self, latch_uuid: Uuid) -> StoreResult<StorageLatch> {
        let inner = self.inner.read().await;
        inner
            .latches
            .get(&latch_uuid)
            .cloned()
            .ok_or(SdkError::LatchNotFound(latch_uuid))
    }

    async fn set_latch(&self, latch_uuid: Uuid) -> StoreResult<StorageLatch> {
        let mut inner = self.inner.write().await;
        let latch = inner
            .latches
            .get_mut(&latch_uuid)
            .ok_or(SdkError::LatchNotFound(latch_uuid))?;
        latch.set = true;
        Ok(latch.clone())
    }

    async fn delete_latch(&self, latch_uuid: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .latches
            .remove(&latch_uuid)
            .map(|_| ())
            .ok_or(SdkError::LatchNotFound(latch_uuid))
    }

    async fn cleanup_latches(&self, before: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.latches.retain(|_, latch| latch.created_at >= before);
        Ok(())
    }
}
