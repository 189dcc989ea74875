use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::model::HostState;

use super::{Engine, EngineError};

/// Write locks on a set of hosts, always taken in ascending host id order so
/// that overlapping transactions cannot deadlock.
pub(super) struct LockSet {
    guards: BTreeMap<Ulid, OwnedRwLockWriteGuard<HostState>>,
}

impl LockSet {
    pub(super) async fn acquire(
        engine: &Engine,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> Result<Self, EngineError> {
        let ids: BTreeSet<Ulid> = ids.into_iter().collect();
        let mut states = Vec::with_capacity(ids.len());
        for id in ids {
            let hs = engine
                .get_host(&id)
                .ok_or(EngineError::HostOrTemplateNotFound(id))?;
            states.push((id, hs));
        }

        let mut guards = BTreeMap::new();
        for (id, hs) in states {
            guards.insert(id, hs.write_owned().await);
        }
        Ok(Self { guards })
    }

    /// Non-blocking variant for replay, where the engine is the only owner.
    pub(super) fn try_acquire(engine: &Engine, ids: impl IntoIterator<Item = Ulid>) -> Option<Self> {
        let ids: BTreeSet<Ulid> = ids.into_iter().collect();
        let mut guards = BTreeMap::new();
        for id in ids {
            let hs = engine.get_host(&id)?;
            guards.insert(id, hs.try_write_owned().ok()?);
        }
        Some(Self { guards })
    }

    pub(super) fn get(&self, id: &Ulid) -> Option<&HostState> {
        self.guards.get(id).map(|g| &**g)
    }

    pub(super) fn get_mut(&mut self, id: &Ulid) -> Option<&mut HostState> {
        self.guards.get_mut(id).map(|g| &mut **g)
    }

    pub(super) fn holds_all(&self, ids: &[Ulid]) -> bool {
        ids.iter().all(|id| self.guards.contains_key(id))
    }
}
