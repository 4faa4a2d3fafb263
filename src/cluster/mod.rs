//! Cluster membership view and key ownership.

pub mod selector;

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Advertised address of a cluster member, e.g. `10.0.0.4:11800`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Member(String);

impl Member {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner chosen for a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Local,
    Remote(Member),
}

/// Eventually consistent membership snapshot.
///
/// Readers load the current list without locking; `update` swaps in a new
/// sorted, deduplicated list. The local member is always part of the view.
pub struct ClusterView {
    local: Member,
    members: ArcSwap<Vec<Member>>,
}

impl ClusterView {
    pub fn new(local: Member, members: impl IntoIterator<Item = Member>) -> Self {
        let view = Self {
            members: ArcSwap::from_pointee(Vec::new()),
            local,
        };
        view.update(members);
        view
    }

    /// Single-member view; every key is local.
    pub fn standalone(local: Member) -> Self {
        Self::new(local, std::iter::empty())
    }

    pub fn local(&self) -> &Member {
        &self.local
    }

    /// Replaces the membership snapshot.
    pub fn update(&self, members: impl IntoIterator<Item = Member>) {
        let mut next: Vec<Member> = members.into_iter().collect();
        next.push(self.local.clone());
        next.sort();
        next.dedup();

        tracing::info!(members = next.len(), local = %self.local, "cluster membership updated");
        self.members.store(Arc::new(next));
    }

    pub fn members(&self) -> Arc<Vec<Member>> {
        self.members.load_full()
    }

    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.load().is_empty()
    }

    /// Resolves the owner of `key` under the current snapshot.
    pub fn place(&self, key: &str) -> Placement {
        let members = self.members.load();
        match selector::select(&members, key) {
            Some(owner) if *owner != self.local => Placement::Remote(owner.clone()),
            _ => Placement::Local,
        }
    }
}

impl fmt::Debug for ClusterView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterView")
            .field("local", &self.local)
            .field("members", &*self.members.load())
            .finish()
    }
}
