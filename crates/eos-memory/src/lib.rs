//! In-memory implementation of entity ownership, simulating a whole cluster inside one process.
//!
//! Every [`MemoryEntityOwnershipService`] obtained from the same [`MemoryCluster`] acts as a
//! separate node. Ownership is stable: the first candidate for an entity becomes its owner and
//! keeps it until it withdraws, at which point the oldest remaining candidate is promoted.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use proven_eos::{
    Entity, EntityOwnershipListener, EntityOwnershipService, EntityOwnershipState,
    EntityOwnershipStateChange,
};
use tracing::{debug, trace};

/// Identifies a simulated node within a [`MemoryCluster`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

type Notification = (
    Arc<dyn EntityOwnershipListener>,
    Entity,
    EntityOwnershipStateChange,
    bool,
);

struct ListenerEntry {
    id: u64,
    node: NodeId,
    entity_type: String,
    listener: Arc<dyn EntityOwnershipListener>,
}

#[derive(Default)]
struct EntityRecord {
    // Registration order, used for succession.
    candidates: Vec<NodeId>,
    owner: Option<NodeId>,
}

#[derive(Default)]
struct ClusterState {
    next_node: u64,
    next_listener: u64,
    entities: HashMap<Entity, EntityRecord>,
    listeners: Vec<ListenerEntry>,
    jeopardy: HashSet<NodeId>,
}

impl ClusterState {
    fn in_jeopardy(&self, node: NodeId) -> bool {
        self.jeopardy.contains(&node)
    }

    /// Every listener of the entity's type learns about an owner change.
    fn owner_moved(
        &self,
        entity: &Entity,
        previous: Option<NodeId>,
        current: Option<NodeId>,
    ) -> Vec<Notification> {
        self.listeners
            .iter()
            .filter(|entry| entry.entity_type == entity.entity_type())
            .map(|entry| {
                let change = EntityOwnershipStateChange::from_flags(
                    previous == Some(entry.node),
                    current == Some(entry.node),
                    current.is_some(),
                );
                (
                    Arc::clone(&entry.listener),
                    entity.clone(),
                    change,
                    self.in_jeopardy(entry.node),
                )
            })
            .collect()
    }

    /// Only the listeners on `node` learn who currently owns the entity.
    fn owner_seen_by(
        &self,
        node: NodeId,
        entity: &Entity,
        owner: Option<NodeId>,
    ) -> Vec<Notification> {
        let change =
            EntityOwnershipStateChange::from_flags(false, owner == Some(node), owner.is_some());

        self.listeners
            .iter()
            .filter(|entry| entry.node == node && entry.entity_type == entity.entity_type())
            .map(|entry| {
                (
                    Arc::clone(&entry.listener),
                    entity.clone(),
                    change,
                    self.in_jeopardy(node),
                )
            })
            .collect()
    }
}

#[derive(Default)]
struct ClusterInner {
    // Held while computing and delivering notifications, so deliveries from different threads
    // never interleave. Reentrant because listeners call back into the cluster.
    delivery: ReentrantMutex<()>,
    state: Mutex<ClusterState>,
}

impl ClusterInner {
    fn add_node(&self) -> NodeId {
        let mut state = self.state.lock();
        let node = NodeId(state.next_node);
        state.next_node += 1;
        node
    }

    fn register_candidate(&self, node: NodeId, entity: &Entity) -> Result<(), Error> {
        let _delivery = self.delivery.lock();

        let notifications = {
            let mut state = self.state.lock();
            let (previous, current) = {
                let record = state.entities.entry(entity.clone()).or_default();
                if record.candidates.contains(&node) {
                    return Err(Error::CandidateAlreadyRegistered(entity.clone()));
                }

                record.candidates.push(node);
                let previous = record.owner;
                if previous.is_none() {
                    record.owner = Some(node);
                }
                (previous, record.owner)
            };

            debug!(%node, %entity, owner = ?current, "registered candidate");
            if previous == current {
                state.owner_seen_by(node, entity, current)
            } else {
                state.owner_moved(entity, previous, current)
            }
        };

        deliver(notifications);
        Ok(())
    }

    fn unregister_candidate(&self, node: NodeId, entity: &Entity) {
        let _delivery = self.delivery.lock();

        let notifications = {
            let mut state = self.state.lock();
            let Some(record) = state.entities.get_mut(entity) else {
                return;
            };

            record.candidates.retain(|candidate| *candidate != node);
            let previous = record.owner;
            if previous == Some(node) {
                record.owner = record.candidates.first().copied();
            }
            let current = record.owner;
            if record.candidates.is_empty() {
                state.entities.remove(entity);
            }

            debug!(%node, %entity, owner = ?current, "unregistered candidate");
            if previous == current {
                Vec::new()
            } else {
                state.owner_moved(entity, previous, current)
            }
        };

        deliver(notifications);
    }

    fn register_listener(
        &self,
        node: NodeId,
        entity_type: &str,
        listener: Arc<dyn EntityOwnershipListener>,
    ) -> u64 {
        let _delivery = self.delivery.lock();

        let (id, replay) = {
            let mut state = self.state.lock();
            let id = state.next_listener;
            state.next_listener += 1;
            state.listeners.push(ListenerEntry {
                id,
                node,
                entity_type: entity_type.to_string(),
                listener: Arc::clone(&listener),
            });

            let jeopardy = state.in_jeopardy(node);
            let replay: Vec<Notification> = state
                .entities
                .iter()
                .filter(|(entity, _)| entity.entity_type() == entity_type)
                .filter_map(|(entity, record)| {
                    let owner = record.owner?;
                    let change = EntityOwnershipStateChange::from_flags(false, owner == node, true);
                    Some((Arc::clone(&listener), entity.clone(), change, jeopardy))
                })
                .collect();

            trace!(%node, entity_type, replayed = replay.len(), "registered listener");
            (id, replay)
        };

        deliver(replay);
        id
    }

    fn unregister_listener(&self, id: u64) {
        let mut state = self.state.lock();
        state.listeners.retain(|entry| entry.id != id);
        trace!(id, "unregistered listener");
    }

    fn set_jeopardy(&self, node: NodeId, in_jeopardy: bool) {
        let _delivery = self.delivery.lock();

        let notifications = {
            let mut state = self.state.lock();
            let changed = if in_jeopardy {
                state.jeopardy.insert(node)
            } else {
                state.jeopardy.remove(&node)
            };
            if !changed {
                return;
            }

            debug!(%node, in_jeopardy, "jeopardy changed");
            let mut notifications = Vec::new();
            for entry in state.listeners.iter().filter(|entry| entry.node == node) {
                for (entity, record) in &state.entities {
                    if entity.entity_type() != entry.entity_type {
                        continue;
                    }

                    let owned = record.owner == Some(node);
                    let change = EntityOwnershipStateChange::from_flags(
                        owned,
                        owned,
                        record.owner.is_some(),
                    );
                    notifications.push((
                        Arc::clone(&entry.listener),
                        entity.clone(),
                        change,
                        in_jeopardy,
                    ));
                }
            }
            notifications
        };

        deliver(notifications);
    }

    fn ownership_state(&self, node: NodeId, entity: &Entity) -> Option<EntityOwnershipState> {
        let state = self.state.lock();
        state.entities.get(entity).map(|record| match record.owner {
            Some(owner) if owner == node => EntityOwnershipState::IsOwner,
            Some(_) => EntityOwnershipState::OwnedByOther,
            None => EntityOwnershipState::NoOwner,
        })
    }

    fn is_candidate(&self, node: NodeId, entity: &Entity) -> bool {
        let state = self.state.lock();
        state
            .entities
            .get(entity)
            .is_some_and(|record| record.candidates.contains(&node))
    }

    fn owner(&self, entity: &Entity) -> Option<NodeId> {
        let state = self.state.lock();
        state.entities.get(entity).and_then(|record| record.owner)
    }
}

fn deliver(notifications: Vec<Notification>) {
    for (listener, entity, change, in_jeopardy) in notifications {
        trace!(%entity, %change, in_jeopardy, "delivering ownership change");
        listener.ownership_changed(&entity, change, in_jeopardy);
    }
}

/// A simulated cluster. Nodes created from the same cluster compete for the same entities.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the cluster and returns its ownership service.
    #[must_use]
    pub fn node(&self) -> MemoryEntityOwnershipService {
        MemoryEntityOwnershipService {
            cluster: self.clone(),
            node: self.inner.add_node(),
        }
    }

    /// Puts a node into (or takes it out of) jeopardy. The node's listeners are re-notified of
    /// the current ownership of every entity of their type, with the new jeopardy flag.
    pub fn set_jeopardy(&self, node: NodeId, in_jeopardy: bool) {
        self.inner.set_jeopardy(node, in_jeopardy);
    }

    /// The node currently owning `entity`, if any.
    #[must_use]
    pub fn owner(&self, entity: &Entity) -> Option<NodeId> {
        self.inner.owner(entity)
    }
}

impl Debug for MemoryCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryCluster")
            .field("nodes", &state.next_node)
            .field("entities", &state.entities.len())
            .field("listeners", &state.listeners.len())
            .finish_non_exhaustive()
    }
}

/// One node's view of a [`MemoryCluster`].
#[derive(Clone, Debug)]
pub struct MemoryEntityOwnershipService {
    cluster: MemoryCluster,
    node: NodeId,
}

impl MemoryEntityOwnershipService {
    /// Creates a single-node cluster. Every candidate it registers is granted ownership.
    #[must_use]
    pub fn new() -> Self {
        MemoryCluster::new().node()
    }

    /// The node this service represents.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node
    }

    /// The cluster this node belongs to.
    #[must_use]
    pub const fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }
}

impl Default for MemoryEntityOwnershipService {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityOwnershipService for MemoryEntityOwnershipService {
    type Error = Error;
    type CandidateRegistration = MemoryCandidateRegistration;
    type ListenerRegistration = MemoryListenerRegistration;

    fn register_candidate(&self, entity: &Entity) -> Result<Self::CandidateRegistration, Self::Error> {
        self.cluster.inner.register_candidate(self.node, entity)?;

        Ok(MemoryCandidateRegistration {
            cluster: Arc::clone(&self.cluster.inner),
            node: self.node,
            entity: entity.clone(),
        })
    }

    fn register_listener(
        &self,
        entity_type: &str,
        listener: Arc<dyn EntityOwnershipListener>,
    ) -> Self::ListenerRegistration {
        let id = self
            .cluster
            .inner
            .register_listener(self.node, entity_type, listener);

        MemoryListenerRegistration {
            cluster: Arc::clone(&self.cluster.inner),
            id,
        }
    }

    fn ownership_state(&self, entity: &Entity) -> Option<EntityOwnershipState> {
        self.cluster.inner.ownership_state(self.node, entity)
    }

    fn is_candidate_registered(&self, entity: &Entity) -> bool {
        self.cluster.inner.is_candidate(self.node, entity)
    }
}

/// A live candidacy. Dropping it withdraws the candidate.
pub struct MemoryCandidateRegistration {
    cluster: Arc<ClusterInner>,
    node: NodeId,
    entity: Entity,
}

impl MemoryCandidateRegistration {
    /// The entity this candidacy is for.
    #[must_use]
    pub const fn entity(&self) -> &Entity {
        &self.entity
    }
}

impl Debug for MemoryCandidateRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCandidateRegistration")
            .field("node", &self.node)
            .field("entity", &self.entity)
            .finish()
    }
}

impl Drop for MemoryCandidateRegistration {
    fn drop(&mut self) {
        self.cluster.unregister_candidate(self.node, &self.entity);
    }
}

/// A live listener. Dropping it stops notifications.
pub struct MemoryListenerRegistration {
    cluster: Arc<ClusterInner>,
    id: u64,
}

impl Debug for MemoryListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryListenerRegistration")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for MemoryListenerRegistration {
    fn drop(&mut self) {
        self.cluster.unregister_listener(self.id);
    }
}
