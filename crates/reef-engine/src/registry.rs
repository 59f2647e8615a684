//! Container registry.
//!
//! Containers are created and deleted on any node and spread to the others
//! by announcement and gossip. Records merge monotonically: an unknown record
//! is accepted, a tombstone replaces a live record, and a live record never
//! replaces a tombstone. Tombstones are kept so that a late announcement
//! cannot bring a deleted container back.

use std::fmt;

use reef_net::ReefMessage;
use reef_placement::parse_rule;
use reef_types::events::{ContainerChanged, EventOrigin};
use reef_types::{
    BasicAcl, Container, ContainerId, ContainerRecord, OwnerId, PlacementRule,
};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::node::ReefNode;

/// Header line introducing the policy in [`ContainerInfo`] output.
const POLICY_HEADER: &str = "placement policy:";

impl ReefNode {
    /// Create a container and announce it to every reachable peer.
    pub async fn create_container(
        &self,
        owner: OwnerId,
        rule: PlacementRule,
        acl: BasicAcl,
        name: Option<String>,
    ) -> Result<ContainerId, EngineError> {
        if rule.replicas.is_empty() {
            return Err(EngineError::InvalidRequest(
                "placement policy has no REP clause".into(),
            ));
        }

        let container = Container::new(
            owner,
            rule,
            acl,
            name,
            self.clock.current(),
            rand::random(),
        );
        let id = container.id;
        let record = ContainerRecord::live(container);

        self.meta.put_container(&record)?;
        info!(container = %id, %owner, "container created");
        self.events.emit(ContainerChanged {
            container_id: id,
            tombstone: false,
            origin: EventOrigin::Local,
        });
        self.broadcast(ReefMessage::ContainerAnnounce { record }).await;
        Ok(id)
    }

    /// Parse `policy` and create a container with it.
    pub async fn create_container_with_policy(
        &self,
        owner: OwnerId,
        policy: &str,
        acl: BasicAcl,
        name: Option<String>,
    ) -> Result<ContainerId, EngineError> {
        let rule = parse_rule(policy)?;
        self.create_container(owner, rule, acl, name).await
    }

    /// Fetch a live container.
    pub fn get_container(&self, id: &ContainerId) -> Result<Container, EngineError> {
        Ok(self.live_container(id)?.container)
    }

    /// The live record of `id`, or `ContainerNotFound`.
    pub(crate) fn live_container(&self, id: &ContainerId) -> Result<ContainerRecord, EngineError> {
        match self.meta.get_container(id)? {
            Some(record) if !record.is_tombstone() => Ok(record),
            _ => Err(EngineError::ContainerNotFound(*id)),
        }
    }

    /// Live containers of `owner`, sorted by id.
    pub fn list_containers(&self, owner: &OwnerId) -> Result<Vec<ContainerId>, EngineError> {
        let mut ids: Vec<ContainerId> = self
            .meta
            .list_containers()?
            .into_iter()
            .filter(|r| !r.is_tombstone() && r.container.owner == *owner)
            .map(|r| r.id())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Delete a container: write a tombstone at the current epoch and
    /// announce it. Object data is reclaimed by garbage collection once the
    /// epoch has moved past the tombstone.
    pub async fn delete_container(
        &self,
        id: &ContainerId,
        requester: &OwnerId,
    ) -> Result<(), EngineError> {
        let mut record = self.live_container(id)?;
        if !record.container.is_owner(requester) {
            return Err(EngineError::Forbidden(format!(
                "only the owner may delete container {id}"
            )));
        }

        let epoch = self.clock.current();
        record.deleted_at = Some(epoch);
        self.meta.put_container(&record)?;
        info!(container = %id, epoch, "container deleted");
        self.events.emit(ContainerChanged {
            container_id: *id,
            tombstone: true,
            origin: EventOrigin::Local,
        });
        self.broadcast(ReefMessage::ContainerAnnounce { record }).await;
        Ok(())
    }

    /// Merge a record learned from elsewhere. Returns whether the local
    /// record changed.
    pub fn merge_container(
        &self,
        record: ContainerRecord,
        origin: EventOrigin,
    ) -> Result<bool, EngineError> {
        let id = record.id();
        if record.container.compute_id() != id {
            debug!(container = %id, "ignoring container record with a forged id");
            return Ok(false);
        }

        let merged = match self.meta.get_container(&id)? {
            None => record,
            Some(mut known) => {
                if !known.merge(&record) {
                    return Ok(false);
                }
                known
            }
        };

        self.meta.put_container(&merged)?;
        debug!(container = %id, tombstone = merged.is_tombstone(), "container record merged");
        self.events.emit(ContainerChanged {
            container_id: id,
            tombstone: merged.is_tombstone(),
            origin,
        });
        Ok(true)
    }

    /// Describe a live container.
    pub fn container_info(&self, id: &ContainerId) -> Result<ContainerInfo, EngineError> {
        Ok(ContainerInfo {
            container: self.get_container(id)?,
        })
    }
}

/// Human-readable description of a container.
///
/// ```text
/// container ID: 3b1f...
/// owner ID: 9c2e...
/// created: 4
/// basic ACL: 1C8C8CCC (private)
/// Name=photos
/// placement policy:
/// REP 2 IN X
/// CBF 1
/// SELECT 2 FROM * AS X
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// The described container.
    pub container: Container,
}

impl fmt::Display for ContainerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.container;
        writeln!(f, "container ID: {}", c.id)?;
        writeln!(f, "owner ID: {}", c.owner)?;
        writeln!(f, "created: {}", c.created_epoch)?;
        writeln!(f, "basic ACL: {}", c.basic_acl)?;
        if let Some(name) = &c.name {
            writeln!(f, "Name={name}")?;
        }
        writeln!(f, "{POLICY_HEADER}")?;
        write!(f, "{}", c.placement_policy.to_multiline())
    }
}

/// Recover the one-line placement policy from [`ContainerInfo`] output.
///
/// Returns `None` if the text has no policy section.
pub fn placement_policy_from_info(info: &str) -> Option<String> {
    let mut lines = info.lines().map(str::trim);
    lines.find(|line| line.eq_ignore_ascii_case(POLICY_HEADER))?;
    let policy = lines
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!policy.is_empty()).then_some(policy)
}
