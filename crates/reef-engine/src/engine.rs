//! [`ReefEngine`]: the interface exposed to gateways and clients.
//!
//! Adapters (an S3 gateway, the `reefd` CLI) depend on this trait instead of
//! the concrete [`ReefNode`](crate::ReefNode), so they work the same against
//! a node in the same process and against a [`ReefClient`](crate::ReefClient)
//! talking to a remote one.

use std::collections::BTreeMap;

use bytes::Bytes;
use reef_types::{
    BasicAcl, Container, ContainerId, Epoch, ObjectAddress, ObjectHeader, ObjectId, OwnerId,
};

use crate::error::EngineError;
use crate::node::ReefNode;

/// Container and object operations of a Reef node.
#[async_trait::async_trait]
pub trait ReefEngine: Send + Sync {
    /// Create a container with the given placement policy text.
    async fn create_container(
        &self,
        owner: OwnerId,
        policy: &str,
        acl: BasicAcl,
        name: Option<String>,
    ) -> Result<ContainerId, EngineError>;

    /// Fetch a live container.
    async fn get_container(&self, id: ContainerId) -> Result<Container, EngineError>;

    /// List the live containers of `owner`, sorted.
    async fn list_containers(&self, owner: OwnerId) -> Result<Vec<ContainerId>, EngineError>;

    /// Delete a container. Only its owner may do so.
    async fn delete_container(&self, id: ContainerId, requester: OwnerId)
    -> Result<(), EngineError>;

    /// Store an object and return its id once the write quorum is reached.
    async fn put_object(
        &self,
        container_id: ContainerId,
        owner: OwnerId,
        payload: Bytes,
        expire_at: Option<Epoch>,
        attributes: BTreeMap<String, String>,
    ) -> Result<ObjectId, EngineError>;

    /// Read an object's header and payload.
    async fn get_object(
        &self,
        address: ObjectAddress,
        requester: OwnerId,
    ) -> Result<(ObjectHeader, Bytes), EngineError>;

    /// Read an object's header only.
    async fn head_object(
        &self,
        address: ObjectAddress,
        requester: OwnerId,
    ) -> Result<ObjectHeader, EngineError>;

    /// Advance the cluster epoch by one.
    async fn tick_epoch(&self) -> Result<Epoch, EngineError>;

    /// The node's current epoch.
    async fn current_epoch(&self) -> Result<Epoch, EngineError>;
}

#[async_trait::async_trait]
impl ReefEngine for ReefNode {
    async fn create_container(
        &self,
        owner: OwnerId,
        policy: &str,
        acl: BasicAcl,
        name: Option<String>,
    ) -> Result<ContainerId, EngineError> {
        self.create_container_with_policy(owner, policy, acl, name)
            .await
    }

    async fn get_container(
        &self,
        id: ContainerId,
    ) -> Result<Container, EngineError> {
        ReefNode::get_container(self, &id)
    }

    async fn list_containers(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<ContainerId>, EngineError> {
        ReefNode::list_containers(self, &owner)
    }

    async fn delete_container(
        &self,
        id: ContainerId,
        requester: OwnerId,
    ) -> Result<(), EngineError> {
        ReefNode::delete_container(self, &id, &requester).await
    }

    async fn put_object(
        &self,
        container_id: ContainerId,
        owner: OwnerId,
        payload: Bytes,
        expire_at: Option<Epoch>,
        attributes: BTreeMap<String, String>,
    ) -> Result<ObjectId, EngineError> {
        ReefNode::put_object(self, container_id, owner, payload, expire_at, attributes).await
    }

    async fn get_object(
        &self,
        address: ObjectAddress,
        requester: OwnerId,
    ) -> Result<(ObjectHeader, Bytes), EngineError> {
        ReefNode::get_object(self, address, requester).await
    }

    async fn head_object(
        &self,
        address: ObjectAddress,
        requester: OwnerId,
    ) -> Result<ObjectHeader, EngineError> {
        ReefNode::head_object(self, address, requester).await
    }

    async fn tick_epoch(&self) -> Result<Epoch, EngineError> {
        ReefNode::tick_epoch(self).await
    }

    async fn current_epoch(&self) -> Result<Epoch, EngineError> {
        Ok(ReefNode::current_epoch(self))
    }
}
