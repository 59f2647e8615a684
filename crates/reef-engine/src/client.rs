//! [`ReefClient`]: a [`ReefEngine`] backed by a remote node.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use reef_net::{ClientRequest, ClientResponse, MAX_PAYLOAD_SIZE, Transport, TransportExt};
use reef_types::{
    BasicAcl, Container, ContainerId, Epoch, NodeId, ObjectAddress, ObjectHeader, ObjectId,
    OwnerId,
};

use crate::engine::ReefEngine;
use crate::error::EngineError;

/// Sends every operation to one node as a client request.
pub struct ReefClient {
    transport: Arc<dyn Transport>,
    node: NodeId,
}

impl ReefClient {
    /// A client for `node`, reached through `transport`.
    pub fn new(transport: Arc<dyn Transport>, node: NodeId) -> Self {
        Self { transport, node }
    }

    /// The node this client talks to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    async fn call(&self, req: ClientRequest) -> Result<ClientResponse, EngineError> {
        match self.transport.client(self.node, req).await? {
            ClientResponse::Error { kind, message } => Err(EngineError::Remote { kind, message }),
            resp => Ok(resp),
        }
    }
}

fn unexpected(resp: ClientResponse) -> EngineError {
    EngineError::InvalidRequest(format!("unexpected response: {resp:?}"))
}

#[async_trait::async_trait]
impl ReefEngine for ReefClient {
    async fn create_container(
        &self,
        owner: OwnerId,
        policy: &str,
        acl: BasicAcl,
        name: Option<String>,
    ) -> Result<ContainerId, EngineError> {
        let req = ClientRequest::CreateContainer {
            owner,
            policy: policy.to_string(),
            acl,
            name,
        };
        match self.call(req).await? {
            ClientResponse::ContainerCreated(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn get_container(&self, id: ContainerId) -> Result<Container, EngineError> {
        match self.call(ClientRequest::GetContainer { id }).await? {
            ClientResponse::Container(container) => Ok(container),
            other => Err(unexpected(other)),
        }
    }

    async fn list_containers(&self, owner: OwnerId) -> Result<Vec<ContainerId>, EngineError> {
        match self.call(ClientRequest::ListContainers { owner }).await? {
            ClientResponse::Containers(ids) => Ok(ids),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_container(
        &self,
        id: ContainerId,
        requester: OwnerId,
    ) -> Result<(), EngineError> {
        match self
            .call(ClientRequest::DeleteContainer { id, requester })
            .await?
        {
            ClientResponse::Deleted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn put_object(
        &self,
        container_id: ContainerId,
        owner: OwnerId,
        payload: Bytes,
        expire_at: Option<Epoch>,
        attributes: BTreeMap<String, String>,
    ) -> Result<ObjectId, EngineError> {
        // Refuse before copying the payload into a frame the node would drop.
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EngineError::InvalidRequest(format!(
                "payload of {} bytes exceeds the limit of {MAX_PAYLOAD_SIZE}",
                payload.len()
            )));
        }
        let req = ClientRequest::PutObject {
            container_id,
            owner,
            payload: payload.to_vec(),
            expire_at,
            attributes,
        };
        match self.call(req).await? {
            ClientResponse::ObjectStored(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn get_object(
        &self,
        address: ObjectAddress,
        requester: OwnerId,
    ) -> Result<(ObjectHeader, Bytes), EngineError> {
        match self
            .call(ClientRequest::GetObject { address, requester })
            .await?
        {
            ClientResponse::Object { header, payload } => Ok((header, Bytes::from(payload))),
            other => Err(unexpected(other)),
        }
    }

    async fn head_object(
        &self,
        address: ObjectAddress,
        requester: OwnerId,
    ) -> Result<ObjectHeader, EngineError> {
        match self
            .call(ClientRequest::HeadObject { address, requester })
            .await?
        {
            ClientResponse::Header(header) => Ok(header),
            other => Err(unexpected(other)),
        }
    }

    async fn tick_epoch(&self) -> Result<Epoch, EngineError> {
        match self.call(ClientRequest::TickEpoch).await? {
            ClientResponse::Epoch(epoch) => Ok(epoch),
            other => Err(unexpected(other)),
        }
    }

    async fn current_epoch(&self) -> Result<Epoch, EngineError> {
        match self.call(ClientRequest::CurrentEpoch).await? {
            ClientResponse::Epoch(epoch) => Ok(epoch),
            other => Err(unexpected(other)),
        }
    }
}
