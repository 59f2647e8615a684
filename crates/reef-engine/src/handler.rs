//! Inbound protocol: how a node answers its peers and its clients.

use std::collections::HashMap;

use bytes::Bytes;
use reef_cluster::GossipState;
use reef_net::{
    ClientRequest, ClientResponse, ContainerVersion, GossipDigest, MessageHandler, ReefMessage,
};
use reef_types::events::{EventOrigin, ReplicaReceived};
use reef_types::{ContainerRecord, NodeId, NodeRecord, ObjectHeader};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::node::ReefNode;

/// Most container records sent in answer to one digest. The rest follow in
/// later rounds.
const MAX_RECORDS_PER_EXCHANGE: usize = 1024;

impl ReefNode {
    /// Admit a member learned from a peer and persist it if it was new.
    async fn admit(&self, record: NodeRecord) {
        if self.cluster.add_node(record.clone()).await
            && let Err(e) = self.meta.put_member(&record)
        {
            warn!(%e, node = %record.node_id, "failed to persist member");
        }
    }

    /// Verify and store a replica pushed by `from`.
    ///
    /// Returns `true` if this node did not hold the replica before.
    async fn accept_replica(
        &self,
        from: NodeId,
        container: Option<ContainerRecord>,
        header: ObjectHeader,
        payload: Bytes,
    ) -> Result<bool, EngineError> {
        if let Some(record) = container {
            self.merge_container(record, EventOrigin::Remote(from))?;
        }
        self.live_container(&header.container_id)?;

        let address = header.address();
        if !header.verify_id() {
            return Err(EngineError::DataCorruption {
                address,
                reason: "header does not match the object id".into(),
            });
        }
        if !header.verify_payload(&payload) {
            return Err(EngineError::DataCorruption {
                address,
                reason: "payload hash mismatch".into(),
            });
        }
        if header.is_expired(self.clock.current()) {
            return Err(EngineError::InvalidRequest(format!(
                "object {address} is already expired"
            )));
        }

        let created = self.store_local(&header, payload).await?;
        debug!(%address, %from, created, "replica stored");
        self.events.emit(ReplicaReceived { address, from });
        Ok(created)
    }

    /// Serve a client request, turning failures into an error response.
    async fn serve_client(&self, req: ClientRequest) -> ClientResponse {
        let result = match req {
            ClientRequest::CreateContainer {
                owner,
                policy,
                acl,
                name,
            } => self
                .create_container_with_policy(owner, &policy, acl, name)
                .await
                .map(ClientResponse::ContainerCreated),
            ClientRequest::GetContainer { id } => {
                self.get_container(&id).map(ClientResponse::Container)
            }
            ClientRequest::ListContainers { owner } => {
                self.list_containers(&owner).map(ClientResponse::Containers)
            }
            ClientRequest::DeleteContainer { id, requester } => self
                .delete_container(&id, &requester)
                .await
                .map(|()| ClientResponse::Deleted),
            ClientRequest::PutObject {
                container_id,
                owner,
                payload,
                expire_at,
                attributes,
            } => self
                .put_object(
                    container_id,
                    owner,
                    Bytes::from(payload),
                    expire_at,
                    attributes,
                )
                .await
                .map(ClientResponse::ObjectStored),
            ClientRequest::GetObject { address, requester } => self
                .get_object(address, requester)
                .await
                .map(|(header, payload)| ClientResponse::Object {
                    header,
                    payload: payload.to_vec(),
                }),
            ClientRequest::HeadObject { address, requester } => self
                .head_object(address, requester)
                .await
                .map(ClientResponse::Header),
            ClientRequest::TickEpoch => self.tick_epoch().await.map(ClientResponse::Epoch),
            ClientRequest::CurrentEpoch => Ok(ClientResponse::Epoch(self.current_epoch())),
        };

        result.unwrap_or_else(|e| ClientResponse::Error {
            kind: e.kind(),
            message: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl MessageHandler for ReefNode {
    async fn handle(&self, from: NodeId, msg: ReefMessage) -> Option<ReefMessage> {
        match msg {
            ReefMessage::Ping { epoch } => {
                self.observe_epoch(epoch);
                Some(ReefMessage::Pong {
                    epoch: self.clock.current(),
                })
            }

            ReefMessage::Join { record } => {
                debug!(node = %record.node_id, "join request");
                self.admit(record).await;
                Some(ReefMessage::JoinAck {
                    members: self.cluster.candidates().await,
                    epoch: self.clock.current(),
                })
            }

            ReefMessage::EpochAnnounce { epoch } => {
                self.observe_epoch(epoch);
                None
            }

            ReefMessage::ContainerAnnounce { record } => {
                if let Err(e) = self.merge_container(record, EventOrigin::Remote(from)) {
                    warn!(%from, %e, "failed to merge announced container");
                }
                None
            }

            ReefMessage::SyncRequest { digest } => {
                let records = self.merge(from, digest).await;
                Some(ReefMessage::SyncResponse {
                    digest: GossipDigest {
                        records,
                        ..self.digest().await
                    },
                })
            }

            ReefMessage::PutReplica {
                container,
                header,
                payload,
            } => {
                let object_id = header.object_id;
                let (created, reason) = match self
                    .accept_replica(from, container, header, Bytes::from(payload))
                    .await
                {
                    Ok(created) => (created, None),
                    Err(e) => {
                        warn!(%from, %object_id, %e, "replica refused");
                        (false, Some(e.to_string()))
                    }
                };
                Some(ReefMessage::ReplicaAck {
                    object_id,
                    ok: reason.is_none(),
                    created,
                    reason,
                })
            }

            ReefMessage::DropReplica { address } => {
                let removed = self.discard_local(address).await.unwrap_or_else(|e| {
                    warn!(%from, %address, %e, "failed to drop replica");
                    false
                });
                debug!(%from, %address, removed, "replica drop requested");
                Some(ReefMessage::ReplicaDropped { removed })
            }

            ReefMessage::GetReplica { address } => {
                let replica = match self.read_local(address).await {
                    Ok(replica) => replica,
                    Err(e) => {
                        warn!(%address, %e, "failed to read local replica");
                        None
                    }
                };
                Some(ReefMessage::ReplicaResponse {
                    replica: replica.map(|(header, payload)| (header, payload.to_vec())),
                })
            }

            ReefMessage::HasReplica { address } => {
                let present = matches!(self.read_local(address).await, Ok(Some(_)));
                Some(ReefMessage::ReplicaPresence { present })
            }

            ReefMessage::Client(req) => Some(ReefMessage::ClientReply(self.serve_client(req).await)),

            other => {
                warn!(%from, kind = other.kind(), "unexpected message, ignoring");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl GossipState for ReefNode {
    async fn digest(&self) -> GossipDigest {
        let containers = self.meta.list_containers().unwrap_or_else(|e| {
            warn!(%e, "failed to list containers for gossip");
            Vec::new()
        });
        GossipDigest {
            epoch: self.clock.current(),
            containers: containers.iter().map(ContainerVersion::from).collect(),
            records: Vec::new(),
            members: self.cluster.candidates().await,
        }
    }

    async fn merge(&self, from: NodeId, digest: GossipDigest) -> Vec<ContainerRecord> {
        self.observe_epoch(digest.epoch);
        for member in digest.members {
            self.admit(member).await;
        }
        for record in digest.records {
            if let Err(e) = self.merge_container(record, EventOrigin::Remote(from)) {
                warn!(%from, %e, "failed to merge gossiped container");
            }
        }

        let theirs: HashMap<_, _> = digest
            .containers
            .into_iter()
            .map(|v| (v.id, v.deleted_at))
            .collect();
        let ours = match self.meta.list_containers() {
            Ok(ours) => ours,
            Err(e) => {
                warn!(%e, "failed to list containers for gossip");
                return Vec::new();
            }
        };
        ours.into_iter()
            .filter(|record| match theirs.get(&record.id()) {
                None => true,
                Some(deleted_at) => record.supersedes(*deleted_at),
            })
            .take(MAX_RECORDS_PER_EXCHANGE)
            .collect()
    }
}
