//! [`MetaStore`] implementation wrapping Fjall keyspaces.

use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use reef_types::events::CollectReason;
use reef_types::{
    ContainerId, ContainerRecord, Epoch, NodeId, NodeRecord, ObjectAddress, ObjectHeader,
    ObjectId,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::debug;

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// Key of the persisted epoch in the `state` keyspace.
const EPOCH_KEY: &[u8] = b"epoch";

/// A durable note that an object is due for collection.
///
/// Written before any data is removed, so an interrupted collection is
/// finished by the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcMark {
    /// Why the object is being collected.
    pub reason: CollectReason,
    /// Epoch at which the mark was written.
    pub marked_epoch: Epoch,
}

/// Metadata store backed by Fjall.
pub struct MetaStore {
    /// The underlying Fjall database handle.
    #[allow(dead_code)]
    db: Database,
    /// ContainerId → ContainerRecord.
    containers: Keyspace,
    /// container ‖ object → ObjectHeader.
    objects: Keyspace,
    /// container ‖ object → Vec<NodeId>.
    replicas: Keyspace,
    /// NodeId → NodeRecord.
    members: Keyspace,
    /// container ‖ object → GcMark.
    gc_marks: Keyspace,
    /// Named scalars.
    state: Keyspace,
    /// Backing directory of a temporary store, removed on drop.
    _tmp: Option<TempDir>,
}

impl MetaStore {
    /// Open a persistent MetaStore at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db, None)
    }

    /// Open a temporary MetaStore that is cleaned up on drop.
    ///
    /// Useful for tests and for nodes started with in-memory storage.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db, Some(tmp))
    }

    fn init_keyspaces(db: Database, tmp: Option<TempDir>) -> Result<Self> {
        let containers = db.keyspace("containers", KeyspaceCreateOptions::default)?;
        let objects = db.keyspace("objects", KeyspaceCreateOptions::default)?;
        let replicas = db.keyspace("replicas", KeyspaceCreateOptions::default)?;
        let members = db.keyspace("members", KeyspaceCreateOptions::default)?;
        let gc_marks = db.keyspace("gc_marks", KeyspaceCreateOptions::default)?;
        let state = db.keyspace("state", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            containers,
            objects,
            replicas,
            members,
            gc_marks,
            state,
            _tmp: tmp,
        })
    }

    // ----- Containers -----

    /// Store a container record, replacing whatever was there.
    ///
    /// Callers merge first; this is a plain write.
    pub fn put_container(&self, record: &ContainerRecord) -> Result<()> {
        let value = postcard::to_allocvec(record)?;
        self.containers
            .insert(record.id().as_bytes(), value.as_slice())?;
        debug!(
            container_id = %record.id(),
            tombstone = record.is_tombstone(),
            "stored container record"
        );
        Ok(())
    }

    /// Retrieve a container record, live or tombstone.
    pub fn get_container(&self, id: &ContainerId) -> Result<Option<ContainerRecord>> {
        match self.containers.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List every container record, tombstones included, in id order.
    pub fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let mut records = Vec::new();
        for guard in self.containers.iter() {
            let v = guard.value()?;
            records.push(postcard::from_bytes(&v)?);
        }
        Ok(records)
    }

    // ----- Object headers -----

    /// Store the header of a locally held object.
    pub fn put_object(&self, header: &ObjectHeader) -> Result<()> {
        let value = postcard::to_allocvec(header)?;
        self.objects
            .insert(address_key(&header.address()).as_slice(), value.as_slice())?;
        debug!(address = %header.address(), "stored object header");
        Ok(())
    }

    /// Retrieve the header of a locally held object.
    pub fn get_object(&self, addr: &ObjectAddress) -> Result<Option<ObjectHeader>> {
        match self.objects.get(address_key(addr).as_slice())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List the headers of every locally held object.
    pub fn list_objects(&self) -> Result<Vec<ObjectHeader>> {
        let mut headers = Vec::new();
        for guard in self.objects.iter() {
            let v = guard.value()?;
            headers.push(postcard::from_bytes(&v)?);
        }
        Ok(headers)
    }

    /// List the headers of locally held objects of one container.
    pub fn list_objects_in(&self, container_id: &ContainerId) -> Result<Vec<ObjectHeader>> {
        let mut headers = Vec::new();
        for guard in self.objects.prefix(container_id.as_bytes()) {
            let v = guard.value()?;
            headers.push(postcard::from_bytes(&v)?);
        }
        Ok(headers)
    }

    /// Remove an object header.
    pub fn remove_object(&self, addr: &ObjectAddress) -> Result<()> {
        self.objects.remove(address_key(addr).as_slice())?;
        debug!(address = %addr, "removed object header");
        Ok(())
    }

    // ----- Replica locations -----

    /// Record the nodes last known to hold a replica of `addr`.
    pub fn put_replicas(&self, addr: &ObjectAddress, holders: &[NodeId]) -> Result<()> {
        let value = postcard::to_allocvec(holders)?;
        self.replicas.insert(address_key(addr).as_slice(), value.as_slice())?;
        Ok(())
    }

    /// Retrieve the recorded holders of `addr`.
    pub fn get_replicas(&self, addr: &ObjectAddress) -> Result<Option<Vec<NodeId>>> {
        match self.replicas.get(address_key(addr).as_slice())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Add one holder to the recorded set of `addr`.
    pub fn add_replica(&self, addr: &ObjectAddress, node_id: NodeId) -> Result<()> {
        let mut holders = self.get_replicas(addr)?.unwrap_or_default();
        if !holders.contains(&node_id) {
            holders.push(node_id);
            self.put_replicas(addr, &holders)?;
        }
        Ok(())
    }

    /// Forget the recorded holders of `addr`.
    pub fn remove_replicas(&self, addr: &ObjectAddress) -> Result<()> {
        self.replicas.remove(address_key(addr).as_slice())?;
        Ok(())
    }

    // ----- Members -----

    /// Store or update a cluster member.
    pub fn put_member(&self, record: &NodeRecord) -> Result<()> {
        let value = postcard::to_allocvec(record)?;
        self.members
            .insert(record.node_id.as_bytes(), value.as_slice())?;
        debug!(node_id = %record.node_id, state = ?record.state, "stored member");
        Ok(())
    }

    /// Retrieve a member by [`NodeId`].
    pub fn get_member(&self, id: &NodeId) -> Result<Option<NodeRecord>> {
        match self.members.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all known members.
    pub fn list_members(&self) -> Result<Vec<NodeRecord>> {
        let mut members = Vec::new();
        for guard in self.members.iter() {
            let v = guard.value()?;
            members.push(postcard::from_bytes(&v)?);
        }
        Ok(members)
    }

    /// Remove a member.
    pub fn remove_member(&self, id: &NodeId) -> Result<()> {
        self.members.remove(id.as_bytes())?;
        debug!(node_id = %id, "removed member");
        Ok(())
    }

    // ----- GC marks -----

    /// Durably mark `addr` for collection.
    pub fn put_gc_mark(&self, addr: &ObjectAddress, mark: GcMark) -> Result<()> {
        let value = postcard::to_allocvec(&mark)?;
        self.gc_marks.insert(address_key(addr).as_slice(), value.as_slice())?;
        debug!(address = %addr, reason = ?mark.reason, "wrote gc mark");
        Ok(())
    }

    /// List all pending marks in address order.
    pub fn list_gc_marks(&self) -> Result<Vec<(ObjectAddress, GcMark)>> {
        let mut marks = Vec::new();
        for guard in self.gc_marks.iter() {
            let (k, v) = guard.into_inner()?;
            let addr = parse_address_key("gc_marks", &k)?;
            marks.push((addr, postcard::from_bytes(&v)?));
        }
        Ok(marks)
    }

    /// Clear the mark of `addr` once collection finished.
    pub fn remove_gc_mark(&self, addr: &ObjectAddress) -> Result<()> {
        self.gc_marks.remove(address_key(addr).as_slice())?;
        Ok(())
    }

    // ----- Node state -----

    /// Persist the current epoch.
    pub fn put_epoch(&self, epoch: Epoch) -> Result<()> {
        self.state.insert(EPOCH_KEY, &epoch.to_be_bytes()[..])?;
        Ok(())
    }

    /// Load the persisted epoch, 0 when none was stored.
    pub fn get_epoch(&self) -> Result<Epoch> {
        match self.state.get(EPOCH_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes[..].try_into().map_err(|_| MetaError::Malformed {
                    keyspace: "state",
                    len: bytes.len(),
                })?;
                Ok(Epoch::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }
}

/// Build the key for address-indexed keyspaces: `container_id ‖ object_id`.
///
/// The container id comes first so one container's objects share a prefix.
fn address_key(addr: &ObjectAddress) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(addr.container_id.as_bytes());
    key.extend_from_slice(addr.object_id.as_bytes());
    key
}

fn parse_address_key(keyspace: &'static str, key: &[u8]) -> Result<ObjectAddress> {
    if key.len() != 64 {
        return Err(MetaError::Malformed {
            keyspace,
            len: key.len(),
        });
    }
    let mut cid = [0u8; 32];
    let mut oid = [0u8; 32];
    cid.copy_from_slice(&key[..32]);
    oid.copy_from_slice(&key[32..]);
    Ok(ObjectAddress::new(ContainerId::from(cid), ObjectId::from(oid)))
}
