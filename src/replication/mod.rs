pub mod client;
pub mod rpc;


use std::sync::Arc;

use tracing::info;

use crate::config::{ReplicationClientConfig, ReplicationMode};
use crate::error::{Result, UmbraError};
use crate::replication::client::{ReplicaInfo, ReplicationClient};
use crate::replication::rpc::ReplicationTransport;
use crate::storage::Storage;

impl Storage {
    /// Registers a replica behind the given transport and immediately runs
    /// the heartbeat handshake. Catch-up, if needed, starts on the client's
    /// worker thread.
    pub fn register_replica(
        &self,
        name: &str,
        mode: ReplicationMode,
        config: ReplicationClientConfig,
        transport: Arc<dyn ReplicationTransport>,
    ) -> Result<()> {
        if self
            .replication_clients
            .read()
            .iter()
            .any(|client| client.name() == name)
        {
            return Err(UmbraError::InvalidArgument(format!(
                "replica {name} is already registered"
            )));
        }
        let client = ReplicationClient::new(name, self.self_weak(), transport, mode, config);
        info!(replica = name, "replica registered");
        self.replication_clients.write().push(client);
        Ok(())
    }

    /// Drops a replica registration. Returns `false` for an unknown name.
    pub fn unregister_replica(&self, name: &str) -> bool {
        let mut clients = self.replication_clients.write();
        let before = clients.len();
        clients.retain(|client| client.name() != name);
        before != clients.len()
    }

    /// Status of every registered replica.
    pub fn replicas_info(&self) -> Vec<ReplicaInfo> {
        self.replication_clients
            .read()
            .iter()
            .map(|client| client.info())
            .collect()
    }
}
