pub mod config;
pub mod durability;
pub mod error;
pub mod replication;
pub mod storage;

pub use crate::config::{
    Config, DurabilityConfig, GcConfig, GcType, ItemsConfig, ReplicationClientConfig,
    ReplicationMode, ReplicationSslConfig,
};
pub use crate::error::{PropertyValueError, Result, UmbraError};
pub use crate::replication::client::{ReplicaInfo, ReplicaState};
pub use crate::replication::rpc::{DeltaStream, ReplicationTransport, RpcError};
pub use crate::storage::property_value::{PropertyValue, TemporalData, TemporalKind};
pub use crate::storage::types::{EdgeTypeId, Gid, LabelId, PropertyId, View};
pub use crate::storage::{Accessor, EdgeAccessor, Storage, VertexAccessor};
