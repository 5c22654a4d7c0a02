// Corral Library Interface
// Container lifecycle core: per-user sandboxed compute environments on top
// of a pluggable container engine.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod images;
pub mod lifecycle;
pub mod models;
pub mod policy;
pub mod ports;
pub mod records;
pub mod schema;
pub mod system;
pub mod workspace;

pub use config::Config;
pub use connection::ConnectionManager;
pub use engine::{
    cpu_percent, BuildOutput, ContainerEngine, ContainerSpec, ContainerStats,
    CumulativeCpuSample, EngineContainerState, EngineGateway, EngineInspect, ImageSource, Mount,
    RawStats, ResolvedImage,
};
pub use error::{CoreResult, Error, LifecycleError, LifecycleResult};
pub use images::{ImageCatalog, ImageEntry, ImageOrigin, NewImage};
pub use lifecycle::{CreateOutcome, CreateRequest, LifecycleManager, StatsReport};
pub use models::{Framework, ModelAsset, ModelAssetStore};
pub use policy::{EffectiveLimits, ResourceDefaults, ResourcePolicy, UserAccount};
pub use ports::PortAllocator;
pub use records::{
    ContainerKind, ContainerRecord, ContainerStatus, PortBinding, RecordCensus, RecordStore,
};
pub use schema::SchemaManager;
pub use system::{host_snapshot, HostSnapshot};
pub use workspace::WorkspaceAllocator;
