use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::engine::{
    BuildOutput, ContainerEngine, ContainerSpec, ContainerStats, EngineContainerState,
    EngineGateway, ImageSource, Mount,
};
use crate::error::{CoreResult, Error, LifecycleError, LifecycleResult};
use crate::policy::{EffectiveLimits, ResourcePolicy, UserAccount};
use crate::ports::PortAllocator;
use crate::records::{
    ContainerKind, ContainerRecord, ContainerStatus, PortBinding, RecordStore,
};
use crate::schema::SchemaManager;
use crate::workspace::{WorkspaceAllocator, DATA_SUBDIR, JUPYTER_SUBDIR, MODELS_SUBDIR};

const ACCESS_TOKEN_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub kind: ContainerKind,
    pub image: ImageSource,
    /// Explicit GPU request. The `ai-serving` kind implies one regardless.
    pub gpu: bool,
    /// Deadline for the image pull/build; the configured default applies
    /// when unset.
    pub image_timeout: Option<Duration>,
}

impl CreateRequest {
    fn wants_gpu(&self) -> bool {
        self.gpu || self.kind == ContainerKind::AiServing
    }
}

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub record: ContainerRecord,
    /// Ready-to-use URL for Jupyter sessions (host, allocated port, access
    /// token). Present only for the `jupyter` kind.
    pub access_url: Option<String>,
    pub build_logs: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsReport {
    pub stats: ContainerStats,
    pub recorded_status: ContainerStatus,
}

/// The orchestration core. Owns the state machine per (user, kind): every
/// state-changing operation on a pair is mutually exclusive, operations
/// across different pairs run in parallel.
pub struct LifecycleManager<E: ContainerEngine + 'static> {
    config: Config,
    policy: ResourcePolicy,
    workspaces: Arc<WorkspaceAllocator>,
    ports: Arc<PortAllocator>,
    gateway: Arc<EngineGateway<E>>,
    records: Arc<RecordStore>,
    op_locks: DashMap<(i64, ContainerKind), Arc<Mutex<()>>>,
    pool: SqlitePool,
}

impl<E: ContainerEngine + 'static> LifecycleManager<E> {
    pub async fn new(config: Config, engine: E) -> CoreResult<Self> {
        let connection = ConnectionManager::from_config(&config).await?;
        let pool = connection.pool().clone();
        Self::with_pool(config, pool, engine).await
    }

    /// Build on an existing pool (embedders sharing one database).
    pub async fn with_pool(config: Config, pool: SqlitePool, engine: E) -> CoreResult<Self> {
        SchemaManager::new(pool.clone()).initialize_schema().await?;

        let gateway = Arc::new(EngineGateway::connect(engine).await);
        let workspaces = Arc::new(WorkspaceAllocator::new(config.workspace_root.clone()));
        let ports = Arc::new(PortAllocator::new(
            pool.clone(),
            config.port_range_start,
            config.port_range_end,
        ));
        let records = Arc::new(RecordStore::new(pool.clone()));
        let policy = ResourcePolicy::new(config.defaults.clone());

        Ok(Self {
            config,
            policy,
            workspaces,
            ports,
            gateway,
            records,
            op_locks: DashMap::new(),
            pool,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn gateway(&self) -> &EngineGateway<E> {
        &self.gateway
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    fn op_lock(&self, user_id: i64, kind: ContainerKind) -> Arc<Mutex<()>> {
        self.op_locks
            .entry((user_id, kind))
            .or_default()
            .value()
            .clone()
    }

    /// Provision a container for (user, kind): resolve effective limits,
    /// ensure the workspace, allocate a port, pull or build the image,
    /// create the engine container, persist the record as `created`.
    ///
    /// Any step failure rolls the record to `error` and releases the port;
    /// the workspace is kept, partial workspaces are harmless on retry.
    /// The engine-facing work runs on a detached task so caller
    /// cancellation cannot abandon a half-made container: the in-flight
    /// engine call completes, then the normal rollback runs.
    pub async fn create(
        &self,
        user: &UserAccount,
        request: CreateRequest,
    ) -> LifecycleResult<CreateOutcome> {
        let kind = request.kind;
        let fail = |step, source| LifecycleError::new(user.id, kind, step, source);

        validate_request(&request).map_err(|e| fail("validate", e))?;
        if request.wants_gpu() && !user.gpu_access {
            return Err(fail(
                "validate",
                Error::Validation {
                    message: format!(
                        "user {} has no GPU entitlement but kind '{}' requires one",
                        user.id, kind
                    ),
                },
            ));
        }

        let lock = self.op_lock(user.id, kind);
        let held = lock.try_lock_owned().map_err(|_| fail("lock", Error::Busy))?;

        let existing = self
            .records
            .find(user.id, kind)
            .await
            .map_err(|e| fail("lookup", e))?;
        if let Some(ref record) = existing {
            if record.status.is_in_flight() {
                return Err(fail(
                    "create",
                    Error::AlreadyExists {
                        status: record.status,
                    },
                ));
            }
        }

        let held_count = self
            .records
            .count_for_user(user.id)
            .await
            .map_err(|e| fail("quota", e))?;
        // Replacing a dead record in this slot does not count against the cap
        let effective_count = if existing.is_some() {
            held_count - 1
        } else {
            held_count
        };
        if effective_count >= self.config.max_containers_per_user {
            return Err(fail(
                "quota",
                Error::QuotaExceeded {
                    current: held_count,
                    max: self.config.max_containers_per_user,
                },
            ));
        }

        self.records
            .upsert(
                user.id,
                kind,
                None,
                &request.image.label(),
                ContainerStatus::Pending,
                &[],
            )
            .await
            .map_err(|e| fail("persist", e))?;

        let limits = self.policy.effective_limits(user);
        let timeout = request
            .image_timeout
            .unwrap_or(Duration::from_secs(self.config.image_timeout_secs));

        let task = {
            let workspaces = self.workspaces.clone();
            let ports = self.ports.clone();
            let gateway = self.gateway.clone();
            let records = self.records.clone();
            let user = user.clone();
            let advertised_host = self.config.advertised_host.clone();

            tokio::spawn(async move {
                let result = provision(
                    &workspaces,
                    &ports,
                    &gateway,
                    &records,
                    &user,
                    &request,
                    limits,
                    timeout,
                    &advertised_host,
                )
                .await;

                if let Err((step, ref source)) = result {
                    tracing::warn!(
                        user_id = user.id,
                        kind = %kind,
                        step,
                        "Container creation failed, rolling back: {}",
                        source
                    );
                    if let Err(e) = ports.release(user.id, kind).await {
                        tracing::warn!(user_id = user.id, kind = %kind, "Port rollback failed: {}", e);
                    }
                    if let Err(e) = records.set_status(user.id, kind, ContainerStatus::Error).await {
                        tracing::warn!(user_id = user.id, kind = %kind, "Record rollback failed: {}", e);
                    }
                }

                drop(held);
                result
            })
        };

        match task.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err((step, source))) => Err(fail(step, source)),
            Err(join_error) => Err(fail(
                "create",
                Error::Runtime {
                    message: format!("creation task aborted: {}", join_error),
                },
            )),
        }
    }

    /// Start the container recorded for (user, kind). Idempotent: starting
    /// a running container succeeds and leaves it running.
    pub async fn start(&self, user: &UserAccount, kind: ContainerKind) -> LifecycleResult<ContainerRecord> {
        let fail = |step, source| LifecycleError::new(user.id, kind, step, source);

        let lock = self.op_lock(user.id, kind);
        let _held = lock.try_lock_owned().map_err(|_| fail("lock", Error::Busy))?;

        let record = self.records.get(user.id, kind).await.map_err(|e| fail("lookup", e))?;
        let runtime_id = recorded_runtime_id(&record).map_err(|e| fail("lookup", e))?;

        match self.gateway.start_container(&runtime_id).await {
            Ok(()) => {
                self.records
                    .set_status(user.id, kind, ContainerStatus::Running)
                    .await
                    .map_err(|e| fail("persist", e))?;
                self.records.get(user.id, kind).await.map_err(|e| fail("lookup", e))
            }
            Err(Error::NotFound { .. }) => {
                self.records
                    .mark_drift(user.id, kind)
                    .await
                    .map_err(|e| fail("persist", e))?;
                Err(fail("engine-start", Error::Drift { runtime_id }).with_status(record.status))
            }
            Err(e) => Err(fail("engine-start", e).with_status(record.status)),
        }
    }

    /// Stop the container recorded for (user, kind). Idempotent.
    pub async fn stop(&self, user: &UserAccount, kind: ContainerKind) -> LifecycleResult<ContainerRecord> {
        let fail = |step, source| LifecycleError::new(user.id, kind, step, source);

        let lock = self.op_lock(user.id, kind);
        let _held = lock.try_lock_owned().map_err(|_| fail("lock", Error::Busy))?;

        let record = self.records.get(user.id, kind).await.map_err(|e| fail("lookup", e))?;
        let runtime_id = recorded_runtime_id(&record).map_err(|e| fail("lookup", e))?;

        let grace = Duration::from_secs(self.config.stop_grace_secs);
        match self.gateway.stop_container(&runtime_id, grace).await {
            Ok(()) => {
                self.records
                    .set_status(user.id, kind, ContainerStatus::Stopped)
                    .await
                    .map_err(|e| fail("persist", e))?;
                self.records.get(user.id, kind).await.map_err(|e| fail("lookup", e))
            }
            Err(Error::NotFound { .. }) => {
                self.records
                    .mark_drift(user.id, kind)
                    .await
                    .map_err(|e| fail("persist", e))?;
                Err(fail("engine-stop", Error::Drift { runtime_id }).with_status(record.status))
            }
            Err(e) => Err(fail("engine-stop", e).with_status(record.status)),
        }
    }

    /// Tear down the container for (user, kind): stop if running, remove
    /// from the engine, release the port, delete the record.
    ///
    /// If engine removal fails the record is retained and the error is
    /// `DeleteIncomplete` so the caller retries; the record must never be
    /// deleted while a live container may still exist under its id.
    pub async fn delete(&self, user: &UserAccount, kind: ContainerKind) -> LifecycleResult<()> {
        let fail = |step, source| LifecycleError::new(user.id, kind, step, source);

        let lock = self.op_lock(user.id, kind);
        let _held = lock.try_lock_owned().map_err(|_| fail("lock", Error::Busy))?;

        let record = self.records.get(user.id, kind).await.map_err(|e| fail("lookup", e))?;

        if let Some(runtime_id) = record.runtime_id.as_deref() {
            if record.status == ContainerStatus::Running {
                let grace = Duration::from_secs(self.config.stop_grace_secs);
                match self.gateway.stop_container(runtime_id, grace).await {
                    Ok(()) | Err(Error::NotFound { .. }) => {}
                    Err(e) => {
                        // Force removal below handles a container that refused to stop
                        tracing::warn!(user_id = user.id, kind = %kind, "Stop before delete failed: {}", e);
                    }
                }
            }

            match self.gateway.remove_container(runtime_id, true).await {
                Ok(()) => {}
                Err(Error::NotFound { .. }) => {
                    tracing::warn!(
                        user_id = user.id,
                        kind = %kind,
                        runtime_id,
                        "Container already gone from engine, deleting record anyway"
                    );
                }
                Err(e) => {
                    return Err(fail(
                        "engine-remove",
                        Error::DeleteIncomplete {
                            message: e.to_string(),
                        },
                    )
                    .with_status(record.status));
                }
            }
        }

        self.ports
            .release(user.id, kind)
            .await
            .map_err(|e| fail("release-port", e))?;
        self.records
            .delete(user.id, kind)
            .await
            .map_err(|e| fail("delete-record", e))?;

        tracing::info!(user_id = user.id, kind = %kind, "Container deleted");
        Ok(())
    }

    /// Fetch live stats for the container. Pure read; gateway failures are
    /// surfaced with the record's last known status attached for context.
    pub async fn stats(&self, user: &UserAccount, kind: ContainerKind) -> LifecycleResult<StatsReport> {
        let fail = |step, source| LifecycleError::new(user.id, kind, step, source);

        let record = self.records.get(user.id, kind).await.map_err(|e| fail("lookup", e))?;
        let runtime_id = recorded_runtime_id(&record)
            .map_err(|e| fail("lookup", e).with_status(record.status))?;

        match self.gateway.stats(&runtime_id).await {
            Ok(stats) => Ok(StatsReport {
                stats,
                recorded_status: record.status,
            }),
            Err(e) => Err(fail("stats", e).with_status(record.status)),
        }
    }

    /// Build an image from a Dockerfile against the user's workspace.
    /// Returns the image reference and the full build log.
    pub async fn build_image(&self, user: &UserAccount, dockerfile: &str) -> CoreResult<BuildOutput> {
        if dockerfile.trim().is_empty() {
            return Err(Error::Validation {
                message: "dockerfile must not be empty".to_string(),
            });
        }

        let user_root = self.workspaces.ensure_workspace(user.id)?;
        let timeout = Duration::from_secs(self.config.image_timeout_secs);
        let resolved = self
            .gateway
            .resolve_image(
                &ImageSource::Dockerfile {
                    contents: dockerfile.to_string(),
                },
                &user_root,
                timeout,
            )
            .await?;

        Ok(BuildOutput {
            image_reference: resolved.reference,
            logs: resolved.build_logs.unwrap_or_default(),
        })
    }

    /// Compare every `running` record against engine reality. Records whose
    /// runtime id the engine no longer knows are flagged as drifted;
    /// records whose container exited outside this system are moved to
    /// `stopped`. Never runs on its own, callers schedule it if they want a
    /// periodic sweep.
    pub async fn sweep_drift(&self) -> CoreResult<Vec<(i64, ContainerKind)>> {
        let running = self.records.list(Some(ContainerStatus::Running)).await?;
        let mut drifted = Vec::new();

        for record in running {
            let Some(runtime_id) = record.runtime_id.as_deref() else {
                continue;
            };

            match self.gateway.inspect_container(runtime_id).await {
                Ok(inspect) if inspect.state == EngineContainerState::Exited => {
                    self.records
                        .set_status(record.user_id, record.kind, ContainerStatus::Stopped)
                        .await?;
                    tracing::info!(
                        user_id = record.user_id,
                        kind = %record.kind,
                        "Container exited outside this system, record moved to stopped"
                    );
                }
                Ok(_) => {}
                Err(Error::NotFound { .. }) => {
                    self.records.mark_drift(record.user_id, record.kind).await?;
                    drifted.push((record.user_id, record.kind));
                }
                Err(Error::EngineUnavailable) => return Err(Error::EngineUnavailable),
                Err(e) => {
                    tracing::warn!(
                        user_id = record.user_id,
                        kind = %record.kind,
                        "Drift check inconclusive: {}",
                        e
                    );
                }
            }
        }

        Ok(drifted)
    }
}

fn validate_request(request: &CreateRequest) -> CoreResult<()> {
    match &request.image {
        ImageSource::Registry { reference } if reference.trim().is_empty() => {
            Err(Error::Validation {
                message: "image reference must not be empty".to_string(),
            })
        }
        ImageSource::Dockerfile { contents } if contents.trim().is_empty() => {
            Err(Error::Validation {
                message: "dockerfile must not be empty".to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn recorded_runtime_id(record: &ContainerRecord) -> CoreResult<String> {
    record.runtime_id.clone().ok_or_else(|| Error::NotFound {
        what: format!(
            "no runtime container recorded for user {} ({}); create it first",
            record.user_id, record.kind
        ),
    })
}

/// Port the service inside the container listens on, by kind.
fn service_port(kind: ContainerKind) -> u16 {
    match kind {
        ContainerKind::Regular => 80,
        ContainerKind::Jupyter => 8888,
        ContainerKind::AiServing => 8000,
    }
}

fn mounts_for(
    kind: ContainerKind,
    workspaces: &WorkspaceAllocator,
    user_id: i64,
) -> Vec<Mount> {
    match kind {
        ContainerKind::Regular => vec![Mount {
            host_path: workspaces.user_root(user_id),
            container_path: "/workspace".to_string(),
            read_only: false,
        }],
        ContainerKind::Jupyter => vec![
            Mount {
                host_path: workspaces.subpath(user_id, JUPYTER_SUBDIR),
                container_path: "/home/jovyan/work".to_string(),
                read_only: false,
            },
            Mount {
                host_path: workspaces.subpath(user_id, MODELS_SUBDIR),
                container_path: "/home/jovyan/models".to_string(),
                read_only: true,
            },
            Mount {
                host_path: workspaces.subpath(user_id, DATA_SUBDIR),
                container_path: "/home/jovyan/data".to_string(),
                read_only: true,
            },
        ],
        ContainerKind::AiServing => vec![
            Mount {
                host_path: workspaces.subpath(user_id, MODELS_SUBDIR),
                container_path: "/models".to_string(),
                read_only: true,
            },
            Mount {
                host_path: workspaces.subpath(user_id, DATA_SUBDIR),
                container_path: "/data".to_string(),
                read_only: true,
            },
        ],
    }
}

fn generate_access_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(ACCESS_TOKEN_LEN)
        .map(char::from)
        .collect()
}

async fn persist_created(
    records: &RecordStore,
    user_id: i64,
    kind: ContainerKind,
    runtime_id: &str,
    image_reference: &str,
    port_bindings: &[PortBinding],
) -> Result<ContainerRecord, (&'static str, Error)> {
    records
        .upsert(
            user_id,
            kind,
            Some(runtime_id),
            image_reference,
            ContainerStatus::Created,
            port_bindings,
        )
        .await
        .map_err(|e| ("persist", e))?;
    records.get(user_id, kind).await.map_err(|e| ("lookup", e))
}

#[allow(clippy::too_many_arguments)]
async fn provision<E: ContainerEngine>(
    workspaces: &WorkspaceAllocator,
    ports: &PortAllocator,
    gateway: &EngineGateway<E>,
    records: &RecordStore,
    user: &UserAccount,
    request: &CreateRequest,
    limits: EffectiveLimits,
    image_timeout: Duration,
    advertised_host: &str,
) -> Result<CreateOutcome, (&'static str, Error)> {
    let kind = request.kind;

    let user_root = workspaces
        .ensure_workspace(user.id)
        .map_err(|e| ("workspace", e))?;

    let host_port = ports
        .allocate(user.id, kind)
        .await
        .map_err(|e| ("allocate-port", e))?;

    records
        .set_status(user.id, kind, ContainerStatus::Building)
        .await
        .map_err(|e| ("persist", e))?;

    let resolved = gateway
        .resolve_image(&request.image, &user_root, image_timeout)
        .await
        .map_err(|e| ("image", e))?;

    let port_bindings = vec![PortBinding {
        container_port: service_port(kind),
        host_port,
    }];

    let mut env = HashMap::new();
    let access_token = if kind == ContainerKind::Jupyter {
        let token = generate_access_token();
        env.insert("JUPYTER_TOKEN".to_string(), token.clone());
        Some(token)
    } else {
        None
    };

    let spec = ContainerSpec {
        name: format!("user_{}_{}", user.id, kind),
        image_reference: resolved.reference.clone(),
        mounts: mounts_for(kind, workspaces, user.id),
        port_bindings: port_bindings.clone(),
        limits,
        gpu: limits.gpu && request.wants_gpu(),
        env,
    };

    let runtime_id = gateway
        .create_container(&spec)
        .await
        .map_err(|e| ("engine-create", e))?;

    let record = match persist_created(
        records,
        user.id,
        kind,
        &runtime_id,
        &resolved.reference,
        &port_bindings,
    )
    .await
    {
        Ok(record) => record,
        Err(err) => {
            // No record points at this container yet; remove it before the
            // rollback frees its port for reuse.
            if let Err(e) = gateway.remove_container(&runtime_id, true).await {
                tracing::warn!(
                    user_id = user.id,
                    kind = %kind,
                    runtime_id = %runtime_id,
                    "Could not remove container after persistence failure: {}",
                    e
                );
            }
            return Err(err);
        }
    };

    let access_url = access_token.map(|token| {
        format!("http://{}:{}/?token={}", advertised_host, host_port, token)
    });

    tracing::info!(
        user_id = user.id,
        kind = %kind,
        runtime_id = %runtime_id,
        host_port,
        "Container created"
    );

    Ok(CreateOutcome {
        record,
        access_url,
        build_logs: resolved.build_logs,
    })
}
