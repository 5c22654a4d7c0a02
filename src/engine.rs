use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, Error};
use crate::policy::EffectiveLimits;
use crate::records::PortBinding;

/// Bind mount handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything the engine needs to materialize a container. Resource limits
/// are expressed as cores/MB; the engine adapter owns the translation to
/// its native knobs (cpu_period/cpu_quota and friends).
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image_reference: String,
    pub mounts: Vec<Mount>,
    pub port_bindings: Vec<PortBinding>,
    pub limits: EffectiveLimits,
    pub gpu: bool,
    pub env: HashMap<String, String>,
}

/// Where a container image comes from: a registry reference or an inline
/// Dockerfile built against the user's workspace.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Registry { reference: String },
    Dockerfile { contents: String },
}

impl ImageSource {
    /// Label recorded while the image is still being resolved.
    pub fn label(&self) -> String {
        match self {
            ImageSource::Registry { reference } => reference.clone(),
            ImageSource::Dockerfile { .. } => "<dockerfile>".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub image_reference: String,
    /// Full build log. Kept on failure too, inside `Error::Image`.
    pub logs: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub reference: String,
    pub build_logs: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineContainerState {
    Created,
    Running,
    Exited,
}

#[derive(Debug, Clone)]
pub struct EngineInspect {
    pub runtime_id: String,
    pub state: EngineContainerState,
}

/// One cumulative CPU usage reading: container usage and system-wide usage
/// at the same instant, both monotonically increasing counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CumulativeCpuSample {
    pub container_usage: u64,
    pub system_usage: u64,
}

/// One-shot stats sample as reported by the engine: two consecutive
/// cumulative CPU readings plus point-in-time memory and network counters.
#[derive(Debug, Clone, Copy)]
pub struct RawStats {
    pub previous_cpu: CumulativeCpuSample,
    pub current_cpu: CumulativeCpuSample,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// CPU percentage from two cumulative readings. A zero system delta yields
/// 0 rather than a division by zero (stats may be sampled faster than the
/// kernel updates its counters).
pub fn cpu_percent(previous: CumulativeCpuSample, current: CumulativeCpuSample) -> f64 {
    let usage_delta = current.container_usage.saturating_sub(previous.container_usage);
    let system_delta = current.system_usage.saturating_sub(previous.system_usage);

    if system_delta == 0 {
        return 0.0;
    }
    (usage_delta as f64 / system_delta as f64) * 100.0
}

/// Narrow capability interface to the external container engine. Any engine
/// implementing these verbs is substitutable; nothing else in the crate may
/// talk to the engine directly.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Cheap reachability check used by the gateway's reconnection probe.
    async fn ping(&self) -> CoreResult<()>;

    async fn pull_image(&self, reference: &str) -> CoreResult<String>;

    /// Build from a Dockerfile with the given context directory. Failures
    /// must surface as `Error::Image` carrying the build log.
    async fn build_image(&self, dockerfile: &str, context_dir: &Path) -> CoreResult<BuildOutput>;

    async fn create_container(&self, spec: &ContainerSpec) -> CoreResult<String>;

    /// Idempotent: starting an already-running container succeeds.
    async fn start_container(&self, runtime_id: &str) -> CoreResult<()>;

    /// Idempotent: stopping an already-stopped container succeeds.
    async fn stop_container(&self, runtime_id: &str, grace: Duration) -> CoreResult<()>;

    async fn remove_container(&self, runtime_id: &str, force: bool) -> CoreResult<()>;

    async fn inspect_container(&self, runtime_id: &str) -> CoreResult<EngineInspect>;

    /// Undefined for stopped containers; implementations fail with
    /// `Error::Runtime` rather than reporting zeros.
    async fn stats(&self, runtime_id: &str) -> CoreResult<RawStats>;
}

/// The sole boundary to the container engine, carrying an explicit
/// connected/degraded state. When degraded every operation fails fast with
/// `EngineUnavailable` without touching the engine; `probe` re-checks
/// reachability and may exit degraded mode.
pub struct EngineGateway<E> {
    engine: E,
    degraded: AtomicBool,
}

impl<E: ContainerEngine> EngineGateway<E> {
    /// Wrap an engine, probing it once. An unreachable engine leaves the
    /// gateway degraded instead of failing construction.
    pub async fn connect(engine: E) -> Self {
        let degraded = match engine.ping().await {
            Ok(()) => false,
            Err(e) => {
                tracing::warn!("Container engine unreachable, entering degraded mode: {}", e);
                true
            }
        };

        Self {
            engine,
            degraded: AtomicBool::new(degraded),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Re-check engine reachability and update the degraded flag.
    pub async fn probe(&self) -> CoreResult<()> {
        match self.engine.ping().await {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    tracing::info!("Container engine reachable again, leaving degraded mode");
                }
                Ok(())
            }
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn guard(&self) -> CoreResult<()> {
        if self.is_degraded() {
            return Err(Error::EngineUnavailable);
        }
        Ok(())
    }

    /// Resolve an image source to a concrete reference, pulling or building
    /// under the given deadline. A timeout maps to `Error::Image`.
    pub async fn resolve_image(
        &self,
        source: &ImageSource,
        build_context: &Path,
        timeout: Duration,
    ) -> CoreResult<ResolvedImage> {
        self.guard()?;

        match source {
            ImageSource::Registry { reference } => {
                let pulled = tokio::time::timeout(timeout, self.engine.pull_image(reference))
                    .await
                    .map_err(|_| Error::Image {
                        message: format!(
                            "pull of '{}' timed out after {}s",
                            reference,
                            timeout.as_secs()
                        ),
                        build_logs: None,
                    })??;
                Ok(ResolvedImage {
                    reference: pulled,
                    build_logs: None,
                })
            }
            ImageSource::Dockerfile { contents } => {
                let output =
                    tokio::time::timeout(timeout, self.engine.build_image(contents, build_context))
                        .await
                        .map_err(|_| Error::Image {
                            message: format!("image build timed out after {}s", timeout.as_secs()),
                            build_logs: None,
                        })??;
                Ok(ResolvedImage {
                    reference: output.image_reference,
                    build_logs: Some(output.logs),
                })
            }
        }
    }

    pub async fn pull_image(&self, reference: &str) -> CoreResult<String> {
        self.guard()?;
        self.engine.pull_image(reference).await
    }

    pub async fn build_image(
        &self,
        dockerfile: &str,
        context_dir: &Path,
    ) -> CoreResult<BuildOutput> {
        self.guard()?;
        self.engine.build_image(dockerfile, context_dir).await
    }

    pub async fn create_container(&self, spec: &ContainerSpec) -> CoreResult<String> {
        self.guard()?;
        self.engine.create_container(spec).await
    }

    pub async fn start_container(&self, runtime_id: &str) -> CoreResult<()> {
        self.guard()?;
        self.engine.start_container(runtime_id).await
    }

    pub async fn stop_container(&self, runtime_id: &str, grace: Duration) -> CoreResult<()> {
        self.guard()?;
        self.engine.stop_container(runtime_id, grace).await
    }

    pub async fn remove_container(&self, runtime_id: &str, force: bool) -> CoreResult<()> {
        self.guard()?;
        self.engine.remove_container(runtime_id, force).await
    }

    pub async fn inspect_container(&self, runtime_id: &str) -> CoreResult<EngineInspect> {
        self.guard()?;
        self.engine.inspect_container(runtime_id).await
    }

    pub async fn stats(&self, runtime_id: &str) -> CoreResult<ContainerStats> {
        self.guard()?;
        let raw = self.engine.stats(runtime_id).await?;

        Ok(ContainerStats {
            cpu_percent: cpu_percent(raw.previous_cpu, raw.current_cpu),
            memory_bytes: raw.memory_bytes,
            memory_limit_bytes: raw.memory_limit_bytes,
            network_rx_bytes: raw.network_rx_bytes,
            network_tx_bytes: raw.network_tx_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_cpu_percent_matches_delta_ratio() {
        let previous = CumulativeCpuSample {
            container_usage: 1_000_000,
            system_usage: 10_000_000,
        };
        let current = CumulativeCpuSample {
            container_usage: 1_250_000,
            system_usage: 11_000_000,
        };

        let percent = cpu_percent(previous, current);
        // (250000 / 1000000) * 100
        assert!((percent - 25.00).abs() < 0.005);
    }

    #[test]
    fn test_cpu_percent_zero_system_delta_reports_zero() {
        let sample = CumulativeCpuSample {
            container_usage: 500,
            system_usage: 9999,
        };
        let later = CumulativeCpuSample {
            container_usage: 900,
            system_usage: 9999,
        };
        assert_eq!(cpu_percent(sample, later), 0.0);
    }

    #[test]
    fn test_cpu_percent_counter_reset_does_not_underflow() {
        let previous = CumulativeCpuSample {
            container_usage: 1000,
            system_usage: 2000,
        };
        let reset = CumulativeCpuSample {
            container_usage: 10,
            system_usage: 2500,
        };
        assert_eq!(cpu_percent(previous, reset), 0.0);
    }

    /// Engine stub that counts calls and can be flipped unreachable.
    #[derive(Clone, Default)]
    struct ProbeEngine {
        reachable: Arc<AtomicBool>,
        op_calls: Arc<AtomicUsize>,
    }

    impl ProbeEngine {
        fn reachable() -> Self {
            let engine = Self::default();
            engine.reachable.store(true, Ordering::SeqCst);
            engine
        }
    }

    #[async_trait]
    impl ContainerEngine for ProbeEngine {
        async fn ping(&self) -> CoreResult<()> {
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::Runtime {
                    message: "connection refused".to_string(),
                })
            }
        }

        async fn pull_image(&self, reference: &str) -> CoreResult<String> {
            self.op_calls.fetch_add(1, Ordering::SeqCst);
            Ok(reference.to_string())
        }

        async fn build_image(&self, _dockerfile: &str, _context: &Path) -> CoreResult<BuildOutput> {
            self.op_calls.fetch_add(1, Ordering::SeqCst);
            Ok(BuildOutput {
                image_reference: "built:latest".to_string(),
                logs: String::new(),
            })
        }

        async fn create_container(&self, _spec: &ContainerSpec) -> CoreResult<String> {
            self.op_calls.fetch_add(1, Ordering::SeqCst);
            Ok("rt-1".to_string())
        }

        async fn start_container(&self, _runtime_id: &str) -> CoreResult<()> {
            self.op_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_container(&self, _runtime_id: &str, _grace: Duration) -> CoreResult<()> {
            self.op_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove_container(&self, _runtime_id: &str, _force: bool) -> CoreResult<()> {
            self.op_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn inspect_container(&self, runtime_id: &str) -> CoreResult<EngineInspect> {
            self.op_calls.fetch_add(1, Ordering::SeqCst);
            Ok(EngineInspect {
                runtime_id: runtime_id.to_string(),
                state: EngineContainerState::Running,
            })
        }

        async fn stats(&self, _runtime_id: &str) -> CoreResult<RawStats> {
            self.op_calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawStats {
                previous_cpu: CumulativeCpuSample {
                    container_usage: 0,
                    system_usage: 0,
                },
                current_cpu: CumulativeCpuSample {
                    container_usage: 50,
                    system_usage: 100,
                },
                memory_bytes: 1,
                memory_limit_bytes: 2,
                network_rx_bytes: 0,
                network_tx_bytes: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_degraded_gateway_fails_fast_without_engine_calls() {
        let engine = ProbeEngine::default(); // unreachable
        let calls = engine.op_calls.clone();
        let gateway = EngineGateway::connect(engine).await;

        assert!(gateway.is_degraded());
        let result = gateway.pull_image("ubuntu:22.04").await;
        assert!(matches!(result, Err(Error::EngineUnavailable)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_exits_degraded_mode() {
        let engine = ProbeEngine::default();
        let reachable = engine.reachable.clone();
        let gateway = EngineGateway::connect(engine).await;
        assert!(gateway.is_degraded());

        assert!(gateway.probe().await.is_err());
        assert!(gateway.is_degraded());

        reachable.store(true, Ordering::SeqCst);
        gateway.probe().await.unwrap();
        assert!(!gateway.is_degraded());

        gateway.pull_image("ubuntu:22.04").await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_computed_from_raw_sample() {
        let gateway = EngineGateway::connect(ProbeEngine::reachable()).await;
        let stats = gateway.stats("rt-1").await.unwrap();
        assert!((stats.cpu_percent - 50.0).abs() < 0.005);
        assert_eq!(stats.memory_bytes, 1);
    }
}
