use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
    StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use derive_more::derive::Display;
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;

use crate::models::ProblemId;

pub const LABEL_MANAGED: &str = "ctf-arena.managed";
pub const LABEL_OWNER: &str = "ctf-arena.team";
pub const LABEL_PROBLEM: &str = "ctf-arena.problem";

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[display("Container {_0} does not exist")]
    NotFound(String),
    #[display("Container runtime refused the request: {_0}")]
    Api(String),
    #[display("Container runtime I/O failed: {_0}")]
    Io(String),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            bollard::errors::Error::IOError { err } => RuntimeError::Io(err.to_string()),
            other => RuntimeError::Api(other.to_string()),
        }
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to bring up one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<MountSpec>,
    /// Guest ports, e.g. `22/tcp`; each gets a host port picked by the runtime.
    pub guest_ports: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl LaunchSpec {
    /// A spec labelled so that sweeps can recognise it as ours. `owner` is a team id
    /// in the first mode and a meta team id in the attack-defense round.
    pub fn managed(name: String, image: String, owner: &str, problem_id: ProblemId) -> Self {
        let labels = HashMap::from([
            (LABEL_MANAGED.to_owned(), "true".to_owned()),
            (LABEL_OWNER.to_owned(), owner.to_owned()),
            (LABEL_PROBLEM.to_owned(), problem_id.to_string()),
        ]);
        Self {
            name,
            image,
            env: vec![],
            mounts: vec![],
            guest_ports: vec![],
            labels,
        }
    }

    pub fn with_ports(mut self, guest_ports: &[String]) -> Self {
        self.guest_ports = guest_ports.iter().map(|p| normalize_port(p)).collect();
        self
    }

    pub fn with_mount(mut self, mount: MountSpec) -> Self {
        self.mounts.push(mount);
        self
    }
}

fn normalize_port(port: &str) -> String {
    let port = port.trim();
    if port.contains('/') {
        port.to_owned()
    } else {
        format!("{port}/tcp")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundPort {
    pub guest_port: String,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit: u64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates and starts a detached container. Nothing is left behind on failure.
    async fn create_and_run(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, RuntimeError>;

    /// Fires a command inside the container without waiting for it.
    async fn exec_once(&self, handle_id: &str, argv: &[String]) -> Result<(), RuntimeError>;

    async fn bound_ports(&self, handle_id: &str) -> Result<Vec<BoundPort>, RuntimeError>;

    async fn kill(&self, handle_id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, handle_id: &str) -> Result<(), RuntimeError>;

    async fn get(&self, handle_id: &str) -> Result<RuntimeHandle, RuntimeError>;

    async fn stats(&self, handle_id: &str) -> Result<ResourceStats, RuntimeError>;

    /// Every container carrying the managed label, running or not.
    async fn list_managed(&self) -> Result<Vec<RuntimeHandle>, RuntimeError>;

    async fn close(&self);
}

/// Kills and removes a container, logging instead of failing. Returns whether the
/// container is gone afterwards.
pub async fn best_effort_teardown(runtime: &dyn ContainerRuntime, handle_id: &str) -> bool {
    if let Err(e) = runtime.kill(handle_id).await {
        // Usually already stopped.
        debug!("Kill of {handle_id} failed: {e}");
    }
    match runtime.remove(handle_id).await {
        Ok(()) => {
            info!("Tore down container {handle_id}");
            true
        }
        Err(RuntimeError::NotFound(_)) => {
            debug!("Container {handle_id} was already gone");
            true
        }
        Err(e) => {
            warn!("Could not remove container {handle_id}: {e}");
            false
        }
    }
}

/// Names of managed containers whose creation has begun but whose store row is not
/// committed yet. The reaper leaves these alone.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    /// Registers `name` until the returned claim is dropped. Claim before creating the
    /// container and drop only after its row committed or the launch was undone.
    pub fn claim(&self, name: &str) -> InFlightClaim {
        self.names().insert(name.to_owned());
        InFlightClaim {
            registry: self.clone(),
            name: name.to_owned(),
        }
    }

    pub fn snapshot(&self) -> HashSet<String> {
        self.names().clone()
    }

    fn names(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("In-flight launch set was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

#[derive(Debug)]
pub struct InFlightClaim {
    registry: InFlight,
    name: String,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.registry.names().remove(&self.name);
    }
}

pub struct DockerRuntime {
    docker: Docker,
    closed: AtomicBool,
}

impl DockerRuntime {
    pub async fn connect(socket_path: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match socket_path {
            Some(path) => {
                info!("Connecting to Docker daemon at {path}");
                Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)?
            }
            None => Docker::connect_with_local_defaults()?,
        };

        match docker.ping().await {
            Ok(_) => info!("Docker daemon is reachable"),
            Err(e) => warn!("Docker ping failed: {e}, will retry on first use"),
        }

        Ok(Self {
            docker,
            closed: AtomicBool::new(false),
        })
    }

    fn client(&self) -> Result<&Docker, RuntimeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::Api("runtime client is closed".to_owned()));
        }
        Ok(&self.docker)
    }
}

fn trimmed_name(name: &str) -> String {
    name.trim_start_matches('/').to_owned()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_run(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, RuntimeError> {
        let docker = self.client()?;

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| {
                let source = m.source.display();
                if m.read_only {
                    format!("{source}:{}:ro", m.target)
                } else {
                    format!("{source}:{}", m.target)
                }
            })
            .collect();

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .guest_ports
            .iter()
            .map(|port| (port.clone(), HashMap::new()))
            .collect();

        let port_bindings = spec
            .guest_ports
            .iter()
            .map(|port| {
                let binding = bollard::models::PortBinding {
                    host_ip: Some("0.0.0.0".to_owned()),
                    host_port: None,
                };
                (port.clone(), Some(vec![binding]))
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if binds.is_empty() { None } else { Some(binds) },
            ..Default::default()
        };

        let config = BollardConfig {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone()),
            attach_stdin: Some(false),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            open_stdin: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;

        if let Err(e) = docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            best_effort_teardown(self, &created.id).await;
            return Err(e.into());
        }

        info!("Started container {} ({})", spec.name, created.id);
        Ok(RuntimeHandle {
            id: created.id,
            name: spec.name.clone(),
        })
    }

    async fn exec_once(&self, handle_id: &str, argv: &[String]) -> Result<(), RuntimeError> {
        let docker = self.client()?;
        let exec = docker
            .create_exec(
                handle_id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn bound_ports(&self, handle_id: &str) -> Result<Vec<BoundPort>, RuntimeError> {
        let inspect = self
            .client()?
            .inspect_container(handle_id, None::<InspectContainerOptions>)
            .await?;

        let mut ports: Vec<BoundPort> = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(guest_port, bindings)| {
                // Docker reports the IPv4 and IPv6 binding, the first one is enough.
                let host_port = bindings?
                    .into_iter()
                    .find_map(|binding| binding.host_port?.parse::<u16>().ok())?;
                Some(BoundPort {
                    guest_port,
                    host_port,
                })
            })
            .collect();
        ports.sort_by(|a, b| a.guest_port.cmp(&b.guest_port));
        Ok(ports)
    }

    async fn kill(&self, handle_id: &str) -> Result<(), RuntimeError> {
        self.client()?
            .kill_container(
                handle_id,
                Some(KillContainerOptions {
                    signal: "SIGKILL".to_owned(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, handle_id: &str) -> Result<(), RuntimeError> {
        self.client()?
            .remove_container(
                handle_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn get(&self, handle_id: &str) -> Result<RuntimeHandle, RuntimeError> {
        let inspect = self
            .client()?
            .inspect_container(handle_id, None::<InspectContainerOptions>)
            .await?;
        Ok(RuntimeHandle {
            id: inspect.id.unwrap_or_else(|| handle_id.to_owned()),
            name: inspect.name.as_deref().map(trimmed_name).unwrap_or_default(),
        })
    }

    async fn stats(&self, handle_id: &str) -> Result<ResourceStats, RuntimeError> {
        let mut stream = self.client()?.stats(
            handle_id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );

        let stats = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::NotFound(handle_id.to_owned()))??;

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or_default()
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or_default());
        let cpus = stats.cpu_stats.online_cpus.unwrap_or(1);
        let cpu_percent = if system_delta == 0 {
            0.0
        } else {
            cpu_delta as f64 / system_delta as f64 * cpus as f64 * 100.0
        };

        Ok(ResourceStats {
            cpu_percent,
            memory_bytes: stats.memory_stats.usage.unwrap_or_default(),
            memory_limit: stats.memory_stats.limit.unwrap_or_default(),
        })
    }

    async fn list_managed(&self) -> Result<Vec<RuntimeHandle>, RuntimeError> {
        let filters = HashMap::from([(
            "label".to_owned(),
            vec![format!("{LABEL_MANAGED}=true")],
        )]);
        let containers = self
            .client()?
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.first().map(|n| trimmed_name(n)))
                    .unwrap_or_default();
                Some(RuntimeHandle { id, name })
            })
            .collect())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Docker client closed");
        }
    }
}
