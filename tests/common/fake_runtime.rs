use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use ctf_arena::util::runtime::{
    BoundPort, ContainerRuntime, LaunchSpec, ResourceStats, RuntimeError, RuntimeHandle,
};

pub const FIRST_HOST_PORT: u16 = 40000;

struct FakeContainer {
    name: String,
    ports: Vec<BoundPort>,
}

#[derive(Default)]
struct FakeState {
    next_id: usize,
    next_port: u16,
    live: HashMap<String, FakeContainer>,
    created: usize,
    removed: Vec<String>,
    execs: Vec<(String, Vec<String>)>,
}

/// In-memory container runtime. Host ports are handed out from 40000 upwards and
/// only reused after `rewind_ports`.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    pub fail_create: AtomicBool,
    pub fail_exec: AtomicBool,
    ports_delay_ms: AtomicU64,
}

impl FakeRuntime {
    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.state.lock().unwrap().live.contains_key(id)
    }

    pub fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .live
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Last argument of the last command run in `id`, which is where flags go.
    pub fn flag_of(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .execs
            .iter()
            .rev()
            .find(|(target, _)| target == id)
            .and_then(|(_, argv)| argv.last().cloned())
    }

    /// A managed container the store knows nothing about.
    pub fn insert_stray(&self, id: &str) {
        self.state.lock().unwrap().live.insert(
            id.to_owned(),
            FakeContainer {
                name: id.to_owned(),
                ports: vec![],
            },
        );
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_exec(&self, fail: bool) {
        self.fail_exec.store(fail, Ordering::SeqCst);
    }

    /// Makes port lookups stall, widening the window between container creation and
    /// the row commit.
    pub fn set_ports_delay(&self, delay: Duration) {
        self.ports_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Next container binds host ports starting at `first`, even if they are taken.
    pub fn rewind_ports(&self, first: u16) {
        self.state.lock().unwrap().next_port = first;
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_and_run(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, RuntimeError> {
        // Leaves room for concurrent callers to interleave.
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("image pull failed".to_owned()));
        }

        let mut state = self.state.lock().unwrap();
        if state.next_port == 0 {
            state.next_port = FIRST_HOST_PORT;
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let mut ports = Vec::new();
        for guest_port in &spec.guest_ports {
            ports.push(BoundPort {
                guest_port: guest_port.clone(),
                host_port: state.next_port,
            });
            state.next_port += 1;
        }
        state.live.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                ports,
            },
        );
        state.created += 1;
        Ok(RuntimeHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn exec_once(&self, handle_id: &str, argv: &[String]) -> Result<(), RuntimeError> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(RuntimeError::Io("exec stream closed".to_owned()));
        }
        let mut state = self.state.lock().unwrap();
        if !state.live.contains_key(handle_id) {
            return Err(RuntimeError::NotFound(handle_id.to_owned()));
        }
        state.execs.push((handle_id.to_owned(), argv.to_vec()));
        Ok(())
    }

    async fn bound_ports(&self, handle_id: &str) -> Result<Vec<BoundPort>, RuntimeError> {
        let delay = self.ports_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.state
            .lock()
            .unwrap()
            .live
            .get(handle_id)
            .map(|c| c.ports.clone())
            .ok_or_else(|| RuntimeError::NotFound(handle_id.to_owned()))
    }

    async fn kill(&self, handle_id: &str) -> Result<(), RuntimeError> {
        if self.is_live(handle_id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(handle_id.to_owned()))
        }
    }

    async fn remove(&self, handle_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        match state.live.remove(handle_id) {
            Some(_) => {
                state.removed.push(handle_id.to_owned());
                Ok(())
            }
            None => Err(RuntimeError::NotFound(handle_id.to_owned())),
        }
    }

    async fn get(&self, handle_id: &str) -> Result<RuntimeHandle, RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .live
            .get(handle_id)
            .map(|c| RuntimeHandle {
                id: handle_id.to_owned(),
                name: c.name.clone(),
            })
            .ok_or_else(|| RuntimeError::NotFound(handle_id.to_owned()))
    }

    async fn stats(&self, handle_id: &str) -> Result<ResourceStats, RuntimeError> {
        if self.is_live(handle_id) {
            Ok(ResourceStats {
                cpu_percent: 1.5,
                memory_bytes: 1 << 20,
                memory_limit: 1 << 30,
            })
        } else {
            Err(RuntimeError::NotFound(handle_id.to_owned()))
        }
    }

    async fn list_managed(&self) -> Result<Vec<RuntimeHandle>, RuntimeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .live
            .iter()
            .map(|(id, c)| RuntimeHandle {
                id: id.clone(),
                name: c.name.clone(),
            })
            .collect())
    }

    async fn close(&self) {}
}
