use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use futures_util::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::models::{Container, NewContainer, Problem, ProblemId, TeamId};
use crate::util::api_util::*;
use crate::util::cipher_util::{gen_container_name, gen_flag, TokenVerifier};
use crate::util::runtime::{
    best_effort_teardown, ContainerRuntime, InFlight, InFlightClaim, LaunchSpec, MountSpec,
    ResourceStats, RuntimeError,
};
use crate::{DbConn, DbPool, Ext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning {
        ports: Vec<i32>,
        url: Option<String>,
    },
    LimitReached,
    Started {
        ports: Vec<i32>,
        url: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct StartBody {
    pub ctf_id: ProblemId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl StartOutcome {
    pub fn msg_code(&self) -> MsgCode {
        match self {
            StartOutcome::AlreadyRunning { .. } => MsgCode::ContainerAlreadyRunning,
            StartOutcome::LimitReached => MsgCode::ContainerLimitReached,
            StartOutcome::Started { .. } => MsgCode::ContainerStart,
        }
    }

    pub fn ports(&self) -> &[i32] {
        match self {
            StartOutcome::AlreadyRunning { ports, .. } | StartOutcome::Started { ports, .. } => {
                ports
            }
            StartOutcome::LimitReached => &[],
        }
    }

    pub fn into_response(self, ctf_id: ProblemId) -> Tagged<StartBody> {
        let msg_code = self.msg_code();
        let body = match self {
            StartOutcome::AlreadyRunning { ports, url } | StartOutcome::Started { ports, url } => {
                StartBody {
                    ctf_id,
                    ports: Some(ports),
                    url,
                }
            }
            StartOutcome::LimitReached => StartBody {
                ctf_id,
                ports: None,
                url: None,
            },
        };
        Tagged::new(msg_code, body)
    }
}

/// Leftovers of a launch that may have to be undone.
#[derive(Debug, Default)]
struct Spawned {
    claim: Option<InFlightClaim>,
    docker_id: Option<String>,
    static_dir: Option<PathBuf>,
}

type SpawnSlot = Arc<Mutex<Spawned>>;

struct Launched {
    name: String,
    docker_id: String,
    flag: String,
    ports: Vec<i32>,
    token: Option<String>,
}

/// Owns every environment of the first competition mode. Creation brings the runtime
/// resource up before its row commits; destruction commits the row deletion before
/// the resource is torn down.
pub struct Orchestrator {
    pool: DbPool,
    runtime: Arc<dyn ContainerRuntime>,
    verifier: Arc<TokenVerifier>,
    config: Arc<Config>,
    in_flight: InFlight,
}

impl Orchestrator {
    pub fn new(
        pool: DbPool,
        runtime: Arc<dyn ContainerRuntime>,
        verifier: Arc<TokenVerifier>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            pool,
            runtime,
            verifier,
            config,
            in_flight: InFlight::default(),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub(crate) async fn connection(
        &self,
        location: &'static str,
    ) -> Result<DbConn<'_>, APIError> {
        self.pool
            .get()
            .await
            .map_err(|e| log_server_error(e, location, ERROR_DB_CONNECTION))
    }

    pub async fn start(
        &self,
        team_id: TeamId,
        problem_id: ProblemId,
    ) -> Result<StartOutcome, APIError> {
        let location = "start";
        let mut conn = self.connection(location).await?;
        let problem = fetch_problem(problem_id, true, &mut conn)
            .await
            .map_err(|e| e.set_location(location))?;

        let slot = SpawnSlot::default();
        let tx_slot = slot.clone();
        let runtime = self.runtime.clone();
        let verifier = self.verifier.clone();
        let config = self.config.clone();
        let in_flight = self.in_flight.clone();

        let result = conn
            .transaction::<_, APIError, _>(|conn| {
                Box::pin(async move {
                    use crate::schema::container::dsl as container_dsl;

                    // Serializes every start of this team, whichever problem it targets.
                    lock_team(team_id, conn).await?;

                    let existing = container_dsl::container
                        .filter(container_dsl::team_id.eq(team_id))
                        .filter(container_dsl::problem_id.eq(problem_id))
                        .order(container_dsl::id.asc())
                        .select(Container::as_select())
                        .load::<Container>(conn)
                        .await?;

                    if let Some((kept, duplicates)) = existing.split_first() {
                        if !duplicates.is_empty() {
                            warn!(
                                "Team {team_id} holds {} extra environments for problem {problem_id}, keeping {}",
                                duplicates.len(),
                                kept.docker_id
                            );
                            let ids: Vec<i32> = duplicates.iter().map(|c| c.id).collect();
                            diesel::delete(
                                container_dsl::container.filter(container_dsl::id.eq_any(ids)),
                            )
                            .execute(conn)
                            .await?;
                        }
                        let ports = container_ports(kept.id, conn).await?;
                        let url = kept
                            .token
                            .as_deref()
                            .map(|token| static_url(&config, team_id, &kept.name, token));
                        return Ok((
                            StartOutcome::AlreadyRunning { ports, url },
                            duplicates.to_vec(),
                        ));
                    }

                    let active: i64 = container_dsl::container
                        .filter(container_dsl::team_id.eq(team_id))
                        .count()
                        .get_result(conn)
                        .await?;
                    if active >= config.max_containers_per_team {
                        return Ok((StartOutcome::LimitReached, vec![]));
                    }

                    let launched = launch_for_team(
                        runtime.as_ref(),
                        &config,
                        &verifier,
                        &in_flight,
                        team_id,
                        &problem,
                        &tx_slot,
                    )
                    .await?;

                    let row_id = diesel::insert_into(container_dsl::container)
                        .values(NewContainer {
                            docker_id: &launched.docker_id,
                            name: &launched.name,
                            team_id,
                            problem_id,
                            flag: &launched.flag,
                            token: launched.token.as_deref(),
                        })
                        .returning(container_dsl::id)
                        .get_result::<i32>(conn)
                        .await?;

                    insert_ports(row_id, &launched.ports, conn).await?;

                    let url = launched
                        .token
                        .as_deref()
                        .map(|token| static_url(&config, team_id, &launched.name, token));
                    Ok((
                        StartOutcome::Started {
                            ports: launched.ports,
                            url,
                        },
                        vec![],
                    ))
                })
            })
            .await;

        match result {
            Ok((outcome, duplicates)) => {
                if let StartOutcome::Started { .. } = outcome {
                    info!("Team {team_id} started an environment for problem {problem_id}");
                }
                for duplicate in duplicates {
                    let runtime = self.runtime.clone();
                    let static_dir = self.static_dir_of(&duplicate);
                    tokio::spawn(async move {
                        dispose(runtime.as_ref(), &duplicate.docker_id, static_dir).await;
                    });
                }
                Ok(outcome)
            }
            Err(e) => {
                let spawned = std::mem::take(&mut *slot.lock().await);
                if let Some(docker_id) = spawned.docker_id.as_deref() {
                    warn!("Undoing launch of {docker_id} for team {team_id}");
                    dispose(self.runtime.as_ref(), docker_id, spawned.static_dir).await;
                } else if let Some(dir) = spawned.static_dir {
                    remove_static_dir(&dir).await;
                }
                Err(e.set_location(location).tap(APIError::log))
            }
        }
    }

    pub async fn stop(&self, team_id: TeamId, problem_id: ProblemId) -> Result<(), APIError> {
        let location = "stop";
        let mut conn = self.connection(location).await?;
        fetch_problem(problem_id, false, &mut conn)
            .await
            .map_err(|e| e.set_location(location))?;

        let removed = conn
            .transaction::<_, APIError, _>(|conn| {
                Box::pin(async move {
                    use crate::schema::container::dsl as container_dsl;
                    let rows = diesel::delete(
                        container_dsl::container
                            .filter(container_dsl::team_id.eq(team_id))
                            .filter(container_dsl::problem_id.eq(problem_id)),
                    )
                    .returning(Container::as_returning())
                    .get_results::<Container>(conn)
                    .await?;
                    if rows.is_empty() {
                        return Err(APIError::ContainerNotFound);
                    }
                    Ok(rows)
                })
            })
            .await
            .map_err(|e| e.set_location(location).tap(APIError::log))?;

        self.dispose_rows(removed).await;
        Ok(())
    }

    /// Stops every environment of the team. Returns how many were stopped.
    pub async fn stop_all(&self, team_id: TeamId) -> Result<usize, APIError> {
        let location = "stop_all";
        let mut conn = self.connection(location).await?;

        let removed = conn
            .transaction::<_, APIError, _>(|conn| {
                Box::pin(async move {
                    use crate::schema::container::dsl as container_dsl;
                    Ok(diesel::delete(
                        container_dsl::container.filter(container_dsl::team_id.eq(team_id)),
                    )
                    .returning(Container::as_returning())
                    .get_results::<Container>(conn)
                    .await?)
                })
            })
            .await
            .map_err(|e| e.set_location(location).tap(APIError::log))?;

        let count = removed.len();
        self.dispose_rows(removed).await;
        Ok(count)
    }

    pub async fn admin_stop(&self, docker_id: &str) -> Result<(), APIError> {
        let location = "admin_stop";
        let mut conn = self.connection(location).await?;
        let target = docker_id.to_owned();

        let removed = conn
            .transaction::<_, APIError, _>(|conn| {
                Box::pin(async move {
                    use crate::schema::container::dsl as container_dsl;
                    let rows = diesel::delete(
                        container_dsl::container.filter(container_dsl::docker_id.eq(target)),
                    )
                    .returning(Container::as_returning())
                    .get_results::<Container>(conn)
                    .await?;
                    if rows.is_empty() {
                        return Err(APIError::ContainerNotFound);
                    }
                    Ok(rows)
                })
            })
            .await
            .map_err(|e| e.set_location(location).tap(APIError::log))?;

        self.dispose_rows(removed).await;
        Ok(())
    }

    /// Tears down and forgets every first-mode environment. Bounded by the configured
    /// shutdown budget, failures are logged only.
    pub async fn shutdown_sweep(&self) -> usize {
        let location = "shutdown";
        let removed = match self.delete_all_rows(location).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Shutdown sweep could not clear the store: {e}");
                return 0;
            }
        };

        let count = removed.len();
        if tokio::time::timeout(self.config.shutdown_budget, self.dispose_rows(removed))
            .await
            .is_err()
        {
            warn!(
                "Shutdown sweep exceeded {:?}, leaving the rest to the orphan reaper",
                self.config.shutdown_budget
            );
        }
        info!("Shutdown sweep released {count} environments");
        count
    }

    pub(crate) async fn delete_all_rows(
        &self,
        location: &'static str,
    ) -> Result<Vec<Container>, APIError> {
        let mut conn = self.connection(location).await?;
        conn.transaction::<_, APIError, _>(|conn| {
            Box::pin(async move {
                use crate::schema::container::dsl as container_dsl;
                Ok(diesel::delete(container_dsl::container)
                    .returning(Container::as_returning())
                    .get_results::<Container>(conn)
                    .await?)
            })
        })
        .await
        .map_err(|e| e.set_location(location).tap(APIError::log))
    }

    /// Removes managed runtime resources that no environment row refers to.
    pub async fn reap_orphans(&self) -> Result<Vec<String>, APIError> {
        let location = "reap_orphans";

        let managed = self
            .runtime
            .list_managed()
            .await
            .map_err(|e| log_server_error(e, location, ERROR_RUNTIME))?;
        // Taken before reading the store: a launch missing from this snapshot has
        // either committed its row or been undone.
        let launching = self.in_flight.snapshot();

        let mut conn = self.connection(location).await?;
        let known: HashSet<String> = {
            use crate::schema::container::dsl as container_dsl;
            use crate::schema::r2_container::dsl as r2_dsl;

            let mut known = container_dsl::container
                .select(container_dsl::docker_id)
                .load::<String>(&mut conn)
                .await
                .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?;
            known.extend(
                r2_dsl::r2_container
                    .select(r2_dsl::docker_id)
                    .load::<String>(&mut conn)
                    .await
                    .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?,
            );
            known.into_iter().collect()
        };

        let orphans: Vec<String> = managed
            .into_iter()
            .filter(|handle| !known.contains(&handle.id) && !launching.contains(&handle.name))
            .map(|handle| handle.id)
            .collect();

        for orphan in &orphans {
            warn!("Reaping orphaned container {orphan}");
            best_effort_teardown(self.runtime.as_ref(), orphan).await;
        }
        Ok(orphans)
    }

    /// Problem id to host ports, for every environment the team holds.
    pub async fn list_team_ports(
        &self,
        team_id: TeamId,
    ) -> Result<BTreeMap<ProblemId, Vec<i32>>, APIError> {
        use crate::schema::container::dsl as container_dsl;
        use crate::schema::port::dsl as port_dsl;
        let location = "list_team_ports";
        let mut conn = self.connection(location).await?;

        let rows = container_dsl::container
            .left_join(port_dsl::port)
            .filter(container_dsl::team_id.eq(team_id))
            .select((container_dsl::problem_id, port_dsl::host_port.nullable()))
            .order((container_dsl::problem_id.asc(), port_dsl::host_port.asc()))
            .load::<(ProblemId, Option<i32>)>(&mut conn)
            .await
            .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?;

        let mut ports: BTreeMap<ProblemId, Vec<i32>> = BTreeMap::new();
        for (problem_id, port) in rows {
            let entry = ports.entry(problem_id).or_default();
            if let Some(port) = port {
                entry.push(port);
            }
        }
        Ok(ports)
    }

    pub async fn environment_stats(&self, docker_id: &str) -> Result<ResourceStats, APIError> {
        let location = "environment_stats";
        let mut conn = self.connection(location).await?;
        let known = {
            use crate::schema::container::dsl as container_dsl;
            diesel::select(diesel::dsl::exists(
                container_dsl::container.filter(container_dsl::docker_id.eq(docker_id)),
            ))
            .get_result::<bool>(&mut conn)
            .await
            .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?
        };
        if !known {
            return Err(APIError::ContainerNotFound);
        }

        match self.runtime.get(docker_id).await {
            Ok(_) => {}
            Err(RuntimeError::NotFound(_)) => {
                warn!("Environment {docker_id} has a row but no container");
                return Err(APIError::ContainerNotFound);
            }
            Err(e) => return Err(log_server_error(e, location, ERROR_RUNTIME)),
        }

        self.runtime
            .stats(docker_id)
            .await
            .map_err(|e| log_server_error(e, location, ERROR_RUNTIME))
    }

    /// Decides whether a static bundle may be served: the token must be genuine, name
    /// this team and instance, and the environment must still be running.
    pub async fn authorize_bundle(
        &self,
        team_id: TeamId,
        instance: &str,
        token: &str,
    ) -> Result<(), APIError> {
        let location = "authorize_bundle";
        let claims = self.verifier.verify_bundle(token).map_err(|e| {
            debug!("Rejected bundle token for {instance}: {e}");
            APIError::Unauthorized
        })?;
        if claims.team_id != team_id || claims.instance != instance {
            return Err(APIError::Unauthorized);
        }

        let mut conn = self.connection(location).await?;
        let live = {
            use crate::schema::container::dsl as container_dsl;
            diesel::select(diesel::dsl::exists(
                container_dsl::container
                    .filter(container_dsl::team_id.eq(team_id))
                    .filter(container_dsl::name.eq(instance))
                    .filter(container_dsl::token.eq(token)),
            ))
            .get_result::<bool>(&mut conn)
            .await
            .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?
        };
        if live {
            Ok(())
        } else {
            Err(APIError::Unauthorized)
        }
    }

    /// Tears down runtime resources of rows already deleted from the store.
    pub(crate) async fn dispose_rows(&self, rows: Vec<Container>) {
        join_all(rows.iter().map(|row| {
            dispose(
                self.runtime.as_ref(),
                &row.docker_id,
                self.static_dir_of(row),
            )
        }))
        .await;
    }

    fn static_dir_of(&self, row: &Container) -> Option<PathBuf> {
        row.token
            .as_ref()
            .map(|_| static_dir(&self.config, row.team_id, &row.name))
    }
}

fn static_dir(config: &Config, team_id: TeamId, name: &str) -> PathBuf {
    config.static_root.join(team_id.to_string()).join(name)
}

fn static_url(config: &Config, team_id: TeamId, name: &str, token: &str) -> String {
    format!(
        "{}/{team_id}/{name}/?token={token}",
        config.static_base_url.trim_end_matches('/')
    )
}

async fn remove_static_dir(dir: &PathBuf) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove static bundle {}: {e}", dir.display());
        }
    }
}

async fn dispose(runtime: &dyn ContainerRuntime, docker_id: &str, static_dir: Option<PathBuf>) {
    best_effort_teardown(runtime, docker_id).await;
    if let Some(dir) = static_dir {
        remove_static_dir(&dir).await;
    }
}

pub(crate) async fn container_ports<C>(container_id: i32, conn: &mut C) -> Result<Vec<i32>, APIError>
where
    C: std::ops::DerefMut<Target = diesel_async::AsyncPgConnection> + std::marker::Send,
{
    use crate::schema::port::dsl as port_dsl;
    Ok(port_dsl::port
        .filter(port_dsl::container_id.eq(container_id))
        .select(port_dsl::host_port)
        .order(port_dsl::host_port.asc())
        .load::<i32>(conn)
        .await?)
}

async fn insert_ports<C>(container_id: i32, ports: &[i32], conn: &mut C) -> Result<(), APIError>
where
    C: std::ops::DerefMut<Target = diesel_async::AsyncPgConnection> + std::marker::Send,
{
    use crate::schema::port::dsl as port_dsl;
    if ports.is_empty() {
        return Ok(());
    }
    let rows: Vec<_> = ports
        .iter()
        .map(|p| (port_dsl::host_port.eq(*p), port_dsl::container_id.eq(container_id)))
        .collect();
    diesel::insert_into(port_dsl::port)
        .values(rows)
        .execute(conn)
        .await?;
    Ok(())
}

/// Brings up one sandbox for a team and injects its flag. Everything created is
/// recorded in `slot` first so a failed transaction can undo it.
async fn launch_for_team(
    runtime: &dyn ContainerRuntime,
    config: &Config,
    verifier: &TokenVerifier,
    in_flight: &InFlight,
    team_id: TeamId,
    problem: &Problem,
    slot: &SpawnSlot,
) -> Result<Launched, APIError> {
    let location = "start";
    let image = problem.image_name.clone().ok_or_else(|| {
        log_server_error(
            format!("problem {} has no image", problem.id),
            location,
            ERROR_RUNTIME,
        )
    })?;

    let owner = team_id.to_string();
    let name = gen_container_name(&owner, problem.id);
    slot.lock().await.claim = Some(in_flight.claim(&name));
    let flag = gen_flag(&config.flag_prefix);
    let mut spec = LaunchSpec::managed(name.clone(), image, &owner, problem.id);

    if problem.is_static {
        let dir = static_dir(config, team_id, &name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| log_server_error(e, location, ERROR_RUNTIME))?;
        slot.lock().await.static_dir = Some(dir.clone());
        spec = spec.with_mount(MountSpec {
            source: dir,
            target: config.static_mount_target.clone(),
            read_only: false,
        });
    } else {
        spec = spec.with_ports(&problem.guest_ports);
    }

    let handle = runtime
        .create_and_run(&spec)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_RUNTIME))?;
    slot.lock().await.docker_id = Some(handle.id.clone());

    let mut argv = config.flag_command.clone();
    argv.push(flag.clone());
    runtime
        .exec_once(&handle.id, &argv)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_RUNTIME))?;

    let (ports, token) = if problem.is_static {
        let ttl = chrono::Duration::seconds(config.static_token_ttl.as_secs() as i64);
        (vec![], Some(verifier.issue_bundle(team_id, &name, ttl)))
    } else {
        let bound = runtime
            .bound_ports(&handle.id)
            .await
            .map_err(|e| log_server_error(e, location, ERROR_RUNTIME))?;
        (bound.into_iter().map(|p| i32::from(p.host_port)).collect(), None)
    };

    Ok(Launched {
        name,
        docker_id: handle.id,
        flag,
        ports,
        token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_carry_their_codes() {
        let started = StartOutcome::Started {
            ports: vec![40000, 40001],
            url: None,
        };
        assert_eq!(started.msg_code(), MsgCode::ContainerStart);
        assert_eq!(started.ports(), &[40000, 40001]);

        let json = serde_json::to_value(started.into_response(3)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "msg_code": "container_start",
                "code": 3,
                "ctf_id": 3,
                "ports": [40000, 40001]
            })
        );

        let json = serde_json::to_value(StartOutcome::LimitReached.into_response(3)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"msg_code": "container_limit_reached", "code": 8, "ctf_id": 3})
        );
    }

    #[test]
    fn static_locations_are_scoped_per_team_and_instance() {
        let config = Config {
            static_base_url: "https://ctf.example/static/".to_owned(),
            static_root: PathBuf::from("/srv/static"),
            ..Config::default()
        };
        assert_eq!(
            static_dir(&config, 7, "7_3_ab"),
            PathBuf::from("/srv/static/7/7_3_ab")
        );
        assert_eq!(
            static_url(&config, 7, "7_3_ab", "tok"),
            "https://ctf.example/static/7/7_3_ab/?token=tok"
        );
    }
}
