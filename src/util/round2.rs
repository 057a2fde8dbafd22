use std::collections::HashMap;

use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use futures_util::future::join_all;
use log::{error, info, warn};
use serde::Serialize;

use crate::models::{ContainerId, MetaTeam, MetaTeamId, R2Container, R2Problem, TeamId};
use crate::util::api_util::*;
use crate::util::cache::Cache;
use crate::util::cipher_util::{gen_container_name, gen_flag};
use crate::util::economy::{attack_reward, defense_reward};
use crate::util::environment::Orchestrator;
use crate::util::runtime::{best_effort_teardown, LaunchSpec};
use crate::util::stat::{fetch_meta_ranking, fetch_ranking};
use crate::Ext;

pub const META_TEAM_ROSTER: [&str; 12] = [
    "Mimas",
    "Enceladus",
    "Tethys",
    "Dione",
    "Rhea",
    "Titan",
    "Hyperion",
    "Iapetus",
    "Phoebe",
    "Janus",
    "Epimetheus",
    "Pan",
];

/// Spreads ranked teams over `groups` buckets: rank 1 to bucket 0, rank 2 to
/// bucket 1, and so on, wrapping around.
pub fn deal_round_robin(ranked: &[TeamId], groups: usize) -> Vec<Vec<TeamId>> {
    if groups == 0 {
        return vec![];
    }
    let mut dealt = vec![Vec::new(); groups];
    for (rank, team_id) in ranked.iter().enumerate() {
        dealt[rank % groups].push(*team_id);
    }
    dealt
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RotationSummary {
    pub stopped_environments: usize,
    pub meta_teams: usize,
    pub assigned_teams: usize,
    pub provisioned: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    WrongFlag,
    Defended,
    Attacked,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SubmissionResponse {
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'static str>,
}

impl SubmissionOutcome {
    pub fn into_response(self) -> SubmissionResponse {
        match self {
            SubmissionOutcome::WrongFlag => SubmissionResponse {
                status: false,
                action: None,
            },
            SubmissionOutcome::Defended => SubmissionResponse {
                status: true,
                action: Some("defend"),
            },
            SubmissionOutcome::Attacked => SubmissionResponse {
                status: true,
                action: Some("attack"),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttackTarget {
    pub id: ContainerId,
    pub problem_id: i32,
    pub problem_name: String,
    pub meta_team: String,
    pub own: bool,
    pub ports: Vec<i32>,
}

/// Starts the attack-defense round: retires every first-mode environment, rebuilds
/// the meta teams from the current ranking and provisions one environment per
/// round-two problem and meta team. Provisioning failures are logged and counted.
pub async fn admin_rotate_round(
    orchestrator: &Orchestrator,
    cache: &Cache,
) -> Result<RotationSummary, APIError> {
    let location = "rotate_round";
    let mut summary = RotationSummary::default();

    let retired = orchestrator.delete_all_rows(location).await?;
    summary.stopped_environments = retired.len();
    orchestrator.dispose_rows(retired).await;

    let roster_size = orchestrator
        .config()
        .meta_team_count
        .clamp(1, META_TEAM_ROSTER.len());

    let mut conn = orchestrator.connection(location).await?;
    let (old_r2, meta_teams, assigned) = conn
        .transaction::<_, APIError, _>(|conn| {
            Box::pin(async move {
                use crate::schema::meta_team::dsl as meta_dsl;
                use crate::schema::r2_container::dsl as r2_dsl;
                use crate::schema::team::dsl as team_dsl;

                let old_r2 = diesel::delete(r2_dsl::r2_container)
                    .returning(r2_dsl::docker_id)
                    .get_results::<String>(conn)
                    .await?;

                diesel::update(team_dsl::team)
                    .set(team_dsl::meta_team_id.eq(None::<MetaTeamId>))
                    .execute(conn)
                    .await?;
                diesel::delete(meta_dsl::meta_team).execute(conn).await?;

                let roster: Vec<_> = META_TEAM_ROSTER[..roster_size]
                    .iter()
                    .map(|name| meta_dsl::name.eq(*name))
                    .collect();
                let meta_teams = diesel::insert_into(meta_dsl::meta_team)
                    .values(roster)
                    .returning(MetaTeam::as_returning())
                    .get_results::<MetaTeam>(conn)
                    .await?;

                let ranked: Vec<TeamId> = fetch_ranking(conn)
                    .await?
                    .into_iter()
                    .map(|item| item.team_id)
                    .collect();

                let mut assigned = 0;
                for (meta, members) in meta_teams
                    .iter()
                    .zip(deal_round_robin(&ranked, meta_teams.len()))
                {
                    if members.is_empty() {
                        continue;
                    }
                    assigned += diesel::update(team_dsl::team.filter(team_dsl::id.eq_any(members)))
                        .set(team_dsl::meta_team_id.eq(meta.id))
                        .execute(conn)
                        .await?;
                }

                Ok((old_r2, meta_teams, assigned))
            })
        })
        .await
        .map_err(|e| e.set_location(location).tap(APIError::log))?;

    summary.meta_teams = meta_teams.len();
    summary.assigned_teams = assigned;

    let runtime = orchestrator.runtime().as_ref();
    join_all(old_r2.iter().map(|docker_id| best_effort_teardown(runtime, docker_id))).await;

    let problems = {
        use crate::schema::r2_problem::dsl::*;
        r2_problem
            .order(id.asc())
            .select(R2Problem::as_select())
            .load::<R2Problem>(&mut conn)
            .await
            .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?
    };
    drop(conn);
    if problems.is_empty() {
        warn!("No round-two problems configured, meta teams start without environments");
    }

    let launches = problems.iter().flat_map(|problem| {
        meta_teams
            .iter()
            .map(move |meta| provision(orchestrator, problem, meta))
    });
    for launched in join_all(launches).await {
        if launched {
            summary.provisioned += 1;
        } else {
            summary.failed += 1;
        }
    }

    cache.leaderboard.force_expire();
    info!(
        "Round two started: {} meta teams, {} teams, {} environments ({} failed)",
        summary.meta_teams, summary.assigned_teams, summary.provisioned, summary.failed
    );
    Ok(summary)
}

/// One environment for one meta team. Returns whether it ended up both running and
/// recorded; anything half done is torn down again.
async fn provision(orchestrator: &Orchestrator, problem: &R2Problem, meta: &MetaTeam) -> bool {
    let runtime = orchestrator.runtime().as_ref();

    let name = gen_container_name(&meta.name, problem.id);
    let flag = gen_flag(&orchestrator.config().flag_prefix);
    let spec = LaunchSpec::managed(
        name.clone(),
        problem.image_name.clone(),
        &format!("meta-{}", meta.id),
        problem.id,
    )
    .with_ports(&problem.guest_ports);

    let _claim = orchestrator.in_flight().claim(&name);
    let handle = match runtime.create_and_run(&spec).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Could not start {name} for meta team {}: {e}", meta.name);
            return false;
        }
    };

    match record_environment(orchestrator, problem, meta, &handle.id, flag).await {
        Ok(()) => true,
        Err(e) => {
            error!("Could not record {name} for meta team {}: {e}", meta.name);
            best_effort_teardown(runtime, &handle.id).await;
            false
        }
    }
}

async fn record_environment(
    orchestrator: &Orchestrator,
    problem: &R2Problem,
    meta: &MetaTeam,
    handle_id: &str,
    flag: String,
) -> Result<(), String> {
    let runtime = orchestrator.runtime();
    let mut argv = orchestrator.config().flag_command.clone();
    argv.push(flag.clone());
    runtime
        .exec_once(handle_id, &argv)
        .await
        .map_err(|e| e.to_string())?;
    let ports: Vec<i32> = runtime
        .bound_ports(handle_id)
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|p| i32::from(p.host_port))
        .collect();

    let mut conn = orchestrator
        .connection("provision_round2")
        .await
        .map_err(|e| e.to_string())?;
    let docker_id = handle_id.to_owned();
    let problem_id = problem.id;
    let meta_team_id = meta.id;
    conn.transaction::<_, APIError, _>(|conn| {
        Box::pin(async move {
            use crate::schema::r2_container::dsl as r2_dsl;
            use crate::schema::r2_port::dsl as r2_port_dsl;

            let row_id = diesel::insert_into(r2_dsl::r2_container)
                .values((
                    r2_dsl::docker_id.eq(docker_id),
                    r2_dsl::problem_id.eq(problem_id),
                    r2_dsl::meta_team_id.eq(meta_team_id),
                    r2_dsl::flag.eq(flag),
                ))
                .returning(r2_dsl::id)
                .get_result::<i32>(conn)
                .await?;

            if !ports.is_empty() {
                let rows: Vec<_> = ports
                    .iter()
                    .map(|p| (r2_port_dsl::host_port.eq(*p), r2_port_dsl::container_id.eq(row_id)))
                    .collect();
                diesel::insert_into(r2_port_dsl::r2_port)
                    .values(rows)
                    .execute(conn)
                    .await?;
            }
            Ok(())
        })
    })
    .await
    .map_err(|e| e.to_string())
}

/// Scores a flag captured from a round-two environment. The owning meta team
/// defends it once; every other meta team may be credited for one attack on it.
pub async fn submit_attack_defense_flag(
    orchestrator: &Orchestrator,
    cache: &Cache,
    team_id: TeamId,
    container_id: ContainerId,
    flag: &str,
) -> Result<SubmissionOutcome, APIError> {
    let location = "submit_round2";
    let submitted = flag.trim().to_owned();
    let mut conn = orchestrator.connection(location).await?;

    let outcome = conn
        .transaction::<_, APIError, _>(|conn| {
            Box::pin(async move {
                use crate::schema::meta_team::dsl as meta_dsl;
                use crate::schema::r2_attack_record::dsl as attack_dsl;
                use crate::schema::r2_container::dsl as r2_dsl;
                use crate::schema::r2_problem::dsl as r2_problem_dsl;
                use crate::schema::team::dsl as team_dsl;

                let target = r2_dsl::r2_container
                    .filter(r2_dsl::id.eq(container_id))
                    .select(R2Container::as_select())
                    .for_update()
                    .first::<R2Container>(conn)
                    .await
                    .optional()?
                    .ok_or(APIError::CtfNotFound)?;

                let team = lock_team(team_id, conn).await?;
                let meta_team_id = team.meta_team_id.ok_or(APIError::NotInMetaTeam)?;

                if target.flag != submitted {
                    return Ok(SubmissionOutcome::WrongFlag);
                }

                let points = r2_problem_dsl::r2_problem
                    .filter(r2_problem_dsl::id.eq(target.problem_id))
                    .select(r2_problem_dsl::points)
                    .first::<i32>(conn)
                    .await?;

                if meta_team_id == target.meta_team_id {
                    if target.solved {
                        return Err(APIError::CtfSolved);
                    }
                    diesel::update(r2_dsl::r2_container.filter(r2_dsl::id.eq(container_id)))
                        .set(r2_dsl::solved.eq(true))
                        .execute(conn)
                        .await?;
                    diesel::update(team_dsl::team.filter(team_dsl::id.eq(team_id)))
                        .set(team_dsl::points.eq(team_dsl::points + defense_reward(points)))
                        .execute(conn)
                        .await?;
                    return Ok(SubmissionOutcome::Defended);
                }

                let credited = diesel::select(diesel::dsl::exists(
                    attack_dsl::r2_attack_record
                        .filter(attack_dsl::container_id.eq(container_id))
                        .filter(attack_dsl::meta_team_id.eq(meta_team_id)),
                ))
                .get_result::<bool>(conn)
                .await?;
                if credited {
                    return Err(APIError::CtfSolved);
                }

                diesel::update(team_dsl::team.filter(team_dsl::id.eq(team_id)))
                    .set(team_dsl::points.eq(team_dsl::points + attack_reward(points)))
                    .execute(conn)
                    .await?;
                diesel::update(meta_dsl::meta_team.filter(meta_dsl::id.eq(meta_team_id)))
                    .set(meta_dsl::points.eq(meta_dsl::points + points))
                    .execute(conn)
                    .await?;
                diesel::insert_into(attack_dsl::r2_attack_record)
                    .values((
                        attack_dsl::container_id.eq(container_id),
                        attack_dsl::meta_team_id.eq(meta_team_id),
                    ))
                    .execute(conn)
                    .await?;
                Ok(SubmissionOutcome::Attacked)
            })
        })
        .await
        .map_err(|e| e.set_location(location).tap(APIError::log))?;

    match outcome {
        SubmissionOutcome::WrongFlag => {}
        SubmissionOutcome::Defended => {
            info!("Team {team_id} defended round-two environment {container_id}");
            cache.leaderboard.force_expire();
        }
        SubmissionOutcome::Attacked => {
            info!("Team {team_id} attacked round-two environment {container_id}");
            cache.leaderboard.force_expire();
        }
    }
    Ok(outcome)
}

pub async fn list_attack_targets(
    orchestrator: &Orchestrator,
    team_id: TeamId,
) -> Result<Vec<AttackTarget>, APIError> {
    use crate::schema::meta_team::dsl as meta_dsl;
    use crate::schema::r2_attack_record::dsl as attack_dsl;
    use crate::schema::r2_container::dsl as r2_dsl;
    use crate::schema::r2_port::dsl as r2_port_dsl;
    use crate::schema::r2_problem::dsl as r2_problem_dsl;

    let location = "list_attack_targets";
    let mut conn = orchestrator.connection(location).await?;

    let mine = fetch_team_from_id(team_id, &mut conn)
        .await?
        .ok_or(APIError::TeamNotFound)?
        .meta_team_id
        .ok_or(APIError::NotInMetaTeam)?;

    let credited = attack_dsl::r2_attack_record
        .filter(attack_dsl::meta_team_id.eq(mine))
        .select(attack_dsl::container_id);

    let rows = r2_dsl::r2_container
        .inner_join(r2_problem_dsl::r2_problem)
        .inner_join(meta_dsl::meta_team)
        .filter(diesel::dsl::not(r2_dsl::id.eq_any(credited)))
        .order(r2_dsl::id.asc())
        .select((
            r2_dsl::id,
            r2_dsl::problem_id,
            r2_problem_dsl::name,
            meta_dsl::name,
            r2_dsl::meta_team_id,
        ))
        .load::<(ContainerId, i32, String, String, MetaTeamId)>(&mut conn)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?;

    let ids: Vec<ContainerId> = rows.iter().map(|row| row.0).collect();
    let mut ports: HashMap<ContainerId, Vec<i32>> = HashMap::new();
    for (container_id, port) in r2_port_dsl::r2_port
        .filter(r2_port_dsl::container_id.eq_any(ids))
        .order(r2_port_dsl::host_port.asc())
        .select((r2_port_dsl::container_id, r2_port_dsl::host_port))
        .load::<(ContainerId, i32)>(&mut conn)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?
    {
        ports.entry(container_id).or_default().push(port);
    }

    Ok(rows
        .into_iter()
        .map(
            |(id, problem_id, problem_name, meta_team, owner)| AttackTarget {
                id,
                problem_id,
                problem_name,
                meta_team,
                own: owner == mine,
                ports: ports.remove(&id).unwrap_or_default(),
            },
        )
        .collect())
}

pub async fn meta_leaderboard(orchestrator: &Orchestrator) -> Result<Vec<MetaTeam>, APIError> {
    let mut conn = orchestrator.connection("meta_leaderboard").await?;
    fetch_meta_ranking(&mut conn).await
}
