use diesel::prelude::*;
use diesel::sql_types::{Integer, Text};
use diesel_async::RunQueryDsl;
use log::info;
use serde::Serialize;

use crate::models::{Member, MetaTeamId, ProblemId, Team, TeamId};
use crate::util::api_util::*;
use crate::util::cache::Cache;
use crate::util::environment::Orchestrator;
use crate::util::scoring::recompute_problem_points;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamInfo {
    pub id: TeamId,
    pub name: String,
    pub coins: i32,
    pub points: i32,
    pub meta_team_id: Option<MetaTeamId>,
    pub meta_team: Option<String>,
    pub members: Vec<Member>,
}

/// Coins a team received from one conversion of pre-event solves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, QueryableByName)]
pub struct PreEventCredit {
    #[diesel(sql_type = Integer)]
    pub team_id: TeamId,
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Integer)]
    pub earned: i32,
    #[diesel(sql_type = Integer)]
    pub coins: i32,
}

/// Flips a problem's visibility. Returns the new state.
pub async fn admin_toggle_problem(
    orchestrator: &Orchestrator,
    cache: &Cache,
    problem_id: ProblemId,
) -> Result<bool, APIError> {
    use crate::schema::problem::dsl::*;

    let location = "admin_toggle_problem";
    let mut conn = orchestrator.connection(location).await?;

    let now_visible = diesel::update(problem.filter(id.eq(problem_id)))
        .set(visible.eq(diesel::dsl::not(visible)))
        .returning(visible)
        .get_result::<bool>(&mut conn)
        .await
        .optional()
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?
        .ok_or(APIError::CtfNotFound)?;

    cache.invalidate_problem(problem_id).await;
    cache.leaderboard.force_expire();
    info!("Problem {problem_id} is now {}", if now_visible { "visible" } else { "hidden" });
    Ok(now_visible)
}

/// Adds `delta` coins (negative to take some away). Returns the new balance.
pub async fn admin_adjust_coins(
    orchestrator: &Orchestrator,
    team_id: TeamId,
    delta: i32,
) -> Result<i32, APIError> {
    use crate::schema::team::dsl::*;

    let location = "admin_adjust_coins";
    let mut conn = orchestrator.connection(location).await?;

    let balance = diesel::update(team.filter(id.eq(team_id)))
        .set(coins.eq(coins + delta))
        .returning(coins)
        .get_result::<i32>(&mut conn)
        .await
        .optional()
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?
        .ok_or(APIError::TeamNotFound)?;

    info!("Adjusted coins of team {team_id} by {delta}, balance {balance}");
    Ok(balance)
}

pub async fn admin_team_info(
    orchestrator: &Orchestrator,
    team_id: TeamId,
) -> Result<TeamInfo, APIError> {
    use crate::schema::meta_team::dsl as meta_dsl;

    let location = "admin_team_info";
    let mut conn = orchestrator.connection(location).await?;

    let team = fetch_team_from_id(team_id, &mut conn)
        .await
        .map_err(|e| e.set_location(location))?
        .ok_or(APIError::TeamNotFound)?;

    let meta_team = match team.meta_team_id {
        Some(meta_id) => meta_dsl::meta_team
            .filter(meta_dsl::id.eq(meta_id))
            .select(meta_dsl::name)
            .first::<String>(&mut conn)
            .await
            .optional()
            .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?,
        None => None,
    };

    let members = {
        use crate::schema::member::dsl as member_dsl;
        member_dsl::member
            .filter(member_dsl::team_id.eq(team_id))
            .select(Member::as_select())
            .order(member_dsl::tag.asc())
            .load::<Member>(&mut conn)
            .await
            .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?
    };

    Ok(TeamInfo {
        id: team.id,
        name: team.name,
        coins: team.coins,
        points: team.points,
        meta_team_id: team.meta_team_id,
        meta_team,
        members,
    })
}

pub async fn admin_list_teams(orchestrator: &Orchestrator) -> Result<Vec<Team>, APIError> {
    use crate::schema::team::dsl::*;

    let location = "admin_list_teams";
    let mut conn = orchestrator.connection(location).await?;
    team.select(Team::as_select())
        .order(id.asc())
        .load::<Team>(&mut conn)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))
}

/// Pays every team the points of the distinct pre-event problems its members solved,
/// as coins. A problem is paid to a team once, however often this runs.
pub async fn admin_convert_pre_event_coins(
    orchestrator: &Orchestrator,
) -> Result<Vec<PreEventCredit>, APIError> {
    let location = "admin_convert_pre_event_coins";
    let mut conn = orchestrator.connection(location).await?;

    let mut credited = diesel::sql_query(
        r#"
        WITH fresh AS (
            INSERT INTO pre_event_credit (team_id, problem_id)
            SELECT DISTINCT m.team_id, s.problem_id
            FROM member AS m
            JOIN pre_event_solved_problem AS s
                ON s.tag = LOWER(TRIM(m.tag))
            ON CONFLICT DO NOTHING
            RETURNING team_id, problem_id
        ), totals AS (
            SELECT f.team_id, CAST(SUM(p.points) AS INT4) AS earned
            FROM fresh AS f
            JOIN pre_event_problem AS p
                ON p.id = f.problem_id
            GROUP BY f.team_id
        )
        UPDATE team AS t
        SET coins = t.coins + totals.earned
        FROM totals
        WHERE t.id = totals.team_id
        RETURNING t.id AS team_id, CAST(t.name AS TEXT) AS name, totals.earned, t.coins;
    "#,
    )
    .load::<PreEventCredit>(&mut conn)
    .await
    .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?;
    credited.sort_by_key(|c| c.team_id);

    let total: i64 = credited.iter().map(|c| i64::from(c.earned)).sum();
    info!(
        "Converted pre-event solves into {total} coins for {} teams",
        credited.len()
    );
    Ok(credited)
}

pub async fn admin_recompute_points(
    orchestrator: &Orchestrator,
    cache: &Cache,
    problem_id: ProblemId,
) -> Result<i32, APIError> {
    recompute_problem_points(orchestrator.pool(), cache, problem_id).await
}
