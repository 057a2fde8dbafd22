use std::collections::HashMap;
use std::sync::Arc;

use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use log::{info, warn};
use serde::Serialize;

use crate::models::{Container, Problem, ProblemId, ProblemView, TeamId};
use crate::util::api_util::*;
use crate::util::cache::Cache;
use crate::util::economy::{
    charge_for_hint, decayed_points, displayed_points, penalty_multiplier, HintCharge,
};
use crate::util::environment::Orchestrator;
use crate::{DbPool, Ext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Queryable)]
pub struct HintView {
    pub text: String,
    pub order: i16,
}

/// Checks a flag against the team's live environment. A correct flag records the
/// solve, retires the environment and schedules the decay recomputation.
/// `Ok(false)` means the flag was wrong.
pub async fn submit_flag(
    orchestrator: &Orchestrator,
    cache: Arc<Cache>,
    team_id: TeamId,
    problem_id: ProblemId,
    flag: &str,
) -> Result<bool, APIError> {
    let location = "submit_flag";
    let mut conn = orchestrator.connection(location).await?;
    fetch_problem(problem_id, true, &mut conn)
        .await
        .map_err(|e| e.set_location(location))?;

    let submitted = flag.trim().to_owned();

    let retired = conn
        .transaction::<_, APIError, _>(|conn| {
            Box::pin(async move {
                use crate::schema::container::dsl as container_dsl;
                use crate::schema::hint::dsl as hint_dsl;
                use crate::schema::solved_problem::dsl as solved_dsl;
                use crate::schema::viewed_hint::dsl as viewed_dsl;

                lock_team(team_id, conn).await?;

                let solved = diesel::select(diesel::dsl::exists(
                    solved_dsl::solved_problem
                        .filter(solved_dsl::team_id.eq(team_id))
                        .filter(solved_dsl::problem_id.eq(problem_id)),
                ))
                .get_result::<bool>(conn)
                .await?;
                if solved {
                    return Err(APIError::CtfSolved);
                }

                let environment = container_dsl::container
                    .filter(container_dsl::team_id.eq(team_id))
                    .filter(container_dsl::problem_id.eq(problem_id))
                    .order(container_dsl::id.asc())
                    .select(Container::as_select())
                    .first::<Container>(conn)
                    .await
                    .optional()?
                    .ok_or(APIError::ContainerNotFound)?;

                if environment.flag != submitted {
                    return Ok(None);
                }

                let orders = hint_dsl::hint
                    .inner_join(viewed_dsl::viewed_hint)
                    .filter(viewed_dsl::team_id.eq(team_id))
                    .filter(viewed_dsl::with_points.eq(true))
                    .filter(hint_dsl::problem_id.eq(problem_id))
                    .select(hint_dsl::ord)
                    .load::<i16>(conn)
                    .await?;
                let penalty = penalty_multiplier(orders);

                diesel::insert_into(solved_dsl::solved_problem)
                    .values((
                        solved_dsl::team_id.eq(team_id),
                        solved_dsl::problem_id.eq(problem_id),
                        solved_dsl::penalty.eq(penalty),
                    ))
                    .execute(conn)
                    .await?;

                let retired = diesel::delete(
                    container_dsl::container
                        .filter(container_dsl::team_id.eq(team_id))
                        .filter(container_dsl::problem_id.eq(problem_id)),
                )
                .returning(Container::as_returning())
                .get_results::<Container>(conn)
                .await?;

                Ok(Some(retired))
            })
        })
        .await
        .map_err(|e| e.set_location(location).tap(APIError::log))?;

    let Some(retired) = retired else {
        return Ok(false);
    };

    info!("Team {team_id} solved problem {problem_id}");
    cache.leaderboard.force_expire();
    orchestrator.dispose_rows(retired).await;

    let pool = orchestrator.pool().clone();
    tokio::spawn(async move {
        if let Err(e) = recompute_problem_points(&pool, &cache, problem_id).await {
            warn!("Points of problem {problem_id} were not updated: {e}");
        }
    });

    Ok(true)
}

/// Reveals the lowest-order hint the team has not seen yet. Teams short on coins
/// still get it, at a point penalty.
pub async fn request_hint(
    orchestrator: &Orchestrator,
    team_id: TeamId,
    problem_id: ProblemId,
) -> Result<HintView, APIError> {
    let location = "request_hint";
    let hint_cost = orchestrator.config().hint_cost;
    let mut conn = orchestrator.connection(location).await?;
    fetch_problem(problem_id, true, &mut conn)
        .await
        .map_err(|e| e.set_location(location))?;

    conn.transaction::<_, APIError, _>(|conn| {
        Box::pin(async move {
            use crate::schema::hint::dsl as hint_dsl;
            use crate::schema::team::dsl as team_dsl;
            use crate::schema::viewed_hint::dsl as viewed_dsl;

            let team = lock_team(team_id, conn).await?;

            let last_order = hint_dsl::hint
                .inner_join(viewed_dsl::viewed_hint)
                .filter(viewed_dsl::team_id.eq(team_id))
                .filter(hint_dsl::problem_id.eq(problem_id))
                .select(diesel::dsl::max(hint_dsl::ord))
                .get_result::<Option<i16>>(conn)
                .await?;
            let next_order = last_order.map_or(0, |order| order + 1);

            let (hint_id, text, order) = hint_dsl::hint
                .filter(hint_dsl::problem_id.eq(problem_id))
                .filter(hint_dsl::ord.eq(next_order))
                .select((hint_dsl::id, hint_dsl::text, hint_dsl::ord))
                .first::<(i32, String, i16)>(conn)
                .await
                .optional()?
                .ok_or(APIError::HintLimitReached)?;

            let charge = charge_for_hint(team.coins, hint_cost);
            if let HintCharge::Coins(cost) = charge {
                diesel::update(team_dsl::team.filter(team_dsl::id.eq(team_id)))
                    .set(team_dsl::coins.eq(team_dsl::coins - cost))
                    .execute(conn)
                    .await?;
            }

            diesel::insert_into(viewed_dsl::viewed_hint)
                .values((
                    viewed_dsl::team_id.eq(team_id),
                    viewed_dsl::hint_id.eq(hint_id),
                    viewed_dsl::with_points.eq(charge.with_points()),
                ))
                .execute(conn)
                .await?;

            Ok(HintView { text, order })
        })
    })
    .await
    .map_err(|e| e.set_location(location).tap(APIError::log))
}

pub async fn list_viewed_hints(
    orchestrator: &Orchestrator,
    team_id: TeamId,
    problem_id: ProblemId,
) -> Result<Vec<HintView>, APIError> {
    use crate::schema::hint::dsl as hint_dsl;
    use crate::schema::viewed_hint::dsl as viewed_dsl;

    let location = "list_viewed_hints";
    let mut conn = orchestrator.connection(location).await?;
    fetch_problem(problem_id, true, &mut conn)
        .await
        .map_err(|e| e.set_location(location))?;

    hint_dsl::hint
        .inner_join(viewed_dsl::viewed_hint)
        .filter(viewed_dsl::team_id.eq(team_id))
        .filter(hint_dsl::problem_id.eq(problem_id))
        .order(hint_dsl::ord.asc())
        .select((hint_dsl::text, hint_dsl::ord))
        .load::<HintView>(&mut conn)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))
}

/// Visible problems, valued at what the team would get for solving them now.
pub async fn list_problems(
    orchestrator: &Orchestrator,
    team_id: TeamId,
) -> Result<Vec<ProblemView>, APIError> {
    use crate::schema::hint::dsl as hint_dsl;
    use crate::schema::problem::dsl as problem_dsl;
    use crate::schema::viewed_hint::dsl as viewed_dsl;

    let location = "list_problems";
    let mut conn = orchestrator.connection(location).await?;

    let problems = problem_dsl::problem
        .filter(problem_dsl::visible.eq(true))
        .order(problem_dsl::id.asc())
        .select(Problem::as_select())
        .load::<Problem>(&mut conn)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?;

    let penalized = hint_dsl::hint
        .inner_join(viewed_dsl::viewed_hint)
        .filter(viewed_dsl::team_id.eq(team_id))
        .filter(viewed_dsl::with_points.eq(true))
        .select((hint_dsl::problem_id, hint_dsl::ord))
        .load::<(ProblemId, i16)>(&mut conn)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?;

    let mut orders: HashMap<ProblemId, Vec<i16>> = HashMap::new();
    for (problem_id, order) in penalized {
        orders.entry(problem_id).or_default().push(order);
    }

    Ok(problems
        .iter()
        .map(|problem| {
            let multiplier = orders
                .get(&problem.id)
                .map_or(1.0, |o| penalty_multiplier(o.iter().copied()));
            ProblemView {
                points: displayed_points(problem.points, multiplier),
                ..ProblemView::from(problem)
            }
        })
        .collect())
}

pub async fn completed_problems(
    orchestrator: &Orchestrator,
    team_id: TeamId,
) -> Result<Vec<ProblemView>, APIError> {
    use crate::schema::problem::dsl as problem_dsl;
    use crate::schema::solved_problem::dsl as solved_dsl;

    let location = "completed_problems";
    let mut conn = orchestrator.connection(location).await?;

    let problems = problem_dsl::problem
        .inner_join(solved_dsl::solved_problem)
        .filter(solved_dsl::team_id.eq(team_id))
        .filter(problem_dsl::visible.eq(true))
        .order(problem_dsl::id.asc())
        .select(Problem::as_select())
        .load::<Problem>(&mut conn)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?;

    Ok(problems.iter().map(ProblemView::from).collect())
}

pub async fn get_problem(cache: &Cache, problem_id: ProblemId) -> Result<ProblemView, APIError> {
    cache
        .query_problem_cached(problem_id, true)
        .await
        .map(|problem| ProblemView::from(problem.as_ref()))
}

/// Re-derives a problem's value from its solve count, then makes readers see it.
pub async fn recompute_problem_points(
    pool: &DbPool,
    cache: &Cache,
    problem_id: ProblemId,
) -> Result<i32, APIError> {
    let location = "recompute_points";
    let mut conn = pool
        .get()
        .await
        .map_err(|e| log_server_error(e, location, ERROR_DB_CONNECTION))?;

    let points = conn
        .transaction::<_, APIError, _>(|conn| {
            Box::pin(async move {
                use crate::schema::problem::dsl as problem_dsl;
                use crate::schema::solved_problem::dsl as solved_dsl;

                let (min_points, max_points) = problem_dsl::problem
                    .filter(problem_dsl::id.eq(problem_id))
                    .select((problem_dsl::min_points, problem_dsl::max_points))
                    .for_update()
                    .first::<(i32, i32)>(conn)
                    .await
                    .optional()?
                    .ok_or(APIError::CtfNotFound)?;

                let solves: i64 = solved_dsl::solved_problem
                    .filter(solved_dsl::problem_id.eq(problem_id))
                    .count()
                    .get_result(conn)
                    .await?;

                let points = decayed_points(min_points, max_points, solves);
                diesel::update(problem_dsl::problem.filter(problem_dsl::id.eq(problem_id)))
                    .set(problem_dsl::points.eq(points))
                    .execute(conn)
                    .await?;
                Ok(points)
            })
        })
        .await
        .map_err(|e| e.set_location(location).tap(APIError::log))?;

    cache.invalidate_problem(problem_id).await;
    cache.leaderboard.force_expire();
    Ok(points)
}
