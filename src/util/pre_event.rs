use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error};
use diesel_async::{AsyncConnection, RunQueryDsl};
use log::info;
use serde::Serialize;

use crate::config::Config;
use crate::models::{PreEventProblem, PreEventProblemId};
use crate::util::api_util::*;
use crate::util::environment::Orchestrator;
use crate::util::stat::{fetch_pre_event_ranking, PreEventRankItem};
use crate::Ext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreEventSubmission {
    pub status: bool,
    pub coins: i64,
}

/// Calendar date at the event's location.
pub fn event_today(config: &Config) -> NaiveDate {
    Utc::now().with_timezone(&config.event_offset).date_naive()
}

/// Tags are compared trimmed and lowercased.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

pub async fn list_pre_event_problems(
    orchestrator: &Orchestrator,
) -> Result<Vec<PreEventProblem>, APIError> {
    use crate::schema::pre_event_problem::dsl::*;

    let location = "list_pre_event_problems";
    let mut conn = orchestrator.connection(location).await?;
    pre_event_problem
        .select(PreEventProblem::as_select())
        .order((live_on.asc(), id.asc()))
        .load::<PreEventProblem>(&mut conn)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))
}

pub async fn today_pre_event_problems(
    orchestrator: &Orchestrator,
) -> Result<Vec<PreEventProblem>, APIError> {
    use crate::schema::pre_event_problem::dsl::*;

    let location = "today_pre_event_problems";
    let today = event_today(orchestrator.config());
    let mut conn = orchestrator.connection(location).await?;
    pre_event_problem
        .filter(live_on.eq(today))
        .select(PreEventProblem::as_select())
        .order(id.asc())
        .load::<PreEventProblem>(&mut conn)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))
}

pub async fn get_pre_event_problem(
    orchestrator: &Orchestrator,
    problem_id: PreEventProblemId,
) -> Result<PreEventProblem, APIError> {
    use crate::schema::pre_event_problem::dsl::*;

    let location = "get_pre_event_problem";
    let mut conn = orchestrator.connection(location).await?;
    pre_event_problem
        .filter(id.eq(problem_id))
        .select(PreEventProblem::as_select())
        .first::<PreEventProblem>(&mut conn)
        .await
        .optional()
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))?
        .ok_or(APIError::CtfNotFound)
}

async fn coins_of<C>(tag: &str, conn: &mut C) -> Result<i64, Error>
where
    C: std::ops::DerefMut<Target = diesel_async::AsyncPgConnection> + std::marker::Send,
{
    use crate::schema::pre_event_problem::dsl as problem_dsl;
    use crate::schema::pre_event_solved_problem::dsl as solved_dsl;

    let total = solved_dsl::pre_event_solved_problem
        .inner_join(problem_dsl::pre_event_problem)
        .filter(solved_dsl::tag.eq(tag))
        .select(diesel::dsl::sum(problem_dsl::points))
        .first::<Option<i64>>(conn)
        .await?;
    Ok(total.unwrap_or(0))
}

/// Points a participant has collected so far. Unknown tags have none.
pub async fn pre_event_coins(orchestrator: &Orchestrator, tag: &str) -> Result<i64, APIError> {
    let location = "pre_event_coins";
    let mut conn = orchestrator.connection(location).await?;
    coins_of(&normalize_tag(tag), &mut conn)
        .await
        .map_err(|e| log_server_error(e, location, ERROR_DB_UNKNOWN))
}

/// Checks a flag for one of today's problems. The tag is registered on first use and
/// its email refreshed afterwards; a wrong flag still does that much.
pub async fn submit_pre_event_flag(
    orchestrator: &Orchestrator,
    problem_id: PreEventProblemId,
    tag: &str,
    email: &str,
    flag: &str,
) -> Result<PreEventSubmission, APIError> {
    let location = "submit_pre_event_flag";
    let today = event_today(orchestrator.config());
    let tag = normalize_tag(tag);
    let email = email.trim().to_owned();
    let submitted = flag.trim().to_owned();

    let mut conn = orchestrator.connection(location).await?;
    conn.transaction::<_, APIError, _>(|conn| {
        Box::pin(async move {
            use crate::schema::pre_event_problem::dsl as problem_dsl;
            use crate::schema::pre_event_solved_problem::dsl as solved_dsl;
            use crate::schema::pre_event_user::dsl as user_dsl;

            let expected = problem_dsl::pre_event_problem
                .filter(problem_dsl::id.eq(problem_id))
                .filter(problem_dsl::live_on.eq(today))
                .select(problem_dsl::flag)
                .first::<String>(conn)
                .await
                .optional()?
                .ok_or(APIError::CtfNotFound)?;

            let solved = diesel::select(diesel::dsl::exists(
                solved_dsl::pre_event_solved_problem
                    .filter(solved_dsl::tag.eq(&tag))
                    .filter(solved_dsl::problem_id.eq(problem_id)),
            ))
            .get_result::<bool>(conn)
            .await?;
            if solved {
                return Err(APIError::CtfSolved);
            }

            diesel::insert_into(user_dsl::pre_event_user)
                .values((user_dsl::tag.eq(&tag), user_dsl::email.eq(&email)))
                .on_conflict(user_dsl::tag)
                .do_update()
                .set(user_dsl::email.eq(&email))
                .execute(conn)
                .await
                .map_err(|e| match e {
                    Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                        APIError::UserOrEmailExists
                    }
                    e => e.into(),
                })?;

            let status = submitted == expected;
            if status {
                let inserted = diesel::insert_into(solved_dsl::pre_event_solved_problem)
                    .values((
                        solved_dsl::tag.eq(&tag),
                        solved_dsl::problem_id.eq(problem_id),
                    ))
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .await?;
                if inserted == 0 {
                    return Err(APIError::CtfSolved);
                }
                info!("Pre-event problem {problem_id} solved by {tag}");
            }

            Ok(PreEventSubmission {
                status,
                coins: coins_of(&tag, conn).await?,
            })
        })
    })
    .await
    .map_err(|e| e.set_location(location).tap(APIError::log))
}

pub async fn pre_event_leaderboard(
    orchestrator: &Orchestrator,
) -> Result<Vec<PreEventRankItem>, APIError> {
    let mut conn = orchestrator.connection("pre_event_leaderboard").await?;
    fetch_pre_event_ranking(&mut conn).await
}
