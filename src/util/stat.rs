use std::ops::DerefMut;

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Text};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;

use crate::models::{MetaTeam, TeamId};

use super::api_util::{log_server_error, APIError, ERROR_DB_UNKNOWN};

#[derive(Serialize, QueryableByName, Clone, Debug, PartialEq, Eq)]
pub struct RankItem {
    #[serde(skip)]
    #[diesel(sql_type = Integer)]
    pub team_id: TeamId,
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = BigInt)]
    pub tpoints: i64,
}

/// Teams with their penalty-adjusted solve points plus flat bonus points, best first.
/// Ties go to the older team. A team without any visible solve is listed only while
/// its flat points are not negative.
pub async fn fetch_ranking<C>(conn: &mut C) -> Result<Vec<RankItem>, APIError>
where
    C: DerefMut<Target = AsyncPgConnection> + std::marker::Send,
{
    let query = diesel::sql_query(
        r#"
        SELECT
            t.id AS team_id,
            CAST(t.name AS TEXT) AS name,
            CAST(ROUND(COALESCE(SUM(s.penalty * p.points), 0) + t.points) AS BIGINT) AS tpoints
        FROM team AS t
        LEFT JOIN solved_problem AS s
            ON s.team_id = t.id
        LEFT JOIN problem AS p
            ON p.id = s.problem_id AND p.visible
        GROUP BY t.id, t.name, t.points
        HAVING COUNT(p.id) > 0 OR t.points >= 0
        ORDER BY tpoints DESC, t.id ASC;
    "#,
    );

    query
        .load::<RankItem>(conn)
        .await
        .map_err(|e| log_server_error(e, "stat", ERROR_DB_UNKNOWN))
}

#[derive(Serialize, QueryableByName, Clone, Debug, PartialEq, Eq)]
pub struct PreEventRankItem {
    #[diesel(sql_type = Text)]
    pub tag: String,
    #[diesel(sql_type = BigInt)]
    pub points: i64,
}

/// Pre-event participants by collected points. Ties go to whoever got there first.
pub async fn fetch_pre_event_ranking<C>(conn: &mut C) -> Result<Vec<PreEventRankItem>, APIError>
where
    C: DerefMut<Target = AsyncPgConnection> + std::marker::Send,
{
    let query = diesel::sql_query(
        r#"
        SELECT
            CAST(s.tag AS TEXT) AS tag,
            CAST(SUM(p.points) AS BIGINT) AS points
        FROM pre_event_solved_problem AS s
        JOIN pre_event_problem AS p
            ON p.id = s.problem_id
        GROUP BY s.tag
        ORDER BY points DESC, MAX(s.solved_at) ASC, s.tag ASC;
    "#,
    );

    query
        .load::<PreEventRankItem>(conn)
        .await
        .map_err(|e| log_server_error(e, "stat", ERROR_DB_UNKNOWN))
}

pub async fn fetch_meta_ranking<C>(conn: &mut C) -> Result<Vec<MetaTeam>, APIError>
where
    C: DerefMut<Target = AsyncPgConnection> + std::marker::Send,
{
    use crate::schema::meta_team::dsl::*;

    meta_team
        .select(MetaTeam::as_select())
        .order((points.desc(), id.asc()))
        .load::<MetaTeam>(conn)
        .await
        .map_err(|e| log_server_error(e, "stat", ERROR_DB_UNKNOWN))
}
