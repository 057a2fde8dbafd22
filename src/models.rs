use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::Serialize;

pub type TeamId = i32;
pub type ProblemId = i32;
pub type HintId = i32;
pub type ContainerId = i32;
pub type MetaTeamId = i32;
pub type PreEventProblemId = i32;

#[derive(Queryable, Selectable, Clone, Debug, Serialize)]
#[diesel(table_name = crate::schema::team)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    #[serde(skip)]
    pub secret_hash: String,
    pub coins: i32,
    pub points: i32,
    pub meta_team_id: Option<MetaTeamId>,
}

#[derive(Queryable, Selectable, Clone, Debug)]
#[diesel(table_name = crate::schema::problem)]
pub struct Problem {
    pub id: ProblemId,
    pub name: String,
    pub description: String,
    pub author: String,
    pub points: i32,
    pub min_points: i32,
    pub max_points: i32,
    pub visible: bool,
    pub tags: i16,
    pub image_name: Option<String>,
    pub guest_ports: Vec<String>,
    pub is_static: bool,
}

/// What a team gets to see of a problem. Image and scoring bounds stay private.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ProblemView {
    pub id: ProblemId,
    pub name: String,
    pub description: String,
    pub author: String,
    pub points: i32,
    pub tags: i16,
}

impl From<&Problem> for ProblemView {
    fn from(problem: &Problem) -> Self {
        Self {
            id: problem.id,
            name: problem.name.clone(),
            description: problem.description.clone(),
            author: problem.author.clone(),
            points: problem.points,
            tags: problem.tags,
        }
    }
}

#[derive(Queryable, Selectable, Clone, Debug)]
#[diesel(table_name = crate::schema::hint)]
pub struct Hint {
    pub id: HintId,
    pub problem_id: ProblemId,
    pub ord: i16,
    pub text: String,
}

#[derive(Queryable, Selectable, Clone, Debug)]
#[diesel(table_name = crate::schema::container)]
pub struct Container {
    pub id: ContainerId,
    pub docker_id: String,
    pub name: String,
    pub team_id: TeamId,
    pub problem_id: ProblemId,
    pub flag: String,
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::container)]
pub struct NewContainer<'a> {
    pub docker_id: &'a str,
    pub name: &'a str,
    pub team_id: TeamId,
    pub problem_id: ProblemId,
    pub flag: &'a str,
    pub token: Option<&'a str>,
}

#[derive(Queryable, Selectable, Clone, Debug)]
#[diesel(table_name = crate::schema::solved_problem)]
pub struct SolvedProblem {
    pub id: i32,
    pub team_id: TeamId,
    pub problem_id: ProblemId,
    pub solved_at: DateTime<Utc>,
    pub penalty: f64,
}

#[derive(Queryable, Selectable, Clone, Debug, Serialize)]
#[diesel(table_name = crate::schema::meta_team)]
pub struct MetaTeam {
    pub id: MetaTeamId,
    pub name: String,
    pub points: i32,
}

#[derive(Queryable, Selectable, Clone, Debug)]
#[diesel(table_name = crate::schema::r2_problem)]
pub struct R2Problem {
    pub id: i32,
    pub name: String,
    pub description: String,
    pub author: String,
    pub points: i32,
    pub image_name: String,
    pub guest_ports: Vec<String>,
}

#[derive(Queryable, Selectable, Clone, Debug)]
#[diesel(table_name = crate::schema::r2_container)]
pub struct R2Container {
    pub id: ContainerId,
    pub docker_id: String,
    pub problem_id: i32,
    pub meta_team_id: MetaTeamId,
    pub flag: String,
    pub solved: bool,
}

#[derive(Queryable, Selectable, Clone, Debug, Serialize, PartialEq, Eq)]
#[diesel(table_name = crate::schema::member)]
pub struct Member {
    pub tag: String,
    pub name: String,
    #[serde(skip)]
    pub team_id: TeamId,
}

/// A flag-only warm-up problem, live on a single day of the event calendar.
#[derive(Queryable, Selectable, Clone, Debug, Serialize)]
#[diesel(table_name = crate::schema::pre_event_problem)]
pub struct PreEventProblem {
    pub id: PreEventProblemId,
    pub name: String,
    pub description: String,
    pub author: String,
    pub points: i32,
    #[serde(skip)]
    pub flag: String,
    pub url: String,
    pub live_on: NaiveDate,
}
