use std::fmt::Display;
use std::ops::DerefMut;

use actix_web::{
    error,
    http::{header, StatusCode},
    HttpRequest, HttpResponse,
};
use derive_more::derive::Display;
use diesel::prelude::*;
use diesel::result::Error;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use log::error;
use serde::Serialize;

use crate::{
    config::Config,
    models::{Problem, ProblemId, Team, TeamId},
    util::cipher_util::{sha256_hex, TokenVerifier},
    Ext,
};

pub trait APIRequest: Sized {
    fn ok(&self) -> bool;
    fn sanity(&self) -> Result<(), APIError> {
        if self.ok() {
            Ok(())
        } else {
            Err(APIError::InvalidFormData)
        }
    }
}

/// Stable message kinds shared by every response, successful or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgCode {
    DbError,
    CtfNotFound,
    ContainerStart,
    ContainerStop,
    ContainersTeamStop,
    ContainerNotFound,
    ContainerAlreadyRunning,
    ContainerLimitReached,
    CtfSolved,
    HintLimitReached,
    TeamNotFound,
    UserNotFound,
    // Reserved: hints fall back to a point penalty instead.
    InsufficientCoins,
    NotInMetaTeam,
    Unauthorized,
    InvalidFormData,
    UserOrEmailExists,
}

impl MsgCode {
    pub fn code(self) -> u16 {
        match self {
            MsgCode::DbError => 0,
            MsgCode::CtfNotFound => 2,
            MsgCode::ContainerStart => 3,
            MsgCode::ContainerStop => 4,
            MsgCode::ContainersTeamStop => 5,
            MsgCode::ContainerNotFound => 6,
            MsgCode::ContainerAlreadyRunning => 7,
            MsgCode::ContainerLimitReached => 8,
            MsgCode::CtfSolved => 9,
            MsgCode::HintLimitReached => 10,
            MsgCode::TeamNotFound => 11,
            MsgCode::UserNotFound => 12,
            MsgCode::InsufficientCoins => 13,
            MsgCode::NotInMetaTeam => 14,
            MsgCode::Unauthorized => 15,
            MsgCode::InvalidFormData => 16,
            MsgCode::UserOrEmailExists => 17,
        }
    }
}

/// Successful responses carry the same tag as errors, next to their payload.
#[derive(Debug, Serialize)]
pub struct Tagged<T: Serialize> {
    pub msg_code: MsgCode,
    pub code: u16,
    #[serde(flatten)]
    pub body: T,
}

impl<T: Serialize> Tagged<T> {
    pub fn new(msg_code: MsgCode, body: T) -> Self {
        Self {
            msg_code,
            code: msg_code.code(),
            body,
        }
    }
}

#[derive(Debug, Display, PartialEq, Eq)]
pub enum APIError {
    #[display("Invalid form data")]
    InvalidFormData,

    #[display("Unauthorized access")]
    Unauthorized,

    #[display("CTF does not exist")]
    CtfNotFound,

    #[display("You have no running containers for this CTF")]
    ContainerNotFound,

    #[display("Already solved")]
    CtfSolved,

    #[display("No more hints for this CTF")]
    HintLimitReached,

    #[display("Team does not exist")]
    TeamNotFound,

    #[display("Team has no meta team for this round")]
    NotInMetaTeam,

    #[display("Tag or email already belongs to someone else")]
    UserOrEmailExists,

    #[display("Server error at {location}, ref[{refnum}]: {msg}")]
    ServerError {
        location: &'static str,
        msg: &'static str,
        refnum: uuid::Uuid,
    },
}

#[derive(Serialize)]
struct ErrorBody {
    msg_code: MsgCode,
    code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    refnum: Option<uuid::Uuid>,
}

impl APIError {
    pub fn msg_code(&self) -> MsgCode {
        match self {
            APIError::InvalidFormData => MsgCode::InvalidFormData,
            APIError::Unauthorized => MsgCode::Unauthorized,
            APIError::CtfNotFound => MsgCode::CtfNotFound,
            APIError::ContainerNotFound => MsgCode::ContainerNotFound,
            APIError::CtfSolved => MsgCode::CtfSolved,
            APIError::HintLimitReached => MsgCode::HintLimitReached,
            APIError::TeamNotFound => MsgCode::TeamNotFound,
            APIError::NotInMetaTeam => MsgCode::NotInMetaTeam,
            APIError::UserOrEmailExists => MsgCode::UserOrEmailExists,
            APIError::ServerError { .. } => MsgCode::DbError,
        }
    }

    pub fn set_location(self, location: &'static str) -> Self {
        match self {
            APIError::ServerError {
                location: _,
                msg,
                refnum,
            } => APIError::ServerError {
                location,
                msg,
                refnum,
            },
            _ => self,
        }
    }

    pub fn log(&self) {
        if let APIError::ServerError {
            location,
            msg,
            refnum,
        } = self
        {
            error!("Server error at {location}, ref[{refnum}]: {msg}");
        }
    }
}

impl From<Error> for APIError {
    fn from(e: Error) -> Self {
        new_unlocated_server_error(e, "Transaction")
    }
}

impl From<tokio::task::JoinError> for APIError {
    fn from(e: tokio::task::JoinError) -> Self {
        new_unlocated_server_error(e, "Task")
    }
}

impl error::ResponseError for APIError {
    fn error_response(&self) -> HttpResponse {
        let msg_code = self.msg_code();
        let refnum = match self {
            APIError::ServerError { refnum, .. } => Some(*refnum),
            _ => None,
        };
        HttpResponse::build(self.status_code()).json(ErrorBody {
            msg_code,
            code: msg_code.code(),
            refnum,
        })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            APIError::InvalidFormData => StatusCode::NOT_ACCEPTABLE,
            APIError::Unauthorized | APIError::CtfSolved | APIError::NotInMetaTeam => {
                StatusCode::UNAUTHORIZED
            }
            APIError::CtfNotFound | APIError::ContainerNotFound | APIError::TeamNotFound => {
                StatusCode::NOT_FOUND
            }
            APIError::HintLimitReached => StatusCode::FORBIDDEN,
            APIError::UserOrEmailExists => StatusCode::CONFLICT,
            APIError::ServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Extracts the team from `Authorization: Bearer <token>`.
pub fn get_team_id(req: &HttpRequest, verifier: &TokenVerifier) -> Result<TeamId, APIError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(APIError::Unauthorized)?;

    verifier
        .verify_team(token.trim())
        .map(|claims| claims.team_id)
        .map_err(|_| APIError::Unauthorized)
}

pub fn admin_check(req: &HttpRequest, config: &Config) -> Result<(), APIError> {
    let key = req
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(APIError::Unauthorized)?;

    if !config.admin_key_hash.is_empty() && sha256_hex(key.trim()) == config.admin_key_hash {
        Ok(())
    } else {
        Err(APIError::Unauthorized)
    }
}

pub async fn fetch_team_from_id<C>(team_id: TeamId, conn: &mut C) -> Result<Option<Team>, APIError>
where
    C: DerefMut<Target = AsyncPgConnection> + std::marker::Send,
{
    use crate::schema::team::dsl::*;

    match team
        .filter(id.eq(team_id))
        .select(Team::as_select())
        .first::<Team>(conn)
        .await
    {
        Ok(t) => Ok(Some(t)),
        Err(Error::NotFound) => Ok(None),
        Err(e) => Err(new_unlocated_server_error(e, ERROR_DB_UNKNOWN)),
    }
}

/// Row-locks the team for the rest of the surrounding transaction.
/// CAVEAT: only meaningful inside a sql transaction!
pub async fn lock_team<C>(team_id: TeamId, conn: &mut C) -> Result<Team, APIError>
where
    C: DerefMut<Target = AsyncPgConnection> + std::marker::Send,
{
    use crate::schema::team::dsl::*;

    match team
        .filter(id.eq(team_id))
        .select(Team::as_select())
        .for_update()
        .first::<Team>(conn)
        .await
    {
        Ok(t) => Ok(t),
        Err(Error::NotFound) => Err(APIError::TeamNotFound),
        Err(e) => Err(new_unlocated_server_error(e, ERROR_DB_UNKNOWN)),
    }
}

pub async fn fetch_problem<C>(
    problem_id: ProblemId,
    visible_only: bool,
    conn: &mut C,
) -> Result<Problem, APIError>
where
    C: DerefMut<Target = AsyncPgConnection> + std::marker::Send,
{
    use crate::schema::problem::dsl::*;

    let mut query = problem.filter(id.eq(problem_id)).into_boxed();
    if visible_only {
        query = query.filter(visible.eq(true));
    }

    match query.select(Problem::as_select()).first::<Problem>(conn).await {
        Ok(p) => Ok(p),
        Err(Error::NotFound) => Err(APIError::CtfNotFound),
        Err(e) => Err(new_unlocated_server_error(e, ERROR_DB_UNKNOWN)),
    }
}

pub fn log_server_error<E>(error: E, location: &'static str, msg: &'static str) -> APIError
where
    E: Display,
{
    new_unlocated_server_error(error, msg)
        .set_location(location)
        .tap(APIError::log)
}

pub fn new_unlocated_server_error<E>(error: E, msg: &'static str) -> APIError
where
    E: Display,
{
    let refnum = uuid::Uuid::new_v4();
    error!("Error [{refnum}]: {error}");
    APIError::ServerError {
        location: LOCATION_UNKNOWN,
        msg,
        refnum,
    }
}

pub static ADMIN_KEY_HEADER: &str = "X-Admin-Key";

pub static ERROR_DB_CONNECTION: &str = "db_connction_failed";
pub static ERROR_DB_UNKNOWN: &str = "database_unknown";
pub static ERROR_RUNTIME: &str = "container_runtime_failed";

pub static LOCATION_UNKNOWN: &str = "[unknown]";

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use actix_web::ResponseError;

    use crate::util::cipher_util::TokenVerifier;

    #[test]
    fn error_kinds_keep_their_codes() {
        assert_eq!(APIError::CtfNotFound.msg_code().code(), 2);
        assert_eq!(APIError::ContainerNotFound.msg_code().code(), 6);
        assert_eq!(APIError::HintLimitReached.msg_code(), MsgCode::HintLimitReached);
        assert_eq!(APIError::UserOrEmailExists.msg_code().code(), 17);
        assert_eq!(APIError::UserOrEmailExists.status_code(), StatusCode::CONFLICT);
        let server = new_unlocated_server_error("boom", ERROR_DB_UNKNOWN);
        assert_eq!(server.msg_code(), MsgCode::DbError);
        assert_eq!(server.msg_code().code(), 0);
        assert_eq!(server.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn msg_codes_serialize_as_snake_case() {
        let json = serde_json::to_string(&MsgCode::ContainerAlreadyRunning).unwrap();
        assert_eq!(json, "\"container_already_running\"");
    }

    #[test]
    fn tagged_payloads_flatten() {
        #[derive(Serialize)]
        struct Body {
            ports: Vec<i32>,
        }
        let json = serde_json::to_value(Tagged::new(
            MsgCode::ContainerStart,
            Body { ports: vec![4000] },
        ))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"msg_code": "container_start", "code": 3, "ports": [4000]})
        );
        let bare = serde_json::to_value(Tagged::new(MsgCode::ContainerStop, ())).unwrap();
        assert_eq!(bare, serde_json::json!({"msg_code": "container_stop", "code": 4}));
    }

    #[test]
    fn set_location_only_touches_server_errors() {
        let located = new_unlocated_server_error("boom", ERROR_DB_UNKNOWN).set_location("start");
        assert!(matches!(located, APIError::ServerError { location: "start", .. }));
        assert_eq!(APIError::CtfSolved.set_location("start"), APIError::CtfSolved);
    }

    #[test]
    fn bearer_token_resolves_team() {
        let verifier = TokenVerifier::new("secret").unwrap();
        let token = verifier.issue_team(7, chrono::Duration::minutes(5));
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, format!("Bearer {token}")))
            .to_http_request();
        assert_eq!(get_team_id(&req, &verifier), Ok(7));

        let missing = TestRequest::default().to_http_request();
        assert_eq!(get_team_id(&missing, &verifier), Err(APIError::Unauthorized));

        let forged = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer 00ff"))
            .to_http_request();
        assert_eq!(get_team_id(&forged, &verifier), Err(APIError::Unauthorized));
    }

    #[test]
    fn admin_key_is_compared_by_hash() {
        let config = Config {
            admin_key_hash: sha256_hex("hunter2"),
            ..Config::default()
        };
        let good = TestRequest::default()
            .insert_header((ADMIN_KEY_HEADER, "hunter2"))
            .to_http_request();
        assert_eq!(admin_check(&good, &config), Ok(()));

        let bad = TestRequest::default()
            .insert_header((ADMIN_KEY_HEADER, "hunter3"))
            .to_http_request();
        assert_eq!(admin_check(&bad, &config), Err(APIError::Unauthorized));
    }
}
