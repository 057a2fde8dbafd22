use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use crate::models::{ProblemId, TeamId};
use crate::util::api_util::*;
use crate::util::cache::Cache;
use crate::util::cipher_util::TokenVerifier;
use crate::util::environment::Orchestrator;
use crate::util::scoring;

const MAX_FLAG_LENGTH: usize = 256;

#[derive(Debug, Deserialize)]
struct SubmitFlagRequest {
    flag: String,
}

impl APIRequest for SubmitFlagRequest {
    fn ok(&self) -> bool {
        let flag = self.flag.trim();
        !flag.is_empty() && flag.len() <= MAX_FLAG_LENGTH
    }
}

#[derive(Debug, Serialize)]
struct SubmitFlagResponse {
    status: bool,
}

#[derive(Debug, Deserialize)]
struct BundleQuery {
    token: String,
}

#[derive(Debug, Serialize)]
struct StopAllResponse {
    stopped: usize,
}

// [[API]]
// desp: Visible problems, points adjusted by the caller's hint penalties
// Method: GET
// URL: /ctf/list
#[get("/list")]
async fn list(
    req: HttpRequest,
    verifier: web::Data<TokenVerifier>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let team_id = get_team_id(&req, &verifier)?;
    let problems = scoring::list_problems(&orchestrator, team_id).await?;
    Ok(HttpResponse::Ok().json(problems))
}

#[get("/completed")]
async fn completed(
    req: HttpRequest,
    verifier: web::Data<TokenVerifier>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let team_id = get_team_id(&req, &verifier)?;
    let problems = scoring::completed_problems(&orchestrator, team_id).await?;
    Ok(HttpResponse::Ok().json(problems))
}

// [[API]]
// desp: Host ports of every running environment of the caller, by problem id
// Method: GET
// URL: /ctf/ports
#[get("/ports")]
async fn ports(
    req: HttpRequest,
    verifier: web::Data<TokenVerifier>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let team_id = get_team_id(&req, &verifier)?;
    let ports = orchestrator.list_team_ports(team_id).await?;
    Ok(HttpResponse::Ok().json(ports))
}

// [[API]]
// desp: Start the caller's environment for a problem
// Method: POST
// URL: /ctf/start/{ctf_id}
// Response Body: `StartBody` tagged with container_start / container_already_running /
//                container_limit_reached
#[post("/start/{ctf_id}")]
async fn start_environment(
    req: HttpRequest,
    path: web::Path<ProblemId>,
    verifier: web::Data<TokenVerifier>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let team_id = get_team_id(&req, &verifier)?;
    let ctf_id = path.into_inner();
    let outcome = orchestrator.start(team_id, ctf_id).await?;
    Ok(HttpResponse::Ok().json(outcome.into_response(ctf_id)))
}

#[post("/stop/{ctf_id}")]
async fn stop_environment(
    req: HttpRequest,
    path: web::Path<ProblemId>,
    verifier: web::Data<TokenVerifier>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let team_id = get_team_id(&req, &verifier)?;
    orchestrator.stop(team_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(Tagged::new(MsgCode::ContainerStop, ())))
}

#[post("/stopall")]
async fn stop_all_environments(
    req: HttpRequest,
    verifier: web::Data<TokenVerifier>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let team_id = get_team_id(&req, &verifier)?;
    let stopped = orchestrator.stop_all(team_id).await?;
    Ok(HttpResponse::Ok().json(Tagged::new(
        MsgCode::ContainersTeamStop,
        StopAllResponse { stopped },
    )))
}

// [[API]]
// desp: Subrequest check for the static file server. 200 if the bundle token still
//       grants access to that team's instance, 401 otherwise
// Method: GET
// URL: /ctf/bundle/{team_id}/{instance}?token=
#[get("/bundle/{team_id}/{instance}")]
async fn authorize_bundle(
    path: web::Path<(TeamId, String)>,
    query: web::Query<BundleQuery>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let (team_id, instance) = path.into_inner();
    orchestrator
        .authorize_bundle(team_id, &instance, &query.token)
        .await?;
    Ok(HttpResponse::Ok().finish())
}

// [[API]]
// desp: Submit the flag of a running environment
// Method: POST
// URL: /ctf/{ctf_id}/flag
// Request Body: `SubmitFlagRequest`
// Response Body: `SubmitFlagResponse`
#[post("/{ctf_id}/flag")]
async fn submit_flag(
    req: HttpRequest,
    path: web::Path<ProblemId>,
    form: web::Json<SubmitFlagRequest>,
    verifier: web::Data<TokenVerifier>,
    orchestrator: web::Data<Orchestrator>,
    cache: web::Data<Cache>,
) -> Result<impl Responder, APIError> {
    let team_id = get_team_id(&req, &verifier)?;
    form.sanity()?;
    let status = scoring::submit_flag(
        &orchestrator,
        cache.into_inner(),
        team_id,
        path.into_inner(),
        &form.flag,
    )
    .await?;
    Ok(HttpResponse::Ok().json(SubmitFlagResponse { status }))
}

#[get("/{ctf_id}/hint")]
async fn request_hint(
    req: HttpRequest,
    path: web::Path<ProblemId>,
    verifier: web::Data<TokenVerifier>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let team_id = get_team_id(&req, &verifier)?;
    let hint = scoring::request_hint(&orchestrator, team_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(hint))
}

#[get("/{ctf_id}/viewed_hints")]
async fn viewed_hints(
    req: HttpRequest,
    path: web::Path<ProblemId>,
    verifier: web::Data<TokenVerifier>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let team_id = get_team_id(&req, &verifier)?;
    let hints = scoring::list_viewed_hints(&orchestrator, team_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(hints))
}

#[get("/{ctf_id}")]
async fn problem(
    req: HttpRequest,
    path: web::Path<ProblemId>,
    verifier: web::Data<TokenVerifier>,
    cache: web::Data<Cache>,
) -> Result<impl Responder, APIError> {
    get_team_id(&req, &verifier)?;
    let problem = scoring::get_problem(&cache, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(problem))
}

/// Literal routes first, `/{ctf_id}` would shadow them.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list)
        .service(completed)
        .service(ports)
        .service(start_environment)
        .service(stop_environment)
        .service(stop_all_environments)
        .service(authorize_bundle)
        .service(submit_flag)
        .service(request_hint)
        .service(viewed_hints)
        .service(problem);
}
