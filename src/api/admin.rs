use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::models::{ProblemId, TeamId};
use crate::util::api_util::*;
use crate::util::cache::Cache;
use crate::util::dashboard;
use crate::util::environment::Orchestrator;
use crate::util::round2;

#[derive(Debug, Deserialize)]
struct AdjustCoinsRequest {
    delta: i32,
}

impl APIRequest for AdjustCoinsRequest {
    fn ok(&self) -> bool {
        self.delta != 0
    }
}

#[derive(Debug, Serialize)]
struct ToggleResponse {
    problem_id: ProblemId,
    visible: bool,
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    team_id: TeamId,
    coins: i32,
}

#[derive(Debug, Serialize)]
struct PointsResponse {
    problem_id: ProblemId,
    points: i32,
}

#[derive(Debug, Serialize)]
struct ReapResponse {
    reaped: Vec<String>,
}

// [[API]]
// desp: Start the attack-defense round, rebuilding meta teams and their environments
// Method: POST
// URL: /admin/round2
// Response Body: `RotationSummary`
#[post("/round2")]
async fn rotate_round(
    req: HttpRequest,
    config: web::Data<Config>,
    orchestrator: web::Data<Orchestrator>,
    cache: web::Data<Cache>,
) -> Result<impl Responder, APIError> {
    admin_check(&req, &config)?;
    let summary = round2::admin_rotate_round(&orchestrator, &cache).await?;
    Ok(HttpResponse::Ok().json(summary))
}

#[post("/toggle_problem/{problem_id}")]
async fn toggle_problem(
    req: HttpRequest,
    path: web::Path<ProblemId>,
    config: web::Data<Config>,
    orchestrator: web::Data<Orchestrator>,
    cache: web::Data<Cache>,
) -> Result<impl Responder, APIError> {
    admin_check(&req, &config)?;
    let problem_id = path.into_inner();
    let visible = dashboard::admin_toggle_problem(&orchestrator, &cache, problem_id).await?;
    Ok(HttpResponse::Ok().json(ToggleResponse {
        problem_id,
        visible,
    }))
}

#[post("/stop_container/{docker_id}")]
async fn stop_container(
    req: HttpRequest,
    path: web::Path<String>,
    config: web::Data<Config>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    admin_check(&req, &config)?;
    orchestrator.admin_stop(&path).await?;
    Ok(HttpResponse::Ok().json(Tagged::new(MsgCode::ContainerStop, ())))
}

#[post("/adjust_coins/{team_id}")]
async fn adjust_coins(
    req: HttpRequest,
    path: web::Path<TeamId>,
    form: web::Json<AdjustCoinsRequest>,
    config: web::Data<Config>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    admin_check(&req, &config)?;
    form.sanity()?;
    let team_id = path.into_inner();
    let coins = dashboard::admin_adjust_coins(&orchestrator, team_id, form.delta).await?;
    Ok(HttpResponse::Ok().json(BalanceResponse { team_id, coins }))
}

#[get("/team_info/{team_id}")]
async fn team_info(
    req: HttpRequest,
    path: web::Path<TeamId>,
    config: web::Data<Config>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    admin_check(&req, &config)?;
    let info = dashboard::admin_team_info(&orchestrator, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(info))
}

#[post("/recompute/{problem_id}")]
async fn recompute_points(
    req: HttpRequest,
    path: web::Path<ProblemId>,
    config: web::Data<Config>,
    orchestrator: web::Data<Orchestrator>,
    cache: web::Data<Cache>,
) -> Result<impl Responder, APIError> {
    admin_check(&req, &config)?;
    let problem_id = path.into_inner();
    let points = dashboard::admin_recompute_points(&orchestrator, &cache, problem_id).await?;
    Ok(HttpResponse::Ok().json(PointsResponse { problem_id, points }))
}

#[post("/reap")]
async fn reap_orphans(
    req: HttpRequest,
    config: web::Data<Config>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    admin_check(&req, &config)?;
    let reaped = orchestrator.reap_orphans().await?;
    Ok(HttpResponse::Ok().json(ReapResponse { reaped }))
}

#[get("/stats/{docker_id}")]
async fn environment_stats(
    req: HttpRequest,
    path: web::Path<String>,
    config: web::Data<Config>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    admin_check(&req, &config)?;
    let stats = orchestrator.environment_stats(&path).await?;
    Ok(HttpResponse::Ok().json(stats))
}

// [[API]]
// desp: Convert the pre-event solves of every team's members into team coins.
//       Each pre-event problem pays a team once
// Method: POST
// URL: /admin/union
// Response Body: `[PreEventCredit]`, teams paid by this call only
#[post("/union")]
async fn convert_pre_event_coins(
    req: HttpRequest,
    config: web::Data<Config>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    admin_check(&req, &config)?;
    let credited = dashboard::admin_convert_pre_event_coins(&orchestrator).await?;
    Ok(HttpResponse::Ok().json(credited))
}

#[get("/teams")]
async fn list_teams(
    req: HttpRequest,
    config: web::Data<Config>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    admin_check(&req, &config)?;
    let teams = dashboard::admin_list_teams(&orchestrator).await?;
    Ok(HttpResponse::Ok().json(teams))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(rotate_round)
        .service(toggle_problem)
        .service(stop_container)
        .service(adjust_coins)
        .service(team_info)
        .service(recompute_points)
        .service(reap_orphans)
        .service(environment_stats)
        .service(convert_pre_event_coins)
        .service(list_teams)
        .service(super::monitor::cache_status);
}
