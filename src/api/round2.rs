use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;

use crate::models::ContainerId;
use crate::util::api_util::*;
use crate::util::cache::Cache;
use crate::util::cipher_util::TokenVerifier;
use crate::util::environment::Orchestrator;
use crate::util::round2;

#[derive(Debug, Deserialize)]
struct AttackDefenseRequest {
    flag: String,
}

impl APIRequest for AttackDefenseRequest {
    fn ok(&self) -> bool {
        !self.flag.trim().is_empty() && self.flag.len() <= 256
    }
}

// [[API]]
// desp: Environments the caller's meta team may still score on
// Method: GET
// URL: /round2/list
// Response Body: `[AttackTarget]`
#[get("/list")]
async fn list_targets(
    req: HttpRequest,
    verifier: web::Data<TokenVerifier>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let team_id = get_team_id(&req, &verifier)?;
    let targets = round2::list_attack_targets(&orchestrator, team_id).await?;
    Ok(HttpResponse::Ok().json(targets))
}

#[get("/meta_lb")]
async fn meta_leaderboard(
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let ranking = round2::meta_leaderboard(&orchestrator).await?;
    Ok(HttpResponse::Ok().json(ranking))
}

// [[API]]
// desp: Defend the own meta team's environment or attack another one
// Method: POST
// URL: /round2/{container_id}/flag
// Request Body: `AttackDefenseRequest`
// Response Body: `SubmissionResponse`
#[post("/{container_id}/flag")]
async fn submit_attack_defense_flag(
    req: HttpRequest,
    path: web::Path<ContainerId>,
    form: web::Json<AttackDefenseRequest>,
    verifier: web::Data<TokenVerifier>,
    orchestrator: web::Data<Orchestrator>,
    cache: web::Data<Cache>,
) -> Result<impl Responder, APIError> {
    let team_id = get_team_id(&req, &verifier)?;
    form.sanity()?;
    let outcome = round2::submit_attack_defense_flag(
        &orchestrator,
        &cache,
        team_id,
        path.into_inner(),
        &form.flag,
    )
    .await?;
    Ok(HttpResponse::Ok().json(outcome.into_response()))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_targets)
        .service(meta_leaderboard)
        .service(submit_attack_defense_flag);
}
