use actix_web::{get, post, web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use crate::models::PreEventProblemId;
use crate::util::api_util::*;
use crate::util::environment::Orchestrator;
use crate::util::pre_event;

const MAX_TAG_LENGTH: usize = 128;
const MAX_EMAIL_LENGTH: usize = 254;
const MAX_FLAG_LENGTH: usize = 256;

#[derive(Debug, Deserialize)]
struct PreEventFlagRequest {
    tag: String,
    email: String,
    flag: String,
}

impl APIRequest for PreEventFlagRequest {
    fn ok(&self) -> bool {
        let tag = self.tag.trim();
        let email = self.email.trim();
        let flag = self.flag.trim();
        !tag.is_empty()
            && tag.len() <= MAX_TAG_LENGTH
            && email.len() <= MAX_EMAIL_LENGTH
            && matches!(email.split_once('@'), Some((user, host)) if !user.is_empty() && !host.is_empty())
            && !flag.is_empty()
            && flag.len() <= MAX_FLAG_LENGTH
    }
}

#[derive(Debug, Serialize)]
struct CoinsResponse {
    tag: String,
    coins: i64,
}

#[get("/list")]
async fn list(orchestrator: web::Data<Orchestrator>) -> Result<impl Responder, APIError> {
    let problems = pre_event::list_pre_event_problems(&orchestrator).await?;
    Ok(HttpResponse::Ok().json(problems))
}

// [[API]]
// desp: Problems live today, in the event's time zone
// Method: GET
// URL: /pre/today
#[get("/today")]
async fn today(orchestrator: web::Data<Orchestrator>) -> Result<impl Responder, APIError> {
    let problems = pre_event::today_pre_event_problems(&orchestrator).await?;
    Ok(HttpResponse::Ok().json(problems))
}

#[get("/leaderboard")]
async fn leaderboard(orchestrator: web::Data<Orchestrator>) -> Result<impl Responder, APIError> {
    let ranking = pre_event::pre_event_leaderboard(&orchestrator).await?;
    Ok(HttpResponse::Ok().json(ranking))
}

#[get("/coins/{tag}")]
async fn coins(
    path: web::Path<String>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let tag = pre_event::normalize_tag(&path);
    let coins = pre_event::pre_event_coins(&orchestrator, &tag).await?;
    Ok(HttpResponse::Ok().json(CoinsResponse { tag, coins }))
}

// [[API]]
// desp: Submit a flag for one of today's problems. The tag is registered with the
//       given email on first use
// Method: POST
// URL: /pre/{ctf_id}/flag
// Request Body: `PreEventFlagRequest`
// Response Body: `PreEventSubmission`
#[post("/{ctf_id}/flag")]
async fn submit_flag(
    path: web::Path<PreEventProblemId>,
    form: web::Json<PreEventFlagRequest>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    form.sanity()?;
    let submission = pre_event::submit_pre_event_flag(
        &orchestrator,
        path.into_inner(),
        &form.tag,
        &form.email,
        &form.flag,
    )
    .await?;
    Ok(HttpResponse::Ok().json(submission))
}

#[get("/{ctf_id}")]
async fn problem(
    path: web::Path<PreEventProblemId>,
    orchestrator: web::Data<Orchestrator>,
) -> Result<impl Responder, APIError> {
    let problem = pre_event::get_pre_event_problem(&orchestrator, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(problem))
}

/// Literal routes first, `/{ctf_id}` would shadow them.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list)
        .service(today)
        .service(leaderboard)
        .service(coins)
        .service(submit_flag)
        .service(problem);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tag: &str, email: &str, flag: &str) -> PreEventFlagRequest {
        PreEventFlagRequest {
            tag: tag.to_owned(),
            email: email.to_owned(),
            flag: flag.to_owned(),
        }
    }

    #[test]
    fn submissions_need_a_tag_an_email_and_a_flag() {
        assert!(request("code-1", "a@b.in", "C0D{x}").sanity().is_ok());
        assert_eq!(
            request(" ", "a@b.in", "C0D{x}").sanity(),
            Err(APIError::InvalidFormData)
        );
        assert_eq!(
            request("code-1", "nobody", "C0D{x}").sanity(),
            Err(APIError::InvalidFormData)
        );
        assert_eq!(
            request("code-1", "@b.in", "C0D{x}").sanity(),
            Err(APIError::InvalidFormData)
        );
        assert_eq!(
            request("code-1", "a@b.in", "").sanity(),
            Err(APIError::InvalidFormData)
        );
        assert_eq!(
            request(&"t".repeat(129), "a@b.in", "C0D{x}").sanity(),
            Err(APIError::InvalidFormData)
        );
    }
}
