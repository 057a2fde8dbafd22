use actix_web::http::header::ContentType;
use actix_web::{get, web, HttpResponse, Responder};

use crate::util::api_util::APIError;
use crate::util::cache::Cache;

// [[API]]
// desp: Ranked teams, served from the shared snapshot
// Method: GET
// URL: /leaderboard
// Response Body: `[RankItem]`
#[get("/leaderboard")]
pub async fn get_leaderboard(cache: web::Data<Cache>) -> Result<impl Responder, APIError> {
    let snapshot = cache.leaderboard.get().await?;
    Ok(HttpResponse::Ok()
        .content_type(ContentType::json())
        .body(snapshot.payload.as_ref().clone()))
}
