use crate::config::Config;
use crate::util::cache::Cache;

use crate::util::api_util::*;
use actix_web::{get, web, HttpRequest, HttpResponse, Responder};

#[get("/cache_status")]
pub async fn cache_status(
    req: HttpRequest,
    config: web::Data<Config>,
    cache: web::Data<Cache>,
) -> Result<impl Responder, APIError> {
    admin_check(&req, &config)?;
    Ok(HttpResponse::Ok().json(cache.get_size().await))
}
