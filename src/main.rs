extern crate diesel;
extern crate dotenv;

use std::io;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::dev::RequestHead;
use actix_web::http::header::HeaderValue;
use actix_web::{web, App, HttpServer};

use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use log::{info, warn};

use ctf_arena::api::{admin, ctf, leaderboard, pre_event, round2};
use ctf_arena::config::Config;
use ctf_arena::db::run_migrations;
use ctf_arena::util::cache::Cache;
use ctf_arena::util::cipher_util::TokenVerifier;
use ctf_arena::util::environment::Orchestrator;
use ctf_arena::util::runtime::{ContainerRuntime, DockerRuntime};
use ctf_arena::DbPool;

fn cors_check(origins: &[String], head: &HeaderValue) -> bool {
    match head.to_str() {
        Ok(origin) => origins.iter().any(|allowed| allowed == origin),
        Err(_) => false,
    }
}

async fn migrate(database_url: String) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut conn = PgConnection::establish(&database_url).map_err(io::Error::other)?;
        run_migrations(&mut conn).map_err(io::Error::other)
    })
    .await
    .map_err(io::Error::other)?
}

#[actix_rt::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Arc::new(Config::from_env().map_err(|e| io::Error::other(e.to_string()))?);

    migrate(config.database_url.clone()).await?;
    info!("Migrations applied");

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
    let pool: DbPool = Pool::builder()
        .build(manager)
        .await
        .map_err(io::Error::other)?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(config.docker_socket.as_deref())
            .await
            .map_err(|e| io::Error::other(e.to_string()))?,
    );
    let verifier = Arc::new(
        TokenVerifier::new(&config.token_secret).map_err(|e| io::Error::other(e.to_string()))?,
    );
    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        runtime.clone(),
        verifier.clone(),
        config.clone(),
    ));
    let cache = Arc::new(Cache::new(pool, config.leaderboard_period));

    match orchestrator.reap_orphans().await {
        Ok(reaped) if !reaped.is_empty() => warn!("Reaped {} orphaned containers", reaped.len()),
        Ok(_) => {}
        Err(e) => warn!("Startup orphan sweep failed: {e}"),
    }

    let bind_addr = config.bind_addr.clone();
    let server = {
        let orchestrator = orchestrator.clone();
        HttpServer::new(move || {
            let cors = if config.development {
                Cors::permissive()
            } else {
                let origins = config.cors_origins.clone();
                Cors::default()
                    .allowed_origin_fn(move |head: &HeaderValue, _: &RequestHead| {
                        cors_check(&origins, head)
                    })
                    .allow_any_header()
                    .allow_any_method()
            };

            App::new()
                .app_data(web::Data::from(config.clone()))
                .app_data(web::Data::from(verifier.clone()))
                .app_data(web::Data::from(orchestrator.clone()))
                .app_data(web::Data::from(cache.clone()))
                .wrap(cors)
                .service(leaderboard::get_leaderboard)
                .service(web::scope("/ctf").configure(ctf::configure))
                .service(web::scope("/round2").configure(round2::configure))
                .service(web::scope("/pre").configure(pre_event::configure))
                .service(web::scope("/admin").configure(admin::configure))
        })
        .bind(bind_addr)?
        .run()
    };

    let served = server.await;

    let released = orchestrator.shutdown_sweep().await;
    info!("Released {released} environments on shutdown");
    runtime.close().await;

    served
}
