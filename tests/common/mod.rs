#![allow(dead_code)]

mod fake_runtime;

use std::sync::Arc;
use std::time::Duration;

use diesel::prelude::*;
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use tempfile::TempDir;

use ctf_arena::config::Config;
use ctf_arena::db::run_migrations;
use ctf_arena::models::{ProblemId, TeamId};
use ctf_arena::util::cache::Cache;
use ctf_arena::util::cipher_util::TokenVerifier;
use ctf_arena::util::environment::Orchestrator;
use ctf_arena::DbPool;

pub use fake_runtime::{FakeRuntime, FIRST_HOST_PORT};

pub struct TestEnv {
    pub pool: DbPool,
    pub runtime: Arc<FakeRuntime>,
    pub orchestrator: Arc<Orchestrator>,
    pub cache: Arc<Cache>,
    pub config: Arc<Config>,
    pub static_root: TempDir,
    base_url: String,
    schema: String,
}

fn with_search_path(url: &str, schema: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}options=-csearch_path%3D{schema}")
}

pub fn test_config(static_root: &TempDir) -> Config {
    Config {
        max_containers_per_team: 3,
        flag_command: vec!["/bin/gen_flag".to_owned()],
        hint_cost: 10,
        static_root: static_root.path().to_path_buf(),
        static_base_url: "http://arena.test/static".to_owned(),
        token_secret: "test-secret".to_owned(),
        meta_team_count: 2,
        shutdown_budget: Duration::from_secs(5),
        ..Config::default()
    }
}

/// Fresh schema with migrations applied, or `None` when no test database is
/// configured.
pub async fn setup() -> Option<TestEnv> {
    setup_with(|_| {}).await
}

pub async fn setup_with(tweak: impl FnOnce(&mut Config)) -> Option<TestEnv> {
    let Ok(base_url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL is not set, skipping database test");
        return None;
    };

    let schema = format!("arena_test_{}", uuid::Uuid::new_v4().simple());
    let url = with_search_path(&base_url, &schema);

    {
        let base_url = base_url.clone();
        let schema = schema.clone();
        let url = url.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = PgConnection::establish(&base_url).unwrap();
            diesel::RunQueryDsl::execute(
                diesel::sql_query(format!("CREATE SCHEMA {schema}")),
                &mut conn,
            )
            .unwrap();
            let mut conn = PgConnection::establish(&url).unwrap();
            run_migrations(&mut conn).unwrap();
        })
        .await
        .unwrap();
    }

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(url);
    let pool: DbPool = Pool::builder().max_size(16).build(manager).await.unwrap();

    let static_root = tempfile::tempdir().unwrap();
    let mut config = test_config(&static_root);
    tweak(&mut config);
    let config = Arc::new(config);

    let runtime = Arc::new(FakeRuntime::default());
    let verifier = Arc::new(TokenVerifier::new(&config.token_secret).unwrap());
    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        runtime.clone(),
        verifier,
        config.clone(),
    ));
    let cache = Arc::new(Cache::new(pool.clone(), config.leaderboard_period));

    Some(TestEnv {
        pool,
        runtime,
        orchestrator,
        cache,
        config,
        static_root,
        base_url,
        schema,
    })
}

impl TestEnv {
    pub async fn cleanup(self) {
        let TestEnv {
            pool,
            base_url,
            schema,
            ..
        } = self;
        drop(pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = PgConnection::establish(&base_url).unwrap();
            diesel::RunQueryDsl::execute(
                diesel::sql_query(format!("DROP SCHEMA {schema} CASCADE")),
                &mut conn,
            )
            .unwrap();
        })
        .await
        .unwrap();
    }

    pub async fn create_team(&self, team_name: &str, coins: i32, points: i32) -> TeamId {
        use ctf_arena::schema::team::dsl as team_dsl;
        let mut conn = self.pool.get().await.unwrap();
        diesel::insert_into(team_dsl::team)
            .values((
                team_dsl::name.eq(team_name),
                team_dsl::secret_hash.eq("x"),
                team_dsl::coins.eq(coins),
                team_dsl::points.eq(points),
            ))
            .returning(team_dsl::id)
            .get_result(&mut conn)
            .await
            .unwrap()
    }

    pub async fn create_problem(&self, seed: ProblemSeed<'_>) -> ProblemId {
        use ctf_arena::schema::problem::dsl::*;
        let mut conn = self.pool.get().await.unwrap();
        diesel::insert_into(problem)
            .values((
                name.eq(seed.name),
                description.eq("desc"),
                author.eq("author"),
                points.eq(seed.max_points),
                min_points.eq(seed.min_points),
                max_points.eq(seed.max_points),
                visible.eq(seed.visible),
                image_name.eq(Some("arena/challenge:latest")),
                guest_ports.eq(seed.guest_ports.iter().map(|p| p.to_string()).collect::<Vec<_>>()),
                is_static.eq(seed.is_static),
            ))
            .returning(id)
            .get_result(&mut conn)
            .await
            .unwrap()
    }

    /// Hints with orders `0..count`.
    pub async fn add_hints(&self, problem: ProblemId, count: i16) {
        use ctf_arena::schema::hint::dsl::*;
        let mut conn = self.pool.get().await.unwrap();
        let rows: Vec<_> = (0..count)
            .map(|order| {
                (
                    problem_id.eq(problem),
                    ord.eq(order),
                    text.eq(format!("hint {order}")),
                )
            })
            .collect();
        diesel::insert_into(hint)
            .values(rows)
            .execute(&mut conn)
            .await
            .unwrap();
    }

    pub async fn create_r2_problem(&self, problem_name: &str, problem_points: i32) -> i32 {
        use ctf_arena::schema::r2_problem::dsl::*;
        let mut conn = self.pool.get().await.unwrap();
        diesel::insert_into(r2_problem)
            .values((
                name.eq(problem_name),
                description.eq("desc"),
                author.eq("author"),
                points.eq(problem_points),
                image_name.eq("arena/r2:latest"),
                guest_ports.eq(vec!["1337".to_owned()]),
            ))
            .returning(id)
            .get_result(&mut conn)
            .await
            .unwrap()
    }

    pub async fn create_pre_event_problem(
        &self,
        problem_name: &str,
        problem_points: i32,
        problem_flag: &str,
        day: chrono::NaiveDate,
    ) -> i32 {
        use ctf_arena::schema::pre_event_problem::dsl::*;
        let mut conn = self.pool.get().await.unwrap();
        diesel::insert_into(pre_event_problem)
            .values((
                name.eq(problem_name),
                description.eq("desc"),
                author.eq("author"),
                points.eq(problem_points),
                flag.eq(problem_flag),
                live_on.eq(day),
            ))
            .returning(id)
            .get_result(&mut conn)
            .await
            .unwrap()
    }

    pub async fn add_member(&self, team: TeamId, member_tag: &str) {
        use ctf_arena::schema::member::dsl::*;
        let mut conn = self.pool.get().await.unwrap();
        diesel::insert_into(member)
            .values((
                tag.eq(member_tag),
                name.eq(format!("{member_tag} name")),
                team_id.eq(team),
            ))
            .execute(&mut conn)
            .await
            .unwrap();
    }

    pub async fn container_rows(&self, team: TeamId, problem: ProblemId) -> i64 {
        use ctf_arena::schema::container::dsl::*;
        let mut conn = self.pool.get().await.unwrap();
        container
            .filter(team_id.eq(team))
            .filter(problem_id.eq(problem))
            .count()
            .get_result(&mut conn)
            .await
            .unwrap()
    }

    /// Environment row with no port rows, as if written by another replica.
    pub async fn insert_container_row(&self, team: TeamId, problem: ProblemId, docker: &str) {
        use ctf_arena::schema::container::dsl::*;
        let mut conn = self.pool.get().await.unwrap();
        diesel::insert_into(container)
            .values((
                docker_id.eq(docker),
                name.eq(docker),
                team_id.eq(team),
                problem_id.eq(problem),
                flag.eq("C0D{stale}"),
            ))
            .execute(&mut conn)
            .await
            .unwrap();
    }

    pub async fn total_container_rows(&self) -> i64 {
        use ctf_arena::schema::container::dsl::*;
        let mut conn = self.pool.get().await.unwrap();
        container.count().get_result(&mut conn).await.unwrap()
    }

    pub async fn total_port_rows(&self) -> i64 {
        use ctf_arena::schema::port::dsl::*;
        let mut conn = self.pool.get().await.unwrap();
        port.count().get_result(&mut conn).await.unwrap()
    }

    /// Runtime id of the team's environment for the problem.
    pub async fn docker_id_of(&self, team: TeamId, problem: ProblemId) -> String {
        use ctf_arena::schema::container::dsl::*;
        let mut conn = self.pool.get().await.unwrap();
        container
            .filter(team_id.eq(team))
            .filter(problem_id.eq(problem))
            .select(docker_id)
            .first(&mut conn)
            .await
            .unwrap()
    }

    pub async fn flag_for(&self, team: TeamId, problem: ProblemId) -> String {
        let docker_id = self.docker_id_of(team, problem).await;
        self.runtime.flag_of(&docker_id).unwrap()
    }

    pub async fn problem_points(&self, problem_id: ProblemId) -> i32 {
        use ctf_arena::schema::problem::dsl as problem_dsl;
        let mut conn = self.pool.get().await.unwrap();
        problem_dsl::problem
            .filter(problem_dsl::id.eq(problem_id))
            .select(problem_dsl::points)
            .first(&mut conn)
            .await
            .unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct ProblemSeed<'a> {
    pub name: &'a str,
    pub min_points: i32,
    pub max_points: i32,
    pub visible: bool,
    pub is_static: bool,
    pub guest_ports: &'a [u16],
}

impl Default for ProblemSeed<'_> {
    fn default() -> Self {
        Self {
            name: "pwn",
            min_points: 50,
            max_points: 500,
            visible: true,
            is_static: false,
            guest_ports: &[22, 8080],
        }
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..50 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
