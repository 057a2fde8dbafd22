use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::Error;
use log::debug;
use moka::future::Cache as MokaCache;
use serde::Serialize;
use tokio::task::JoinHandle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::models::{Problem, ProblemId};
use crate::util::api_util::{ERROR_DB_CONNECTION, ERROR_DB_UNKNOWN};
use crate::DbPool;

use super::{
    api_util::{log_server_error, APIError},
    auto_fetch::{AutoCache, AutoCacheReadHandle, Expiration},
    stat::{fetch_ranking, RankItem},
};

type APICache<K, V> = AutoCache<
    K,
    V,
    Box<dyn Fn(K) -> AutoCacheReadHandle<V, APIError> + Send + Sync>,
    APIError,
>;

pub type RankingLoader = Box<dyn Fn() -> JoinHandle<Result<Vec<RankItem>, APIError>> + Send + Sync>;

/// A rendered leaderboard, served as-is until it expires.
#[derive(Debug)]
pub struct Snapshot {
    pub payload: Arc<String>,
    pub computed_at: DateTime<Utc>,
}

/// Single global leaderboard entry. Reads recompute when the entry outlived its
/// period or when a score-changing path called [`LeaderboardCache::force_expire`].
pub struct LeaderboardCache {
    snapshot: MokaCache<(), Arc<Snapshot>>,
    force_expire: AtomicBool,
    loader: RankingLoader,
}

impl LeaderboardCache {
    pub fn new(period: Duration, loader: RankingLoader) -> Self {
        Self {
            snapshot: MokaCache::builder()
                .max_capacity(1)
                .time_to_live(period)
                .build(),
            force_expire: AtomicBool::new(false),
            loader,
        }
    }

    pub fn force_expire(&self) {
        self.force_expire.store(true, Ordering::Release);
    }

    pub fn is_force_expired(&self) -> bool {
        self.force_expire.load(Ordering::Acquire)
    }

    pub async fn get(&self) -> Result<Arc<Snapshot>, APIError> {
        // Clear the flag before loading so an expiry raised mid-load is kept.
        let forced = self.force_expire.swap(false, Ordering::AcqRel);
        if !forced {
            if let Some(snapshot) = self.snapshot.get(&()).await {
                debug!("Serving cached leaderboard from {}", snapshot.computed_at);
                return Ok(snapshot);
            }
        }

        let rendered = match (self.loader)().await {
            Ok(Ok(rows)) => serde_json::to_string(&rows)
                .map_err(|e| log_server_error(e, "leaderboard", ERROR_DB_UNKNOWN)),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(APIError::from(e)),
        };

        let payload = match rendered {
            Ok(payload) => payload,
            Err(e) => {
                if forced {
                    self.force_expire();
                }
                return Err(e);
            }
        };

        let snapshot = Arc::new(Snapshot {
            payload: Arc::new(payload),
            computed_at: Utc::now(),
        });
        debug!("Recomputed leaderboard at {}", snapshot.computed_at);
        self.snapshot.insert((), snapshot.clone()).await;
        Ok(snapshot)
    }

    pub async fn age(&self) -> Option<chrono::Duration> {
        self.snapshot
            .get(&())
            .await
            .map(|snapshot| Utc::now() - snapshot.computed_at)
    }
}

pub struct Cache {
    pub problem_cache: APICache<ProblemId, Arc<Problem>>,
    pub leaderboard: LeaderboardCache,
}

#[derive(Debug, Serialize)]
pub struct CacheStatusResponse {
    problem: (usize, usize),
    leaderboard_age_secs: Option<i64>,
    leaderboard_force_expired: bool,
}

fn fetchdb_problem(pool: DbPool, problem_id: ProblemId) -> AutoCacheReadHandle<Arc<Problem>, APIError> {
    use crate::schema::problem::dsl::*;
    use diesel_async::RunQueryDsl;

    tokio::spawn(async move {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| log_server_error(e, "cache", ERROR_DB_CONNECTION))?;
        match RunQueryDsl::first::<Problem>(
            problem
                .filter(id.eq(problem_id))
                .select(Problem::as_select()),
            &mut conn,
        )
        .await
        {
            Ok(p) => Ok((Arc::new(p), Expiration::Middle)),
            Err(Error::NotFound) => Err(APIError::CtfNotFound),
            Err(err) => Err(log_server_error(err, "cache", ERROR_DB_CONNECTION)),
        }
    })
}

fn fetchdb_ranking(pool: DbPool) -> JoinHandle<Result<Vec<RankItem>, APIError>> {
    tokio::spawn(async move {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| log_server_error(e, "leaderboard", ERROR_DB_CONNECTION))?;
        fetch_ranking(&mut conn).await
    })
}

impl Cache {
    pub fn new(pool: DbPool, leaderboard_period: Duration) -> Self {
        let fetch_closure_problem = {
            let pool = pool.clone();
            Box::new(move |key| fetchdb_problem(pool.clone(), key))
        };

        let fetch_closure_ranking = Box::new(move || fetchdb_ranking(pool.clone()));

        Self {
            problem_cache: AutoCache::new(256, fetch_closure_problem),
            leaderboard: LeaderboardCache::new(leaderboard_period, fetch_closure_ranking),
        }
    }

    pub async fn get_size(&self) -> CacheStatusResponse {
        CacheStatusResponse {
            problem: self.problem_cache.size(),
            leaderboard_age_secs: self.leaderboard.age().await.map(|age| age.num_seconds()),
            leaderboard_force_expired: self.leaderboard.is_force_expired(),
        }
    }

    /// Hidden problems are reported as missing unless `visible_only` is off.
    pub async fn query_problem_cached(
        &self,
        problem_id: ProblemId,
        visible_only: bool,
    ) -> Result<Arc<Problem>, APIError> {
        let problem = self.problem_cache.get(problem_id).await?;
        if visible_only && !problem.visible {
            return Err(APIError::CtfNotFound);
        }
        Ok(problem)
    }

    pub async fn invalidate_problem(&self, problem_id: ProblemId) {
        self.problem_cache.invalidate(problem_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_leaderboard(period: Duration, loads: Arc<AtomicUsize>) -> LeaderboardCache {
        LeaderboardCache::new(
            period,
            Box::new(move || {
                let loads = loads.clone();
                tokio::spawn(async move {
                    let n = loads.fetch_add(1, Ordering::SeqCst) as i64;
                    Ok(vec![RankItem {
                        team_id: 1,
                        name: "alpha".to_owned(),
                        tpoints: 100 + n,
                    }])
                })
            }),
        )
    }

    #[tokio::test]
    async fn snapshot_is_reused_within_period() {
        let loads = Arc::new(AtomicUsize::new(0));
        let board = counting_leaderboard(Duration::from_secs(30), loads.clone());

        let first = board.get().await.unwrap();
        let second = board.get().await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first.payload, &second.payload));
        assert_eq!(*first.payload, r#"[{"name":"alpha","tpoints":100}]"#);
    }

    #[tokio::test]
    async fn force_expire_triggers_exactly_one_reload() {
        let loads = Arc::new(AtomicUsize::new(0));
        let board = counting_leaderboard(Duration::from_secs(30), loads.clone());

        board.get().await.unwrap();
        board.force_expire();
        assert!(board.is_force_expired());

        let fresh = board.get().await.unwrap();
        assert_eq!(*fresh.payload, r#"[{"name":"alpha","tpoints":101}]"#);
        assert!(!board.is_force_expired());

        board.get().await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_reload_keeps_the_expiry_request() {
        let board = LeaderboardCache::new(
            Duration::from_secs(30),
            Box::new(|| tokio::spawn(async { Err(APIError::TeamNotFound) })),
        );
        board.force_expire();
        assert_eq!(board.get().await.unwrap_err(), APIError::TeamNotFound);
        assert!(board.is_force_expired());
    }

    #[tokio::test]
    async fn snapshot_expires_after_period() {
        let loads = Arc::new(AtomicUsize::new(0));
        let board = counting_leaderboard(Duration::from_millis(50), loads.clone());

        board.get().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        board.get().await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
