mod common;

use chrono::Duration;

use common::setup;
use ctf_arena::util::api_util::APIError;
use ctf_arena::util::dashboard::{self, PreEventCredit};
use ctf_arena::util::pre_event::{self, event_today, PreEventSubmission};

#[tokio::test]
async fn todays_flags_pay_their_points_once() {
    let Some(env) = setup().await else { return };
    let today = event_today(&env.config);
    let warmup = env
        .create_pre_event_problem("warmup", 120, "C0D{warm}", today)
        .await;
    let o = &env.orchestrator;

    assert_eq!(
        pre_event::submit_pre_event_flag(o, warmup, "Alice", "alice@uni.in", "C0D{cold}").await,
        Ok(PreEventSubmission {
            status: false,
            coins: 0
        })
    );
    assert_eq!(
        pre_event::submit_pre_event_flag(o, warmup, " ALICE ", "alice@uni.in", " C0D{warm} ")
            .await,
        Ok(PreEventSubmission {
            status: true,
            coins: 120
        })
    );
    assert_eq!(
        pre_event::submit_pre_event_flag(o, warmup, "alice", "alice@uni.in", "C0D{warm}").await,
        Err(APIError::CtfSolved)
    );

    assert_eq!(pre_event::pre_event_coins(o, "Alice").await, Ok(120));
    assert_eq!(pre_event::pre_event_coins(o, "stranger").await, Ok(0));
    env.cleanup().await;
}

#[tokio::test]
async fn only_todays_problems_take_flags() {
    let Some(env) = setup().await else { return };
    let today = event_today(&env.config);
    let current = env
        .create_pre_event_problem("current", 100, "C0D{now}", today)
        .await;
    let past = env
        .create_pre_event_problem("past", 100, "C0D{then}", today - Duration::days(1))
        .await;
    let o = &env.orchestrator;

    assert_eq!(
        pre_event::submit_pre_event_flag(o, past, "alice", "alice@uni.in", "C0D{then}").await,
        Err(APIError::CtfNotFound)
    );
    assert_eq!(
        pre_event::submit_pre_event_flag(o, current + 100, "alice", "alice@uni.in", "C0D{now}")
            .await,
        Err(APIError::CtfNotFound)
    );

    let all: Vec<i32> = pre_event::list_pre_event_problems(o)
        .await
        .unwrap()
        .iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(all, vec![past, current]);
    let live: Vec<i32> = pre_event::today_pre_event_problems(o)
        .await
        .unwrap()
        .iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(live, vec![current]);

    let shown = pre_event::get_pre_event_problem(o, past).await.unwrap();
    assert_eq!(shown.name, "past");
    let json = serde_json::to_value(&shown).unwrap();
    assert!(json.get("flag").is_none());
    assert!(matches!(
        pre_event::get_pre_event_problem(o, current + 100).await,
        Err(APIError::CtfNotFound)
    ));
    env.cleanup().await;
}

#[tokio::test]
async fn an_email_belongs_to_one_tag() {
    let Some(env) = setup().await else { return };
    let today = event_today(&env.config);
    let problem = env
        .create_pre_event_problem("warmup", 100, "C0D{warm}", today)
        .await;
    let o = &env.orchestrator;

    pre_event::submit_pre_event_flag(o, problem, "alice", "shared@uni.in", "C0D{no}")
        .await
        .unwrap();
    assert_eq!(
        pre_event::submit_pre_event_flag(o, problem, "bob", "shared@uni.in", "C0D{warm}").await,
        Err(APIError::UserOrEmailExists)
    );
    assert_eq!(pre_event::pre_event_coins(o, "bob").await, Ok(0));

    // Alice moves to another address, which frees the old one.
    pre_event::submit_pre_event_flag(o, problem, "alice", "alice@uni.in", "C0D{no}")
        .await
        .unwrap();
    assert_eq!(
        pre_event::submit_pre_event_flag(o, problem, "bob", "shared@uni.in", "C0D{warm}").await,
        Ok(PreEventSubmission {
            status: true,
            coins: 100
        })
    );
    env.cleanup().await;
}

#[tokio::test]
async fn leaderboard_sums_points_per_tag() {
    let Some(env) = setup().await else { return };
    let today = event_today(&env.config);
    let small = env.create_pre_event_problem("small", 50, "C0D{s}", today).await;
    let large = env.create_pre_event_problem("large", 200, "C0D{l}", today).await;
    let o = &env.orchestrator;

    for (tag, problem, flag) in [
        ("carol", small, "C0D{s}"),
        ("dave", large, "C0D{l}"),
        ("carol", large, "C0D{l}"),
    ] {
        let email = format!("{tag}@uni.in");
        pre_event::submit_pre_event_flag(o, problem, tag, &email, flag)
            .await
            .unwrap();
    }

    let ranking: Vec<(String, i64)> = pre_event::pre_event_leaderboard(o)
        .await
        .unwrap()
        .into_iter()
        .map(|row| (row.tag, row.points))
        .collect();
    assert_eq!(
        ranking,
        vec![("carol".to_owned(), 250), ("dave".to_owned(), 200)]
    );
    env.cleanup().await;
}

#[tokio::test]
async fn union_pays_each_problem_to_a_team_once() {
    let Some(env) = setup().await else { return };
    let today = event_today(&env.config);
    let first = env.create_team("first", 10, 0).await;
    let second = env.create_team("second", 0, 0).await;
    env.add_member(first, "Alice").await;
    env.add_member(first, "bob").await;
    env.add_member(second, "carol").await;

    let crypto = env.create_pre_event_problem("crypto", 100, "C0D{c}", today).await;
    let forensics = env.create_pre_event_problem("forensics", 50, "C0D{f}", today).await;
    let o = &env.orchestrator;
    for (tag, problem, flag) in [
        ("alice", crypto, "C0D{c}"),
        ("alice", forensics, "C0D{f}"),
        ("bob", crypto, "C0D{c}"),
        ("carol", forensics, "C0D{f}"),
        ("outsider", crypto, "C0D{c}"),
    ] {
        let email = format!("{tag}@uni.in");
        pre_event::submit_pre_event_flag(o, problem, tag, &email, flag)
            .await
            .unwrap();
    }

    let credited = dashboard::admin_convert_pre_event_coins(o).await.unwrap();
    assert_eq!(
        credited,
        vec![
            PreEventCredit {
                team_id: first,
                name: "first".to_owned(),
                earned: 150,
                coins: 160,
            },
            PreEventCredit {
                team_id: second,
                name: "second".to_owned(),
                earned: 50,
                coins: 50,
            },
        ]
    );

    assert!(dashboard::admin_convert_pre_event_coins(o)
        .await
        .unwrap()
        .is_empty());
    let info = dashboard::admin_team_info(o, first).await.unwrap();
    assert_eq!(info.coins, 160);
    let tags: Vec<&str> = info.members.iter().map(|m| m.tag.as_str()).collect();
    assert_eq!(tags, vec!["Alice", "bob"]);

    pre_event::submit_pre_event_flag(o, crypto, "carol", "carol@uni.in", "C0D{c}")
        .await
        .unwrap();
    let credited = dashboard::admin_convert_pre_event_coins(o).await.unwrap();
    assert_eq!(credited.len(), 1);
    assert_eq!(credited[0].team_id, second);
    assert_eq!(credited[0].coins, 150);
    env.cleanup().await;
}

#[tokio::test]
async fn admin_lists_every_team() {
    let Some(env) = setup().await else { return };
    let a = env.create_team("alpha", 5, 0).await;
    let b = env.create_team("beta", 0, 30).await;

    let teams = dashboard::admin_list_teams(&env.orchestrator).await.unwrap();
    let summary: Vec<_> = teams
        .iter()
        .map(|t| (t.id, t.name.as_str(), t.coins, t.points))
        .collect();
    assert_eq!(summary, vec![(a, "alpha", 5, 0), (b, "beta", 0, 30)]);

    let json = serde_json::to_value(&teams[0]).unwrap();
    assert!(json.get("secret_hash").is_none());
    env.cleanup().await;
}
