pub mod admin;
pub mod ctf;
pub mod leaderboard;
pub mod monitor;
pub mod pre_event;
pub mod round2;
