use log::warn;

/// Solve count at which a problem has lost `tanh(1)` of its decaying share.
pub const DECAY_SCALE: f64 = 25.0;

/// Current value of a problem solved by `solves` teams. Starts at `max_points` and
/// approaches `min_points` without ever crossing it.
pub fn decayed_points(min_points: i32, max_points: i32, solves: i64) -> i32 {
    let span = f64::from(max_points - min_points);
    let decay = 1.0 - (solves.max(0) as f64 / DECAY_SCALE).tanh();
    (f64::from(min_points) + span * decay).round_ties_even() as i32
}

/// Percentage taken off a problem for a hint revealed without paying coins.
pub fn hint_penalty(order: i16) -> i32 {
    match order {
        0 => 10,
        1 => 5,
        2 => 10,
        other => {
            warn!("Hint order {other} has no penalty entry, counting it as free");
            0
        }
    }
}

/// Fraction of a problem's points a team keeps, given the orders of the hints it
/// revealed at point cost.
pub fn penalty_multiplier<I>(orders: I) -> f64
where
    I: IntoIterator<Item = i16>,
{
    let total: i32 = orders.into_iter().map(hint_penalty).sum();
    f64::from((100 - total).max(0)) / 100.0
}

/// Listing value of a problem for one team. Truncates, matching what teams saw
/// before solving.
pub fn displayed_points(points: i32, multiplier: f64) -> i32 {
    (f64::from(points) * multiplier) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintCharge {
    /// Paid with coins, no point penalty.
    Coins(i32),
    /// Balance too low: the hint is granted and will cost points on solve.
    Points,
}

impl HintCharge {
    pub fn with_points(self) -> bool {
        matches!(self, HintCharge::Points)
    }
}

pub fn charge_for_hint(balance: i32, cost: i32) -> HintCharge {
    if balance < cost {
        HintCharge::Points
    } else {
        HintCharge::Coins(cost)
    }
}

/// One-time bonus for validating the own meta team's environment.
pub fn defense_reward(points: i32) -> i32 {
    (f64::from(points) / 6.0).round_ties_even() as i32
}

/// Credited to the attacking team; its meta team receives the full `points`.
pub fn attack_reward(points: i32) -> i32 {
    (f64::from(points) / 4.0).round_ties_even() as i32
}
