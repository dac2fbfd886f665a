//! Wait-time estimate reported by sensor nodes.

/// Reported instead of a minute count when the queue clears in under a minute.
pub const UNDER_A_MINUTE: &str = "0.9";

/// Estimate the queue wait for `people` waiting at `secs_per_person` each.
///
/// Under a minute is reported as [`UNDER_A_MINUTE`]; anything longer is
/// rounded up to whole minutes and prefixed with `~`.
pub fn estimate(people: u32, secs_per_person: u32) -> String {
    let secs = u64::from(people) * u64::from(secs_per_person);
    if secs < 60 {
        UNDER_A_MINUTE.to_string()
    } else {
        format!("~{}", secs.div_ceil(60))
    }
}
