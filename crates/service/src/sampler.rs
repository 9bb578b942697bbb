//! Random-percentage user sampling for segment auto-assignment.

use rand::seq::SliceRandom;

/// Picks a pseudo-random subset of the user base. Deterministic only in
/// distribution, never in which users come back.
pub trait CohortSampler: Send + Sync {
    fn select_percent(&self, users: &[i64], percent: i64) -> Vec<i64>;
}

pub struct RandomSampler;

impl CohortSampler for RandomSampler {
    fn select_percent(&self, users: &[i64], percent: i64) -> Vec<i64> {
        if percent <= 0 || users.is_empty() {
            return Vec::new();
        }
        if percent >= 100 {
            return users.to_vec();
        }

        // Ceiling division so any positive percent over a non-empty user
        // base selects at least one user.
        let count = (users.len() * percent as usize).div_ceil(100);
        let mut rng = rand::thread_rng();
        users.choose_multiple(&mut rng, count).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn zero_or_negative_percent_selects_nobody() {
        let users: Vec<i64> = (1..=10).collect();
        assert!(RandomSampler.select_percent(&users, 0).is_empty());
        assert!(RandomSampler.select_percent(&users, -5).is_empty());
    }

    #[test]
    fn full_percent_selects_everybody() {
        let users: Vec<i64> = (1..=10).collect();
        assert_eq!(RandomSampler.select_percent(&users, 100).len(), 10);
        assert_eq!(RandomSampler.select_percent(&users, 150).len(), 10);
    }

    #[test]
    fn half_percent_selects_half_without_duplicates() {
        let users: Vec<i64> = (1..=10).collect();
        let chosen = RandomSampler.select_percent(&users, 50);
        assert_eq!(chosen.len(), 5);
        let unique: HashSet<i64> = chosen.iter().copied().collect();
        assert_eq!(unique.len(), 5);
        assert!(chosen.iter().all(|id| users.contains(id)));
    }

    #[test]
    fn small_percent_rounds_up_to_one() {
        let users: Vec<i64> = (1..=3).collect();
        assert_eq!(RandomSampler.select_percent(&users, 1).len(), 1);
    }

    #[test]
    fn empty_user_base_is_a_noop() {
        assert!(RandomSampler.select_percent(&[], 50).is_empty());
    }
}
