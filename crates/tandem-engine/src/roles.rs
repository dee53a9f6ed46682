//! Role allocation at session start.

use rand::seq::SliceRandom;
use rand::Rng;

use tandem_core::definition::SessionDefinition;
use tandem_core::ids::UserId;

/// Assign exactly one role to every participant.
///
/// Every role first gets its `minCount` seats in definition order; callers
/// must seat at least the sum of those minimums. Remaining participants draw
/// from a pool holding each role's declared extra seats (`maxCount -
/// minCount`; a role without `maxCount` declares none). Should the pool run
/// dry, the last role absorbs the rest. The seat list is shuffled before it
/// is handed out.
pub fn assign_roles<R: Rng>(
    definition: &SessionDefinition,
    participants: &[UserId],
    rng: &mut R,
) -> Vec<(UserId, String)> {
    let n = participants.len();
    let mut seats: Vec<&str> = Vec::with_capacity(n);

    for role in &definition.roles {
        seats.extend(std::iter::repeat(role.name.as_str()).take(role.min_count));
    }

    let mut pool: Vec<&str> = definition
        .roles
        .iter()
        .flat_map(|role| {
            let extra = role
                .max_count
                .map_or(0, |max| max.saturating_sub(role.min_count));
            std::iter::repeat(role.name.as_str()).take(extra)
        })
        .collect();

    while seats.len() < n {
        if pool.is_empty() {
            // Capacity exhausted: overflow into the final role.
            match definition.roles.last() {
                Some(last) => seats.push(last.name.as_str()),
                None => break,
            }
        } else {
            let pick = rng.gen_range(0..pool.len());
            seats.push(pool.swap_remove(pick));
        }
    }

    seats.shuffle(rng);
    participants
        .iter()
        .cloned()
        .zip(seats.into_iter().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use std::collections::HashMap;

    fn definition(roles: serde_json::Value) -> SessionDefinition {
        serde_json::from_value(json!({
            "name": "mafia",
            "minPlayers": 1,
            "maxPlayers": 20,
            "roles": roles,
            "phases": [{"name": "night"}]
        }))
        .unwrap()
    }

    fn users(n: usize) -> Vec<UserId> {
        (0..n).map(|i| UserId::from_raw(format!("u{i}"))).collect()
    }

    fn counts(assigned: &[(UserId, String)]) -> HashMap<&str, usize> {
        let mut out = HashMap::new();
        for (_, role) in assigned {
            *out.entry(role.as_str()).or_default() += 1;
        }
        out
    }

    #[test]
    fn every_participant_gets_exactly_one_role_and_minimums_hold() {
        let def = definition(json!([
            {"name": "mafia", "minCount": 1, "maxCount": 2},
            {"name": "doctor", "minCount": 1, "maxCount": 1},
            {"name": "villager", "minCount": 2}
        ]));
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let players = users(7);
            let assigned = assign_roles(&def, &players, &mut rng);

            assert_eq!(assigned.len(), players.len());
            let ids: Vec<_> = assigned.iter().map(|(u, _)| u.clone()).collect();
            assert_eq!(ids, players);

            let c = counts(&assigned);
            assert!(c["mafia"] >= 1 && c["mafia"] <= 2);
            assert_eq!(c["doctor"], 1);
            assert!(c["villager"] >= 2);
        }
    }

    #[test]
    fn overflow_repeats_final_role() {
        let def = definition(json!([
            {"name": "judge", "minCount": 1, "maxCount": 1},
            {"name": "juror", "minCount": 1, "maxCount": 2}
        ]));
        let mut rng = StdRng::seed_from_u64(7);
        let assigned = assign_roles(&def, &users(5), &mut rng);
        let c = counts(&assigned);
        assert_eq!(c["judge"], 1);
        assert_eq!(c["juror"], 4);
    }

    #[test]
    fn roles_without_max_count_add_no_pool_seats() {
        let def = definition(json!([
            {"name": "villager", "minCount": 1},
            {"name": "wolf", "minCount": 1, "maxCount": 1}
        ]));
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let assigned = assign_roles(&def, &users(5), &mut rng);
            let c = counts(&assigned);
            assert_eq!(c["villager"], 1);
            assert_eq!(c["wolf"], 4);
        }
    }

    #[test]
    fn declared_extra_seats_fill_before_overflow() {
        let def = definition(json!([
            {"name": "seer", "minCount": 0, "maxCount": 1},
            {"name": "villager", "minCount": 1}
        ]));
        let mut rng = StdRng::seed_from_u64(11);
        let assigned = assign_roles(&def, &users(4), &mut rng);
        let c = counts(&assigned);
        assert_eq!(c["seer"], 1);
        assert_eq!(c["villager"], 3);
    }

    #[test]
    fn no_participants_no_assignments() {
        let def = definition(json!([{"name": "a", "minCount": 1}]));
        let mut rng = StdRng::seed_from_u64(1);
        assert!(assign_roles(&def, &[], &mut rng).is_empty());
    }
}
