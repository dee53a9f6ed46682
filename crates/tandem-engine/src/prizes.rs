use tandem_core::definition::{PrizeRule, PrizeSplit};
use tandem_core::ids::UserId;
use tandem_core::session::PrizeAward;

/// Split the pool among `winners` (in seat order). Integer amounts; any
/// rounding remainder goes to the first winner. Percentage shares beyond the
/// number of winners are not paid out.
pub fn distribute(rule: &PrizeRule, winners: &[UserId]) -> Vec<PrizeAward> {
    let Some(first) = winners.first() else {
        return Vec::new();
    };
    if rule.pool == 0 {
        return Vec::new();
    }

    let mut amounts: Vec<u64> = match &rule.split {
        PrizeSplit::WinnerTakesAll => {
            return vec![PrizeAward {
                user_id: first.clone(),
                amount: rule.pool,
            }];
        }
        PrizeSplit::Equal => {
            let each = rule.pool / winners.len() as u64;
            vec![each; winners.len()]
        }
        PrizeSplit::Percentages { shares } => winners
            .iter()
            .enumerate()
            .map(|(i, _)| shares.get(i).map_or(0, |pct| percent_of(rule.pool, u64::from(*pct))))
            .collect(),
    };

    let paid_shares: u64 = match &rule.split {
        PrizeSplit::Percentages { shares } => shares.iter().take(winners.len()).map(|p| u64::from(*p)).sum(),
        _ => 100,
    };
    let owed = percent_of(rule.pool, paid_shares.min(100));
    let paid = amounts.iter().fold(0u64, |sum, a| sum.saturating_add(*a));
    amounts[0] = amounts[0].saturating_add(owed.saturating_sub(paid));

    winners
        .iter()
        .zip(amounts)
        .filter(|(_, amount)| *amount > 0)
        .map(|(user_id, amount)| PrizeAward {
            user_id: user_id.clone(),
            amount,
        })
        .collect()
}

/// `pct` percent of `pool`, rounded down. Widened so large pools cannot
/// overflow.
fn percent_of(pool: u64, pct: u64) -> u64 {
    let share = u128::from(pool) * u128::from(pct) / 100;
    u64::try_from(share).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn winners(n: usize) -> Vec<UserId> {
        (0..n).map(|i| UserId::from_raw(format!("w{i}"))).collect()
    }

    fn amounts(awards: &[PrizeAward]) -> Vec<u64> {
        awards.iter().map(|a| a.amount).collect()
    }

    #[test]
    fn equal_split_gives_remainder_to_first() {
        let rule = PrizeRule { pool: 100, split: PrizeSplit::Equal };
        let awards = distribute(&rule, &winners(3));
        assert_eq!(amounts(&awards), vec![34, 33, 33]);
        assert_eq!(awards[0].user_id.as_str(), "w0");
    }

    #[test]
    fn percentages_follow_seat_order() {
        let rule = PrizeRule {
            pool: 1000,
            split: PrizeSplit::Percentages { shares: vec![50, 30, 20] },
        };
        assert_eq!(amounts(&distribute(&rule, &winners(3))), vec![500, 300, 200]);
        // Only two winners: the third share stays in the pool.
        assert_eq!(amounts(&distribute(&rule, &winners(2))), vec![500, 300]);
    }

    #[test]
    fn percentage_rounding_goes_to_first() {
        let rule = PrizeRule {
            pool: 10,
            split: PrizeSplit::Percentages { shares: vec![33, 33, 34] },
        };
        let awards = distribute(&rule, &winners(3));
        assert_eq!(amounts(&awards).iter().sum::<u64>(), 10);
        assert_eq!(amounts(&awards), vec![4, 3, 3]);
    }

    #[test]
    fn pools_near_the_integer_limit_split_exactly() {
        let rule = PrizeRule {
            pool: u64::MAX,
            split: PrizeSplit::Percentages { shares: vec![50, 50] },
        };
        let awards = amounts(&distribute(&rule, &winners(2)));
        assert_eq!(awards, vec![u64::MAX / 2 + 1, u64::MAX / 2]);

        let rule = PrizeRule { pool: u64::MAX, split: PrizeSplit::Equal };
        let awards = amounts(&distribute(&rule, &winners(3)));
        assert_eq!(awards.iter().map(|a| u128::from(*a)).sum::<u128>(), u128::from(u64::MAX));
    }

    #[test]
    fn winner_takes_all() {
        let rule = PrizeRule { pool: 70, split: PrizeSplit::WinnerTakesAll };
        let awards = distribute(&rule, &winners(4));
        assert_eq!(awards.len(), 1);
        assert_eq!(awards[0].amount, 70);
    }

    #[test]
    fn nothing_to_distribute() {
        let rule = PrizeRule { pool: 0, split: PrizeSplit::Equal };
        assert!(distribute(&rule, &winners(2)).is_empty());
        let rule = PrizeRule { pool: 50, split: PrizeSplit::Equal };
        assert!(distribute(&rule, &[]).is_empty());
    }
}
