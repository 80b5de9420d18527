//! Block reward sharing between a validator's commission and its self-stake.

use serde_json::Value;

use crate::types::{parse_amount, Event, ValidatorStake};

/// Commission is expressed in basis points of this denominator.
pub const COMMISSION_DENOMINATOR: u128 = 10_000;

/// How a block reward splits for its generator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewardShares {
    pub commission: u128,
    pub self_stake_reward: u128,
}

/// Amount of the first reward-mint event of a block, if any.
pub fn minted_reward(events: &[Event]) -> Option<u128> {
    events
        .iter()
        .find(|e| e.is_reward_minted())
        .and_then(|e| match &e.data {
            Value::Object(map) => map.get("amount").and_then(parse_amount),
            _ => None,
        })
}

/// Split `reward` according to the generator's stake parameters.
///
/// `commission = reward * commission / 10000`; the remainder is shared pro
/// rata between self-stake and total stake.
pub fn reward_shares(reward: u128, stake: &ValidatorStake) -> RewardShares {
    let commission_rate = u128::from(stake.commission).min(COMMISSION_DENOMINATOR);
    let commission = reward.saturating_mul(commission_rate) / COMMISSION_DENOMINATOR;
    let remainder = reward - commission;
    let self_stake_reward = if stake.total_stake == 0 {
        0
    } else {
        remainder
            .checked_mul(stake.self_stake)
            .map(|v| v / stake.total_stake)
            .unwrap_or_else(|| remainder / stake.total_stake * stake.self_stake)
    };
    RewardShares {
        commission,
        self_stake_reward,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reward_event(amount: Value) -> Event {
        Event {
            module: "reward".into(),
            name: "rewardMinted".into(),
            index: 3,
            topics: vec![],
            data: json!({ "amount": amount, "reduction": 0 }),
            height: None,
        }
    }

    #[test]
    fn finds_minted_reward() {
        let events = vec![reward_event(json!("100000000"))];
        assert_eq!(minted_reward(&events), Some(100_000_000));
        assert_eq!(minted_reward(&[]), None);
    }

    #[test]
    fn splits_commission_and_self_stake() {
        let stake = ValidatorStake {
            commission: 1_000, // 10%
            self_stake: 250,
            total_stake: 1_000,
        };
        let shares = reward_shares(1_000_000, &stake);
        assert_eq!(shares.commission, 100_000);
        assert_eq!(shares.self_stake_reward, 225_000);
    }

    #[test]
    fn no_stake_means_no_self_stake_reward() {
        let stake = ValidatorStake {
            commission: 10_000,
            self_stake: 0,
            total_stake: 0,
        };
        let shares = reward_shares(500, &stake);
        assert_eq!(shares.commission, 500);
        assert_eq!(shares.self_stake_reward, 0);
    }
}
