use crate::numeric::{Tokens, KUSD};
use crate::state::{CollateralId, State};
use crate::storage::record_event;
use crate::{InitArg, UpgradeArg};
use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};

/// The event log is the single source of truth for the engine's books.
///
/// Flows apply their state mutation first, then perform the ledger call,
/// and append the event only once that call has succeeded; on failure the
/// mutation is undone and nothing is recorded. Replaying the log through
/// the same mutators therefore rebuilds exactly the state that was live
/// when each event was written.
#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    #[serde(rename = "init")]
    Init(InitArg),

    #[serde(rename = "upgrade")]
    Upgrade(UpgradeArg),

    #[serde(rename = "collateral_deposited")]
    CollateralDeposited {
        account: Principal,
        asset: CollateralId,
        amount: Tokens,
        block_index: u64,
    },

    #[serde(rename = "collateral_redeemed")]
    CollateralRedeemed {
        from: Principal,
        to: Principal,
        asset: CollateralId,
        amount: Tokens,
        block_index: u64,
    },

    #[serde(rename = "stablecoin_minted")]
    StablecoinMinted {
        account: Principal,
        amount: KUSD,
        block_index: u64,
    },

    #[serde(rename = "stablecoin_burned")]
    StablecoinBurned {
        /// Who paid the kUSD to the burn.
        payer: Principal,
        /// Whose debt was retired.
        on_behalf_of: Principal,
        amount: KUSD,
        block_index: u64,
    },

    #[serde(rename = "position_liquidated")]
    PositionLiquidated {
        target: Principal,
        liquidator: Principal,
        asset: CollateralId,
        debt_covered: KUSD,
        collateral_to_liquidator: Tokens,
        burn_block_index: u64,
        payout_block_index: u64,
    },
}

impl Event {
    /// Whether the event touches the given account's position, as payer,
    /// owner, target or liquidator.
    pub fn concerns_account(&self, account: &Principal) -> bool {
        match self {
            Event::Init(_) => false,
            Event::Upgrade(_) => false,
            Event::CollateralDeposited { account: a, .. } => a == account,
            Event::CollateralRedeemed { from, to, .. } => from == account || to == account,
            Event::StablecoinMinted { account: a, .. } => a == account,
            Event::StablecoinBurned {
                payer,
                on_behalf_of,
                ..
            } => payer == account || on_behalf_of == account,
            Event::PositionLiquidated {
                target, liquidator, ..
            } => target == account || liquidator == account,
        }
    }
}

#[derive(Debug)]
pub enum ReplayLogError {
    /// There are no events in the event log.
    EmptyLog,
    /// The event log is inconsistent.
    InconsistentLog(String),
}

pub fn replay(mut events: impl Iterator<Item = Event>) -> Result<State, ReplayLogError> {
    let mut state = match events.next() {
        Some(Event::Init(args)) => match State::new(args) {
            Ok(state) => state,
            Err(error) => {
                return Err(ReplayLogError::InconsistentLog(format!(
                    "The recorded init arguments are invalid: {error}"
                )))
            }
        },
        Some(evt) => {
            return Err(ReplayLogError::InconsistentLog(format!(
                "The first event is not Init: {:?}",
                evt
            )))
        }
        None => return Err(ReplayLogError::EmptyLog),
    };
    for event in events {
        match event {
            Event::Init(_) => panic!("should have only one init event"),
            Event::Upgrade(upgrade_args) => {
                state.upgrade(upgrade_args);
            }
            Event::CollateralDeposited {
                account,
                asset,
                amount,
                block_index: _,
            } => {
                state.apply_deposit(account, asset, amount);
            }
            Event::CollateralRedeemed {
                from,
                to: _,
                asset,
                amount,
                block_index: _,
            } => {
                if let Err(error) = state.apply_redeem(from, asset, amount) {
                    return Err(ReplayLogError::InconsistentLog(format!(
                        "cannot replay a redeem of {amount} by {from}: {error:?}"
                    )));
                }
            }
            Event::StablecoinMinted {
                account,
                amount,
                block_index: _,
            } => {
                state.apply_mint(account, amount);
            }
            Event::StablecoinBurned {
                payer: _,
                on_behalf_of,
                amount,
                block_index: _,
            } => {
                if let Err(error) = state.apply_burn(on_behalf_of, amount) {
                    return Err(ReplayLogError::InconsistentLog(format!(
                        "cannot replay a burn of {amount} for {on_behalf_of}: {error:?}"
                    )));
                }
            }
            Event::PositionLiquidated {
                target,
                liquidator: _,
                asset,
                debt_covered,
                collateral_to_liquidator,
                burn_block_index: _,
                payout_block_index: _,
            } => {
                if let Err(error) = state.debit_collateral(target, asset, collateral_to_liquidator)
                {
                    return Err(ReplayLogError::InconsistentLog(format!(
                        "cannot replay a liquidation seizing {collateral_to_liquidator} from {target}: {error:?}"
                    )));
                }
                if let Err(error) = state.debit_debt(target, debt_covered) {
                    return Err(ReplayLogError::InconsistentLog(format!(
                        "cannot replay a liquidation covering {debt_covered} of {target}: {error:?}"
                    )));
                }
            }
        }
    }
    Ok(state)
}

pub fn record_collateral_deposited(
    account: Principal,
    asset: CollateralId,
    amount: Tokens,
    block_index: u64,
) {
    record_event(&Event::CollateralDeposited {
        account,
        asset,
        amount,
        block_index,
    });
}

pub fn record_collateral_redeemed(
    from: Principal,
    to: Principal,
    asset: CollateralId,
    amount: Tokens,
    block_index: u64,
) {
    record_event(&Event::CollateralRedeemed {
        from,
        to,
        asset,
        amount,
        block_index,
    });
}

pub fn record_stablecoin_minted(account: Principal, amount: KUSD, block_index: u64) {
    record_event(&Event::StablecoinMinted {
        account,
        amount,
        block_index,
    });
}

pub fn record_stablecoin_burned(
    payer: Principal,
    on_behalf_of: Principal,
    amount: KUSD,
    block_index: u64,
) {
    record_event(&Event::StablecoinBurned {
        payer,
        on_behalf_of,
        amount,
        block_index,
    });
}

#[allow(clippy::too_many_arguments)]
pub fn record_position_liquidated(
    target: Principal,
    liquidator: Principal,
    asset: CollateralId,
    debt_covered: KUSD,
    collateral_to_liquidator: Tokens,
    burn_block_index: u64,
    payout_block_index: u64,
) {
    record_event(&Event::PositionLiquidated {
        target,
        liquidator,
        asset,
        debt_covered,
        collateral_to_liquidator,
        burn_block_index,
        payout_block_index,
    });
}
