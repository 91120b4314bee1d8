use crate::event::{replay, Event};
use crate::numeric::{Tokens, UsdPrice, KUSD};
use crate::state::{PriceSource, PriceView, State};
use crate::{compute_health_factor, InitArg, MIN_HEALTH_FACTOR, E8S, PRECISION};
use candid::Principal;
use proptest::collection::vec as pvec;
use proptest::prelude::*;

fn principal(id: u8) -> Principal {
    Principal::from_slice(&[id; 8])
}

fn xrc_feed(base: &str) -> PriceSource {
    PriceSource::Xrc {
        base_asset: base.to_string(),
        quote_asset: "USD".to_string(),
    }
}

fn init_arg() -> InitArg {
    InitArg {
        kusd_ledger_principal: principal(20),
        xrc_principal: principal(21),
        collateral_ledgers: vec![principal(1), principal(2)],
        price_feeds: vec![xrc_feed("BTC"), xrc_feed("ETH")],
    }
}

const ACCOUNTS: [u8; 3] = [10, 11, 12];
const ASSETS: [u8; 2] = [1, 2];

#[derive(Clone, Debug)]
enum Op {
    Deposit { account: u8, asset: u8, amount: u64 },
    Mint { account: u8, amount: u64 },
    Redeem { account: u8, asset: u8, amount: u64 },
    Burn { account: u8, amount: u64 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    let account = prop::sample::select(ACCOUNTS.to_vec());
    let asset = prop::sample::select(ASSETS.to_vec());
    prop_oneof![
        3 => (account.clone(), asset.clone(), 1..10_000 * E8S).prop_map(|(account, asset, amount)| {
            Op::Deposit { account, asset, amount }
        }),
        2 => (account.clone(), 1..5_000 * E8S).prop_map(|(account, amount)| {
            Op::Mint { account, amount }
        }),
        2 => (account.clone(), asset, 1..10_000 * E8S).prop_map(|(account, asset, amount)| {
            Op::Redeem { account, asset, amount }
        }),
        2 => (account, 1..5_000 * E8S).prop_map(|(account, amount)| {
            Op::Burn { account, amount }
        }),
    ]
}

/// Applies the operations to the state the way the flows do, recording an
/// event for each one that sticks, and skipping the ones the books reject.
fn apply_ops(state: &mut State, ops: Vec<Op>) -> Vec<Event> {
    let mut events = vec![Event::Init(init_arg())];
    let mut block_index = 0;
    for op in ops {
        block_index += 1;
        match op {
            Op::Deposit {
                account,
                asset,
                amount,
            } => {
                state.apply_deposit(principal(account), principal(asset), Tokens::new(amount));
                events.push(Event::CollateralDeposited {
                    account: principal(account),
                    asset: principal(asset),
                    amount: Tokens::new(amount),
                    block_index,
                });
            }
            Op::Mint { account, amount } => {
                state.apply_mint(principal(account), KUSD::new(amount));
                events.push(Event::StablecoinMinted {
                    account: principal(account),
                    amount: KUSD::new(amount),
                    block_index,
                });
            }
            Op::Redeem {
                account,
                asset,
                amount,
            } => {
                if state
                    .apply_redeem(principal(account), principal(asset), Tokens::new(amount))
                    .is_ok()
                {
                    events.push(Event::CollateralRedeemed {
                        from: principal(account),
                        to: principal(account),
                        asset: principal(asset),
                        amount: Tokens::new(amount),
                        block_index,
                    });
                }
            }
            Op::Burn { account, amount } => {
                if state.apply_burn(principal(account), KUSD::new(amount)).is_ok() {
                    events.push(Event::StablecoinBurned {
                        payer: principal(account),
                        on_behalf_of: principal(account),
                        amount: KUSD::new(amount),
                        block_index,
                    });
                }
            }
        }
    }
    events
}

proptest! {
    #[test]
    fn replaying_the_log_rebuilds_the_live_state(ops in pvec(arb_op(), 0..60)) {
        let mut state = State::new(init_arg()).unwrap();
        let events = apply_ops(&mut state, ops);

        prop_assert!(state.check_invariants().is_ok());

        let replayed = replay(events.into_iter()).expect("replaying a log of applied operations");
        prop_assert!(replayed.check_invariants().is_ok());
        prop_assert_eq!(Ok(()), replayed.check_semantically_eq(&state));
    }

    #[test]
    fn usd_conversion_roundtrip_never_creates_tokens(
        amount in 1..u32::MAX as u64,
        price_e8s in 1..100_000 * E8S,
    ) {
        let price = UsdPrice::new(price_e8s);
        let value = Tokens::new(amount) * price;
        let back = value / price;

        prop_assert!(back.to_u64() <= amount);

        let value_back = back * price;
        prop_assert!(value_back <= value);
    }

    #[test]
    fn debt_at_half_the_collateral_value_sits_exactly_at_the_minimum(
        value in 2..u32::MAX as u64,
    ) {
        let limit = value / 2;
        let at_limit = compute_health_factor(KUSD::new(value), KUSD::new(limit));
        prop_assert_eq!(at_limit.to_u128(), PRECISION);

        let over = compute_health_factor(KUSD::new(value), KUSD::new(limit + 1));
        prop_assert!(over < MIN_HEALTH_FACTOR);
    }

    #[test]
    fn events_survive_their_stable_encoding(ops in pvec(arb_op(), 1..20)) {
        let mut state = State::new(init_arg()).unwrap();
        for event in apply_ops(&mut state, ops) {
            let mut buf = Vec::new();
            ciborium::ser::into_writer(&event, &mut buf).expect("failed to encode an event");
            let decoded: Event =
                ciborium::de::from_reader(buf.as_slice()).expect("failed to decode an event");
            prop_assert_eq!(event, decoded);
        }
    }
}

#[test]
fn replaying_a_liquidation_matches_the_live_books() {
    let target = principal(10);
    let liquidator = principal(11);
    let asset = principal(1);

    let mut state = State::new(init_arg()).unwrap();
    state.apply_deposit(target, asset, Tokens::new(10 * E8S));
    state.apply_mint(target, KUSD::new(10_000 * E8S));

    // The quote drops from $2000 to $1300: the position is under water but
    // still holds more than 110% of its debt, so covering part of the debt
    // strictly improves it.
    let mut prices = PriceView::new();
    prices.insert(principal(1), UsdPrice::new(1_300 * E8S));
    prices.insert(principal(2), UsdPrice::new(100 * E8S));

    let outcome = state
        .apply_liquidation(liquidator, target, asset, KUSD::new(4_000 * E8S), &prices)
        .expect("the position is liquidatable");

    let events = vec![
        Event::Init(init_arg()),
        Event::CollateralDeposited {
            account: target,
            asset,
            amount: Tokens::new(10 * E8S),
            block_index: 1,
        },
        Event::StablecoinMinted {
            account: target,
            amount: KUSD::new(10_000 * E8S),
            block_index: 2,
        },
        Event::PositionLiquidated {
            target,
            liquidator,
            asset,
            debt_covered: KUSD::new(4_000 * E8S),
            collateral_to_liquidator: outcome.collateral_to_liquidator,
            burn_block_index: 3,
            payout_block_index: 4,
        },
    ];

    let replayed = replay(events.into_iter()).expect("replaying a liquidation");
    assert_eq!(Ok(()), replayed.check_semantically_eq(&state));
    assert!(replayed.check_invariants().is_ok());
}

#[test]
fn replaying_an_empty_log_fails() {
    assert!(matches!(
        replay(Vec::new().into_iter()),
        Err(crate::event::ReplayLogError::EmptyLog)
    ));
}

#[test]
fn replaying_an_overdrawn_redeem_fails() {
    let events = vec![
        Event::Init(init_arg()),
        Event::CollateralRedeemed {
            from: principal(10),
            to: principal(10),
            asset: principal(1),
            amount: Tokens::new(E8S),
            block_index: 1,
        },
    ];
    assert!(matches!(
        replay(events.into_iter()),
        Err(crate::event::ReplayLogError::InconsistentLog(_))
    ));
}
