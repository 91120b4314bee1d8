use assert_matches::assert_matches;
use candid::Principal;
use futures::executor::block_on;

use keel_protocol_backend::event::{replay, Event};
use keel_protocol_backend::guard::OperationGuard;
use keel_protocol_backend::liquidation::LiquidationArg;
use keel_protocol_backend::numeric::{HealthFactor, Tokens, UsdPrice, KUSD};
use keel_protocol_backend::state::{
    replace_state, CollateralAsset, InitError, PriceSource, PriceView, State, DEFAULT_TRANSFER_FEE,
};
use keel_protocol_backend::{InitArg, ProtocolError, UpgradeArg, E8S, MIN_HEALTH_FACTOR, PRECISION};

#[cfg(test)]
mod fixtures {
    use super::*;

    pub fn xrc_principal() -> Principal {
        Principal::from_text("uf6dk-hyaaa-aaaaq-qaaaq-cai").unwrap()
    }

    pub fn kusd_ledger() -> Principal {
        Principal::from_text("ryjl3-tyaaa-aaaaa-aaaba-cai").unwrap()
    }

    pub fn wbtc_ledger() -> Principal {
        Principal::from_text("mxzaz-hqaaa-aaaar-qaada-cai").unwrap()
    }

    pub fn weth_ledger() -> Principal {
        Principal::from_text("ss2fx-dyaaa-aaaar-qacoq-cai").unwrap()
    }

    pub fn alice() -> Principal {
        Principal::from_slice(&[0xAA; 8])
    }

    pub fn bob() -> Principal {
        Principal::from_slice(&[0xBB; 8])
    }

    pub fn xrc_feed(base: &str) -> PriceSource {
        PriceSource::Xrc {
            base_asset: base.to_string(),
            quote_asset: "USD".to_string(),
        }
    }

    pub fn init_arg() -> InitArg {
        InitArg {
            kusd_ledger_principal: kusd_ledger(),
            xrc_principal: xrc_principal(),
            collateral_ledgers: vec![wbtc_ledger(), weth_ledger()],
            price_feeds: vec![xrc_feed("BTC"), xrc_feed("ETH")],
        }
    }

    pub fn create_test_state() -> State {
        State::new(init_arg()).expect("the fixture init arguments are valid")
    }

    /// Installs a fresh test state in the thread-local slot so the flows
    /// under test can read it.
    pub fn install_test_state() {
        replace_state(create_test_state());
    }

    pub fn prices(wbtc_usd: u64, weth_usd: u64) -> PriceView {
        let mut view = PriceView::new();
        view.insert(wbtc_ledger(), UsdPrice::new(wbtc_usd));
        view.insert(weth_ledger(), UsdPrice::new(weth_usd));
        view
    }
}

#[cfg(test)]
mod init_tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn accepts_parallel_asset_and_feed_lists() {
        let state = create_test_state();
        assert!(state.is_accepted_asset(&wbtc_ledger()));
        assert!(state.is_accepted_asset(&weth_ledger()));
        assert!(!state.is_accepted_asset(&kusd_ledger()));
        assert_eq!(state.kusd_ledger_principal, kusd_ledger());
        assert_eq!(state.xrc_principal, xrc_principal());
    }

    #[test]
    fn preserves_registration_order() {
        let state = create_test_state();
        assert_eq!(
            state
                .collateral_assets
                .iter()
                .map(|asset| asset.ledger_canister_id)
                .collect::<Vec<_>>(),
            vec![wbtc_ledger(), weth_ledger()]
        );
        for asset in &state.collateral_assets {
            assert_eq!(asset.transfer_fee, DEFAULT_TRANSFER_FEE);
            assert_eq!(asset.last_quote, None);
        }
    }

    #[test]
    fn rejects_mismatched_list_lengths() {
        let result = State::new(InitArg {
            price_feeds: vec![xrc_feed("BTC")],
            ..init_arg()
        });
        assert_eq!(
            result.unwrap_err(),
            InitError::LengthMismatch { assets: 2, feeds: 1 }
        );
    }

    #[test]
    fn rejects_duplicate_collateral_ledgers() {
        let result = State::new(InitArg {
            collateral_ledgers: vec![wbtc_ledger(), wbtc_ledger()],
            price_feeds: vec![xrc_feed("BTC"), xrc_feed("BTC")],
            ..init_arg()
        });
        assert_eq!(result.unwrap_err(), InitError::DuplicateAsset(wbtc_ledger()));
    }

    #[test]
    fn upgrade_only_touches_the_provided_fields() {
        let mut state = create_test_state();
        state.upgrade(UpgradeArg {
            xrc_principal: None,
        });
        assert_eq!(state.xrc_principal, xrc_principal());

        let new_xrc = Principal::from_slice(&[0x42; 8]);
        state.upgrade(UpgradeArg {
            xrc_principal: Some(new_xrc),
        });
        assert_eq!(state.xrc_principal, new_xrc);
    }

    #[test]
    fn asset_registry_is_untouched_by_operations() {
        let mut state = create_test_state();
        let registry_before: Vec<CollateralAsset> = state.collateral_assets.clone();

        state.apply_deposit(alice(), wbtc_ledger(), Tokens::new(15 * E8S));
        state.apply_mint(alice(), KUSD::new(1_000 * E8S));
        state.apply_burn(alice(), KUSD::new(1_000 * E8S)).unwrap();
        state
            .apply_redeem(alice(), wbtc_ledger(), Tokens::new(15 * E8S))
            .unwrap();

        assert_eq!(state.collateral_assets, registry_before);
    }
}

/// The mutating flows validate their arguments before the first external
/// call, so their rejection paths complete without a live ledger or oracle.
#[cfg(test)]
mod flow_validation_tests {
    use super::fixtures::*;
    use super::*;
    use keel_protocol_backend::{debt, liquidation, vault};

    #[test]
    fn zero_deposit_is_rejected() {
        install_test_state();
        assert_eq!(
            block_on(vault::deposit_collateral(alice(), wbtc_ledger(), 0)),
            Err(ProtocolError::InvalidAmount)
        );
    }

    #[test]
    fn deposit_of_an_unregistered_asset_is_rejected() {
        install_test_state();
        assert_eq!(
            block_on(vault::deposit_collateral(alice(), kusd_ledger(), E8S)),
            Err(ProtocolError::AssetNotAccepted(kusd_ledger()))
        );
    }

    #[test]
    fn zero_redeem_is_rejected() {
        install_test_state();
        assert_eq!(
            block_on(vault::redeem_collateral(alice(), wbtc_ledger(), 0)),
            Err(ProtocolError::InvalidAmount)
        );
        assert_eq!(
            block_on(vault::redeem_collateral(alice(), kusd_ledger(), E8S)),
            Err(ProtocolError::AssetNotAccepted(kusd_ledger()))
        );
    }

    #[test]
    fn redeem_below_the_ledger_fee_is_rejected() {
        install_test_state();
        let fee = DEFAULT_TRANSFER_FEE.to_u64();
        assert_eq!(
            block_on(vault::redeem_collateral(alice(), wbtc_ledger(), fee)),
            Err(ProtocolError::AmountTooLow {
                minimum_amount: fee + 1,
            })
        );
    }

    #[test]
    fn zero_mint_and_burn_are_rejected() {
        install_test_state();
        assert_eq!(
            block_on(debt::mint_kusd(alice(), 0)),
            Err(ProtocolError::InvalidAmount)
        );
        assert_eq!(
            block_on(debt::burn_kusd(alice(), 0)),
            Err(ProtocolError::InvalidAmount)
        );
    }

    #[test]
    fn composite_flows_validate_both_legs_upfront() {
        install_test_state();
        assert_eq!(
            block_on(vault::deposit_collateral_and_mint(
                alice(),
                wbtc_ledger(),
                0,
                1_000 * E8S
            )),
            Err(ProtocolError::InvalidAmount)
        );
        assert_eq!(
            block_on(vault::deposit_collateral_and_mint(
                alice(),
                wbtc_ledger(),
                E8S,
                0
            )),
            Err(ProtocolError::InvalidAmount)
        );
        assert_eq!(
            block_on(vault::redeem_collateral_for_kusd(
                alice(),
                kusd_ledger(),
                E8S,
                1_000 * E8S
            )),
            Err(ProtocolError::AssetNotAccepted(kusd_ledger()))
        );
    }

    #[test]
    fn zero_liquidation_cover_is_rejected() {
        install_test_state();
        assert_eq!(
            block_on(liquidation::liquidate(
                bob(),
                LiquidationArg {
                    target: alice(),
                    collateral_asset: wbtc_ledger(),
                    debt_to_cover: 0,
                }
            )),
            Err(ProtocolError::InvalidAmount)
        );
        assert_eq!(
            block_on(liquidation::liquidate(
                bob(),
                LiquidationArg {
                    target: alice(),
                    collateral_asset: kusd_ledger(),
                    debt_to_cover: 1_000 * E8S,
                }
            )),
            Err(ProtocolError::AssetNotAccepted(kusd_ledger()))
        );
    }
}

#[cfg(test)]
mod guard_tests {
    use super::fixtures::*;
    use super::*;
    use keel_protocol_backend::debt;

    #[test]
    fn a_second_protected_operation_is_rejected_while_one_is_in_flight() {
        install_test_state();
        let guard = OperationGuard::new().expect("no operation is in flight");
        assert_eq!(
            block_on(debt::mint_kusd(alice(), 1_000 * E8S)),
            Err(ProtocolError::ReentrantCall)
        );
        drop(guard);
        let _guard = OperationGuard::new().expect("the guard must release on drop");
    }

    #[test]
    fn the_guard_releases_on_a_failed_flow() {
        install_test_state();
        // The zero-amount rejection exits through the guard's drop path.
        assert_eq!(
            block_on(debt::mint_kusd(alice(), 0)),
            Err(ProtocolError::InvalidAmount)
        );
        let _guard = OperationGuard::new().expect("a failed flow must not leave the flag set");
    }
}

/// The end-to-end arithmetic scenarios, applied to the books directly the
/// way the flows do once their ledger calls succeed.
#[cfg(test)]
mod scenario_tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn fifteen_units_at_two_thousand_usd_are_worth_thirty_thousand() {
        let mut state = create_test_state();
        state.apply_deposit(alice(), wbtc_ledger(), Tokens::new(15 * E8S));
        let view = prices(2_000 * E8S, 30 * E8S);
        assert_eq!(
            state.account_collateral_value(&alice(), &view),
            KUSD::new(30_000 * E8S)
        );
    }

    #[test]
    fn minting_up_to_half_the_collateral_value_is_allowed() {
        let mut state = create_test_state();
        state.apply_deposit(alice(), wbtc_ledger(), Tokens::new(15 * E8S));
        let view = prices(2_000 * E8S, 30 * E8S);

        state.apply_mint(alice(), KUSD::new(15_000 * E8S));
        assert_eq!(
            state.health_factor(&alice(), &view),
            HealthFactor::new(PRECISION)
        );
        assert_eq!(state.ensure_healthy(&alice(), &view), Ok(()));
    }

    #[test]
    fn minting_one_unit_past_the_threshold_is_rejected() {
        let mut state = create_test_state();
        state.apply_deposit(alice(), wbtc_ledger(), Tokens::new(15 * E8S));
        let view = prices(2_000 * E8S, 30 * E8S);

        state.apply_mint(alice(), KUSD::new(15_000 * E8S + 1));
        assert_matches!(
            state.ensure_healthy(&alice(), &view),
            Err(ProtocolError::BreaksHealthFactor { health_factor })
                if health_factor < PRECISION
        );
        // This is where the mint flow rolls back.
        state.undo_mint(alice(), KUSD::new(15_000 * E8S + 1));
        assert_eq!(state.debt_of(&alice()), KUSD::new(0));
    }

    #[test]
    fn deposit_then_redeem_restores_the_position() {
        let mut state = create_test_state();
        let view = prices(2_000 * E8S, 30 * E8S);
        let amount = Tokens::new(7 * E8S);

        state.apply_deposit(alice(), wbtc_ledger(), amount);
        state.apply_redeem(alice(), wbtc_ledger(), amount).unwrap();

        assert_eq!(
            state.collateral_balance(&alice(), &wbtc_ledger()),
            Tokens::new(0)
        );
        assert_eq!(state.health_factor(&alice(), &view), HealthFactor::MAX);
        assert_eq!(state.check_invariants(), Ok(()));
    }

    #[test]
    fn redeeming_into_insolvency_is_rejected() {
        let mut state = create_test_state();
        state.apply_deposit(alice(), wbtc_ledger(), Tokens::new(15 * E8S));
        state.apply_mint(alice(), KUSD::new(15_000 * E8S));
        let view = prices(2_000 * E8S, 30 * E8S);

        // The redeem flow debits first, checks health, and undoes on failure.
        state
            .apply_redeem(alice(), wbtc_ledger(), Tokens::new(E8S))
            .unwrap();
        assert_matches!(
            state.ensure_healthy(&alice(), &view),
            Err(ProtocolError::BreaksHealthFactor { .. })
        );
        state.undo_redeem(alice(), wbtc_ledger(), Tokens::new(E8S));
        assert_eq!(
            state.collateral_balance(&alice(), &wbtc_ledger()),
            Tokens::new(15 * E8S)
        );
    }

    #[test]
    fn burning_debt_frees_collateral_for_redemption() {
        let mut state = create_test_state();
        state.apply_deposit(alice(), wbtc_ledger(), Tokens::new(15 * E8S));
        state.apply_mint(alice(), KUSD::new(15_000 * E8S));
        let view = prices(2_000 * E8S, 30 * E8S);

        // Repaying a third of the debt makes a third of the collateral
        // redundant; the redeem-for-kusd composite burns first for exactly
        // this reason.
        state.apply_burn(alice(), KUSD::new(5_000 * E8S)).unwrap();
        state
            .apply_redeem(alice(), wbtc_ledger(), Tokens::new(5 * E8S))
            .unwrap();
        assert_eq!(state.ensure_healthy(&alice(), &view), Ok(()));
        assert_eq!(
            state.health_factor(&alice(), &view),
            HealthFactor::new(PRECISION)
        );
    }

    #[test]
    fn a_price_drop_opens_the_position_for_liquidation() {
        let mut state = create_test_state();
        state.apply_deposit(alice(), wbtc_ledger(), Tokens::new(15 * E8S));
        state.apply_mint(alice(), KUSD::new(15_000 * E8S));

        let healthy_view = prices(2_000 * E8S, 30 * E8S);
        assert!(state.health_factor(&alice(), &healthy_view) >= MIN_HEALTH_FACTOR);
        assert_eq!(
            state.apply_liquidation(
                bob(),
                alice(),
                wbtc_ledger(),
                KUSD::new(5_000 * E8S),
                &healthy_view,
            ),
            Err(ProtocolError::HealthFactorOk)
        );

        let dropped_view = prices(1_800 * E8S, 30 * E8S);
        assert!(state.health_factor(&alice(), &dropped_view) < MIN_HEALTH_FACTOR);
        let outcome = state
            .apply_liquidation(
                bob(),
                alice(),
                wbtc_ledger(),
                KUSD::new(5_000 * E8S),
                &dropped_view,
            )
            .expect("the dropped price makes the position liquidatable");

        // $5,000 at $1,800 is 2.77777777 wBTC, plus the 10% bonus.
        assert_eq!(outcome.collateral_to_liquidator, Tokens::new(305_555_554));
        assert!(outcome.ending_health > outcome.starting_health);
        assert_eq!(state.debt_of(&alice()), KUSD::new(10_000 * E8S));
        assert_eq!(state.check_invariants(), Ok(()));
    }

    #[test]
    fn a_failed_payout_after_the_burn_restores_the_books() {
        let mut state = create_test_state();
        state.apply_deposit(alice(), wbtc_ledger(), Tokens::new(15 * E8S));
        state.apply_mint(alice(), KUSD::new(15_000 * E8S));
        let view = prices(1_800 * E8S, 30 * E8S);

        let outcome = state
            .apply_liquidation(bob(), alice(), wbtc_ledger(), KUSD::new(5_000 * E8S), &view)
            .expect("the position is liquidatable");

        // The collateral payout failed after the liquidator's kUSD was
        // burned: the flow undoes the booking with exactly the outcome it
        // got and mints the burned kUSD back, so the target's position is
        // exactly what it was before the call.
        state.undo_liquidation(
            alice(),
            wbtc_ledger(),
            outcome.collateral_to_liquidator,
            KUSD::new(5_000 * E8S),
        );

        assert_eq!(
            state.collateral_balance(&alice(), &wbtc_ledger()),
            Tokens::new(15 * E8S)
        );
        assert_eq!(state.debt_of(&alice()), KUSD::new(15_000 * E8S));
        assert_eq!(state.health_factor(&alice(), &view), outcome.starting_health);
        assert_eq!(state.check_invariants(), Ok(()));
    }

    #[test]
    fn liquidation_leaves_an_indebted_liquidator_solvent_or_fails() {
        let mut state = create_test_state();
        state.apply_deposit(alice(), wbtc_ledger(), Tokens::new(15 * E8S));
        state.apply_mint(alice(), KUSD::new(15_000 * E8S));
        // Bob has his own position, healthy at the dropped price.
        state.apply_deposit(bob(), weth_ledger(), Tokens::new(1_000 * E8S));
        state.apply_mint(bob(), KUSD::new(10_000 * E8S));
        let view = prices(1_800 * E8S, 30 * E8S);
        assert!(state.health_factor(&bob(), &view) >= MIN_HEALTH_FACTOR);

        let outcome = state
            .apply_liquidation(bob(), alice(), wbtc_ledger(), KUSD::new(5_000 * E8S), &view)
            .expect("a solvent liquidator may liquidate");
        assert!(outcome.ending_health > outcome.starting_health);
        assert!(state.health_factor(&bob(), &view) >= MIN_HEALTH_FACTOR);
    }

    #[test]
    fn liquidation_only_draws_the_named_asset() {
        let mut state = create_test_state();
        // Alice's wBTC holding is small but she has plenty of wETH.
        state.apply_deposit(alice(), wbtc_ledger(), Tokens::new(E8S));
        state.apply_deposit(alice(), weth_ledger(), Tokens::new(1_000 * E8S));
        state.apply_mint(alice(), KUSD::new(15_000 * E8S));
        let view = prices(1_800 * E8S, 24 * E8S);
        assert!(state.health_factor(&alice(), &view) < MIN_HEALTH_FACTOR);

        // Covering $5,000 needs 3.05 wBTC with the bonus; the wETH balance
        // is never drawn upon.
        assert_eq!(
            state.apply_liquidation(
                bob(),
                alice(),
                wbtc_ledger(),
                KUSD::new(5_000 * E8S),
                &view,
            ),
            Err(ProtocolError::InsufficientCollateral {
                balance: E8S,
                requested: 305_555_554,
            })
        );
        assert_eq!(
            state.collateral_balance(&alice(), &weth_ledger()),
            Tokens::new(1_000 * E8S)
        );
    }
}

#[cfg(test)]
mod event_tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn replaying_a_scenario_log_rebuilds_the_live_state() {
        let mut state = create_test_state();
        state.apply_deposit(alice(), wbtc_ledger(), Tokens::new(15 * E8S));
        state.apply_mint(alice(), KUSD::new(15_000 * E8S));
        state.apply_burn(alice(), KUSD::new(5_000 * E8S)).unwrap();
        state
            .apply_redeem(alice(), wbtc_ledger(), Tokens::new(5 * E8S))
            .unwrap();

        let events = vec![
            Event::Init(init_arg()),
            Event::CollateralDeposited {
                account: alice(),
                asset: wbtc_ledger(),
                amount: Tokens::new(15 * E8S),
                block_index: 1,
            },
            Event::StablecoinMinted {
                account: alice(),
                amount: KUSD::new(15_000 * E8S),
                block_index: 2,
            },
            Event::StablecoinBurned {
                payer: alice(),
                on_behalf_of: alice(),
                amount: KUSD::new(5_000 * E8S),
                block_index: 3,
            },
            Event::CollateralRedeemed {
                from: alice(),
                to: alice(),
                asset: wbtc_ledger(),
                amount: Tokens::new(5 * E8S),
                block_index: 4,
            },
        ];

        let replayed = replay(events.into_iter()).expect("the log is consistent");
        assert_eq!(Ok(()), replayed.check_semantically_eq(&state));
        assert_eq!(Ok(()), replayed.check_invariants());
    }

    #[test]
    fn replay_rejects_a_log_with_invalid_init_arguments() {
        let events = vec![Event::Init(InitArg {
            price_feeds: vec![],
            ..init_arg()
        })];
        assert_matches!(
            replay(events.into_iter()),
            Err(keel_protocol_backend::event::ReplayLogError::InconsistentLog(_))
        );
    }

    #[test]
    fn account_history_covers_every_role() {
        let deposit = Event::CollateralDeposited {
            account: alice(),
            asset: wbtc_ledger(),
            amount: Tokens::new(E8S),
            block_index: 1,
        };
        assert!(deposit.concerns_account(&alice()));
        assert!(!deposit.concerns_account(&bob()));

        let liquidation = Event::PositionLiquidated {
            target: alice(),
            liquidator: bob(),
            asset: wbtc_ledger(),
            debt_covered: KUSD::new(E8S),
            collateral_to_liquidator: Tokens::new(E8S),
            burn_block_index: 2,
            payout_block_index: 3,
        };
        assert!(liquidation.concerns_account(&alice()));
        assert!(liquidation.concerns_account(&bob()));

        assert!(!Event::Init(init_arg()).concerns_account(&alice()));
    }
}
