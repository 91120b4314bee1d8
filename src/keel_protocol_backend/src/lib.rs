use crate::guard::GuardError;
use crate::logs::{DEBUG, INFO};
use crate::numeric::{HealthFactor, KUSD};
use crate::state::{read_state, PriceSource, PriceView, State};
use candid::{CandidType, Deserialize, Principal};
use ic_canister_log::log;
use icrc_ledger_types::icrc1::transfer::TransferError;
use icrc_ledger_types::icrc2::transfer_from::TransferFromError;
use serde::Serialize;

pub mod dashboard;
pub mod debt;
pub mod event;
pub mod guard;
pub mod http;
pub mod liquidation;
pub mod logs;
pub mod management;
pub mod numeric;
pub mod state;
pub mod storage;
pub mod vault;
pub mod xrc;

#[cfg(any(test, feature = "test_endpoints"))]
pub mod test_helpers;

#[cfg(test)]
mod tests;

pub const SEC_NANOS: u64 = 1_000_000_000;
pub const E8S: u64 = 100_000_000;

/// Health factors and intermediate USD conversions are carried at 18
/// decimals.
pub const PRECISION: u128 = 1_000_000_000_000_000_000;
/// Upscales an 8-decimal feed quote to 18 decimals.
pub const ADDITIONAL_FEED_PRECISION: u128 = 10_000_000_000;

/// Only this share of the deposited collateral value backs debt: 50 out of
/// 100 means every position must hold at least twice its debt in
/// collateral.
pub const LIQUIDATION_THRESHOLD: u128 = 50;
pub const LIQUIDATION_PRECISION: u128 = 100;
/// Liquidators receive the covered value plus this percentage of it.
pub const LIQUIDATION_BONUS: u128 = 10;

/// Positions at or above this health factor cannot be liquidated; mints and
/// redemptions must not take a position below it.
pub const MIN_HEALTH_FACTOR: HealthFactor = HealthFactor::new(PRECISION);

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolArg {
    Init(InitArg),
    Upgrade(UpgradeArg),
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitArg {
    pub kusd_ledger_principal: Principal,
    pub xrc_principal: Principal,
    /// One entry per accepted collateral asset, matched by position with
    /// `price_feeds`.
    pub collateral_ledgers: Vec<Principal>,
    pub price_feeds: Vec<PriceSource>,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeArg {
    pub xrc_principal: Option<Principal>,
}

#[derive(CandidType, Deserialize, Debug)]
pub struct ProtocolStatus {
    pub total_debt: u64,
    /// USD value of all deposited collateral, absent until every asset has
    /// a cached quote.
    pub total_collateral_value: Option<u64>,
    pub open_positions: u64,
    pub accepted_assets: u64,
}

#[derive(CandidType, Clone, Debug, Deserialize)]
pub struct AcceptedAsset {
    pub ledger_canister_id: Principal,
    pub price_source: PriceSource,
    pub transfer_fee: u64,
    pub last_quote: Option<u64>,
    pub last_quote_timestamp: Option<u64>,
}

#[derive(CandidType, Clone, Debug, Deserialize)]
pub struct Position {
    pub account: Principal,
    pub debt: u64,
    pub collateral: Vec<(Principal, u64)>,
    /// Absent until every asset has a cached quote.
    pub collateral_value: Option<u64>,
    /// At 18 decimals; absent until every asset has a cached quote.
    pub health_factor: Option<u128>,
}

#[derive(CandidType, Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SuccessWithFee {
    pub block_index: u64,
    pub fee_amount_paid: u64,
}

#[derive(CandidType, Deserialize)]
pub struct GetEventsArg {
    pub start: u64,
    pub length: u64,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub enum ProtocolError {
    /// A zero amount was supplied where a positive one is required.
    InvalidAmount,
    /// The given ledger is not registered as a collateral asset.
    AssetNotAccepted(Principal),
    AmountTooLow {
        minimum_amount: u64,
    },
    InsufficientCollateral {
        balance: u64,
        requested: u64,
    },
    BurnExceedsDebt {
        minted: u64,
        requested: u64,
    },
    /// The operation would leave the account below the minimum health
    /// factor. Carries the offending health factor at 18 decimals.
    BreaksHealthFactor {
        health_factor: u128,
    },
    /// The liquidation target is not below the minimum health factor.
    HealthFactorOk,
    /// The liquidation would not strictly raise the target's health factor.
    HealthFactorNotImproved {
        starting: u128,
        ending: u128,
    },
    TransferFailed(TransferError),
    TransferFromFailed(TransferFromError, u64),
    MintFailed(TransferError),
    BurnFailed(TransferFromError),
    /// A fresh quote could not be obtained for every collateral asset.
    OracleUnavailable(String),
    /// Another protected operation is already in flight.
    ReentrantCall,
    AnonymousCallerNotAllowed,
    GenericError(String),
}

impl From<GuardError> for ProtocolError {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::AlreadyProcessing => Self::ReentrantCall,
        }
    }
}

/// The health factor of a position at 18 decimals: the liquidation-adjusted
/// collateral value over the debt. Debt-free positions are unbounded.
pub fn compute_health_factor(collateral_value: KUSD, debt: KUSD) -> HealthFactor {
    if debt == 0 {
        return HealthFactor::MAX;
    }
    let adjusted_value =
        collateral_value.to_u64() as u128 * LIQUIDATION_THRESHOLD / LIQUIDATION_PRECISION;
    HealthFactor::new(adjusted_value * PRECISION / debt.to_u64() as u128)
}

pub fn build_position(s: &State, account: Principal, prices: Option<&PriceView>) -> Position {
    Position {
        account,
        debt: s.debt_of(&account).to_u64(),
        collateral: s
            .collateral_balances
            .get(&account)
            .map(|balances| {
                balances
                    .iter()
                    .map(|(asset_id, amount)| (*asset_id, amount.to_u64()))
                    .collect()
            })
            .unwrap_or_default(),
        collateral_value: prices.map(|view| s.account_collateral_value(&account, view).to_u64()),
        health_factor: prices.map(|view| s.health_factor(&account, view).to_u128()),
    }
}

/// Scans all open positions against the cached quotes and logs the ones
/// open to liquidation. The engine never liquidates on its own; external
/// liquidators act on what is logged here.
pub fn check_positions() {
    let prices = match read_state(|s| s.cached_price_view()) {
        Some(prices) => prices,
        None => {
            log!(
                DEBUG,
                "[check_positions] not every asset has a quote yet, skipping the scan"
            );
            return;
        }
    };
    let liquidatable = read_state(|s| {
        s.debt_ledger
            .keys()
            .filter(|account| s.health_factor(account, &prices) < MIN_HEALTH_FACTOR)
            .map(|account| {
                (
                    *account,
                    s.debt_of(account),
                    s.health_factor(account, &prices),
                )
            })
            .collect::<Vec<_>>()
    });
    if liquidatable.is_empty() {
        log!(
            DEBUG,
            "[check_positions] all positions are healthy at the cached quotes"
        );
        return;
    }
    log!(
        INFO,
        "[check_positions] found {} liquidatable positions, waiting for external liquidators",
        liquidatable.len()
    );
    for (account, debt, health_factor) in liquidatable {
        log!(
            INFO,
            "[check_positions] account {} with {} kUSD of debt is at health factor {}",
            account,
            debt,
            health_factor
        );
    }
}
