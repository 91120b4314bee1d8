//! Helper functions for testing purposes.
//! These functions should only be available in test builds.

use crate::logs::INFO;
use crate::numeric::UsdPrice;
use crate::state::mutate_state;
use candid::{candid_method, Principal};
use ic_canister_log::log;
use ic_cdk_macros::update;

fn ensure_test_caller() {
    let caller = ic_cdk::caller();
    if caller != ic_cdk::id() && caller != Principal::management_canister() {
        ic_cdk::trap("Only management canister or self can call test methods");
    }
}

/// Overrides the cached quote of a collateral asset so tests do not depend
/// on the exchange rate canister.
#[cfg(any(test, feature = "test_endpoints"))]
#[candid_method(update)]
#[update]
pub fn test_set_quote(asset_id: Principal, price_e8s: u64) {
    ensure_test_caller();

    log!(
        INFO,
        "[test_set_quote] setting the quote of {} to {}",
        asset_id,
        price_e8s
    );

    mutate_state(|s| {
        s.record_quote(asset_id, UsdPrice::new(price_e8s), ic_cdk::api::time());
    });
}

/// Drops every cached quote, forcing price-sensitive operations to go back
/// to the exchange rate canister.
#[cfg(any(test, feature = "test_endpoints"))]
#[candid_method(update)]
#[update]
pub fn test_clear_quotes() {
    ensure_test_caller();

    log!(INFO, "[test_clear_quotes] clearing all cached quotes");

    mutate_state(|s| {
        for asset in s.collateral_assets.iter_mut() {
            asset.last_quote = None;
            asset.last_quote_timestamp = None;
        }
    });
}
