use crate::logs::TRACE_XRC;
use crate::numeric::UsdPrice;
use crate::state::{mutate_state, read_state, CollateralId, PriceSource, PriceView};
use crate::{ProtocolError, SEC_NANOS};
use futures::future::join_all;
use ic_canister_log::log;
use ic_xrc_types::GetExchangeRateResult;
use std::time::Duration;

/// How often the background timer refreshes the quote cache.
/// Each XRC call costs ~1B cycles, so the cache is refreshed lazily; the
/// flows that depend on prices always fetch fresh quotes themselves.
pub const FETCHING_RATE_INTERVAL: Duration = Duration::from_secs(300);

/// Rescales an XRC rate to an 8-decimal quote. Returns `None` for a zero
/// rate or one too large to represent.
fn rescale_rate(rate: u64, decimals: u32) -> Option<UsdPrice> {
    if rate == 0 {
        return None;
    }
    let scaled = if decimals >= 8 {
        rate / 10_u64.checked_pow(decimals - 8)?
    } else {
        rate.checked_mul(10_u64.checked_pow(8 - decimals)?)?
    };
    if scaled == 0 {
        return None;
    }
    Some(UsdPrice::new(scaled))
}

/// Fetches the USD quote for one price source, in e8s, along with the
/// XRC timestamp in seconds.
async fn quote_usd_price(price_source: &PriceSource) -> Result<(UsdPrice, u64), String> {
    match crate::management::fetch_exchange_rate(price_source).await? {
        GetExchangeRateResult::Ok(exchange_rate) => {
            match rescale_rate(exchange_rate.rate, exchange_rate.metadata.decimals) {
                Some(price) => Ok((price, exchange_rate.timestamp)),
                None => Err(format!(
                    "unusable rate {} with {} decimals",
                    exchange_rate.rate, exchange_rate.metadata.decimals
                )),
            }
        }
        GetExchangeRateResult::Err(error) => Err(format!(
            "the exchange rate canister returned an error: {error:?}"
        )),
    }
}

fn cache_quote(asset_id: CollateralId, price: UsdPrice, timestamp_sec: u64) {
    let timestamp = timestamp_sec * SEC_NANOS;
    mutate_state(|s| {
        let superseded = s
            .asset(&asset_id)
            .and_then(|asset| asset.last_quote_timestamp)
            .map_or(false, |last| timestamp <= last);
        if !superseded {
            s.record_quote(asset_id, price, timestamp);
        }
    });
}

/// Background refresh of the quote cache, one XRC call per registered asset.
pub async fn fetch_all_rates() {
    let _guard = match crate::guard::FetchRateGuard::new() {
        Some(guard) => guard,
        None => return,
    };

    let assets: Vec<(CollateralId, PriceSource)> = read_state(|s| {
        s.collateral_assets
            .iter()
            .map(|asset| (asset.ledger_canister_id, asset.price_source.clone()))
            .collect()
    });

    for (asset_id, price_source) in assets {
        match quote_usd_price(&price_source).await {
            Ok((price, timestamp_sec)) => {
                log!(
                    TRACE_XRC,
                    "[fetch_all_rates] fetched new rate for {}: {} with timestamp: {}",
                    asset_id,
                    price,
                    timestamp_sec
                );
                cache_quote(asset_id, price, timestamp_sec);
            }
            Err(error) => log!(
                TRACE_XRC,
                "[fetch_all_rates] failed to fetch a quote for {}: {}",
                asset_id,
                error
            ),
        }
    }

    crate::check_positions();
}

/// Fetches a fresh quote for every registered asset, for one price-sensitive
/// operation. Fails with `OracleUnavailable` unless every asset can be
/// quoted right now; a partial view could misprice a mixed position.
pub async fn price_snapshot() -> Result<PriceView, ProtocolError> {
    let assets: Vec<(CollateralId, PriceSource)> = read_state(|s| {
        s.collateral_assets
            .iter()
            .map(|asset| (asset.ledger_canister_id, asset.price_source.clone()))
            .collect()
    });

    let quotes = join_all(
        assets
            .iter()
            .map(|(_, price_source)| quote_usd_price(price_source)),
    )
    .await;

    let mut view = PriceView::new();
    for ((asset_id, _), quote) in assets.iter().zip(quotes) {
        match quote {
            Ok((price, timestamp_sec)) => {
                cache_quote(*asset_id, price, timestamp_sec);
                view.insert(*asset_id, price);
            }
            Err(error) => {
                return Err(ProtocolError::OracleUnavailable(format!(
                    "no quote for collateral asset {asset_id}: {error}"
                )))
            }
        }
    }
    Ok(view)
}
