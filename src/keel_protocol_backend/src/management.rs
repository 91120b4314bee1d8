use crate::logs::{DEBUG, INFO};
use crate::numeric::{Tokens, KUSD};
use crate::state::{mutate_state, read_state, CollateralId, PriceSource};
use candid::{Nat, Principal};
use ic_canister_log::log;
use ic_cdk::api::call::{call, call_with_payment, RejectionCode};
use ic_xrc_types::{Asset, AssetClass, GetExchangeRateRequest, GetExchangeRateResult};
use icrc_ledger_types::icrc1::account::Account;
use icrc_ledger_types::icrc1::transfer::{TransferArg, TransferError};
use icrc_ledger_types::icrc2::transfer_from::{TransferFromArgs, TransferFromError};
use num_traits::ToPrimitive;

/// Query the exchange rate canister for the configured asset pair.
/// https://github.com/dfinity/exchange-rate-canister
pub async fn fetch_exchange_rate(
    price_source: &PriceSource,
) -> Result<GetExchangeRateResult, String> {
    const XRC_CALL_COST_CYCLES: u64 = 1_000_000_000;
    const XRC_MARGIN_SEC: u64 = 60;

    let PriceSource::Xrc {
        base_asset,
        quote_asset,
    } = price_source;

    let base = Asset {
        symbol: base_asset.clone(),
        class: AssetClass::Cryptocurrency,
    };
    let quote = Asset {
        symbol: quote_asset.clone(),
        class: AssetClass::FiatCurrency,
    };

    // Take a timestamp slightly in the past so the XRC already has the rate.
    let timestamp_sec = ic_cdk::api::time() / crate::SEC_NANOS - XRC_MARGIN_SEC;

    let args = GetExchangeRateRequest {
        base_asset: base,
        quote_asset: quote,
        timestamp: Some(timestamp_sec),
    };

    let xrc_principal = read_state(|s| s.xrc_principal);

    let res_xrc: Result<(GetExchangeRateResult,), _> = call_with_payment(
        xrc_principal,
        "get_exchange_rate",
        (args.clone(),),
        XRC_CALL_COST_CYCLES,
    )
    .await;

    match res_xrc {
        Ok((rate_result,)) => {
            log!(
                DEBUG,
                "[fetch_exchange_rate] {}/{} response: {:?}",
                base_asset,
                quote_asset,
                rate_result
            );
            Ok(rate_result)
        }
        Err((code, msg)) => {
            log!(
                DEBUG,
                "[fetch_exchange_rate] {}/{} request {:?} failed with code {:?}: {}",
                base_asset,
                quote_asset,
                args,
                code,
                msg
            );
            Err(format!(
                "Error while calling the exchange rate canister ({:?}): {}",
                code, msg
            ))
        }
    }
}

fn to_block_index(block_index: Nat) -> u64 {
    block_index
        .0
        .to_u64()
        .expect("block index does not fit into u64")
}

/// A call rejected by the replica never reached the ledger, so it folds
/// into the ledger's generic error variant.
fn reject_to_transfer_error(code: RejectionCode, message: String) -> TransferError {
    TransferError::GenericError {
        error_code: Nat::from((code as i32).max(0) as u64),
        message,
    }
}

fn reject_to_transfer_from_error(code: RejectionCode, message: String) -> TransferFromError {
    TransferFromError::GenericError {
        error_code: Nat::from((code as i32).max(0) as u64),
        message,
    }
}

async fn icrc1_transfer(ledger: Principal, arg: TransferArg) -> Result<Nat, TransferError> {
    let (result,): (Result<Nat, TransferError>,) = call(ledger, "icrc1_transfer", (arg,))
        .await
        .map_err(|(code, message)| reject_to_transfer_error(code, message))?;
    result
}

async fn icrc2_transfer_from(
    ledger: Principal,
    arg: TransferFromArgs,
) -> Result<Nat, TransferFromError> {
    let (result,): (Result<Nat, TransferFromError>,) =
        call(ledger, "icrc2_transfer_from", (arg,))
            .await
            .map_err(|(code, message)| reject_to_transfer_from_error(code, message))?;
    result
}

/// Mint kUSD to an account. The engine's default account is the ledger's
/// minting account, so a plain transfer from it mints and carries no fee.
pub async fn mint_kusd(amount: KUSD, to: Principal) -> Result<u64, TransferError> {
    let ledger = read_state(|s| s.kusd_ledger_principal);
    let block_index = icrc1_transfer(
        ledger,
        TransferArg {
            from_subaccount: None,
            to: Account {
                owner: to,
                subaccount: None,
            },
            fee: None,
            created_at_time: None,
            memo: None,
            amount: amount.to_nat(),
        },
    )
    .await?;
    Ok(to_block_index(block_index))
}

/// Burn kUSD by pulling it from the payer into the minting account.
/// Requires an ICRC-2 approval from the payer to the engine.
pub async fn burn_kusd_from(amount: KUSD, payer: Principal) -> Result<u64, TransferFromError> {
    let ledger = read_state(|s| s.kusd_ledger_principal);
    let engine_id = ic_cdk::id();
    let block_index = icrc2_transfer_from(
        ledger,
        TransferFromArgs {
            spender_subaccount: None,
            from: Account {
                owner: payer,
                subaccount: None,
            },
            to: Account {
                owner: engine_id,
                subaccount: None,
            },
            amount: amount.to_nat(),
            fee: None,
            created_at_time: None,
            memo: None,
        },
    )
    .await?;
    Ok(to_block_index(block_index))
}

/// Pay out collateral from the engine to a recipient. The fee is passed
/// explicitly so a stale stored fee fails loudly with BadFee instead of
/// silently draining the reserves; the stored fee is corrected before the
/// error is returned.
pub async fn transfer_collateral(
    amount: Tokens,
    fee: Tokens,
    to: Principal,
    ledger: CollateralId,
) -> Result<u64, TransferError> {
    let result = icrc1_transfer(
        ledger,
        TransferArg {
            from_subaccount: None,
            to: Account {
                owner: to,
                subaccount: None,
            },
            fee: Some(fee.to_nat()),
            created_at_time: None,
            memo: None,
            amount: amount.to_nat(),
        },
    )
    .await;

    match result {
        Ok(block_index) => Ok(to_block_index(block_index)),
        Err(error) => {
            if let TransferError::BadFee { expected_fee } = &error {
                let expected_fee: u64 = expected_fee
                    .0
                    .to_u64()
                    .expect("transfer fee does not fit into u64");
                log!(
                    INFO,
                    "[transfer_collateral] updating the stored fee of ledger {} to {}",
                    ledger,
                    expected_fee
                );
                mutate_state(|s| s.update_transfer_fee(ledger, Tokens::new(expected_fee)));
            }
            Err(error)
        }
    }
}

/// Pull collateral from a depositor into the engine. The ledger charges its
/// fee to the payer on top of `amount`, so the engine receives exactly
/// `amount`. Requires an ICRC-2 approval from the payer to the engine.
pub async fn transfer_collateral_from(
    amount: Tokens,
    from: Principal,
    ledger: CollateralId,
) -> Result<u64, TransferFromError> {
    let engine_id = ic_cdk::id();
    let block_index = icrc2_transfer_from(
        ledger,
        TransferFromArgs {
            spender_subaccount: None,
            from: Account {
                owner: from,
                subaccount: None,
            },
            to: Account {
                owner: engine_id,
                subaccount: None,
            },
            amount: amount.to_nat(),
            fee: None,
            created_at_time: None,
            memo: None,
        },
    )
    .await?;
    Ok(to_block_index(block_index))
}
