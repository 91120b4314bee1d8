use crate::event::{record_collateral_deposited, record_collateral_redeemed};
use crate::guard::OperationGuard;
use crate::logs::{DEBUG, INFO};
use crate::management::{transfer_collateral, transfer_collateral_from};
use crate::numeric::Tokens;
use crate::state::{mutate_state, read_state, CollateralId};
use crate::{ProtocolError, SuccessWithFee};
use candid::{CandidType, Deserialize, Principal};
use ic_canister_log::log;

#[derive(CandidType, Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DepositSuccess {
    pub block_index: u64,
}

#[derive(CandidType, Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DepositAndMintSuccess {
    pub deposit_block_index: u64,
    pub mint_block_index: u64,
}

#[derive(CandidType, Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RedeemForKusdSuccess {
    pub burn_block_index: u64,
    pub payout_block_index: u64,
    pub fee_amount_paid: u64,
}

/// Pulls `amount` of the given collateral from the caller into the engine.
/// The caller must have approved the engine on the collateral ledger first.
pub async fn deposit_collateral(
    caller: Principal,
    asset_id: CollateralId,
    amount: u64,
) -> Result<DepositSuccess, ProtocolError> {
    let _guard = OperationGuard::new()?;
    deposit_collateral_internal(caller, asset_id, amount).await
}

/// Internal deposit logic without guard management. Called by
/// `deposit_collateral` and by `deposit_collateral_and_mint`, which already
/// holds the operation guard.
pub(crate) async fn deposit_collateral_internal(
    caller: Principal,
    asset_id: CollateralId,
    amount: u64,
) -> Result<DepositSuccess, ProtocolError> {
    if amount == 0 {
        return Err(ProtocolError::InvalidAmount);
    }
    if !read_state(|s| s.is_accepted_asset(&asset_id)) {
        return Err(ProtocolError::AssetNotAccepted(asset_id));
    }
    let amount = Tokens::new(amount);

    mutate_state(|s| s.apply_deposit(caller, asset_id, amount));

    match transfer_collateral_from(amount, caller, asset_id).await {
        Ok(block_index) => {
            record_collateral_deposited(caller, asset_id, amount, block_index);
            log!(
                INFO,
                "[deposit_collateral] {} deposited {} of {} at block {}",
                caller,
                amount,
                asset_id,
                block_index
            );
            Ok(DepositSuccess { block_index })
        }
        Err(error) => {
            mutate_state(|s| s.undo_deposit(caller, asset_id, amount));
            log!(
                DEBUG,
                "[deposit_collateral] failed to pull {} of {} from {}: {:?}",
                amount,
                asset_id,
                caller,
                error
            );
            Err(ProtocolError::TransferFromFailed(error, amount.to_u64()))
        }
    }
}

/// Sends `amount` of the given collateral back to the caller, provided the
/// remaining position stays healthy. The ledger fee is taken out of the
/// amount, so the caller receives `amount - fee`.
pub async fn redeem_collateral(
    caller: Principal,
    asset_id: CollateralId,
    amount: u64,
) -> Result<SuccessWithFee, ProtocolError> {
    let _guard = OperationGuard::new()?;
    redeem_collateral_internal(caller, asset_id, amount).await
}

/// Internal redeem logic without guard management. Called by
/// `redeem_collateral` and by `redeem_collateral_for_kusd`, which already
/// holds the operation guard.
pub(crate) async fn redeem_collateral_internal(
    caller: Principal,
    asset_id: CollateralId,
    amount: u64,
) -> Result<SuccessWithFee, ProtocolError> {
    if amount == 0 {
        return Err(ProtocolError::InvalidAmount);
    }
    let fee = match read_state(|s| s.asset(&asset_id).map(|asset| asset.transfer_fee)) {
        Some(fee) => fee,
        None => return Err(ProtocolError::AssetNotAccepted(asset_id)),
    };
    if amount <= fee.to_u64() {
        return Err(ProtocolError::AmountTooLow {
            minimum_amount: fee.to_u64() + 1,
        });
    }
    let amount = Tokens::new(amount);

    let prices = crate::xrc::price_snapshot().await?;

    mutate_state(|s| {
        s.apply_redeem(caller, asset_id, amount)?;
        if let Err(error) = s.ensure_healthy(&caller, &prices) {
            s.undo_redeem(caller, asset_id, amount);
            return Err(error);
        }
        Ok(())
    })?;

    match transfer_collateral(amount - fee, fee, caller, asset_id).await {
        Ok(block_index) => {
            record_collateral_redeemed(caller, caller, asset_id, amount, block_index);
            log!(
                INFO,
                "[redeem_collateral] {} redeemed {} of {} at block {}",
                caller,
                amount,
                asset_id,
                block_index
            );
            Ok(SuccessWithFee {
                block_index,
                fee_amount_paid: fee.to_u64(),
            })
        }
        Err(error) => {
            mutate_state(|s| s.undo_redeem(caller, asset_id, amount));
            log!(
                DEBUG,
                "[redeem_collateral] failed to send {} of {} to {}: {:?}",
                amount,
                asset_id,
                caller,
                error
            );
            Err(ProtocolError::TransferFailed(error))
        }
    }
}

/// Deposits collateral and mints kUSD against it in a single call. The two
/// legs are sequenced under one operation guard; if the mint leg fails the
/// deposit stays committed and the caller can mint separately.
pub async fn deposit_collateral_and_mint(
    caller: Principal,
    asset_id: CollateralId,
    collateral_amount: u64,
    mint_amount: u64,
) -> Result<DepositAndMintSuccess, ProtocolError> {
    let _guard = OperationGuard::new()?;

    if collateral_amount == 0 || mint_amount == 0 {
        return Err(ProtocolError::InvalidAmount);
    }
    if !read_state(|s| s.is_accepted_asset(&asset_id)) {
        return Err(ProtocolError::AssetNotAccepted(asset_id));
    }

    let deposit = deposit_collateral_internal(caller, asset_id, collateral_amount).await?;

    match crate::debt::mint_kusd_internal(caller, mint_amount).await {
        Ok(mint_block_index) => Ok(DepositAndMintSuccess {
            deposit_block_index: deposit.block_index,
            mint_block_index,
        }),
        Err(error) => {
            log!(
                INFO,
                "[deposit_collateral_and_mint] {} deposited {} of {} at block {} but minting {} kUSD failed: {:?}",
                caller,
                collateral_amount,
                asset_id,
                deposit.block_index,
                mint_amount,
                error
            );
            Err(ProtocolError::GenericError(format!(
                "Deposited {} of {} at block {} but minting {} kUSD failed: {:?}. \
                 The collateral stays deposited, you can mint separately.",
                collateral_amount, asset_id, deposit.block_index, mint_amount, error
            )))
        }
    }
}

/// Burns kUSD and redeems collateral in a single call. Burning first lowers
/// the debt, so the redeem leg is checked against the improved position. If
/// the redeem leg fails the burn stays committed.
pub async fn redeem_collateral_for_kusd(
    caller: Principal,
    asset_id: CollateralId,
    collateral_amount: u64,
    kusd_to_burn: u64,
) -> Result<RedeemForKusdSuccess, ProtocolError> {
    let _guard = OperationGuard::new()?;

    if collateral_amount == 0 || kusd_to_burn == 0 {
        return Err(ProtocolError::InvalidAmount);
    }
    if !read_state(|s| s.is_accepted_asset(&asset_id)) {
        return Err(ProtocolError::AssetNotAccepted(asset_id));
    }

    let burn_block_index = crate::debt::burn_kusd_internal(caller, kusd_to_burn).await?;

    match redeem_collateral_internal(caller, asset_id, collateral_amount).await {
        Ok(redeem) => Ok(RedeemForKusdSuccess {
            burn_block_index,
            payout_block_index: redeem.block_index,
            fee_amount_paid: redeem.fee_amount_paid,
        }),
        Err(error) => {
            log!(
                INFO,
                "[redeem_collateral_for_kusd] {} burned {} kUSD at block {} but redeeming {} of {} failed: {:?}",
                caller,
                kusd_to_burn,
                burn_block_index,
                collateral_amount,
                asset_id,
                error
            );
            Err(ProtocolError::GenericError(format!(
                "Burned {} kUSD at block {} but redeeming {} of {} failed: {:?}. \
                 The debt stays repaid, you can redeem separately.",
                kusd_to_burn, burn_block_index, collateral_amount, asset_id, error
            )))
        }
    }
}
