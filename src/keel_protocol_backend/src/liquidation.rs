use crate::event::record_position_liquidated;
use crate::guard::OperationGuard;
use crate::logs::{DEBUG, INFO};
use crate::management;
use crate::numeric::KUSD;
use crate::state::{mutate_state, read_state};
use crate::ProtocolError;
use candid::{CandidType, Deserialize, Principal};
use ic_canister_log::log;

#[derive(CandidType, Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LiquidationArg {
    pub target: Principal,
    pub collateral_asset: Principal,
    pub debt_to_cover: u64,
}

#[derive(CandidType, Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LiquidationSuccess {
    pub burn_block_index: u64,
    pub payout_block_index: u64,
    pub collateral_to_liquidator: u64,
}

/// Liquidates an unhealthy position: the caller covers `debt_to_cover` of
/// the target's debt with their own kUSD and receives the covered value in
/// collateral plus the liquidation bonus.
///
/// The books are settled first, then the caller's kUSD is burned, then the
/// seized collateral is paid out. A payout failure after the burn rolls the
/// books back and mints the burned kUSD back to the caller.
pub async fn liquidate(
    caller: Principal,
    arg: LiquidationArg,
) -> Result<LiquidationSuccess, ProtocolError> {
    let _guard = OperationGuard::new()?;

    if arg.debt_to_cover == 0 {
        return Err(ProtocolError::InvalidAmount);
    }
    let fee = match read_state(|s| {
        s.asset(&arg.collateral_asset)
            .map(|asset| asset.transfer_fee)
    }) {
        Some(fee) => fee,
        None => return Err(ProtocolError::AssetNotAccepted(arg.collateral_asset)),
    };
    let debt_to_cover = KUSD::new(arg.debt_to_cover);

    let prices = crate::xrc::price_snapshot().await?;

    let outcome = mutate_state(|s| {
        s.apply_liquidation(
            caller,
            arg.target,
            arg.collateral_asset,
            debt_to_cover,
            &prices,
        )
    })?;

    if outcome.collateral_to_liquidator <= fee {
        mutate_state(|s| {
            s.undo_liquidation(
                arg.target,
                arg.collateral_asset,
                outcome.collateral_to_liquidator,
                debt_to_cover,
            )
        });
        return Err(ProtocolError::GenericError(format!(
            "Seized collateral {} does not cover the ledger fee {}.",
            outcome.collateral_to_liquidator, fee
        )));
    }

    let burn_block_index = match management::burn_kusd_from(debt_to_cover, caller).await {
        Ok(block_index) => block_index,
        Err(error) => {
            mutate_state(|s| {
                s.undo_liquidation(
                    arg.target,
                    arg.collateral_asset,
                    outcome.collateral_to_liquidator,
                    debt_to_cover,
                )
            });
            log!(
                DEBUG,
                "[liquidate] failed to burn {} kUSD from {}: {:?}",
                debt_to_cover,
                caller,
                error
            );
            return Err(ProtocolError::BurnFailed(error));
        }
    };

    match management::transfer_collateral(
        outcome.collateral_to_liquidator - fee,
        fee,
        caller,
        arg.collateral_asset,
    )
    .await
    {
        Ok(payout_block_index) => {
            record_position_liquidated(
                arg.target,
                caller,
                arg.collateral_asset,
                debt_to_cover,
                outcome.collateral_to_liquidator,
                burn_block_index,
                payout_block_index,
            );
            log!(
                INFO,
                "[liquidate] {} covered {} kUSD of {} and seized {} of {}, health {} -> {}",
                caller,
                debt_to_cover,
                arg.target,
                outcome.collateral_to_liquidator,
                arg.collateral_asset,
                outcome.starting_health,
                outcome.ending_health
            );
            Ok(LiquidationSuccess {
                burn_block_index,
                payout_block_index,
                collateral_to_liquidator: outcome.collateral_to_liquidator.to_u64(),
            })
        }
        Err(payout_error) => {
            mutate_state(|s| {
                s.undo_liquidation(
                    arg.target,
                    arg.collateral_asset,
                    outcome.collateral_to_liquidator,
                    debt_to_cover,
                )
            });
            log!(
                INFO,
                "[liquidate] payout of {} of {} to {} failed: {:?}, minting back {} kUSD",
                outcome.collateral_to_liquidator,
                arg.collateral_asset,
                caller,
                payout_error,
                debt_to_cover
            );
            match management::mint_kusd(debt_to_cover, caller).await {
                Ok(refund_block_index) => {
                    log!(
                        INFO,
                        "[liquidate] minted {} kUSD back to {} at block {}",
                        debt_to_cover,
                        caller,
                        refund_block_index
                    );
                }
                Err(refund_error) => {
                    log!(
                        INFO,
                        "[liquidate] CRITICAL: payout failed AND minting back failed for {}! \
                         Amount: {} kUSD. Payout error: {:?}. Refund error: {:?}. \
                         Manual intervention required.",
                        caller,
                        debt_to_cover,
                        payout_error,
                        refund_error
                    );
                }
            }
            Err(ProtocolError::TransferFailed(payout_error))
        }
    }
}
