use crate::event::{record_stablecoin_burned, record_stablecoin_minted};
use crate::guard::OperationGuard;
use crate::logs::{DEBUG, INFO};
use crate::management;
use crate::numeric::KUSD;
use crate::state::mutate_state;
use crate::ProtocolError;
use candid::Principal;
use ic_canister_log::log;

/// Mints `amount` kUSD to the caller. The position must stay over the
/// minimum health factor with the new debt counted in, valued at a fresh
/// price snapshot.
pub async fn mint_kusd(caller: Principal, amount: u64) -> Result<u64, ProtocolError> {
    let _guard = OperationGuard::new()?;
    mint_kusd_internal(caller, amount).await
}

/// Internal mint logic without guard management. Called by `mint_kusd` and
/// by `deposit_collateral_and_mint`, which already holds the operation
/// guard.
pub(crate) async fn mint_kusd_internal(
    caller: Principal,
    amount: u64,
) -> Result<u64, ProtocolError> {
    if amount == 0 {
        return Err(ProtocolError::InvalidAmount);
    }
    let amount = KUSD::new(amount);

    let prices = crate::xrc::price_snapshot().await?;

    mutate_state(|s| {
        s.apply_mint(caller, amount);
        if let Err(error) = s.ensure_healthy(&caller, &prices) {
            s.undo_mint(caller, amount);
            return Err(error);
        }
        Ok(())
    })?;

    match management::mint_kusd(amount, caller).await {
        Ok(block_index) => {
            record_stablecoin_minted(caller, amount, block_index);
            log!(
                INFO,
                "[mint_kusd] {} minted {} kUSD at block {}",
                caller,
                amount,
                block_index
            );
            Ok(block_index)
        }
        Err(error) => {
            mutate_state(|s| s.undo_mint(caller, amount));
            log!(
                DEBUG,
                "[mint_kusd] failed to mint {} kUSD to {}: {:?}",
                amount,
                caller,
                error
            );
            Err(ProtocolError::MintFailed(error))
        }
    }
}

/// Burns `amount` of the caller's kUSD and retires the same amount of their
/// debt. The kUSD is pulled from the caller to the minting account, which is
/// how an ICRC ledger burns.
pub async fn burn_kusd(caller: Principal, amount: u64) -> Result<u64, ProtocolError> {
    let _guard = OperationGuard::new()?;
    burn_kusd_internal(caller, amount).await
}

/// Internal burn logic without guard management. Called by `burn_kusd` and
/// by `redeem_collateral_for_kusd`, which already holds the operation guard.
pub(crate) async fn burn_kusd_internal(
    caller: Principal,
    amount: u64,
) -> Result<u64, ProtocolError> {
    if amount == 0 {
        return Err(ProtocolError::InvalidAmount);
    }
    let amount = KUSD::new(amount);

    let prices = crate::xrc::price_snapshot().await?;

    mutate_state(|s| {
        s.apply_burn(caller, amount)?;
        // Burning can only raise the health factor, so this cannot fire; it
        // keeps the flow aligned with the other debt mutations.
        if let Err(error) = s.ensure_healthy(&caller, &prices) {
            s.undo_burn(caller, amount);
            return Err(error);
        }
        Ok(())
    })?;

    match management::burn_kusd_from(amount, caller).await {
        Ok(block_index) => {
            record_stablecoin_burned(caller, caller, amount, block_index);
            log!(
                INFO,
                "[burn_kusd] {} burned {} kUSD at block {}",
                caller,
                amount,
                block_index
            );
            Ok(block_index)
        }
        Err(error) => {
            mutate_state(|s| s.undo_burn(caller, amount));
            log!(
                DEBUG,
                "[burn_kusd] failed to burn {} kUSD from {}: {:?}",
                amount,
                caller,
                error
            );
            Err(ProtocolError::BurnFailed(error))
        }
    }
}
