use crate::numeric::{HealthFactor, KUSD, Tokens, UsdPrice};
use crate::{
    compute_health_factor, InitArg, ProtocolError, UpgradeArg, LIQUIDATION_BONUS,
    LIQUIDATION_PRECISION, MIN_HEALTH_FACTOR,
};
use candid::Principal;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::btree_map::Entry::{Occupied, Vacant};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// Like assert_eq, but returns an error instead of panicking.
macro_rules! ensure_eq {
    ($lhs:expr, $rhs:expr, $msg:expr $(, $args:expr)* $(,)*) => {
        if $lhs != $rhs {
            return Err(format!("{} ({:?}) != {} ({:?}): {}",
                               std::stringify!($lhs), $lhs,
                               std::stringify!($rhs), $rhs,
                               format!($msg $(,$args)*)));
        }
    }
}

macro_rules! ensure {
    ($cond:expr, $msg:expr $(, $args:expr)* $(,)*) => {
        if !$cond {
            return Err(format!("Condition {} is false: {}",
                               std::stringify!($cond),
                               format!($msg $(,$args)*)));
        }
    }
}

/// 0.0001 tokens, the usual ICRC-1 ledger default. The stored fee is
/// corrected from the ledger's expected fee on the first BadFee rejection.
pub const DEFAULT_TRANSFER_FEE: Tokens = Tokens::new(10_000);

/// Collateral is identified by its ICRC-1 ledger canister principal.
pub type CollateralId = Principal;

/// A full set of fresh quotes, one per registered collateral asset.
pub type PriceView = BTreeMap<CollateralId, UsdPrice>;

/// Where the USD quote for a collateral asset comes from.
#[derive(candid::CandidType, Clone, Debug, PartialEq, Eq, serde::Deserialize, Serialize)]
pub enum PriceSource {
    /// The exchange rate canister, quoting `base_asset` in `quote_asset`.
    Xrc {
        base_asset: String,
        quote_asset: String,
    },
}

/// Per-asset configuration and oracle cache. One entry per accepted
/// collateral token, in registration order.
#[derive(candid::CandidType, Clone, Debug, PartialEq, Eq, serde::Deserialize, Serialize)]
pub struct CollateralAsset {
    /// ICRC-1 ledger canister of the token.
    pub ledger_canister_id: Principal,
    /// How to fetch the USD price for this token.
    pub price_source: PriceSource,
    /// Fee the ledger charges on outbound transfers, in e8s.
    pub transfer_fee: Tokens,
    /// Most recent quote fetched by the rate timer, if any.
    pub last_quote: Option<UsdPrice>,
    /// When `last_quote` was fetched, in nanoseconds.
    pub last_quote_timestamp: Option<u64>,
}

impl CollateralAsset {
    /// The event-sourced part of the entry. Fees and cached quotes track the
    /// live ledgers and the oracle, so they are excluded.
    fn identity(&self) -> (Principal, PriceSource) {
        (self.ledger_canister_id, self.price_source.clone())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum InitError {
    LengthMismatch { assets: usize, feeds: usize },
    DuplicateAsset(Principal),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::LengthMismatch { assets, feeds } => write!(
                f,
                "got {assets} collateral ledgers but {feeds} price feeds, the lists must be parallel"
            ),
            InitError::DuplicateAsset(ledger) => {
                write!(f, "collateral ledger {ledger} is listed more than once")
            }
        }
    }
}

/// What a successful liquidation did to the books, before any transfer
/// has been attempted.
#[derive(Debug, PartialEq, Eq)]
pub struct LiquidationOutcome {
    pub collateral_to_liquidator: Tokens,
    pub starting_health: HealthFactor,
    pub ending_health: HealthFactor,
}

thread_local! {
    static __STATE: RefCell<Option<State>> = RefCell::default();
}

#[derive(Debug)]
pub struct State {
    /// Accepted collateral assets, in registration order.
    pub collateral_assets: Vec<CollateralAsset>,
    /// account -> collateral ledger -> deposited amount. Zero entries are
    /// pruned on debit.
    pub collateral_balances: BTreeMap<Principal, BTreeMap<CollateralId, Tokens>>,
    /// account -> outstanding minted kUSD. Zero entries are pruned on burn.
    pub debt_ledger: BTreeMap<Principal, KUSD>,
    pub kusd_ledger_principal: Principal,
    pub xrc_principal: Principal,
    pub operation_in_flight: bool,
    pub is_fetching_rates: bool,
}

impl State {
    pub fn new(args: InitArg) -> Result<State, InitError> {
        let InitArg {
            kusd_ledger_principal,
            xrc_principal,
            collateral_ledgers,
            price_feeds,
        } = args;
        if collateral_ledgers.len() != price_feeds.len() {
            return Err(InitError::LengthMismatch {
                assets: collateral_ledgers.len(),
                feeds: price_feeds.len(),
            });
        }
        let mut seen: BTreeSet<Principal> = BTreeSet::new();
        let mut collateral_assets = Vec::with_capacity(collateral_ledgers.len());
        for (ledger_canister_id, price_source) in
            collateral_ledgers.into_iter().zip(price_feeds.into_iter())
        {
            if !seen.insert(ledger_canister_id) {
                return Err(InitError::DuplicateAsset(ledger_canister_id));
            }
            collateral_assets.push(CollateralAsset {
                ledger_canister_id,
                price_source,
                transfer_fee: DEFAULT_TRANSFER_FEE,
                last_quote: None,
                last_quote_timestamp: None,
            });
        }
        Ok(State {
            collateral_assets,
            collateral_balances: BTreeMap::new(),
            debt_ledger: BTreeMap::new(),
            kusd_ledger_principal,
            xrc_principal,
            operation_in_flight: false,
            is_fetching_rates: false,
        })
    }

    pub fn upgrade(&mut self, args: UpgradeArg) {
        if let Some(xrc_principal) = args.xrc_principal {
            self.xrc_principal = xrc_principal;
        }
    }

    pub fn asset(&self, ledger_canister_id: &Principal) -> Option<&CollateralAsset> {
        self.collateral_assets
            .iter()
            .find(|asset| asset.ledger_canister_id == *ledger_canister_id)
    }

    pub fn is_accepted_asset(&self, ledger_canister_id: &Principal) -> bool {
        self.asset(ledger_canister_id).is_some()
    }

    pub fn collateral_balance(&self, account: &Principal, asset_id: &CollateralId) -> Tokens {
        self.collateral_balances
            .get(account)
            .and_then(|balances| balances.get(asset_id))
            .copied()
            .unwrap_or_default()
    }

    pub fn debt_of(&self, account: &Principal) -> KUSD {
        self.debt_ledger.get(account).copied().unwrap_or_default()
    }

    pub fn total_debt(&self) -> KUSD {
        self.debt_ledger.values().copied().sum()
    }

    pub fn total_collateral(&self, asset_id: &CollateralId) -> Tokens {
        self.collateral_balances
            .values()
            .filter_map(|balances| balances.get(asset_id))
            .copied()
            .sum()
    }

    /// USD value of everything deposited across all accounts, saturating at
    /// the largest representable value so status queries and metrics stay
    /// available for arbitrarily large books.
    pub fn total_collateral_value(&self, prices: &PriceView) -> u64 {
        self.collateral_assets
            .iter()
            .map(|asset| {
                let price = prices[&asset.ledger_canister_id];
                (self.total_collateral(&asset.ledger_canister_id) * price).to_u64() as u128
            })
            .sum::<u128>()
            .min(u64::MAX as u128) as u64
    }

    pub fn credit_collateral(&mut self, account: Principal, asset_id: CollateralId, amount: Tokens) {
        debug_assert!(self.is_accepted_asset(&asset_id));
        *self
            .collateral_balances
            .entry(account)
            .or_default()
            .entry(asset_id)
            .or_default() += amount;
    }

    pub fn debit_collateral(
        &mut self,
        account: Principal,
        asset_id: CollateralId,
        amount: Tokens,
    ) -> Result<(), ProtocolError> {
        let balance = self.collateral_balance(&account, &asset_id);
        let remaining = match balance.checked_sub(amount) {
            Some(remaining) => remaining,
            None => {
                return Err(ProtocolError::InsufficientCollateral {
                    balance: balance.to_u64(),
                    requested: amount.to_u64(),
                })
            }
        };
        match self.collateral_balances.entry(account) {
            Occupied(mut account_balances) => {
                if remaining == 0 {
                    account_balances.get_mut().remove(&asset_id);
                    if account_balances.get().is_empty() {
                        account_balances.remove();
                    }
                } else if let Some(entry) = account_balances.get_mut().get_mut(&asset_id) {
                    *entry = remaining;
                }
                Ok(())
            }
            // Only reachable for a zero debit against an empty account.
            Vacant(_) => Ok(()),
        }
    }

    pub fn credit_debt(&mut self, account: Principal, amount: KUSD) {
        *self.debt_ledger.entry(account).or_default() += amount;
    }

    pub fn debit_debt(&mut self, account: Principal, amount: KUSD) -> Result<(), ProtocolError> {
        let minted = self.debt_of(&account);
        let remaining = match minted.checked_sub(amount) {
            Some(remaining) => remaining,
            None => {
                return Err(ProtocolError::BurnExceedsDebt {
                    minted: minted.to_u64(),
                    requested: amount.to_u64(),
                })
            }
        };
        if remaining == 0 {
            self.debt_ledger.remove(&account);
        } else {
            self.debt_ledger.insert(account, remaining);
        }
        Ok(())
    }

    /// Total USD value of everything the account has deposited, summed over
    /// the asset registry in registration order.
    pub fn account_collateral_value(&self, account: &Principal, prices: &PriceView) -> KUSD {
        let balances = match self.collateral_balances.get(account) {
            Some(balances) => balances,
            None => return KUSD::new(0),
        };
        self.collateral_assets
            .iter()
            .filter_map(|asset| {
                let amount = *balances.get(&asset.ledger_canister_id)?;
                let price = match prices.get(&asset.ledger_canister_id) {
                    Some(price) => *price,
                    None => ic_cdk::trap(&format!(
                        "no quote for collateral asset {}",
                        asset.ledger_canister_id
                    )),
                };
                Some(amount * price)
            })
            .sum()
    }

    pub fn health_factor(&self, account: &Principal, prices: &PriceView) -> HealthFactor {
        compute_health_factor(
            self.account_collateral_value(account, prices),
            self.debt_of(account),
        )
    }

    pub fn ensure_healthy(
        &self,
        account: &Principal,
        prices: &PriceView,
    ) -> Result<(), ProtocolError> {
        let health_factor = self.health_factor(account, prices);
        if health_factor < MIN_HEALTH_FACTOR {
            return Err(ProtocolError::BreaksHealthFactor {
                health_factor: health_factor.to_u128(),
            });
        }
        Ok(())
    }

    pub fn apply_deposit(&mut self, account: Principal, asset_id: CollateralId, amount: Tokens) {
        self.credit_collateral(account, asset_id, amount);
    }

    pub fn undo_deposit(&mut self, account: Principal, asset_id: CollateralId, amount: Tokens) {
        if self.debit_collateral(account, asset_id, amount).is_err() {
            ic_cdk::trap("cannot undo a deposit that was never applied");
        }
    }

    pub fn apply_redeem(
        &mut self,
        from: Principal,
        asset_id: CollateralId,
        amount: Tokens,
    ) -> Result<(), ProtocolError> {
        self.debit_collateral(from, asset_id, amount)
    }

    pub fn undo_redeem(&mut self, from: Principal, asset_id: CollateralId, amount: Tokens) {
        self.credit_collateral(from, asset_id, amount);
    }

    pub fn apply_mint(&mut self, account: Principal, amount: KUSD) {
        self.credit_debt(account, amount);
    }

    pub fn undo_mint(&mut self, account: Principal, amount: KUSD) {
        if self.debit_debt(account, amount).is_err() {
            ic_cdk::trap("cannot undo a mint that was never applied");
        }
    }

    pub fn apply_burn(&mut self, account: Principal, amount: KUSD) -> Result<(), ProtocolError> {
        self.debit_debt(account, amount)
    }

    pub fn undo_burn(&mut self, account: Principal, amount: KUSD) {
        self.credit_debt(account, amount);
    }

    /// Books a liquidation: seizes the covered value plus the bonus from the
    /// target and retires the covered debt. Leaves the state untouched on
    /// every error path.
    ///
    /// The caller is responsible for burning the liquidator's kUSD and
    /// paying out the seized collateral afterwards.
    pub fn apply_liquidation(
        &mut self,
        liquidator: Principal,
        target: Principal,
        asset_id: CollateralId,
        debt_to_cover: KUSD,
        prices: &PriceView,
    ) -> Result<LiquidationOutcome, ProtocolError> {
        let starting_health = self.health_factor(&target, prices);
        if starting_health >= MIN_HEALTH_FACTOR {
            return Err(ProtocolError::HealthFactorOk);
        }
        let price = match prices.get(&asset_id) {
            Some(price) => *price,
            None => ic_cdk::trap("no quote for the seized collateral asset"),
        };
        let base_amount = debt_to_cover / price;
        let bonus = Tokens::new(
            (base_amount.to_u64() as u128 * LIQUIDATION_BONUS / LIQUIDATION_PRECISION) as u64,
        );
        let collateral_to_liquidator = base_amount + bonus;
        // A cover too small to floor to any collateral would repay debt for
        // nothing; seizures must be positive like every other amount.
        if collateral_to_liquidator == 0 {
            return Err(ProtocolError::InvalidAmount);
        }

        self.debit_collateral(target, asset_id, collateral_to_liquidator)?;
        if let Err(error) = self.debit_debt(target, debt_to_cover) {
            self.credit_collateral(target, asset_id, collateral_to_liquidator);
            return Err(error);
        }

        let ending_health = self.health_factor(&target, prices);
        if ending_health <= starting_health {
            self.undo_liquidation(target, asset_id, collateral_to_liquidator, debt_to_cover);
            return Err(ProtocolError::HealthFactorNotImproved {
                starting: starting_health.to_u128(),
                ending: ending_health.to_u128(),
            });
        }
        if let Err(error) = self.ensure_healthy(&liquidator, prices) {
            self.undo_liquidation(target, asset_id, collateral_to_liquidator, debt_to_cover);
            return Err(error);
        }
        Ok(LiquidationOutcome {
            collateral_to_liquidator,
            starting_health,
            ending_health,
        })
    }

    pub fn undo_liquidation(
        &mut self,
        target: Principal,
        asset_id: CollateralId,
        collateral_seized: Tokens,
        debt_covered: KUSD,
    ) {
        self.credit_collateral(target, asset_id, collateral_seized);
        self.credit_debt(target, debt_covered);
    }

    pub fn record_quote(&mut self, asset_id: CollateralId, price: UsdPrice, timestamp: u64) {
        if let Some(asset) = self
            .collateral_assets
            .iter_mut()
            .find(|asset| asset.ledger_canister_id == asset_id)
        {
            asset.last_quote = Some(price);
            asset.last_quote_timestamp = Some(timestamp);
        }
    }

    pub fn update_transfer_fee(&mut self, asset_id: CollateralId, transfer_fee: Tokens) {
        if let Some(asset) = self
            .collateral_assets
            .iter_mut()
            .find(|asset| asset.ledger_canister_id == asset_id)
        {
            asset.transfer_fee = transfer_fee;
        }
    }

    /// Quotes from the cache maintained by the rate timer, or `None` until
    /// every registered asset has been quoted at least once.
    pub fn cached_price_view(&self) -> Option<PriceView> {
        self.collateral_assets
            .iter()
            .map(|asset| Some((asset.ledger_canister_id, asset.last_quote?)))
            .collect()
    }

    pub fn check_semantically_eq(&self, other: &Self) -> Result<(), String> {
        ensure_eq!(
            self.collateral_balances,
            other.collateral_balances,
            "collateral_balances does not match"
        );
        ensure_eq!(
            self.debt_ledger,
            other.debt_ledger,
            "debt_ledger does not match"
        );
        ensure_eq!(
            self.kusd_ledger_principal,
            other.kusd_ledger_principal,
            "kusd_ledger_principal does not match"
        );
        ensure_eq!(
            self.xrc_principal,
            other.xrc_principal,
            "xrc_principal does not match"
        );
        ensure_eq!(
            self.collateral_assets
                .iter()
                .map(CollateralAsset::identity)
                .collect::<Vec<_>>(),
            other
                .collateral_assets
                .iter()
                .map(CollateralAsset::identity)
                .collect::<Vec<_>>(),
            "collateral asset registry does not match"
        );
        Ok(())
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        let mut registered: BTreeSet<Principal> = BTreeSet::new();
        for asset in &self.collateral_assets {
            ensure!(
                registered.insert(asset.ledger_canister_id),
                "collateral asset {} is registered twice",
                asset.ledger_canister_id
            );
        }

        for (account, balances) in &self.collateral_balances {
            ensure!(
                !balances.is_empty(),
                "account {} has an empty balance map",
                account
            );
            for (asset_id, amount) in balances {
                ensure!(
                    registered.contains(asset_id),
                    "account {} holds unregistered asset {}",
                    account,
                    asset_id
                );
                ensure!(
                    *amount != 0,
                    "account {} has a zero balance entry for {}",
                    account,
                    asset_id
                );
            }
        }

        for (account, debt) in &self.debt_ledger {
            ensure!(*debt != 0, "account {} has a zero debt entry", account);
        }

        Ok(())
    }
}

pub fn mutate_state<F, R>(f: F) -> R
where
    F: FnOnce(&mut State) -> R,
{
    __STATE.with(|s| f(s.borrow_mut().as_mut().expect("State not initialized!")))
}

/// Read (part of) the current state using `f`.
///
/// Panics if there is no state.
pub fn read_state<F, R>(f: F) -> R
where
    F: FnOnce(&State) -> R,
{
    __STATE.with(|s| f(s.borrow().as_ref().expect("State not initialized!")))
}

/// Replaces the current state.
pub fn replace_state(state: State) {
    __STATE.with(|s| {
        *s.borrow_mut() = Some(state);
    });
}
