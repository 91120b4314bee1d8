use candid::{candid_method, Principal};
use candid_parser::utils::service_equal;
use candid_parser::utils::CandidSource;
use ic_canister_log::log;
use ic_cdk_macros::{init, post_upgrade, query, update};
use keel_protocol_backend::event::Event;
use keel_protocol_backend::http::{HttpRequest, HttpResponse, HttpResponseBuilder};
use keel_protocol_backend::liquidation::{LiquidationArg, LiquidationSuccess};
use keel_protocol_backend::logs::INFO;
use keel_protocol_backend::numeric::{Tokens, KUSD};
use keel_protocol_backend::state::{read_state, replace_state, State};
use keel_protocol_backend::storage::events;
use keel_protocol_backend::vault::{DepositAndMintSuccess, DepositSuccess, RedeemForKusdSuccess};
use keel_protocol_backend::{
    build_position, AcceptedAsset, GetEventsArg, Position, ProtocolArg, ProtocolError,
    ProtocolStatus, SuccessWithFee,
};
use std::collections::BTreeSet;

#[cfg(feature = "self_check")]
fn ok_or_die(result: Result<(), String>) {
    if let Err(msg) = result {
        ic_cdk::println!("{}", msg);
        ic_cdk::trap(&msg);
    }
}

/// Checks that the engine's state is internally consistent and matches the
/// state recovered by replaying the whole event log.
#[cfg(feature = "self_check")]
fn check_invariants() -> Result<(), String> {
    use keel_protocol_backend::event::replay;

    read_state(|s| {
        s.check_invariants()?;

        let events: Vec<_> = keel_protocol_backend::storage::events().collect();
        let recovered_state = replay(events.clone().into_iter())
            .unwrap_or_else(|e| panic!("failed to replay log {:?}: {:?}", events, e));

        recovered_state.check_invariants()?;
        s.check_semantically_eq(&recovered_state)?;

        Ok(())
    })
}

fn check_postcondition<T>(t: T) -> T {
    #[cfg(feature = "self_check")]
    ok_or_die(check_invariants());
    t
}

fn validate_call() -> Result<(), ProtocolError> {
    if ic_cdk::caller() == Principal::anonymous() {
        return Err(ProtocolError::AnonymousCallerNotAllowed);
    }
    Ok(())
}

fn setup_timers() {
    ic_cdk_timers::set_timer_interval(keel_protocol_backend::xrc::FETCHING_RATE_INTERVAL, || {
        ic_cdk::spawn(keel_protocol_backend::xrc::fetch_all_rates())
    });
}

fn main() {}

#[candid_method(init)]
#[init]
fn init(arg: ProtocolArg) {
    match arg {
        ProtocolArg::Init(init_arg) => match State::new(init_arg.clone()) {
            Ok(state) => {
                log!(
                    INFO,
                    "[init] initialized the engine with args: {:?}",
                    init_arg
                );
                keel_protocol_backend::storage::record_event(&Event::Init(init_arg));
                replace_state(state);
            }
            Err(error) => ic_cdk::trap(&format!("[init]: invalid arguments: {}", error)),
        },
        ProtocolArg::Upgrade(_) => ic_cdk::trap("expected Init got Upgrade"),
    }
    setup_timers();
}

#[post_upgrade]
fn post_upgrade(arg: ProtocolArg) {
    use keel_protocol_backend::event::replay;
    use keel_protocol_backend::storage::{count_events, record_event};

    let start = ic_cdk::api::instruction_counter();

    log!(INFO, "[upgrade]: replaying {} events", count_events());

    match arg {
        ProtocolArg::Init(_) => ic_cdk::trap("expected Upgrade got Init"),
        ProtocolArg::Upgrade(upgrade_args) => {
            log!(
                INFO,
                "[upgrade]: updating configuration with {:?}",
                upgrade_args
            );
            record_event(&Event::Upgrade(upgrade_args));
        }
    }

    let state = replay(events()).unwrap_or_else(|e| {
        ic_cdk::trap(&format!(
            "[upgrade]: failed to replay the event log: {:?}",
            e
        ))
    });

    replace_state(state);

    let end = ic_cdk::api::instruction_counter();

    log!(
        INFO,
        "[upgrade]: replaying events consumed {} instructions",
        end - start
    );

    setup_timers();
}

#[candid_method(update)]
#[update]
async fn deposit_collateral(asset: Principal, amount: u64) -> Result<DepositSuccess, ProtocolError> {
    validate_call()?;
    let caller = ic_cdk::api::caller();
    check_postcondition(keel_protocol_backend::vault::deposit_collateral(caller, asset, amount).await)
}

#[candid_method(update)]
#[update]
async fn redeem_collateral(asset: Principal, amount: u64) -> Result<SuccessWithFee, ProtocolError> {
    validate_call()?;
    let caller = ic_cdk::api::caller();
    check_postcondition(keel_protocol_backend::vault::redeem_collateral(caller, asset, amount).await)
}

#[candid_method(update)]
#[update]
async fn mint_kusd(amount: u64) -> Result<u64, ProtocolError> {
    validate_call()?;
    let caller = ic_cdk::api::caller();
    check_postcondition(keel_protocol_backend::debt::mint_kusd(caller, amount).await)
}

#[candid_method(update)]
#[update]
async fn burn_kusd(amount: u64) -> Result<u64, ProtocolError> {
    validate_call()?;
    let caller = ic_cdk::api::caller();
    check_postcondition(keel_protocol_backend::debt::burn_kusd(caller, amount).await)
}

#[candid_method(update)]
#[update]
async fn deposit_collateral_and_mint(
    asset: Principal,
    collateral_amount: u64,
    mint_amount: u64,
) -> Result<DepositAndMintSuccess, ProtocolError> {
    validate_call()?;
    let caller = ic_cdk::api::caller();
    check_postcondition(
        keel_protocol_backend::vault::deposit_collateral_and_mint(
            caller,
            asset,
            collateral_amount,
            mint_amount,
        )
        .await,
    )
}

#[candid_method(update)]
#[update]
async fn redeem_collateral_for_kusd(
    asset: Principal,
    collateral_amount: u64,
    kusd_to_burn: u64,
) -> Result<RedeemForKusdSuccess, ProtocolError> {
    validate_call()?;
    let caller = ic_cdk::api::caller();
    check_postcondition(
        keel_protocol_backend::vault::redeem_collateral_for_kusd(
            caller,
            asset,
            collateral_amount,
            kusd_to_burn,
        )
        .await,
    )
}

#[candid_method(update)]
#[update]
async fn liquidate(arg: LiquidationArg) -> Result<LiquidationSuccess, ProtocolError> {
    validate_call()?;
    let caller = ic_cdk::api::caller();
    check_postcondition(keel_protocol_backend::liquidation::liquidate(caller, arg).await)
}

#[candid_method(query)]
#[query]
fn get_protocol_status() -> ProtocolStatus {
    read_state(|s| {
        let prices = s.cached_price_view();
        let total_collateral_value = prices.as_ref().map(|view| s.total_collateral_value(view));
        ProtocolStatus {
            total_debt: s.total_debt().to_u64(),
            total_collateral_value,
            open_positions: s.debt_ledger.len() as u64,
            accepted_assets: s.collateral_assets.len() as u64,
        }
    })
}

#[candid_method(query)]
#[query]
fn get_accepted_collateral() -> Vec<AcceptedAsset> {
    read_state(|s| {
        s.collateral_assets
            .iter()
            .map(|asset| AcceptedAsset {
                ledger_canister_id: asset.ledger_canister_id,
                price_source: asset.price_source.clone(),
                transfer_fee: asset.transfer_fee.to_u64(),
                last_quote: asset.last_quote.map(|quote| quote.to_u64()),
                last_quote_timestamp: asset.last_quote_timestamp,
            })
            .collect()
    })
}

/// USD value (8 decimals) of `amount` of the given collateral, at the
/// cached quote.
#[candid_method(query)]
#[query]
fn get_usd_value(asset: Principal, amount: u64) -> Result<u64, ProtocolError> {
    read_state(|s| {
        let entry = s
            .asset(&asset)
            .ok_or(ProtocolError::AssetNotAccepted(asset))?;
        let quote = entry.last_quote.ok_or_else(|| {
            ProtocolError::OracleUnavailable(format!("no cached quote for {}", asset))
        })?;
        Ok((Tokens::new(amount) * quote).to_u64())
    })
}

/// How many units of the given collateral are worth `usd_amount` (8
/// decimals), at the cached quote.
#[candid_method(query)]
#[query]
fn get_token_amount_from_usd(asset: Principal, usd_amount: u64) -> Result<u64, ProtocolError> {
    read_state(|s| {
        let entry = s
            .asset(&asset)
            .ok_or(ProtocolError::AssetNotAccepted(asset))?;
        let quote = entry.last_quote.ok_or_else(|| {
            ProtocolError::OracleUnavailable(format!("no cached quote for {}", asset))
        })?;
        Ok((KUSD::new(usd_amount) / quote).to_u64())
    })
}

#[candid_method(query)]
#[query]
fn get_account_collateral_value(account: Principal) -> Result<u64, ProtocolError> {
    read_state(|s| {
        let prices = s.cached_price_view().ok_or_else(|| {
            ProtocolError::OracleUnavailable(
                "not every collateral asset has a cached quote".to_string(),
            )
        })?;
        Ok(s.account_collateral_value(&account, &prices).to_u64())
    })
}

/// The account's health factor at 18 decimals, at the cached quotes.
#[candid_method(query)]
#[query]
fn get_health_factor(account: Principal) -> Result<u128, ProtocolError> {
    read_state(|s| {
        let prices = s.cached_price_view().ok_or_else(|| {
            ProtocolError::OracleUnavailable(
                "not every collateral asset has a cached quote".to_string(),
            )
        })?;
        Ok(s.health_factor(&account, &prices).to_u128())
    })
}

#[candid_method(query)]
#[query]
fn get_positions(target: Option<Principal>) -> Vec<Position> {
    read_state(|s| {
        let prices = s.cached_price_view();
        match target {
            Some(account) => vec![build_position(s, account, prices.as_ref())],
            None => {
                let accounts: BTreeSet<Principal> = s
                    .debt_ledger
                    .keys()
                    .chain(s.collateral_balances.keys())
                    .copied()
                    .collect();
                accounts
                    .into_iter()
                    .map(|account| build_position(s, account, prices.as_ref()))
                    .collect()
            }
        }
    })
}

#[candid_method(query)]
#[query]
fn get_liquidatable_positions() -> Vec<Position> {
    read_state(|s| {
        let prices = match s.cached_price_view() {
            Some(prices) => prices,
            None => return vec![],
        };
        s.debt_ledger
            .keys()
            .filter(|account| {
                s.health_factor(account, &prices) < keel_protocol_backend::MIN_HEALTH_FACTOR
            })
            .map(|account| build_position(s, *account, Some(&prices)))
            .collect()
    })
}

#[candid_method(query)]
#[query]
fn get_account_history(account: Principal) -> Vec<Event> {
    if ic_cdk::api::data_certificate().is_none() {
        ic_cdk::trap("update call rejected");
    }

    events()
        .filter(|event| event.concerns_account(&account))
        .collect()
}

#[candid_method(query)]
#[query]
fn get_events(args: GetEventsArg) -> Vec<Event> {
    if ic_cdk::api::data_certificate().is_none() {
        ic_cdk::trap("update call rejected");
    }
    const MAX_EVENTS_PER_QUERY: usize = 2000;

    events()
        .skip(args.start as usize)
        .take(MAX_EVENTS_PER_QUERY.min(args.length as usize))
        .collect()
}

#[query]
fn http_request(req: HttpRequest) -> HttpResponse {
    use ic_metrics_encoder::MetricsEncoder;
    if ic_cdk::api::data_certificate().is_none() {
        ic_cdk::trap("update call rejected");
    }

    if req.path() == "/metrics" {
        let mut writer = MetricsEncoder::new(vec![], ic_cdk::api::time() as i64 / 1_000_000);

        fn encode_metrics(w: &mut MetricsEncoder<Vec<u8>>) -> std::io::Result<()> {
            read_state(|s| {
                w.gauge_vec("cycle_balance", "Cycle balance of this canister.")?
                    .value(
                        &[("canister", "keel-protocol")],
                        ic_cdk::api::canister_balance128() as f64,
                    )?;

                w.encode_gauge(
                    "keel_open_positions_count",
                    s.debt_ledger.len() as f64,
                    "Count of accounts with outstanding kUSD debt.",
                )?;

                w.encode_gauge(
                    "keel_total_debt_e8s",
                    s.total_debt().to_u64() as f64,
                    "Total outstanding kUSD debt.",
                )?;

                w.encode_gauge(
                    "keel_accepted_collateral_assets",
                    s.collateral_assets.len() as f64,
                    "Count of registered collateral assets.",
                )?;

                let total_collateral_value = s
                    .cached_price_view()
                    .map_or(0, |view| s.total_collateral_value(&view));
                w.encode_gauge(
                    "keel_total_collateral_value_e8s",
                    total_collateral_value as f64,
                    "USD value of all deposited collateral at the cached quotes.",
                )?;

                w.encode_gauge(
                    "keel_event_count",
                    keel_protocol_backend::storage::count_events() as f64,
                    "Number of events in the stable log.",
                )?;

                Ok(())
            })
        }

        match encode_metrics(&mut writer) {
            Ok(()) => HttpResponseBuilder::ok()
                .header("Content-Type", "text/plain; version=0.0.4")
                .with_body_and_content_length(writer.into_inner())
                .build(),
            Err(err) => {
                HttpResponseBuilder::server_error(format!("Failed to encode metrics: {}", err))
                    .build()
            }
        }
    } else if req.path() == "/logs" {
        use keel_protocol_backend::logs::{Log, Priority};
        use std::str::FromStr;

        let max_skip_timestamp = match req.raw_query_param("time") {
            Some(arg) => match u64::from_str(arg) {
                Ok(value) => value,
                Err(_) => {
                    return HttpResponseBuilder::bad_request()
                        .with_body_and_content_length("failed to parse the 'time' parameter")
                        .build()
                }
            },
            None => 0,
        };

        let mut entries: Log = Default::default();

        match req.raw_query_param("priority") {
            Some(priority_str) => match Priority::from_str(priority_str) {
                Ok(priority) => match priority {
                    Priority::Info => entries.push_logs(Priority::Info),
                    Priority::TraceXrc => entries.push_logs(Priority::TraceXrc),
                    Priority::Debug => entries.push_logs(Priority::Debug),
                },
                Err(_) => entries.push_all(),
            },
            None => entries.push_all(),
        }

        entries
            .entries
            .retain(|entry| entry.timestamp >= max_skip_timestamp);
        let mut entries_bytes: Vec<u8> = serde_json::to_string(&entries)
            .unwrap_or_default()
            .into_bytes();

        // Truncate bytes to avoid having more than 2MB response.
        let max_size_bytes: usize = 1_900_000;
        entries_bytes.truncate(max_size_bytes);

        HttpResponseBuilder::ok()
            .header("Content-Type", "application/json; charset=utf-8")
            .with_body_and_content_length(entries_bytes)
            .build()
    } else if req.path() == "/dashboard" {
        use keel_protocol_backend::dashboard::build_dashboard;

        let dashboard = build_dashboard();
        HttpResponseBuilder::ok()
            .header("Content-Type", "text/html; charset=utf-8")
            .with_body_and_content_length(dashboard)
            .build()
    } else {
        HttpResponseBuilder::not_found().build()
    }
}

// Checks the real candid interface against the one declared in the did file
#[test]
fn check_candid_interface_compatibility() {
    fn source_to_str(source: &CandidSource) -> String {
        match source {
            CandidSource::File(f) => std::fs::read_to_string(f).unwrap_or_else(|_| "".to_string()),
            CandidSource::Text(t) => t.to_string(),
        }
    }

    fn check_service_compatible(
        new_name: &str,
        new: CandidSource,
        old_name: &str,
        old: CandidSource,
    ) {
        let new_str = source_to_str(&new);
        let old_str = source_to_str(&old);
        match service_equal(new, old) {
            Ok(_) => {}
            Err(e) => {
                eprintln!(
                    "{} is not compatible with {}!\n\n\
            {}:\n\
            {}\n\n\
            {}:\n\
            {}\n",
                    new_name, old_name, new_name, new_str, old_name, old_str
                );
                panic!("{:?}", e);
            }
        }
    }

    candid::export_service!();

    let new_interface = __export_service();

    // check the public interface against the actual one
    let old_interface = std::path::PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap())
        .join("keel_protocol_backend.did");

    check_service_compatible(
        "actual keel protocol candid interface",
        CandidSource::Text(&new_interface),
        "declared candid interface in keel_protocol_backend.did file",
        CandidSource::File(old_interface.as_path()),
    );
}
