use crate::state::{read_state, PriceSource};
use std::collections::BTreeSet;
use std::io::Write;

pub fn build_dashboard() -> Vec<u8> {
    format!(
        "
    <!DOCTYPE html>
    <html lang=\"en\">
        <head>
            <title>Keel Protocol Dashboard</title>
            <style>
                table {{
                    border: solid;
                    text-align: left;
                    width: 100%;
                    border-width: thin;
                }}
                h3 {{
                    font-variant: small-caps;
                    margin-top: 30px;
                    margin-bottom: 5px;
                }}
                table table {{ font-size: small; }}
                .background {{ margin: 0; padding: 0; }}
                .content {{ max-width: 100vw; width: fit-content; margin: 0 auto; }}
                tbody tr:nth-child(odd) {{ background-color: #eeeeee; }}
            </style>
            <script>
                document.addEventListener(\"DOMContentLoaded\", function() {{
                    var tds = document.querySelectorAll(\".ts-class\");
                    for (var i = 0; i < tds.length; i++) {{
                    var td = tds[i];
                    var timestamp = td.textContent / 1000000;
                    var date = new Date(timestamp);
                    var options = {{
                        year: 'numeric',
                        month: 'short',
                        day: 'numeric',
                        hour: 'numeric',
                        minute: 'numeric',
                        second: 'numeric'
                    }};
                    td.title = td.textContent;
                    td.textContent = date.toLocaleString(undefined, options);
                    }}
                }});
            </script>
        </head>
        <body>
            <div class=\"background content\">
                <div>
                    <h3>Metadata</h3>
                    {}
                </div>
                <div>
                    <h3>Collateral Assets</h3>
                    {}
                </div>
                <div>
                    <h3>Positions</h3>
                    <table>
                        <thead>
                            <tr>
                                <th>Account</th>
                                <th>Debt (kUSD)</th>
                                <th>Collateral Value (USD)</th>
                                <th>Health Factor</th>
                            </tr>
                        </thead>
                        <tbody>{}</tbody>
                    </table>
                </div>
                <div>
                    <h3>Collateral Balances</h3>
                    <table>
                        <thead>
                            <tr>
                                <th>Account</th>
                                <th>Asset</th>
                                <th>Amount</th>
                            </tr>
                        </thead>
                        <tbody>{}</tbody>
                    </table>
                </div>
                <h3>Logs</h3>
                <table>
                    <thead>
                        <tr><th>Priority</th><th>Timestamp</th><th>Location</th><th>Message</th></tr>
                    </thead>
                    <tbody>
                        {}
                    </tbody>
                </table>
            </div>
        </body>
    </html>
    ",
        construct_metadata_table(),
        construct_assets_table(),
        construct_positions_table(),
        construct_balances_table(),
        display_logs()
    )
    .into_bytes()
}

fn with_utf8_buffer(f: impl FnOnce(&mut Vec<u8>)) -> String {
    let mut buf = Vec::new();
    f(&mut buf);
    String::from_utf8(buf).unwrap()
}

fn shorten(principal: &candid::Principal) -> String {
    let text = principal.to_string();
    if text.len() > 12 {
        format!("{}...", &text[..12])
    } else {
        text
    }
}

fn construct_metadata_table() -> String {
    read_state(|s| {
        format!(
            "<table>
                <tbody>
                    <tr>
                        <th>kUSD Ledger Principal</th>
                        <td>{}</td>
                    </tr>
                    <tr>
                        <th>XRC Principal</th>
                        <td>{}</td>
                    </tr>
                    <tr>
                        <th>Accepted Collateral Assets</th>
                        <td>{}</td>
                    </tr>
                    <tr>
                        <th>Total Debt (kUSD)</th>
                        <td>{}</td>
                    </tr>
                    <tr>
                        <th>Open Positions</th>
                        <td>{}</td>
                    </tr>
                </tbody>
            </table>",
            s.kusd_ledger_principal,
            s.xrc_principal,
            s.collateral_assets.len(),
            s.total_debt(),
            s.debt_ledger.len(),
        )
    })
}

fn construct_assets_table() -> String {
    with_utf8_buffer(|buf| {
        read_state(|s| {
            write!(
                buf,
                "<table>
                    <thead>
                        <tr>
                            <th>Ledger</th>
                            <th>Price Source</th>
                            <th>Transfer Fee</th>
                            <th>Last Quote (USD)</th>
                            <th>Last Quote Timestamp</th>
                            <th>Total Deposited</th>
                        </tr>
                    </thead>
                    <tbody>"
            )
            .unwrap();

            for asset in &s.collateral_assets {
                let PriceSource::Xrc {
                    base_asset,
                    quote_asset,
                } = &asset.price_source;
                let quote_str = asset
                    .last_quote
                    .map_or("N/A".to_string(), |quote| quote.to_string());
                let timestamp_str = asset
                    .last_quote_timestamp
                    .map_or("N/A".to_string(), |timestamp| {
                        format!("<span class=\"ts-class\">{}</span>", timestamp)
                    });
                write!(
                    buf,
                    "<tr>
                        <td title=\"{}\">{}</td>
                        <td>{}/{}</td>
                        <td>{}</td>
                        <td>{}</td>
                        <td>{}</td>
                        <td>{}</td>
                    </tr>",
                    asset.ledger_canister_id,
                    shorten(&asset.ledger_canister_id),
                    base_asset,
                    quote_asset,
                    asset.transfer_fee,
                    quote_str,
                    timestamp_str,
                    s.total_collateral(&asset.ledger_canister_id),
                )
                .unwrap();
            }

            write!(buf, "</tbody></table>").unwrap();
        });
    })
}

fn construct_positions_table() -> String {
    with_utf8_buffer(|buf| {
        read_state(|s| {
            let prices = s.cached_price_view();
            let accounts: BTreeSet<_> = s
                .debt_ledger
                .keys()
                .chain(s.collateral_balances.keys())
                .copied()
                .collect();
            for account in &accounts {
                let (value_str, health_str) = match &prices {
                    Some(view) => (
                        s.account_collateral_value(account, view).to_string(),
                        s.health_factor(account, view).to_string(),
                    ),
                    None => ("N/A".to_string(), "N/A".to_string()),
                };
                write!(
                    buf,
                    "
                <tr>
                    <td>{}</td>
                    <td>{}</td>
                    <td>{}</td>
                    <td>{}</td>
                </tr>
                ",
                    account,
                    s.debt_of(account),
                    value_str,
                    health_str,
                )
                .unwrap();
            }
            write!(
                buf,
                "<tr><td style='text-align: right;'><b>Total</b></td><td>{}</td><td></td><td></td></tr>",
                s.total_debt(),
            )
            .unwrap();
        });
    })
}

fn construct_balances_table() -> String {
    with_utf8_buffer(|buf| {
        read_state(|s| {
            for (account, balances) in s.collateral_balances.iter() {
                for (asset_id, amount) in balances.iter() {
                    write!(
                        buf,
                        "<tr><td>{}</td><td title=\"{}\">{}</td><td>{}</td></tr>",
                        account,
                        asset_id,
                        shorten(asset_id),
                        amount,
                    )
                    .unwrap();
                }
            }
        })
    })
}

fn display_logs() -> String {
    use crate::logs::{Log, LogEntry};

    fn display_entry(buf: &mut Vec<u8>, e: &LogEntry) {
        write!(
            buf,
            "<tr><td>{:?}</td><td class=\"ts-class\">{}</td><td><code>{}:{}</code></td><td>{}</td></tr>",
            e.priority, e.timestamp, e.file, e.line, e.message
        )
        .unwrap()
    }

    let mut log: Log = Default::default();
    log.push_all();
    log.entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    with_utf8_buffer(|buf| {
        for e in log.entries {
            display_entry(buf, &e);
        }
    })
}
