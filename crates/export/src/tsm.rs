//! TradeSkillMaster `AppData.lua` price format.
//!
//! Every block is a single line:
//!
//! ```text
//! select(2, ...).LoadData("<TYPE>","<Realm>",[[return {downloadTime=<ts>,fields={..},data={{..},..}}]])
//! ```

use crate::summary::{SnapshotSummary, mean_market_value};

/// Version reported in the `APP_INFO` block.
pub const APP_VERSION: u32 = 41200;

pub const DATA: &str = "AUCTIONDB_NON_COMMODITY_DATA";
pub const SCAN_STAT: &str = "AUCTIONDB_NON_COMMODITY_SCAN_STAT";
pub const HISTORICAL: &str = "AUCTIONDB_NON_COMMODITY_HISTORICAL";
pub const REGION_STAT: &str = "AUCTIONDB_REGION_STAT";
pub const REGION_HISTORICAL: &str = "AUCTIONDB_REGION_HISTORICAL";

const NUMERALS: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Integers are written in base 32.
pub fn base32(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(NUMERALS[(value % 32) as usize]);
        value /= 32;
    }
    digits.iter().rev().map(|&d| d as char).collect()
}

/// Numeric item strings are written bare, everything else quoted.
fn item_literal(item: &str) -> String {
    match !item.is_empty() && item.bytes().all(|b| b.is_ascii_digit()) {
        true => item.to_string(),
        false => format!("\"{}\"", escape(item)),
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// One `LoadData` line. Rows whose values are all zero are left out.
pub fn data_line<'a>(
    kind: &str,
    realm: &str,
    download_time: i64,
    fields: &[&str],
    rows: impl IntoIterator<Item = (&'a str, Vec<u64>)>,
) -> String {
    let fields = fields.iter().map(|field| format!("\"{field}\"")).collect::<Vec<_>>().join(",");
    let data = rows
        .into_iter()
        .filter(|(_, values)| values.iter().any(|value| *value > 0))
        .map(|(item, values)| {
            let mut row = item_literal(item);
            for value in values {
                row.push(',');
                row.push_str(&base32(value));
            }
            format!("{{{row}}}")
        })
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "select(2, ...).LoadData(\"{kind}\",\"{}\",[[return {{downloadTime={download_time},fields={{{fields}}},data={{{data}}}}}]])",
        escape(realm)
    )
}

pub fn app_info_line(last_sync: i64) -> String {
    format!(
        "select(2, ...).LoadData(\"APP_INFO\",\"Global\",[[return {{version={APP_VERSION},lastSync={last_sync},message={{id=0,msg=\"\"}},news={{}}}}]])"
    )
}

/// Summaries inside the scan-stat and historical windows.
#[derive(Clone, Copy, Debug)]
pub struct Windows<'a> {
    pub recent: &'a [SnapshotSummary],
    pub historical: &'a [SnapshotSummary],
}

/// Complete file contents for one realm.
///
/// `realm` holds the realm's own summaries and `region` those of every
/// stored realm of its region; both include `latest`. Region blocks are
/// labelled with `region_label`, e.g. `US`.
pub fn render(
    realm_label: &str,
    region_label: &str,
    latest: &SnapshotSummary,
    realm: Windows<'_>,
    region: Windows<'_>,
) -> String {
    let ts = latest.timestamp();
    let mut out = String::new();
    let mut push = |line: String| {
        out.push_str(&line);
        out.push('\n');
    };

    let rows = latest
        .items
        .iter()
        .map(|(item, stats)| (item.as_str(), vec![stats.min_buyout, stats.num_auctions, stats.market_value]));
    push(data_line(
        DATA,
        realm_label,
        ts,
        &["itemString", "minBuyout", "numAuctions", "marketValueRecent"],
        rows,
    ));

    let items = known_items(realm.historical);
    let rows = items.iter().map(|item| (item.as_str(), vec![mean_market_value(realm.recent, item)]));
    push(data_line(SCAN_STAT, realm_label, ts, &["itemString", "marketValue"], rows));
    let rows = items.iter().map(|item| (item.as_str(), vec![mean_market_value(realm.historical, item)]));
    push(data_line(HISTORICAL, realm_label, ts, &["itemString", "historical"], rows));

    let items = known_items(region.historical);
    let rows = items.iter().map(|item| (item.as_str(), vec![mean_market_value(region.recent, item)]));
    push(data_line(REGION_STAT, region_label, ts, &["itemString", "regionMarketValue"], rows));
    let rows = items.iter().map(|item| (item.as_str(), vec![mean_market_value(region.historical, item)]));
    push(data_line(REGION_HISTORICAL, region_label, ts, &["itemString", "regionHistorical"], rows));

    push(app_info_line(ts));
    out
}

fn known_items(summaries: &[SnapshotSummary]) -> Vec<String> {
    let mut items: Vec<String> = summaries.iter().flat_map(|summary| summary.items.keys().cloned()).collect();
    items.sort_unstable();
    items.dedup();
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::ItemStats;
    use ahdb_store::Scope;
    use rstest::rstest;
    use std::collections::BTreeMap;

    #[rstest]
    #[case(0, "0")]
    #[case(31, "V")]
    #[case(32, "10")]
    #[case(250_000, "7K4G")]
    #[case(1_000_000, "UGI0")]
    fn test_base32(#[case] value: u64, #[case] expected: &str) {
        assert_eq!(base32(value), expected);
    }

    #[rstest]
    #[case("19019", "19019")]
    #[case("i:19019::1", "\"i:19019::1\"")]
    #[case("p:1155:1:2", "\"p:1155:1:2\"")]
    fn test_item_literal(#[case] item: &str, #[case] expected: &str) {
        assert_eq!(item_literal(item), expected);
    }

    #[test]
    fn test_data_line() {
        let rows = vec![("19019", vec![32, 1]), ("i:2589", vec![0, 0]), ("i:2590", vec![0, 5])];
        let line = data_line(DATA, "Stormrage", 1_700_000_000, &["itemString", "minBuyout", "numAuctions"], rows);
        assert_eq!(
            line,
            "select(2, ...).LoadData(\"AUCTIONDB_NON_COMMODITY_DATA\",\"Stormrage\",[[return \
             {downloadTime=1700000000,fields={\"itemString\",\"minBuyout\",\"numAuctions\"},\
             data={{19019,10,1},{\"i:2590\",0,5}}}]])"
        );
    }

    #[test]
    fn test_app_info_line() {
        assert_eq!(
            app_info_line(1_700_000_000),
            "select(2, ...).LoadData(\"APP_INFO\",\"Global\",[[return \
             {version=41200,lastSync=1700000000,message={id=0,msg=\"\"},news={}}]])"
        );
    }

    #[test]
    fn test_render_blocks() {
        let scope: Scope = "us/stormrage".parse().unwrap();
        let summary = |ts, value| SnapshotSummary {
            key: scope.key(ts),
            items: BTreeMap::from([(
                "19019".to_string(),
                ItemStats {
                    min_buyout: value,
                    num_auctions: 1,
                    market_value: value,
                },
            )]),
        };
        let old = summary(100, 64);
        let latest = summary(200, 32);
        let neighbour = summary(150, 128);
        let own = [old, latest.clone()];
        let regional = [own[0].clone(), neighbour, latest.clone()];
        let out = render(
            "Stormrage",
            "US",
            &latest,
            Windows {
                recent: &own[1..],
                historical: &own,
            },
            Windows {
                recent: &regional[1..],
                historical: &regional,
            },
        );
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].contains(DATA) && lines[0].contains("{19019,10,1,10}"));
        assert!(lines[1].contains(SCAN_STAT) && lines[1].contains("{19019,10}"));
        assert!(lines[2].contains(HISTORICAL) && lines[2].contains("{19019,1G}"));
        // Region means: (128 + 32) / 2 = 80 and (64 + 128 + 32) / 3 = 75.
        assert!(lines[3].contains("(\"AUCTIONDB_REGION_STAT\",\"US\""));
        assert!(lines[3].contains("\"regionMarketValue\"") && lines[3].contains("{19019,2G}"));
        assert!(lines[4].contains("(\"AUCTIONDB_REGION_HISTORICAL\",\"US\""));
        assert!(lines[4].contains("\"regionHistorical\"") && lines[4].contains("{19019,2B}"));
        assert!(lines[5].contains("lastSync=200"));
        assert!(lines.iter().take(5).all(|line| line.contains("downloadTime=200")));
        assert!(out.ends_with('\n'));
    }
}
