/// csv_source.rs — replay source for the `backtest` binary
///
/// Reads a flat CSV of interleaved trade/quote rows (one file per symbol)
/// into the same `MarketEvent` stream the live WebSocket collector
/// produces, so `Pipeline` never has to know which one is feeding it.
/// Expected columns: `event` ("trade" | "quote"), `ts_ms`, and whichever of
/// `price`/`size` or `bid_px`/`bid_sz`/`ask_px`/`ask_sz` the row type needs;
/// the unused columns may be left blank.
use std::path::Path;

use anyhow::{Context, Result};
use polars::prelude::*;

use crate::transport::MarketEvent;
use crate::types::{Quote, Trade};

pub fn load_events(path: &Path) -> Result<Vec<MarketEvent>> {
    let df = LazyCsvReader::new(path)
        .with_has_header(true)
        .finish()
        .with_context(|| format!("opening csv replay file {}", path.display()))?
        .collect()
        .with_context(|| format!("reading csv replay file {}", path.display()))?;

    let events = dataframe_to_events(&df)?;
    let mut events = events;
    events.sort_by_key(|e| event_ts(e));
    Ok(events)
}

fn event_ts(event: &MarketEvent) -> i64 {
    match event {
        MarketEvent::Trade(t) => t.ts_ms,
        MarketEvent::Quote(q) => q.ts_ms,
    }
}

fn dataframe_to_events(df: &DataFrame) -> Result<Vec<MarketEvent>> {
    let kind = df.column("event")?.str().context("event column must be a string")?;
    let ts_ms = df.column("ts_ms")?.i64().context("ts_ms column must be an integer")?;
    let price = df.column("price")?.f64().context("price column must be numeric")?;
    let size = df.column("size")?.f64().context("size column must be numeric")?;
    let bid_px = df.column("bid_px")?.f64().context("bid_px column must be numeric")?;
    let bid_sz = df.column("bid_sz")?.f64().context("bid_sz column must be numeric")?;
    let ask_px = df.column("ask_px")?.f64().context("ask_px column must be numeric")?;
    let ask_sz = df.column("ask_sz")?.f64().context("ask_sz column must be numeric")?;

    let mut events = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let row_kind = kind.get(i).unwrap_or("");
        let ts = ts_ms.get(i).unwrap_or(0);
        match row_kind {
            "trade" => {
                let Some(p) = price.get(i) else { continue };
                let Some(sz) = size.get(i) else { continue };
                events.push(MarketEvent::Trade(Trade { ts_ms: ts, price: p, size: sz }));
            }
            "quote" => {
                let (Some(bp), Some(bs), Some(ap), Some(asz)) =
                    (bid_px.get(i), bid_sz.get(i), ask_px.get(i), ask_sz.get(i))
                else {
                    continue;
                };
                events.push(MarketEvent::Quote(Quote { ts_ms: ts, bid_px: bp, bid_sz: bs, ask_px: ap, ask_sz: asz }));
            }
            other => {
                tracing::warn!("skipping csv row with unknown event kind {other:?}");
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_mixed_trade_and_quote_rows() {
        let dir = std::env::temp_dir().join(format!("mft_engine_csv_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("events.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "event,ts_ms,price,size,bid_px,bid_sz,ask_px,ask_sz").unwrap();
        writeln!(f, "quote,0,,,99.9,1.0,100.1,1.0").unwrap();
        writeln!(f, "trade,1000,100.0,0.5,,,,").unwrap();
        writeln!(f, "trade,61000,101.0,1.0,,,,").unwrap();
        drop(f);

        let events = load_events(&path).unwrap();
        assert_eq!(events.len(), 3);
        match &events[0] {
            MarketEvent::Quote(q) => assert!((q.bid_px - 99.9).abs() < 1e-9),
            _ => panic!("expected first row to be a quote"),
        }
        match &events[1] {
            MarketEvent::Trade(t) => assert!((t.price - 100.0).abs() < 1e-9),
            _ => panic!("expected second row to be a trade"),
        }

        std::fs::remove_dir_all(&dir).ok();
    }
}
