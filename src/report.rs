//! Aggregations behind the analysis report and the dashboard widgets.
//!
//! Every function accepts a table with any extra columns and ignores rows
//! whose relevant cells are null. Empty inputs yield empty aggregates, never
//! a panic; the functions that rank makes report an empty input as
//! [`PipelineError::EmptyResult`] instead.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::PipelineError;
use crate::table::{Table, Value};

pub const MAKE: &str = "make";
pub const MODEL: &str = "model";
pub const SALE_PRICE: &str = "sale_price";
pub const MARKET_VALUE: &str = "market_value";
pub const PRICE_DIFF: &str = "price_diff";
pub const SELLING_PRICE: &str = "sellingprice";
pub const ODOMETER: &str = "odometer";
pub const CONDITION: &str = "condition";
pub const STATE: &str = "state";
pub const RELEASE_YEAR: &str = "release_year";

pub const PREVIEW_ROWS: usize = 5;
pub const TOP_OVERPRICED: usize = 5;
pub const TOP_MAKES: usize = 10;
pub const TOP_DEALS: usize = 5;
/// Prices at or below this are treated as data errors when ranking deals.
pub const MIN_DEAL_PRICE: f64 = 500.0;

/// Summary statistics of one numeric column.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Describe {
    pub column: String,
    pub count: usize,
    pub mean: Option<f64>,
    /// Sample standard deviation.
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub max: Option<f64>,
}

pub fn describe(table: &Table, column: &str) -> Result<Describe, PipelineError> {
    let index = table.require_column(column)?;
    let mut values = table
        .column_values(index)
        .filter_map(Value::as_f64)
        .collect::<Vec<_>>();
    values.sort_by(f64::total_cmp);

    let count = values.len();
    if count == 0 {
        return Ok(Describe {
            column: column.to_string(),
            ..Describe::default()
        });
    }
    let mean = values.iter().sum::<f64>() / count as f64;
    let std = (count > 1).then(|| {
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
        variance.sqrt()
    });
    Ok(Describe {
        column: column.to_string(),
        count,
        mean: Some(mean),
        std,
        min: values.first().copied(),
        p25: quantile(&values, 0.25),
        p50: quantile(&values, 0.5),
        p75: quantile(&values, 0.75),
        max: values.last().copied(),
    })
}

/// Linear interpolation between closest ranks over sorted values.
fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

impl fmt::Display for Describe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = |value: Option<f64>| match value {
            Some(value) => format!("{value:.2}"),
            None => "NaN".to_string(),
        };
        writeln!(f, "{}", self.column)?;
        writeln!(f, "  {:<6}{:>16}", "count", self.count)?;
        for (label, value) in [
            ("mean", self.mean),
            ("std", self.std),
            ("min", self.min),
            ("25%", self.p25),
            ("50%", self.p50),
            ("75%", self.p75),
            ("max", self.max),
        ] {
            writeln!(f, "  {label:<6}{:>16}", cell(value))?;
        }
        Ok(())
    }
}

/// Adds `price_diff = sale_price - market_value`; null when either side is missing.
pub fn with_price_diff(table: &Table) -> Result<Table, PipelineError> {
    let sale = table.require_column(SALE_PRICE)?;
    let market = table.require_column(MARKET_VALUE)?;
    Ok(table.with_column(PRICE_DIFF, |row| {
        match (row[sale].as_f64(), row[market].as_f64()) {
            (Some(sale), Some(market)) => Value::Float(sale - market),
            _ => Value::Null,
        }
    }))
}

/// Mean of a numeric column for one make.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MakeValue {
    pub make: String,
    pub value: f64,
}

#[derive(Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn get(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

fn mean_by_make(
    table: &Table,
    value_column: &str,
    limit: usize,
) -> Result<Vec<MakeValue>, PipelineError> {
    if table.is_empty() {
        return Err(PipelineError::EmptyResult(format!(
            "no rows to rank makes by {value_column}"
        )));
    }
    let make = table.require_column(MAKE)?;
    let value = table.require_column(value_column)?;
    let mut groups: BTreeMap<String, Mean> = BTreeMap::new();
    for row in table.rows() {
        let (Some(name), Some(amount)) = (row[make].as_text(), row[value].as_f64()) else {
            continue;
        };
        groups.entry(name.to_string()).or_default().push(amount);
    }
    let mut ranked = groups
        .into_iter()
        .filter_map(|(make, mean)| mean.get().map(|value| MakeValue { make, value }))
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.value.total_cmp(&a.value));
    ranked.truncate(limit);
    Ok(ranked)
}

/// Makes ranked by mean `price_diff`, most overpriced first.
pub fn top_overpriced_makes(table: &Table, limit: usize) -> Result<Vec<MakeValue>, PipelineError> {
    if table.column_index(PRICE_DIFF).is_some() {
        mean_by_make(table, PRICE_DIFF, limit)
    } else {
        mean_by_make(&with_price_diff(table)?, PRICE_DIFF, limit)
    }
}

/// Makes ranked by mean sale price, most expensive first.
pub fn top_makes_by_price(table: &Table, limit: usize) -> Result<Vec<MakeValue>, PipelineError> {
    mean_by_make(table, SALE_PRICE, limit)
}

/// Headline numbers for one brand and year.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BrandMetrics {
    pub total_offers: usize,
    pub avg_price: Option<f64>,
    pub avg_mileage: Option<f64>,
}

pub fn brand_metrics(table: &Table) -> Result<BrandMetrics, PipelineError> {
    let price = table.require_column(SELLING_PRICE)?;
    let mileage = table.require_column(ODOMETER)?;
    let mut prices = Mean::default();
    let mut miles = Mean::default();
    for row in table.rows() {
        if let Some(value) = row[price].as_f64() {
            prices.push(value);
        }
        if let Some(value) = row[mileage].as_f64() {
            miles.push(value);
        }
    }
    Ok(BrandMetrics {
        total_offers: table.len(),
        avg_price: prices.get(),
        avg_mileage: miles.get(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionPrice {
    pub condition: f64,
    pub avg_price: f64,
}

/// Mean selling price per condition grade, ascending by grade.
pub fn price_by_condition(table: &Table) -> Result<Vec<ConditionPrice>, PipelineError> {
    let condition = table.require_column(CONDITION)?;
    let price = table.require_column(SELLING_PRICE)?;
    let mut groups: Vec<(f64, Mean)> = Vec::new();
    for row in table.rows() {
        let (Some(grade), Some(amount)) = (row[condition].as_f64(), row[price].as_f64()) else {
            continue;
        };
        match groups.iter_mut().find(|(existing, _)| *existing == grade) {
            Some((_, mean)) => mean.push(amount),
            None => {
                let mut mean = Mean::default();
                mean.push(amount);
                groups.push((grade, mean));
            }
        }
    }
    groups.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(groups
        .into_iter()
        .filter_map(|(condition, mean)| {
            mean.get().map(|avg_price| ConditionPrice {
                condition,
                avg_price,
            })
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSummary {
    pub state: String,
    pub count: usize,
    pub avg_price: Option<f64>,
}

/// Offers per state, busiest first; ties keep alphabetical order.
pub fn state_breakdown(table: &Table) -> Result<Vec<StateSummary>, PipelineError> {
    let state = table.require_column(STATE)?;
    let price = table.require_column(SELLING_PRICE)?;
    let mut groups: BTreeMap<String, Mean> = BTreeMap::new();
    for row in table.rows() {
        let Some(name) = row[state].as_text() else {
            continue;
        };
        let entry = groups.entry(name.to_string()).or_default();
        if let Some(amount) = row[price].as_f64() {
            entry.push(amount);
        }
    }
    let mut summaries = groups
        .into_iter()
        .map(|(state, mean)| StateSummary {
            state,
            count: mean.count,
            avg_price: mean.get(),
        })
        .filter(|summary| summary.count > 0)
        .collect::<Vec<_>>();
    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    Ok(summaries)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deal {
    pub model: Option<String>,
    pub condition: Option<f64>,
    pub odometer: Option<f64>,
    pub state: Option<String>,
    pub price: f64,
}

/// Cheapest offers above [`MIN_DEAL_PRICE`], cheapest first.
pub fn top_deals(table: &Table, limit: usize) -> Result<Vec<Deal>, PipelineError> {
    let price = table.require_column(SELLING_PRICE)?;
    let model = table.column_index(MODEL);
    let condition = table.column_index(CONDITION);
    let odometer = table.column_index(ODOMETER);
    let state = table.column_index(STATE);
    let text = |row: &[Value], index: Option<usize>| {
        index.and_then(|index| row[index].as_text().map(str::to_string))
    };
    let number = |row: &[Value], index: Option<usize>| index.and_then(|index| row[index].as_f64());

    let mut deals = table
        .rows()
        .iter()
        .filter_map(|row| {
            let amount = row[price].as_f64().filter(|amount| *amount > MIN_DEAL_PRICE)?;
            Some(Deal {
                model: text(row, model),
                condition: number(row, condition),
                odometer: number(row, odometer),
                state: text(row, state),
                price: amount,
            })
        })
        .collect::<Vec<_>>();
    deals.sort_by(|a, b| a.price.total_cmp(&b.price));
    deals.truncate(limit);
    Ok(deals)
}

/// Console report over the cleaned sales view.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub rows: usize,
    #[serde(skip)]
    pub preview: Table,
    pub market_value: Describe,
    pub sale_price: Describe,
    pub top_overpriced: Vec<MakeValue>,
    pub top_makes: Vec<MakeValue>,
    pub chart_path: Option<String>,
}

impl AnalysisReport {
    pub fn build(table: &Table) -> Result<Self, PipelineError> {
        let enriched = with_price_diff(table)?;
        Ok(Self {
            rows: table.len(),
            preview: table.head(PREVIEW_ROWS),
            market_value: describe(table, MARKET_VALUE)?,
            sale_price: describe(table, SALE_PRICE)?,
            top_overpriced: top_overpriced_makes(&enriched, TOP_OVERPRICED)?,
            top_makes: top_makes_by_price(table, TOP_MAKES)?,
            chart_path: None,
        })
    }
}

impl fmt::Display for AnalysisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- DATA PREVIEW ---")?;
        writeln!(f, "{}", self.preview)?;
        writeln!(f, "--- BASIC STATISTICS ---")?;
        write!(f, "{}", self.market_value)?;
        write!(f, "{}", self.sale_price)?;
        writeln!(f, "--- TOP {} OVERPRICED MAKES (Avg Difference) ---", self.top_overpriced.len())?;
        for entry in &self.top_overpriced {
            writeln!(f, "{:<20}{:>14.2}", entry.make, entry.value)?;
        }
        if let Some(path) = &self.chart_path {
            writeln!(f, "Chart saved to {path}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn dealer_table() -> Table {
        let row = |price: f64, miles: i64, grade: f64, state: &str, model: &str| {
            vec![
                Value::Float(price),
                Value::Int(miles),
                Value::Float(grade),
                Value::Text(state.to_string()),
                Value::Text(model.to_string()),
            ]
        };
        Table::from_rows(
            vec![
                SELLING_PRICE.to_string(),
                ODOMETER.to_string(),
                CONDITION.to_string(),
                STATE.to_string(),
                MODEL.to_string(),
            ],
            vec![
                row(12000.0, 30000, 4.0, "ca", "Sorento"),
                row(300.0, 200000, 1.0, "ca", "Rio"),
                row(9000.0, 60000, 2.5, "fl", "Optima"),
                row(15000.0, 10000, 4.0, "tx", "Sorento"),
                row(7000.0, 80000, 2.5, "ca", "Rio"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn describe_matches_reference_values() {
        let table = Table::from_rows(
            vec![SALE_PRICE.to_string()],
            [1.0, 2.0, 3.0, 4.0]
                .into_iter()
                .map(|v| vec![Value::Float(v)])
                .chain(std::iter::once(vec![Value::Null]))
                .collect(),
        )
        .unwrap();
        let stats = describe(&table, SALE_PRICE).unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean, Some(2.5));
        assert_eq!(stats.p25, Some(1.75));
        assert_eq!(stats.p50, Some(2.5));
        assert_eq!(stats.p75, Some(3.25));
        let std = stats.std.unwrap();
        assert!((std - 1.2909944).abs() < 1e-6);
    }

    #[test]
    fn describe_of_empty_column_is_empty() {
        let table = Table::new(vec![SALE_PRICE.to_string()]);
        let stats = describe(&table, SALE_PRICE).unwrap();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.mean, None);
    }

    #[test]
    fn overpriced_ranking_uses_mean_per_make() {
        let table = Table::from_rows(
            vec![MAKE.to_string(), PRICE_DIFF.to_string()],
            vec![
                vec![Value::Text("Honda".into()), Value::Float(20000.0)],
                vec![Value::Text("Honda".into()), Value::Float(30000.0)],
                vec![Value::Text("Ford".into()), Value::Float(10000.0)],
            ],
        )
        .unwrap();
        let ranked = top_overpriced_makes(&table, TOP_OVERPRICED).unwrap();
        assert_eq!(
            ranked,
            vec![
                MakeValue {
                    make: "Honda".into(),
                    value: 25000.0
                },
                MakeValue {
                    make: "Ford".into(),
                    value: 10000.0
                },
            ]
        );
    }

    #[test]
    fn ranking_empty_table_is_empty_result() {
        let table = Table::new(vec![MAKE.to_string(), PRICE_DIFF.to_string()]);
        assert_matches!(
            top_overpriced_makes(&table, 5),
            Err(PipelineError::EmptyResult(_))
        );
    }

    #[test]
    fn price_diff_is_null_when_side_missing() {
        let table = Table::from_rows(
            vec![SALE_PRICE.to_string(), MARKET_VALUE.to_string()],
            vec![
                vec![Value::Int(21500), Value::Int(20500)],
                vec![Value::Null, Value::Int(100)],
            ],
        )
        .unwrap();
        let enriched = with_price_diff(&table).unwrap();
        let index = enriched.require_column(PRICE_DIFF).unwrap();
        let diffs = enriched.column_values(index).cloned().collect::<Vec<_>>();
        assert_eq!(diffs, vec![Value::Float(1000.0), Value::Null]);
    }

    #[test]
    fn metrics_and_breakdowns() {
        let table = dealer_table();
        let metrics = brand_metrics(&table).unwrap();
        assert_eq!(metrics.total_offers, 5);
        assert_eq!(metrics.avg_price, Some(8660.0));

        let by_condition = price_by_condition(&table).unwrap();
        let grades = by_condition.iter().map(|c| c.condition).collect::<Vec<_>>();
        assert_eq!(grades, vec![1.0, 2.5, 4.0]);
        assert_eq!(by_condition[2].avg_price, 13500.0);

        let states = state_breakdown(&table).unwrap();
        assert_eq!(states[0].state, "ca");
        assert_eq!(states[0].count, 3);
        assert_eq!(states.len(), 3);
    }

    #[test]
    fn deals_skip_suspicious_prices() {
        let deals = top_deals(&dealer_table(), TOP_DEALS).unwrap();
        let prices = deals.iter().map(|deal| deal.price).collect::<Vec<_>>();
        assert_eq!(prices, vec![7000.0, 9000.0, 12000.0, 15000.0]);
        assert_eq!(deals[0].model.as_deref(), Some("Rio"));
    }

    #[test]
    fn aggregates_on_empty_table_do_not_panic() {
        let table = Table::new(vec![
            SELLING_PRICE.to_string(),
            ODOMETER.to_string(),
            CONDITION.to_string(),
            STATE.to_string(),
        ]);
        assert_eq!(brand_metrics(&table).unwrap(), BrandMetrics::default());
        assert!(price_by_condition(&table).unwrap().is_empty());
        assert!(state_breakdown(&table).unwrap().is_empty());
        assert!(top_deals(&table, TOP_DEALS).unwrap().is_empty());
    }
}
