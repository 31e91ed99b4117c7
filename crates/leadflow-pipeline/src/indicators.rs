//! Key business indicators over the cleaned datasets
//!
//! Listing indicators come from `sample_clean`, lead-funnel indicators from
//! `status_clean`. Tables are taken from the cache when a run already
//! produced them and read from the cleaned CSV files otherwise. A dataset
//! that has not been cleaned yet leaves its half of the report empty.

use crate::context::PipelineContext;
use crate::datasets::{DatasetKind, Stage};
use crate::error::{PipelineError, Result};
use crate::loader::DatasetLoader;
use crate::validation::quantile;
use chrono::NaiveDateTime;
use leadflow_common::{Table, Value};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const PRICE_COLUMN: &str = "Precio_Solicitado";
pub const AREA_COLUMN: &str = "Area";
pub const PROPERTY_COLUMN: &str = "Inmueble_ID";
pub const STATUS_COLUMN: &str = "Estado";
pub const DATE_COLUMN: &str = "Fecha_Actualizacion";

/// A listing counts as reliable when all of these are present and known.
pub const RELIABILITY_FIELDS: [&str; 5] =
    ["Precio_Solicitado", "Area", "Ciudad", "Zona", "Tipo_Inmueble"];

const UNKNOWN_MARKERS: [&str; 3] = ["desconocido", "nan", ""];
const REVIEW_MARKERS: [&str; 2] = ["revisar", "dirección"];
const DISCARD_MARKERS: [&str; 3] = ["descart", "rechaz", "cancel"];
/// Review stints this long or longer are ignored.
const MAX_REVIEW_DAYS: i64 = 365;
const IQR_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyIndicators {
    pub listings: Option<ListingIndicators>,
    pub funnel: Option<FunnelIndicators>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingIndicators {
    /// Mean of price / area over listings with both values and a positive area
    pub average_price_per_m2: Option<f64>,
    pub reliability: Reliability,
    pub outliers: PriceOutliers,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reliability {
    pub complete_records: usize,
    pub total_records: usize,
    pub rate_percent: f64,
}

/// IQR outliers on price per square metre
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceOutliers {
    pub outliers: usize,
    pub analyzed: usize,
    pub lower_limit: Option<f64>,
    pub upper_limit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelIndicators {
    pub review_address: ReviewAddress,
    pub discards: Discards,
    pub initial_state: Option<InitialState>,
}

/// Properties that passed through an address-review status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewAddress {
    pub properties: usize,
    /// Days until the next later-dated status; 0 when none qualify
    pub average_days: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discards {
    pub discarded: usize,
    pub total_properties: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitialState {
    pub state: String,
    pub properties: usize,
    pub percent: f64,
}

pub struct IndicatorsCalculator {
    ctx: PipelineContext,
}

impl IndicatorsCalculator {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Computes every indicator the cleaned datasets allow.
    ///
    /// Fails with [`PipelineError::MissingInput`] only when neither dataset
    /// has been cleaned.
    pub async fn calculate(&self) -> Result<KeyIndicators> {
        let timer = self.ctx.metrics.timer("indicators");
        let sample = self.cleaned(DatasetKind::Sample).await?;
        let status = self.cleaned(DatasetKind::Status).await?;
        if sample.is_none() && status.is_none() {
            return Err(PipelineError::MissingInput {
                key: DatasetKind::Sample.cache_key(Stage::Clean).to_string(),
                path: self.ctx.config.paths.clean_path(DatasetKind::Sample),
            });
        }

        let indicators = tokio::task::spawn_blocking(move || -> Result<KeyIndicators> {
            Ok(KeyIndicators {
                listings: sample.as_deref().map(listing_indicators).transpose()?,
                funnel: status.as_deref().map(funnel_indicators).transpose()?,
            })
        })
        .await??;
        timer.stop();

        if let Some(listings) = &indicators.listings {
            info!(
                price_per_m2 = ?listings.average_price_per_m2,
                reliability = listings.reliability.rate_percent,
                outliers = listings.outliers.outliers,
                "Listing indicators"
            );
        }
        if let Some(funnel) = &indicators.funnel {
            info!(
                review_address = funnel.review_address.properties,
                discard_percent = funnel.discards.percent,
                initial_state = ?funnel.initial_state.as_ref().map(|s| s.state.as_str()),
                "Funnel indicators"
            );
        }
        Ok(indicators)
    }

    /// Cached table, else the cleaned file. `None` when neither exists.
    async fn cleaned(&self, kind: DatasetKind) -> Result<Option<Arc<Table>>> {
        let key = kind.cache_key(Stage::Clean);
        if let Some(table) = self.ctx.cache.get(key) {
            return Ok(Some(table));
        }
        match DatasetLoader::new(self.ctx.clone()).load_one(key).await {
            Ok(table) => Ok(Some(table)),
            Err(PipelineError::MissingInput { .. }) => {
                warn!(dataset = %kind, "Cleaned dataset not available, skipping its indicators");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }
}

fn require(table: &Table, column: &str) -> Result<usize> {
    table
        .column_index(column)
        .ok_or_else(|| leadflow_common::CommonError::UnknownColumn(column.to_string()).into())
}

/// Price per m², reliability rate and price-per-m² outliers.
pub fn listing_indicators(sample: &Table) -> Result<ListingIndicators> {
    let price = require(sample, PRICE_COLUMN)?;
    let area = require(sample, AREA_COLUMN)?;

    let mut per_m2: Vec<f64> = sample
        .rows()
        .iter()
        .filter_map(|row| {
            let price = row[price].to_number().as_f64()?;
            let area = row[area].to_number().as_f64().filter(|a| *a > 0.0)?;
            Some(price / area)
        })
        .collect();

    let average_price_per_m2 =
        (!per_m2.is_empty()).then(|| per_m2.iter().sum::<f64>() / per_m2.len() as f64);

    per_m2.sort_by(f64::total_cmp);
    let outliers = match (quantile(&per_m2, 0.25), quantile(&per_m2, 0.75)) {
        (Some(q1), Some(q3)) => {
            let spread = (q3 - q1) * IQR_FACTOR;
            let (low, high) = (q1 - spread, q3 + spread);
            PriceOutliers {
                outliers: per_m2.iter().filter(|v| **v < low || **v > high).count(),
                analyzed: per_m2.len(),
                lower_limit: Some(low),
                upper_limit: Some(high),
            }
        },
        _ => PriceOutliers {
            outliers: 0,
            analyzed: 0,
            lower_limit: None,
            upper_limit: None,
        },
    };

    Ok(ListingIndicators {
        average_price_per_m2,
        reliability: reliability(sample),
        outliers,
    })
}

/// A missing column makes every row incomplete.
fn reliability(sample: &Table) -> Reliability {
    let fields: Option<Vec<usize>> = RELIABILITY_FIELDS
        .iter()
        .map(|field| sample.column_index(field))
        .collect();
    let total_records = sample.row_count();
    let complete_records = match fields {
        Some(fields) => sample
            .rows()
            .iter()
            .filter(|row| fields.iter().all(|idx| is_known(&row[*idx])))
            .count(),
        None => 0,
    };
    Reliability {
        complete_records,
        total_records,
        rate_percent: percent(complete_records, total_records),
    }
}

fn is_known(value: &Value) -> bool {
    if value.is_null() {
        return false;
    }
    let text = value.to_string().trim().to_lowercase();
    !UNKNOWN_MARKERS.contains(&text.as_str())
}

/// Address-review count and time, discard rate and most frequent first status.
pub fn funnel_indicators(status: &Table) -> Result<FunnelIndicators> {
    let property = require(status, PROPERTY_COLUMN)?;
    let state = require(status, STATUS_COLUMN)?;
    let date = require(status, DATE_COLUMN)?;

    // Per property, in file order.
    let mut order: Vec<String> = Vec::new();
    let mut history: HashMap<String, Vec<StatusRow>> = HashMap::new();
    for row in status.rows() {
        let Some(id) = property_key(&row[property]) else {
            continue;
        };
        let entry = history.entry(id.clone()).or_insert_with(|| {
            order.push(id);
            Vec::new()
        });
        entry.push(StatusRow {
            state: row[state].as_str().map(str::to_string),
            date: row[date].to_date().as_date(),
        });
    }

    Ok(FunnelIndicators {
        review_address: review_address(&order, &history),
        discards: discards(&order, &history),
        initial_state: initial_state(&order, &history),
    })
}

struct StatusRow {
    state: Option<String>,
    date: Option<NaiveDateTime>,
}

impl StatusRow {
    fn matches(&self, markers: &[&str]) -> bool {
        self.state.as_deref().is_some_and(|s| {
            let s = s.to_lowercase();
            markers.iter().any(|m| s.contains(m))
        })
    }
}

fn property_key(value: &Value) -> Option<String> {
    (!value.is_null()).then(|| value.to_string())
}

fn review_address(order: &[String], history: &HashMap<String, Vec<StatusRow>>) -> ReviewAddress {
    let mut properties = 0;
    let mut stints = Vec::new();

    for id in order {
        let rows = &history[id];
        if !rows.iter().any(|r| r.matches(&REVIEW_MARKERS)) {
            continue;
        }
        properties += 1;

        let mut dated: Vec<&StatusRow> = rows.iter().filter(|r| r.date.is_some()).collect();
        dated.sort_by_key(|r| r.date);
        for row in dated.iter().filter(|r| r.matches(&REVIEW_MARKERS)) {
            let (Some(entered), Some(left)) = (
                row.date,
                dated.iter().filter_map(|r| r.date).find(|d| Some(*d) > row.date),
            ) else {
                continue;
            };
            let days = (left - entered).num_days();
            if days > 0 && days < MAX_REVIEW_DAYS {
                stints.push(days as f64);
            }
        }
    }

    ReviewAddress {
        properties,
        average_days: if stints.is_empty() {
            0.0
        } else {
            stints.iter().sum::<f64>() / stints.len() as f64
        },
    }
}

fn discards(order: &[String], history: &HashMap<String, Vec<StatusRow>>) -> Discards {
    let discarded = order
        .iter()
        .filter(|id| history[*id].iter().any(|r| r.matches(&DISCARD_MARKERS)))
        .count();
    Discards {
        discarded,
        total_properties: order.len(),
        percent: percent(discarded, order.len()),
    }
}

/// Ties go to the status seen first.
fn initial_state(order: &[String], history: &HashMap<String, Vec<StatusRow>>) -> Option<InitialState> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    let mut with_state = 0;
    for id in order {
        let Some(first) = history[id].iter().find_map(|r| r.state.as_ref()) else {
            continue;
        };
        with_state += 1;
        match counts.iter_mut().find(|(state, _)| state == first) {
            Some((_, n)) => *n += 1,
            None => counts.push((first.clone(), 1)),
        }
    }

    let mut best: Option<(String, usize)> = None;
    for (state, n) in counts {
        if best.as_ref().map_or(true, |(_, top)| n > *top) {
            best = Some((state, n));
        }
    }
    best.map(|(state, properties)| InitialState {
        state,
        properties,
        percent: percent(properties, with_state),
    })
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
