//! Derived indicators computed from a loaded [`Table`].
//!
//! Everything here is a pure function of the table and a window size:
//! same table in, same numbers out. Windows count rows (recorded days),
//! not calendar days.

use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{Field, Record};
use crate::table::Table;

/// Approximate energy content of one kilogram of body fat.
pub const KCAL_PER_KG: f64 = 7700.0;
/// Rows considered by the TDEE estimate.
pub const TDEE_WINDOW: usize = 14;
/// Fewer weigh-ins than this and the estimate is not attempted.
pub const MIN_TDEE_POINTS: usize = 3;
pub const TDEE_FLOOR_KCAL: f64 = 1200.0;
pub const TDEE_CEILING_KCAL: f64 = 4000.0;
/// Distance from the fitted trend beyond which the latest weigh-in is flagged.
pub const TREND_TOLERANCE_KG: f64 = 0.5;
/// Trailing window used by BMI, protein and vitals when none is given.
pub const DEFAULT_WINDOW: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendLabel {
    Stable,
    WaterRetention,
    RapidLoss,
}

impl fmt::Display for TrendLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrendLabel::Stable => "stable trend",
            TrendLabel::WaterRetention => "water retention suspected",
            TrendLabel::RapidLoss => "rapid loss suspected",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TdeeMethod {
    /// Least-squares slope over every weigh-in in the window.
    Regression,
    /// First weigh-in against last weigh-in.
    Delta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TdeeEstimate {
    pub method: TdeeMethod,
    /// Estimate after clamping to the physiological bounds.
    pub tdee_kcal: f64,
    /// Estimate before clamping.
    pub raw_tdee_kcal: f64,
    pub clamped: bool,
    pub slope_kg_per_day: f64,
    pub daily_delta_kcal: f64,
    pub mean_intake_kcal: f64,
    pub expected_weight_kg: f64,
    pub actual_weight_kg: f64,
    pub label: TrendLabel,
    pub weigh_ins: usize,
    pub intake_days: usize,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InsufficientReason {
    TooFewWeighIns { found: usize, required: usize },
    NoIntake,
}

impl fmt::Display for InsufficientReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsufficientReason::TooFewWeighIns { found, required } => {
                write!(f, "need at least {required} weigh-ins, found {found}")
            }
            InsufficientReason::NoIntake => f.write_str("no calorie intake recorded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TdeeOutcome {
    Estimate(TdeeEstimate),
    Insufficient { reason: InsufficientReason },
}

impl TdeeOutcome {
    #[must_use]
    pub fn estimate(&self) -> Option<&TdeeEstimate> {
        match self {
            TdeeOutcome::Estimate(e) => Some(e),
            TdeeOutcome::Insufficient { .. } => None,
        }
    }
}

/// Inputs shared by both TDEE methods.
struct TdeeWindow {
    /// (day offset, weight) for every weigh-in, oldest first.
    points: Vec<(f64, f64)>,
    mean_intake: f64,
    intake_days: usize,
    from: NaiveDate,
    to: NaiveDate,
}

#[allow(clippy::cast_precision_loss)]
fn tdee_window(table: &Table) -> Result<TdeeWindow, InsufficientReason> {
    let rows = table.latest(TDEE_WINDOW);
    let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
        return Err(InsufficientReason::TooFewWeighIns {
            found: 0,
            required: MIN_TDEE_POINTS,
        });
    };

    let points: Vec<(f64, f64)> = rows
        .iter()
        .filter_map(|r| {
            r.values
                .weight_kg
                .map(|w| ((r.date - first.date).num_days() as f64, w))
        })
        .collect();
    if points.len() < MIN_TDEE_POINTS {
        return Err(InsufficientReason::TooFewWeighIns {
            found: points.len(),
            required: MIN_TDEE_POINTS,
        });
    }

    let intake: Vec<f64> = rows.iter().filter_map(|r| r.get(Field::CaloriesKcal)).collect();
    let Some(mean_intake) = mean(&intake) else {
        return Err(InsufficientReason::NoIntake);
    };

    Ok(TdeeWindow {
        points,
        mean_intake,
        intake_days: intake.len(),
        from: first.date,
        to: last.date,
    })
}

/// Ordinary least squares; returns `(slope, intercept)`.
#[allow(clippy::cast_precision_loss)]
fn linear_fit(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    if sxx <= f64::EPSILON {
        return None;
    }
    let sxy: f64 = points
        .iter()
        .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
        .sum();
    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}

fn trend_label(actual: f64, expected: f64) -> TrendLabel {
    if actual > expected + TREND_TOLERANCE_KG {
        TrendLabel::WaterRetention
    } else if actual < expected - TREND_TOLERANCE_KG {
        TrendLabel::RapidLoss
    } else {
        TrendLabel::Stable
    }
}

fn build_estimate(
    method: TdeeMethod,
    window: &TdeeWindow,
    slope: f64,
    expected: f64,
) -> TdeeEstimate {
    let actual = window.points.last().map_or(expected, |p| p.1);
    let daily_delta = slope * KCAL_PER_KG;
    let raw = window.mean_intake - daily_delta;
    let tdee = raw.clamp(TDEE_FLOOR_KCAL, TDEE_CEILING_KCAL);
    TdeeEstimate {
        method,
        tdee_kcal: tdee,
        raw_tdee_kcal: raw,
        clamped: (tdee - raw).abs() > f64::EPSILON,
        slope_kg_per_day: slope,
        daily_delta_kcal: daily_delta,
        mean_intake_kcal: window.mean_intake,
        expected_weight_kg: expected,
        actual_weight_kg: actual,
        label: trend_label(actual, expected),
        weigh_ins: window.points.len(),
        intake_days: window.intake_days,
        from: window.from,
        to: window.to,
    }
}

/// Estimate total daily energy expenditure from the weight trend and intake
/// over the last [`TDEE_WINDOW`] rows.
///
/// `tdee = mean intake - slope * 7700`, where `slope` is the least-squares
/// weight change per day, clamped to `[1200, 4000]` kcal. The latest weigh-in
/// is compared with the fitted line to label the trend.
#[must_use]
pub fn estimate_tdee(table: &Table) -> TdeeOutcome {
    let window = match tdee_window(table) {
        Ok(w) => w,
        Err(reason) => return TdeeOutcome::Insufficient { reason },
    };
    // At least three distinct dates, so the fit always exists.
    let Some((slope, intercept)) = linear_fit(&window.points) else {
        return TdeeOutcome::Insufficient {
            reason: InsufficientReason::TooFewWeighIns {
                found: window.points.len(),
                required: MIN_TDEE_POINTS,
            },
        };
    };
    let last_x = window.points.last().map_or(0.0, |p| p.0);
    let expected = intercept + slope * last_x;
    TdeeOutcome::Estimate(build_estimate(
        TdeeMethod::Regression,
        &window,
        slope,
        expected,
    ))
}

/// The same estimate from the first and last weigh-in only.
///
/// Kept for comparison: a single water-weight spike on the last day moves it
/// much further than the regression.
#[must_use]
pub fn estimate_tdee_naive(table: &Table) -> TdeeOutcome {
    let window = match tdee_window(table) {
        Ok(w) => w,
        Err(reason) => return TdeeOutcome::Insufficient { reason },
    };
    let (first, last) = (window.points[0], window.points[window.points.len() - 1]);
    let slope = (last.1 - first.1) / (last.0 - first.0);
    TdeeOutcome::Estimate(build_estimate(TdeeMethod::Delta, &window, slope, last.1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BmiClass {
    Underweight,
    Normal,
    Overweight,
    Obese,
}

impl BmiClass {
    #[must_use]
    pub fn from_bmi(bmi: f64) -> Self {
        if bmi < 18.5 {
            BmiClass::Underweight
        } else if bmi < 25.0 {
            BmiClass::Normal
        } else if bmi < 30.0 {
            BmiClass::Overweight
        } else {
            BmiClass::Obese
        }
    }
}

impl fmt::Display for BmiClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BmiClass::Underweight => "underweight",
            BmiClass::Normal => "normal",
            BmiClass::Overweight => "overweight",
            BmiClass::Obese => "obese",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BmiReading {
    pub bmi: f64,
    pub class: BmiClass,
    pub weight_kg: f64,
    pub height_m: f64,
}

/// Most recent value of `field` in `rows`, scanning from the end.
fn latest_in(rows: &[Record], field: Field) -> Option<f64> {
    rows.iter().rev().find_map(|r| r.get(field))
}

/// The most recent recorded value of `field` anywhere in the table.
#[must_use]
pub fn latest_non_sentinel(table: &Table, field: Field) -> Option<f64> {
    latest_in(table.records(), field)
}

/// Body mass index from the latest height in the table and the latest weight
/// in the trailing window.
#[must_use]
pub fn bmi(table: &Table, window: usize) -> Option<BmiReading> {
    let height = latest_non_sentinel(table, Field::HeightM).filter(|h| *h > 0.0)?;
    let weight = latest_in(table.latest(window), Field::WeightKg)?;
    let bmi = weight / (height * height);
    Some(BmiReading {
        bmi,
        class: BmiClass::from_bmi(bmi),
        weight_kg: weight,
        height_m: height,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeightBand {
    pub min_kg: f64,
    pub max_kg: f64,
}

/// Weights that give a normal BMI at the latest recorded height.
#[must_use]
pub fn ideal_weight_band(table: &Table) -> Option<WeightBand> {
    let height = latest_non_sentinel(table, Field::HeightM).filter(|h| *h > 0.0)?;
    let h2 = height * height;
    Some(WeightBand {
        min_kg: 18.5 * h2,
        max_kg: 25.0 * h2,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProteinClass {
    Low,
    Adequate,
    Excellent,
}

impl ProteinClass {
    #[must_use]
    pub fn from_ratio(grams_per_kg: f64) -> Self {
        if grams_per_kg < 1.5 {
            ProteinClass::Low
        } else if grams_per_kg < 1.8 {
            ProteinClass::Adequate
        } else {
            ProteinClass::Excellent
        }
    }
}

impl fmt::Display for ProteinClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProteinClass::Low => "low",
            ProteinClass::Adequate => "adequate",
            ProteinClass::Excellent => "excellent",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProteinReading {
    pub grams_per_kg: f64,
    pub class: ProteinClass,
    pub mean_protein_g: f64,
    pub weight_kg: f64,
}

/// Mean daily protein over the window per kilogram of the window's latest weight.
#[must_use]
pub fn protein_ratio(table: &Table, window: usize) -> Option<ProteinReading> {
    let rows = table.latest(window);
    let weight = latest_in(rows, Field::WeightKg).filter(|w| *w > 0.0)?;
    let protein: Vec<f64> = rows.iter().filter_map(|r| r.get(Field::ProteinG)).collect();
    let mean_protein = mean(&protein)?;
    let ratio = mean_protein / weight;
    Some(ProteinReading {
        grams_per_kg: ratio,
        class: ProteinClass::from_ratio(ratio),
        mean_protein_g: mean_protein,
        weight_kg: weight,
    })
}

/// Trailing-window means. `None` means nothing was recorded in the window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Vitals {
    pub sleep_hours: Option<f64>,
    pub resting_heart_rate: Option<f64>,
    pub spo2_pct: Option<f64>,
    pub steps: Option<f64>,
    pub energy_level: Option<f64>,
    pub systolic: Option<f64>,
    pub diastolic: Option<f64>,
    pub active_kcal: Option<f64>,
}

#[must_use]
pub fn vitals(table: &Table, window: usize) -> Vitals {
    let rows = table.latest(window);
    let avg = |field| field_mean(rows, field);
    Vitals {
        sleep_hours: avg(Field::SleepHours),
        resting_heart_rate: avg(Field::RestingHeartRate),
        spo2_pct: avg(Field::Spo2Pct),
        steps: avg(Field::Steps),
        energy_level: avg(Field::EnergyLevel),
        systolic: avg(Field::Systolic),
        diastolic: avg(Field::Diastolic),
        active_kcal: avg(Field::ActiveKcal),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AveragePoint {
    pub date: NaiveDate,
    pub value: Option<f64>,
}

/// Trailing mean of `field` over the `window` rows ending at each row.
/// Rows without the field are skipped; a point is `None` when its whole
/// window is empty.
#[must_use]
pub fn moving_average(table: &Table, field: Field, window: usize) -> Vec<AveragePoint> {
    let rows = table.records();
    let window = window.max(1);
    rows.iter()
        .enumerate()
        .map(|(i, record)| {
            let start = (i + 1).saturating_sub(window);
            AveragePoint {
                date: record.date,
                value: field_mean(&rows[start..=i], field),
            }
        })
        .collect()
}

fn field_mean(rows: &[Record], field: Field) -> Option<f64> {
    let values: Vec<f64> = rows.iter().filter_map(|r| r.get(field)).collect();
    mean(&values)
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Everything the dashboard shows, computed in one pass over a table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub window: usize,
    pub record_count: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub latest_weight_kg: Option<f64>,
    pub height_m: Option<f64>,
    pub tdee: TdeeOutcome,
    pub bmi: Option<BmiReading>,
    pub ideal_weight: Option<WeightBand>,
    pub protein: Option<ProteinReading>,
    pub vitals: Vitals,
    pub weight_ma7: Vec<AveragePoint>,
    pub weight_ma14: Vec<AveragePoint>,
}

impl Dashboard {
    #[must_use]
    pub fn compute(table: &Table, window: usize) -> Self {
        let window = window.max(1);
        Dashboard {
            window,
            record_count: table.len(),
            first_date: table.records().first().map(|r| r.date),
            last_date: table.last().map(|r| r.date),
            latest_weight_kg: latest_non_sentinel(table, Field::WeightKg),
            height_m: latest_non_sentinel(table, Field::HeightM),
            tdee: estimate_tdee(table),
            bmi: bmi(table, window),
            ideal_weight: ideal_weight_band(table),
            protein: protein_ratio(table, window),
            vitals: vitals(table, window),
            weight_ma7: moving_average(table, Field::WeightKg, 7),
            weight_ma14: moving_average(table, Field::WeightKg, 14),
        }
    }
}
