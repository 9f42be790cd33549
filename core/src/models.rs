use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A measured column of the daily table.
///
/// `date` is not a field: it is the key every record is addressed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    WeightKg,
    HeightM,
    WaistCm,
    CaloriesKcal,
    ProteinG,
    Steps,
    SleepHours,
    RestingHeartRate,
    Spo2Pct,
    Systolic,
    Diastolic,
    EnergyLevel,
    ActiveKcal,
}

impl Field {
    /// Canonical column order used when writing the table.
    pub const ALL: [Field; 13] = [
        Field::WeightKg,
        Field::HeightM,
        Field::WaistCm,
        Field::CaloriesKcal,
        Field::ProteinG,
        Field::Steps,
        Field::SleepHours,
        Field::RestingHeartRate,
        Field::Spo2Pct,
        Field::Systolic,
        Field::Diastolic,
        Field::EnergyLevel,
        Field::ActiveKcal,
    ];

    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            Field::WeightKg => "weight_kg",
            Field::HeightM => "height_m",
            Field::WaistCm => "waist_cm",
            Field::CaloriesKcal => "calories_kcal",
            Field::ProteinG => "protein_g",
            Field::Steps => "steps",
            Field::SleepHours => "sleep_hours",
            Field::RestingHeartRate => "resting_heart_rate",
            Field::Spo2Pct => "spo2_pct",
            Field::Systolic => "systolic",
            Field::Diastolic => "diastolic",
            Field::EnergyLevel => "energy_level",
            Field::ActiveKcal => "active_kcal",
        }
    }

    /// Look up a field by its column name (case-insensitive).
    #[must_use]
    pub fn from_column(name: &str) -> Option<Field> {
        Field::ALL
            .into_iter()
            .find(|f| f.column().eq_ignore_ascii_case(name.trim()))
    }

    /// Integer columns are stored as whole numbers; the rest are decimals.
    #[must_use]
    pub fn is_integer(self) -> bool {
        !matches!(
            self,
            Field::WeightKg | Field::HeightM | Field::WaistCm | Field::SleepHours
        )
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// The measurements recorded for one day. `None` means "not recorded".
///
/// The CSV blob encodes "not recorded" as `0`; that sentinel is translated at
/// the codec boundary and never appears here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height_m: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waist_cm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories_kcal: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein_g: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resting_heart_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spo2_pct: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systolic: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diastolic: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_kcal: Option<u32>,
}

impl Measurements {
    #[must_use]
    pub fn get(&self, field: Field) -> Option<f64> {
        match field {
            Field::WeightKg => self.weight_kg,
            Field::HeightM => self.height_m,
            Field::WaistCm => self.waist_cm,
            Field::SleepHours => self.sleep_hours,
            Field::CaloriesKcal => self.calories_kcal.map(f64::from),
            Field::ProteinG => self.protein_g.map(f64::from),
            Field::Steps => self.steps.map(f64::from),
            Field::RestingHeartRate => self.resting_heart_rate.map(f64::from),
            Field::Spo2Pct => self.spo2_pct.map(f64::from),
            Field::Systolic => self.systolic.map(f64::from),
            Field::Diastolic => self.diastolic.map(f64::from),
            Field::EnergyLevel => self.energy_level.map(f64::from),
            Field::ActiveKcal => self.active_kcal.map(f64::from),
        }
    }

    /// Set a field. Zero, negative and non-finite values clear it; integer
    /// fields are rounded to the nearest whole number.
    #[allow(clippy::cast_sign_loss)]
    pub fn set(&mut self, field: Field, value: Option<f64>) {
        let value = value.filter(|v| v.is_finite() && *v > 0.0);
        let whole = value
            .map(|v| v.round().min(f64::from(u32::MAX)) as u32)
            .filter(|v| *v > 0);
        match field {
            Field::WeightKg => self.weight_kg = value,
            Field::HeightM => self.height_m = value,
            Field::WaistCm => self.waist_cm = value,
            Field::SleepHours => self.sleep_hours = value,
            Field::CaloriesKcal => self.calories_kcal = whole,
            Field::ProteinG => self.protein_g = whole,
            Field::Steps => self.steps = whole,
            Field::RestingHeartRate => self.resting_heart_rate = whole,
            Field::Spo2Pct => self.spo2_pct = whole,
            Field::Systolic => self.systolic = whole,
            Field::Diastolic => self.diastolic = whole,
            Field::EnergyLevel => self.energy_level = whole,
            Field::ActiveKcal => self.active_kcal = whole,
        }
    }

    /// Map any stray zero (or negative/NaN) to `None`.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut out = Measurements::default();
        for field in Field::ALL {
            out.set(field, self.get(field));
        }
        out
    }

    /// Copy every recorded field of `incoming` over `self`, leaving fields
    /// `incoming` does not record untouched. Returns how many values changed.
    pub fn overlay(&mut self, incoming: &Measurements) -> usize {
        let mut changed = 0;
        for field in Field::ALL {
            if let Some(value) = incoming.get(field).filter(|v| *v > 0.0) {
                if self.get(field) != Some(value) {
                    self.set(field, Some(value));
                    changed += 1;
                }
            }
        }
        changed
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        Field::ALL.into_iter().all(|f| self.get(f).is_none())
    }
}

/// One day's full set of measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub values: Measurements,
    /// Columns this build does not know about, carried through verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Record {
    #[must_use]
    pub fn new(date: NaiveDate, values: Measurements) -> Self {
        Self {
            date,
            values: values.normalized(),
            extra: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, field: Field) -> Option<f64> {
        self.values.get(field)
    }
}

/// A dated set of values from an external source, merged field-by-field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialRecord {
    pub date: NaiveDate,
    pub values: Measurements,
}

/// Reject measurements no person can produce.
pub fn validate_measurements(values: &Measurements) -> Result<()> {
    if let Some(level) = values.energy_level {
        if !(1..=10).contains(&level) {
            bail!("Energy level must be between 1 and 10 (got {level})");
        }
    }
    if let Some(spo2) = values.spo2_pct {
        if spo2 > 100 {
            bail!("SpO2 must be at most 100% (got {spo2})");
        }
    }
    if let Some(height) = values.height_m {
        if height > 3.0 {
            bail!("Height is in metres and must be at most 3.0 (got {height})");
        }
    }
    if let Some(sleep) = values.sleep_hours {
        if sleep > 24.0 {
            bail!("Sleep must be at most 24 hours (got {sleep})");
        }
    }
    if let (Some(sys), Some(dia)) = (values.systolic, values.diastolic) {
        if dia >= sys {
            bail!("Diastolic pressure ({dia}) must be below systolic ({sys})");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_column_roundtrip() {
        for field in Field::ALL {
            assert_eq!(Field::from_column(field.column()), Some(field));
        }
        assert_eq!(Field::from_column(" Weight_KG "), Some(Field::WeightKg));
        assert_eq!(Field::from_column("mood"), None);
    }

    #[test]
    fn test_set_clears_zero_and_negative() {
        let mut m = Measurements::default();
        m.set(Field::Steps, Some(0.0));
        assert!(m.steps.is_none());
        m.set(Field::WeightKg, Some(-3.0));
        assert!(m.weight_kg.is_none());
        m.set(Field::SleepHours, Some(f64::NAN));
        assert!(m.sleep_hours.is_none());
        m.set(Field::ProteinG, Some(120.6));
        assert_eq!(m.protein_g, Some(121));
    }

    #[test]
    fn test_normalized_drops_zero_sentinels() {
        let m = Measurements {
            weight_kg: Some(0.0),
            steps: Some(0),
            calories_kcal: Some(1800),
            ..Measurements::default()
        };
        let n = m.normalized();
        assert!(n.weight_kg.is_none());
        assert!(n.steps.is_none());
        assert_eq!(n.calories_kcal, Some(1800));
    }

    #[test]
    fn test_overlay_keeps_unrecorded_fields() {
        let mut stored = Measurements {
            steps: Some(5000),
            weight_kg: Some(80.0),
            ..Measurements::default()
        };
        let incoming = Measurements {
            sleep_hours: Some(7.5),
            ..Measurements::default()
        };
        assert_eq!(stored.overlay(&incoming), 1);
        assert_eq!(stored.steps, Some(5000));
        assert_eq!(stored.weight_kg, Some(80.0));
        assert_eq!(stored.sleep_hours, Some(7.5));

        // Same values again change nothing
        assert_eq!(stored.overlay(&incoming), 0);
    }

    #[test]
    fn test_validate_measurements() {
        let ok = Measurements {
            energy_level: Some(7),
            spo2_pct: Some(98),
            systolic: Some(120),
            diastolic: Some(80),
            ..Measurements::default()
        };
        assert!(validate_measurements(&ok).is_ok());

        let bad_energy = Measurements {
            energy_level: Some(11),
            ..Measurements::default()
        };
        let err = validate_measurements(&bad_energy).unwrap_err();
        assert!(err.to_string().contains("Energy level"));

        let bad_height = Measurements {
            height_m: Some(178.0),
            ..Measurements::default()
        };
        assert!(validate_measurements(&bad_height).is_err());

        let inverted_bp = Measurements {
            systolic: Some(80),
            diastolic: Some(120),
            ..Measurements::default()
        };
        assert!(validate_measurements(&inverted_bp).is_err());
    }

    #[test]
    fn test_record_serializes_flat() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rec = Record::new(
            date,
            Measurements {
                weight_kg: Some(80.5),
                ..Measurements::default()
            },
        );
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["date"], "2024-01-01");
        assert_eq!(json["weight_kg"], 80.5);
        assert!(json.get("steps").is_none());
        assert!(json.get("extra").is_none());
    }
}
