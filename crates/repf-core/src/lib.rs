//! Core domain model for REPF: energy domains, raw and clean record shapes.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "repf-core";

/// Canonical textual calendar format used for persistence and API payloads.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// The three tracked renewable-energy domains.
///
/// Each domain carries its own cleaning configuration in a static
/// [`DomainSpec`]; adding a domain means adding a spec entry, not new
/// branching logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyDomain {
    Hydro,
    Wind,
    Solar,
}

impl EnergyDomain {
    pub const ALL: [EnergyDomain; 3] = [EnergyDomain::Hydro, EnergyDomain::Wind, EnergyDomain::Solar];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnergyDomain::Hydro => "hydro",
            EnergyDomain::Wind => "wind",
            EnergyDomain::Solar => "solar",
        }
    }

    /// Accepts both the canonical names and the legacy French aliases used by
    /// the historical data files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "hydro" => Some(EnergyDomain::Hydro),
            "wind" | "eolienne" => Some(EnergyDomain::Wind),
            "solar" | "solaire" => Some(EnergyDomain::Solar),
            _ => None,
        }
    }

    pub fn spec(&self) -> &'static DomainSpec {
        match self {
            EnergyDomain::Hydro => &HYDRO_SPEC,
            EnergyDomain::Wind => &WIND_SPEC,
            EnergyDomain::Solar => &SOLAR_SPEC,
        }
    }
}

impl std::fmt::Display for EnergyDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked measurement series within a domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSpec {
    pub name: &'static str,
    /// Readings at or above this value are physically impossible and are
    /// rejected before the statistical fence.
    pub physical_ceiling: Option<f64>,
    /// Whether the series comes from an independent physical sensor, making
    /// it eligible for per-column IQR outlier rejection.
    pub independent_sensor: bool,
}

/// Data-driven per-domain configuration: everything the cleaner, outlier
/// filter and writer need to know about a domain lives here.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainSpec {
    pub domain: EnergyDomain,
    /// Store table the cleaned rows are upserted into.
    pub table: &'static str,
    pub target_column: &'static str,
    /// Maximum plausible production value; the range filter keeps
    /// `0 < target <= ceiling`.
    pub ceiling: f64,
    /// Corrective factor applied to the target after the range filter.
    pub target_scale: f64,
    pub metrics: &'static [MetricSpec],
}

impl DomainSpec {
    pub fn metric(&self, name: &str) -> Option<&MetricSpec> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.metrics.iter().map(|m| m.name)
    }
}

static HYDRO_SPEC: DomainSpec = DomainSpec {
    domain: EnergyDomain::Hydro,
    table: "hydro_data",
    target_column: "prod_hydro",
    ceiling: 200.0,
    target_scale: 1.0,
    metrics: &[
        MetricSpec {
            name: "QmnJ",
            physical_ceiling: Some(10_000.0),
            independent_sensor: true,
        },
        MetricSpec {
            name: "HIXnJ",
            physical_ceiling: Some(2_000.0),
            independent_sensor: true,
        },
    ],
};

static WIND_SPEC: DomainSpec = DomainSpec {
    domain: EnergyDomain::Wind,
    table: "eolienne_data",
    target_column: "prod_eolienne",
    ceiling: 100.0,
    target_scale: 1.0,
    metrics: &[
        MetricSpec {
            name: "wind_speed_10m_mean",
            physical_ceiling: None,
            independent_sensor: false,
        },
        MetricSpec {
            name: "pressure_msl_mean",
            physical_ceiling: None,
            independent_sensor: false,
        },
        MetricSpec {
            name: "temperature_2m_mean",
            physical_ceiling: None,
            independent_sensor: false,
        },
    ],
};

static SOLAR_SPEC: DomainSpec = DomainSpec {
    domain: EnergyDomain::Solar,
    table: "solaire_data",
    target_column: "prod_solaire",
    ceiling: 100.0,
    // Known source underreporting bias.
    target_scale: 1.5,
    metrics: &[
        MetricSpec {
            name: "global_tilted_irradiance",
            physical_ceiling: None,
            independent_sensor: false,
        },
        MetricSpec {
            name: "temperature_2m",
            physical_ceiling: None,
            independent_sensor: false,
        },
    ],
};

/// Quality codes attached to hydrometric API observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationStatus {
    pub code_statut: i32,
    pub code_methode: i32,
    pub code_qualification: i32,
}

impl ObservationStatus {
    /// Validated-raw, measured, qualified — the only combination eligible for
    /// strict ingestion.
    pub fn is_validated_raw(&self) -> bool {
        self.code_statut == 4 && self.code_methode == 0 && self.code_qualification == 16
    }
}

/// One source row from a long-format source: one metric per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongObservation {
    /// Source-provided date text; parsed and canonicalized by the cleaner.
    pub date: String,
    pub metric: String,
    pub value: Option<f64>,
    pub status: Option<ObservationStatus>,
}

/// One source row from a wide-format source: one date per row, several
/// metric columns already attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideObservation {
    pub date: String,
    pub target: Option<f64>,
    pub metrics: BTreeMap<String, Option<f64>>,
}

impl WideObservation {
    pub fn with_target(date: impl Into<String>, target: Option<f64>) -> Self {
        Self {
            date: date.into(),
            target,
            metrics: BTreeMap::new(),
        }
    }
}

/// Unvalidated tabular dataset in whatever shape the source naturally
/// provides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawDataset {
    Long(Vec<LongObservation>),
    Wide(Vec<WideObservation>),
}

impl RawDataset {
    pub fn len(&self) -> usize {
        match self {
            RawDataset::Long(rows) => rows.len(),
            RawDataset::Wide(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Canonical per-day record after cleaning; the unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    pub date: NaiveDate,
    pub target: Option<f64>,
    pub metrics: BTreeMap<String, Option<f64>>,
}

impl CleanRecord {
    pub fn new(date: NaiveDate, target: Option<f64>) -> Self {
        Self {
            date,
            target,
            metrics: BTreeMap::new(),
        }
    }

    pub fn date_text(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten()
    }
}

/// Dense per-day table: a full calendar index with one column per tracked
/// metric and `None` where no measurement exists.
#[derive(Debug, Clone, PartialEq)]
pub struct WideFrame {
    pub columns: Vec<String>,
    pub dates: Vec<NaiveDate>,
    /// One series per column, each parallel to `dates`.
    pub cells: Vec<Vec<Option<f64>>>,
}

impl WideFrame {
    /// Date-indexed skeleton with no metric columns; rows are identified by
    /// their sequential position.
    pub fn skeleton(dates: Vec<NaiveDate>) -> Self {
        Self {
            columns: Vec::new(),
            dates,
            cells: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.column_index(name).map(|i| self.cells[i].as_slice())
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Vec<Option<f64>>> {
        self.column_index(name).map(move |i| &mut self.cells[i])
    }

    pub fn value_at(&self, date: NaiveDate, column: &str) -> Option<f64> {
        let row = self.dates.iter().position(|d| *d == date)?;
        let col = self.column_index(column)?;
        self.cells[col][row]
    }

    /// Per-date metric mapping for one row.
    pub fn row_metrics(&self, row: usize) -> BTreeMap<String, Option<f64>> {
        self.columns
            .iter()
            .enumerate()
            .map(|(col, name)| (name.clone(), self.cells[col][row]))
            .collect()
    }
}

/// Inclusive calendar range used to reindex sparse series into dense frames.
pub fn calendar_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut day = start;
    while day <= end {
        out.push(day);
        day = day.succ_opt().expect("calendar range within NaiveDate bounds");
    }
    out
}

/// Parses a source-provided date in any of the shapes the historical files
/// and APIs are known to emit.
pub fn parse_calendar_date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, DATE_FORMAT) {
        return Some(date);
    }
    // Timestamped variants: keep the calendar day, drop the time component.
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt.date());
        }
    }
    None
}
