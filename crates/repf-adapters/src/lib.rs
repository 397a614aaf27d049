//! Source reader contracts + file- and API-backed implementations.
//!
//! Every reader yields an unvalidated [`RawDataset`] in whatever shape the
//! source naturally provides; cleaning and validation belong to the sync
//! pipeline, not to the readers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use repf_core::{
    EnergyDomain, LongObservation, ObservationStatus, RawDataset, WideObservation, DATE_FORMAT,
};
use repf_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "repf-adapters";

pub const HUBEAU_OBS_ELAB_URL: &str = "https://hubeau.eaufrance.fr/api/v2/hydrometrie/obs_elab";
pub const OPEN_METEO_ARCHIVE_URL: &str = "https://archive-api.open-meteo.com/v1/archive";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source rejected request: http {status} for {url}")]
    Rejected { status: u16, url: String },
    #[error("malformed source: {0}")]
    Malformed(String),
    #[error("schema mismatch: missing column {column}")]
    SchemaMismatch { column: String },
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Request(inner) => SourceError::Unavailable(inner.to_string()),
            FetchError::HttpStatus { status, url } => SourceError::Rejected { status, url },
        }
    }
}

/// One contract for both source kinds. File-backed readers ignore the
/// fetcher; API-backed readers issue their requests through it so retry and
/// backoff policy stays in one place.
#[async_trait]
pub trait SourceReader: Send + Sync {
    fn domain(&self) -> EnergyDomain;

    async fn load(&self, http: &HttpFetcher) -> Result<RawDataset, SourceError>;
}

/// Delimited historical production file: a `date` column plus the domain's
/// production column.
#[derive(Debug, Clone)]
pub struct ProductionFileSource {
    domain: EnergyDomain,
    path: PathBuf,
    delimiter: u8,
}

impl ProductionFileSource {
    pub fn new(domain: EnergyDomain, path: impl Into<PathBuf>) -> Self {
        Self {
            domain,
            path: path.into(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn read(&self) -> Result<Vec<WideObservation>, SourceError> {
        let spec = self.domain.spec();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|err| SourceError::Unavailable(format!("{}: {err}", self.path.display())))?;

        let headers = reader
            .headers()
            .map_err(|err| SourceError::Malformed(err.to_string()))?
            .clone();
        // Columns are resolved by name against the declared schema, never by
        // position.
        let date_idx = column_index(&headers, "date")?;
        let target_idx = column_index(&headers, spec.target_column)?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    debug!(error = %err, "skipping unreadable file row");
                    continue;
                }
            };
            let date = record.get(date_idx).unwrap_or_default().to_string();
            let target = record
                .get(target_idx)
                .and_then(|text| text.parse::<f64>().ok());
            rows.push(WideObservation::with_target(date, target));
        }
        Ok(rows)
    }
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Result<usize, SourceError> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| SourceError::SchemaMismatch {
            column: name.to_string(),
        })
}

#[async_trait]
impl SourceReader for ProductionFileSource {
    fn domain(&self) -> EnergyDomain {
        self.domain
    }

    async fn load(&self, _http: &HttpFetcher) -> Result<RawDataset, SourceError> {
        Ok(RawDataset::Wide(self.read()?))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HubeauResponse {
    #[serde(default)]
    data: Vec<HubeauObservation>,
}

#[derive(Debug, Clone, Deserialize)]
struct HubeauObservation {
    date_obs_elab: Option<String>,
    resultat_obs_elab: Option<f64>,
    code_statut: Option<i32>,
    code_methode: Option<i32>,
    code_qualification: Option<i32>,
}

/// Hydrometric observations, one request per grandeur since the API is
/// single-metric-per-call. Responses are concatenated into one long dataset
/// tagged with metric identity per row.
#[derive(Debug, Clone)]
pub struct HydrometricApiSource {
    base_url: String,
    code_entite: String,
    grandeurs: Vec<String>,
    date_debut: Option<NaiveDate>,
    date_fin: Option<NaiveDate>,
    size: u32,
    /// Keep only validated-raw/measured/qualified observations.
    validated_only: bool,
}

impl HydrometricApiSource {
    pub fn new(code_entite: impl Into<String>, grandeurs: Vec<String>) -> Self {
        Self {
            base_url: HUBEAU_OBS_ELAB_URL.to_string(),
            code_entite: code_entite.into(),
            grandeurs,
            date_debut: None,
            date_fin: None,
            size: 500,
            validated_only: false,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_date_range(mut self, debut: NaiveDate, fin: NaiveDate) -> Self {
        self.date_debut = Some(debut);
        self.date_fin = Some(fin);
        self
    }

    pub fn with_validated_only(mut self, validated_only: bool) -> Self {
        self.validated_only = validated_only;
        self
    }

    fn query_for(&self, grandeur: &str) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("code_entite", self.code_entite.clone()),
            ("grandeur_hydro_elab", grandeur.to_string()),
            ("size", self.size.to_string()),
        ];
        if let Some(debut) = self.date_debut {
            query.push(("date_debut_obs", debut.format(DATE_FORMAT).to_string()));
        }
        if let Some(fin) = self.date_fin {
            query.push(("date_fin_obs", fin.format(DATE_FORMAT).to_string()));
        }
        query
    }
}

/// Parses one hub'eau obs_elab response body into tagged long observations.
pub fn parse_hubeau_body(body: &[u8], grandeur: &str) -> Result<Vec<LongObservation>, SourceError> {
    let response: HubeauResponse = serde_json::from_slice(body)
        .map_err(|err| SourceError::Malformed(format!("hubeau response: {err}")))?;

    Ok(response
        .data
        .into_iter()
        .filter_map(|obs| {
            let date = obs.date_obs_elab?;
            let status = match (obs.code_statut, obs.code_methode, obs.code_qualification) {
                (Some(code_statut), Some(code_methode), Some(code_qualification)) => {
                    Some(ObservationStatus {
                        code_statut,
                        code_methode,
                        code_qualification,
                    })
                }
                _ => None,
            };
            Some(LongObservation {
                date,
                metric: grandeur.to_string(),
                value: obs.resultat_obs_elab,
                status,
            })
        })
        .collect())
}

#[async_trait]
impl SourceReader for HydrometricApiSource {
    fn domain(&self) -> EnergyDomain {
        EnergyDomain::Hydro
    }

    async fn load(&self, http: &HttpFetcher) -> Result<RawDataset, SourceError> {
        let mut all = Vec::new();
        for grandeur in &self.grandeurs {
            let body = http
                .get_bytes("hubeau", &self.base_url, &self.query_for(grandeur))
                .await?;
            let mut rows = parse_hubeau_body(&body, grandeur)?;
            if self.validated_only {
                let before = rows.len();
                rows.retain(|row| row.status.is_some_and(|s| s.is_validated_raw()));
                debug!(
                    %grandeur,
                    dropped = before - rows.len(),
                    "filtered non-validated observations"
                );
            }
            all.extend(rows);
        }
        Ok(RawDataset::Long(all))
    }
}

/// Weather measurements for wind and solar. Wind is served at daily
/// resolution; solar is served hourly and resampled to daily means before
/// handoff.
#[derive(Debug, Clone)]
pub struct WeatherApiSource {
    base_url: String,
    domain: EnergyDomain,
    latitude: f64,
    longitude: f64,
    start_date: NaiveDate,
    end_date: NaiveDate,
    timezone: String,
    /// Panel tilt in degrees; only meaningful for solar irradiance.
    tilt: Option<f64>,
}

impl WeatherApiSource {
    pub fn new(
        domain: EnergyDomain,
        latitude: f64,
        longitude: f64,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Self {
        Self {
            base_url: OPEN_METEO_ARCHIVE_URL.to_string(),
            domain,
            latitude,
            longitude,
            start_date,
            end_date,
            timezone: "Europe/Paris".to_string(),
            tilt: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_tilt(mut self, tilt: f64) -> Self {
        self.tilt = Some(tilt);
        self
    }

    fn hourly(&self) -> bool {
        self.domain == EnergyDomain::Solar
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let metric_list = self
            .domain
            .spec()
            .metric_names()
            .collect::<Vec<_>>()
            .join(",");
        let mut query = vec![
            ("latitude", self.latitude.to_string()),
            ("longitude", self.longitude.to_string()),
            ("start_date", self.start_date.format(DATE_FORMAT).to_string()),
            ("end_date", self.end_date.format(DATE_FORMAT).to_string()),
            ("timezone", self.timezone.clone()),
        ];
        if self.hourly() {
            query.push(("hourly", metric_list));
        } else {
            query.push(("daily", metric_list));
        }
        if let Some(tilt) = self.tilt {
            query.push(("tilt", tilt.to_string()));
        }
        query
    }
}

fn json_block<'a>(value: &'a JsonValue, key: &str) -> Result<&'a JsonValue, SourceError> {
    value
        .get(key)
        .ok_or_else(|| SourceError::Malformed(format!("weather response missing `{key}` block")))
}

fn time_axis(block: &JsonValue) -> Result<Vec<String>, SourceError> {
    let axis = block
        .get("time")
        .and_then(|v| v.as_array())
        .ok_or_else(|| SourceError::Malformed("weather response missing time axis".into()))?;
    Ok(axis
        .iter()
        .map(|v| v.as_str().unwrap_or_default().to_string())
        .collect())
}

fn metric_series(
    block: &JsonValue,
    name: &str,
    expected_len: usize,
) -> Result<Vec<Option<f64>>, SourceError> {
    let series = block
        .get(name)
        .and_then(|v| v.as_array())
        .ok_or_else(|| SourceError::Malformed(format!("weather response missing `{name}` series")))?;
    if series.len() != expected_len {
        return Err(SourceError::Malformed(format!(
            "`{name}` series length {} does not match time axis length {expected_len}",
            series.len()
        )));
    }
    Ok(series.iter().map(|v| v.as_f64()).collect())
}

/// Parses a weather response body into one wide observation per time-axis
/// entry. `block_key` is `daily` or `hourly`.
pub fn parse_weather_body(
    body: &[u8],
    block_key: &str,
    metric_names: &[&str],
) -> Result<Vec<WideObservation>, SourceError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|err| SourceError::Malformed(format!("weather response: {err}")))?;
    let block = json_block(&value, block_key)?;
    let axis = time_axis(block)?;

    let mut series = BTreeMap::new();
    for name in metric_names {
        series.insert(*name, metric_series(block, name, axis.len())?);
    }

    Ok(axis
        .iter()
        .enumerate()
        .map(|(i, stamp)| WideObservation {
            date: stamp.clone(),
            target: None,
            metrics: series
                .iter()
                .map(|(name, values)| (name.to_string(), values[i]))
                .collect(),
        })
        .collect())
}

/// Collapses hourly observations to one row per calendar day, averaging each
/// metric over the day's non-null hours.
pub fn resample_hourly_to_daily(rows: Vec<WideObservation>) -> Vec<WideObservation> {
    let mut grouped: BTreeMap<String, BTreeMap<String, (f64, u32)>> = BTreeMap::new();
    for row in rows {
        // Hourly stamps look like `2024-01-01T13:00`; the calendar day is the
        // first ten characters.
        let day = row.date.get(..10).unwrap_or(&row.date).to_string();
        let slot = grouped.entry(day).or_default();
        for (name, value) in row.metrics {
            if let Some(value) = value {
                let (sum, count) = slot.entry(name).or_insert((0.0, 0));
                *sum += value;
                *count += 1;
            }
        }
    }

    grouped
        .into_iter()
        .map(|(date, metrics)| WideObservation {
            date,
            target: None,
            metrics: metrics
                .into_iter()
                .map(|(name, (sum, count))| (name, Some(sum / count as f64)))
                .collect(),
        })
        .collect()
}

#[async_trait]
impl SourceReader for WeatherApiSource {
    fn domain(&self) -> EnergyDomain {
        self.domain
    }

    async fn load(&self, http: &HttpFetcher) -> Result<RawDataset, SourceError> {
        let body = http
            .get_bytes("open-meteo", &self.base_url, &self.query())
            .await?;
        let metric_names = self.domain.spec().metric_names().collect::<Vec<_>>();
        let block_key = if self.hourly() { "hourly" } else { "daily" };
        let rows = parse_weather_body(&body, block_key, &metric_names)?;
        let rows = if self.hourly() {
            resample_hourly_to_daily(rows)
        } else {
            rows
        };
        Ok(RawDataset::Wide(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(repf_storage::HttpClientConfig::default()).unwrap()
    }

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn file_source_reads_named_columns() {
        let file = write_csv("date,prod_hydro\n2024-01-01,50\n2024-01-02,not-a-number\n");
        let source = ProductionFileSource::new(EnergyDomain::Hydro, file.path());
        let dataset = source.load(&fetcher()).await.unwrap();
        let RawDataset::Wide(rows) = dataset else {
            panic!("file source yields wide rows");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, "2024-01-01");
        assert_eq!(rows[0].target, Some(50.0));
        assert_eq!(rows[1].target, None);
    }

    #[tokio::test]
    async fn file_source_resolves_columns_regardless_of_order() {
        let file = write_csv("prod_solaire;date\n40;2024-01-01\n");
        let source =
            ProductionFileSource::new(EnergyDomain::Solar, file.path()).with_delimiter(b';');
        let dataset = source.load(&fetcher()).await.unwrap();
        let RawDataset::Wide(rows) = dataset else {
            panic!("file source yields wide rows");
        };
        assert_eq!(rows[0].target, Some(40.0));
    }

    #[tokio::test]
    async fn file_source_missing_production_column_is_schema_mismatch() {
        let file = write_csv("date,prod_hydro\n2024-01-01,50\n");
        let source = ProductionFileSource::new(EnergyDomain::Wind, file.path());
        let err = source.load(&fetcher()).await.unwrap_err();
        assert!(matches!(
            err,
            SourceError::SchemaMismatch { column } if column == "prod_eolienne"
        ));
    }

    #[tokio::test]
    async fn file_source_missing_file_is_unavailable() {
        let source =
            ProductionFileSource::new(EnergyDomain::Hydro, "/nonexistent/prod_hydro.csv");
        let err = source.load(&fetcher()).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[test]
    fn hubeau_body_parses_into_tagged_long_rows() {
        let body = br#"{
            "data": [
                {"date_obs_elab": "2024-01-01", "resultat_obs_elab": 12.5,
                 "code_statut": 4, "code_methode": 0, "code_qualification": 16},
                {"date_obs_elab": "2024-01-02", "resultat_obs_elab": null,
                 "code_statut": 8, "code_methode": 0, "code_qualification": 16}
            ]
        }"#;
        let rows = parse_hubeau_body(body, "QmnJ").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].metric, "QmnJ");
        assert_eq!(rows[0].value, Some(12.5));
        assert!(rows[0].status.unwrap().is_validated_raw());
        assert_eq!(rows[1].value, None);
        assert!(!rows[1].status.unwrap().is_validated_raw());
    }

    #[test]
    fn hubeau_body_without_data_is_empty_not_fatal() {
        let rows = parse_hubeau_body(b"{}", "HIXnJ").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn hubeau_body_that_is_not_json_is_malformed() {
        let err = parse_hubeau_body(b"<html>down for maintenance</html>", "QmnJ").unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn hydrometric_query_includes_date_bounds_when_set() {
        let source = HydrometricApiSource::new("Y321002101", vec!["QmnJ".into()]).with_date_range(
            NaiveDate::from_ymd_opt(2022, 9, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );
        let query = source.query_for("QmnJ");
        assert!(query.contains(&("code_entite", "Y321002101".to_string())));
        assert!(query.contains(&("date_debut_obs", "2022-09-01".to_string())));
        assert!(query.contains(&("date_fin_obs", "2024-01-01".to_string())));
    }

    #[test]
    fn weather_daily_body_zips_axis_with_series() {
        let body = br#"{
            "daily": {
                "time": ["2024-01-01", "2024-01-02"],
                "wind_speed_10m_mean": [12.0, null],
                "pressure_msl_mean": [1013.2, 1009.8],
                "temperature_2m_mean": [4.5, 6.1]
            }
        }"#;
        let rows = parse_weather_body(
            body,
            "daily",
            &["wind_speed_10m_mean", "pressure_msl_mean", "temperature_2m_mean"],
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].metrics["wind_speed_10m_mean"], Some(12.0));
        assert_eq!(rows[1].metrics["wind_speed_10m_mean"], None);
        assert_eq!(rows[1].metrics["pressure_msl_mean"], Some(1009.8));
    }

    #[test]
    fn weather_series_length_mismatch_is_malformed() {
        let body = br#"{
            "daily": {
                "time": ["2024-01-01", "2024-01-02"],
                "wind_speed_10m_mean": [12.0]
            }
        }"#;
        let err = parse_weather_body(body, "daily", &["wind_speed_10m_mean"]).unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn weather_missing_block_is_malformed() {
        let err = parse_weather_body(b"{\"hourly\": {\"time\": []}}", "daily", &[]).unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn hourly_rows_resample_to_daily_means() {
        let rows = vec![
            WideObservation {
                date: "2024-01-01T10:00".into(),
                target: None,
                metrics: BTreeMap::from([("global_tilted_irradiance".to_string(), Some(100.0))]),
            },
            WideObservation {
                date: "2024-01-01T11:00".into(),
                target: None,
                metrics: BTreeMap::from([("global_tilted_irradiance".to_string(), Some(300.0))]),
            },
            WideObservation {
                date: "2024-01-01T12:00".into(),
                target: None,
                metrics: BTreeMap::from([("global_tilted_irradiance".to_string(), None)]),
            },
            WideObservation {
                date: "2024-01-02T10:00".into(),
                target: None,
                metrics: BTreeMap::from([("global_tilted_irradiance".to_string(), Some(50.0))]),
            },
        ];
        let daily = resample_hourly_to_daily(rows);
        assert_eq!(daily.len(), 2);
        assert_eq!(daily[0].date, "2024-01-01");
        // Null hours are excluded from the mean, not counted as zero.
        assert_eq!(daily[0].metrics["global_tilted_irradiance"], Some(200.0));
        assert_eq!(daily[1].metrics["global_tilted_irradiance"], Some(50.0));
    }

    #[test]
    fn solar_query_requests_hourly_series_with_tilt() {
        let source = WeatherApiSource::new(
            EnergyDomain::Solar,
            43.6,
            3.9,
            NaiveDate::from_ymd_opt(2022, 9, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )
        .with_tilt(30.0);
        let query = source.query();
        assert!(query
            .iter()
            .any(|(k, v)| *k == "hourly" && v.contains("global_tilted_irradiance")));
        assert!(query.contains(&("tilt", "30".to_string())));
    }

    #[test]
    fn wind_query_requests_daily_series() {
        let source = WeatherApiSource::new(
            EnergyDomain::Wind,
            43.6,
            3.9,
            NaiveDate::from_ymd_opt(2022, 9, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );
        let query = source.query();
        assert!(query
            .iter()
            .any(|(k, v)| *k == "daily" && v.contains("wind_speed_10m_mean")));
        assert!(!query.iter().any(|(k, _)| *k == "tilt"));
    }
}
