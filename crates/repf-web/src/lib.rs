//! Synchronous prediction endpoints: validate numeric bounds, delegate to
//! the predictor, return JSON. No state beyond the shared predictor handle.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use repf_core::EnergyDomain;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "repf-web";

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("no fitted model for {domain}")]
    ModelMissing { domain: EnergyDomain },
    #[error("model for {domain} is unusable: {reason}")]
    ModelUnusable { domain: EnergyDomain, reason: String },
    #[error("expected {expected} features, got {got}")]
    FeatureShape { expected: usize, got: usize },
}

/// The external regression collaborator, seen from the serving side: a
/// fitted model handle that maps a feature row to a scalar.
pub trait Predictor: Send + Sync {
    fn predict(&self, domain: EnergyDomain, features: &[f64]) -> Result<f64, PredictError>;
}

/// Serialized fitted-model handle: the trainer writes one JSON file per
/// domain into the models directory.
#[derive(Debug, Clone, Deserialize)]
pub struct FittedModel {
    pub features: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl FittedModel {
    pub fn predict(&self, features: &[f64]) -> Result<f64, PredictError> {
        if features.len() != self.coefficients.len() {
            return Err(PredictError::FeatureShape {
                expected: self.coefficients.len(),
                got: features.len(),
            });
        }
        Ok(self
            .coefficients
            .iter()
            .zip(features)
            .map(|(c, x)| c * x)
            .sum::<f64>()
            + self.intercept)
    }
}

/// File-backed predictor: loads `<dir>/<domain>_model.json` per request, as
/// the trainer rewrites the files in place between runs.
#[derive(Debug, Clone)]
pub struct SavedModelPredictor {
    dir: PathBuf,
}

impl SavedModelPredictor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn load(&self, domain: EnergyDomain) -> Result<FittedModel, PredictError> {
        let path = self.dir.join(format!("{domain}_model.json"));
        let text = std::fs::read_to_string(&path)
            .map_err(|_| PredictError::ModelMissing { domain })?;
        serde_json::from_str(&text).map_err(|err| PredictError::ModelUnusable {
            domain,
            reason: err.to_string(),
        })
    }
}

impl Predictor for SavedModelPredictor {
    fn predict(&self, domain: EnergyDomain, features: &[f64]) -> Result<f64, PredictError> {
        self.load(domain)?.predict(features)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub predictor: Arc<dyn Predictor>,
}

impl AppState {
    pub fn new(predictor: Arc<dyn Predictor>) -> Self {
        Self { predictor }
    }
}

#[derive(Debug, Deserialize)]
struct HydroInput {
    #[serde(rename = "QmnJ")]
    qmnj: f64,
    #[serde(rename = "HIXnJ")]
    hixnj: f64,
}

#[derive(Debug, Deserialize)]
struct WindInput {
    wind_speed_10m_mean: f64,
    pressure_msl_mean: f64,
    temperature_2m_mean: f64,
}

#[derive(Debug, Deserialize)]
struct SolarInput {
    global_tilted_irradiance: f64,
    temperature_2m: f64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/predict/hydro", post(predict_hydro_handler))
        .route("/predict/wind", post(predict_wind_handler))
        .route("/predict/solar", post(predict_solar_handler))
        // Legacy French route names used by the historical dashboard.
        .route("/predict/eolienne", post(predict_wind_handler))
        .route("/predict/solaire", post(predict_solar_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("REPF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let models_dir = std::env::var("REPF_MODELS_DIR").unwrap_or_else(|_| "saved_models".to_string());
    let state = AppState::new(Arc::new(SavedModelPredictor::new(models_dir)));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn predict_hydro_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<HydroInput>,
) -> Response {
    if let Err(message) = check_bound("QmnJ", input.qmnj, 0.0, 10_000.0)
        .and_then(|_| check_bound("HIXnJ", input.hixnj, 0.0, 2_000.0))
    {
        return unprocessable(message);
    }
    respond(&state, EnergyDomain::Hydro, &[input.qmnj, input.hixnj])
}

async fn predict_wind_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<WindInput>,
) -> Response {
    if let Err(message) = check_bound("wind_speed_10m_mean", input.wind_speed_10m_mean, 0.0, 500.0)
        .and_then(|_| check_bound("pressure_msl_mean", input.pressure_msl_mean, 800.0, 1_200.0))
        .and_then(|_| check_bound("temperature_2m_mean", input.temperature_2m_mean, -80.0, 80.0))
    {
        return unprocessable(message);
    }
    respond(
        &state,
        EnergyDomain::Wind,
        &[
            input.wind_speed_10m_mean,
            input.pressure_msl_mean,
            input.temperature_2m_mean,
        ],
    )
}

async fn predict_solar_handler(
    State(state): State<Arc<AppState>>,
    Json(input): Json<SolarInput>,
) -> Response {
    if let Err(message) = check_bound("global_tilted_irradiance", input.global_tilted_irradiance, 0.0, 2_000.0)
        .and_then(|_| check_bound("temperature_2m", input.temperature_2m, -80.0, 80.0))
    {
        return unprocessable(message);
    }
    respond(
        &state,
        EnergyDomain::Solar,
        &[input.global_tilted_irradiance, input.temperature_2m],
    )
}

fn check_bound(name: &str, value: f64, min: f64, max: f64) -> Result<(), String> {
    if !value.is_finite() || value < min || value > max {
        return Err(format!("{name} must be between {min} and {max}"));
    }
    Ok(())
}

fn respond(state: &AppState, domain: EnergyDomain, features: &[f64]) -> Response {
    match state.predictor.predict(domain, features) {
        Ok(prediction) => Json(serde_json::json!({ "prediction": prediction })).into_response(),
        Err(err @ PredictError::ModelMissing { .. }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => {
            error!(%domain, error = %err, "prediction failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

fn unprocessable(message: String) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}
