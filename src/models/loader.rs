use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use crate::config::ModelsConfig;
use crate::models::artifacts::{DenseNetwork, LogisticModel, ProbabilityModel, Scaler, TreeEnsemble};
use crate::models::ensemble::META_FEATURE_COUNT;
use crate::models::features::FeatureSchema;

pub const FEATURE_NAMES_FILE: &str = "feature_names.json";
pub const SCALER_FILE: &str = "scaler_params.json";
pub const HISTORICAL_FILE: &str = "historical_model.json";
pub const SENTIMENT_NETWORK_FILE: &str = "sentiment_model.network.json";
pub const SENTIMENT_LOGISTIC_FILE: &str = "sentiment_model.json";
pub const META_LEARNER_FILE: &str = "hybrid_meta_learner.json";

/// Result of trying to load one optional artifact.
#[derive(Debug)]
pub enum LoadOutcome<T> {
    Loaded(T),
    Absent,
    Incompatible(String),
}

impl<T> LoadOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            LoadOutcome::Loaded(value) => Some(value),
            _ => None,
        }
    }

    /// Run a structural check on a loaded value.
    fn and_validate(self, check: impl FnOnce(&T) -> Result<(), String>) -> Self {
        match self {
            LoadOutcome::Loaded(value) => match check(&value) {
                Ok(()) => LoadOutcome::Loaded(value),
                Err(reason) => LoadOutcome::Incompatible(reason),
            },
            other => other,
        }
    }
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> LoadOutcome<T> {
    if !path.exists() {
        return LoadOutcome::Absent;
    }
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => return LoadOutcome::Incompatible(format!("{}: {}", path.display(), e)),
    };
    match serde_json::from_str(&contents) {
        Ok(value) => LoadOutcome::Loaded(value),
        Err(e) => LoadOutcome::Incompatible(format!("{}: {}", path.display(), e)),
    }
}

/// Which stages have a trained artifact behind them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ModelStatus {
    pub historical: bool,
    pub sentiment: bool,
    pub hybrid: bool,
}

/// Read-only set of artifacts, shared across evaluations after loading.
#[derive(Clone, Default)]
pub struct LoadedModels {
    pub schema: FeatureSchema,
    pub scaler: Option<Scaler>,
    pub historical: Option<Arc<dyn ProbabilityModel>>,
    pub sentiment: Option<Arc<dyn ProbabilityModel>>,
    pub meta_learner: Option<Arc<dyn ProbabilityModel>>,
}

impl LoadedModels {
    pub fn status(&self) -> ModelStatus {
        ModelStatus {
            historical: self.historical.is_some(),
            sentiment: self.sentiment.is_some(),
            hybrid: self.meta_learner.is_some(),
        }
    }
}

pub struct ModelLoader {
    model_dir: PathBuf,
    prepared_dir: PathBuf,
    models: LoadedModels,
}

impl ModelLoader {
    pub fn new(config: &ModelsConfig) -> Self {
        Self {
            model_dir: config.model_dir.clone(),
            prepared_dir: config.prepared_dir.clone(),
            models: LoadedModels::default(),
        }
    }

    /// Load every artifact independently.
    ///
    /// Returns true if at least one of the historical or sentiment stages
    /// loaded. Missing artifacts are expected; the ensemble degrades around
    /// them.
    pub fn load_all(&mut self) -> bool {
        let schema = load_json::<Vec<String>>(&self.prepared_dir.join(FEATURE_NAMES_FILE));
        self.models.schema = match report("feature schema", schema) {
            Some(names) => FeatureSchema::new(names),
            None => FeatureSchema::default(),
        };

        let width = self.models.schema.len();
        let scaler = load_json::<Scaler>(&self.prepared_dir.join(SCALER_FILE))
            .and_validate(|s| s.validate(width));
        self.models.scaler = report("scaler params", scaler);

        self.models.historical = report("historical model", self.load_historical());
        self.models.sentiment = report("sentiment model", self.load_sentiment());
        self.models.meta_learner = report("hybrid meta-learner", self.load_meta_learner());

        let status = self.models.status();
        info!("Models loaded: {:?}", status);
        status.historical || status.sentiment
    }

    /// Stage models must consume exactly the schema's columns. Without a
    /// schema no stage can be fed, so there is nothing to check against.
    fn fits_schema(&self, model_width: usize) -> Result<(), String> {
        let width = self.models.schema.len();
        if width != 0 && model_width != width {
            return Err(format!("model expects {} features, schema has {}", model_width, width));
        }
        Ok(())
    }

    fn load_historical(&self) -> LoadOutcome<Arc<dyn ProbabilityModel>> {
        let historical = load_json::<TreeEnsemble>(&self.model_dir.join(HISTORICAL_FILE))
            .and_validate(TreeEnsemble::validate)
            .and_validate(|m| self.fits_schema(m.num_features));
        match historical {
            LoadOutcome::Loaded(model) => LoadOutcome::Loaded(Arc::new(model)),
            LoadOutcome::Absent => LoadOutcome::Absent,
            LoadOutcome::Incompatible(reason) => LoadOutcome::Incompatible(reason),
        }
    }

    /// Network artifact first, logistic artifact as the fallback.
    fn load_sentiment(&self) -> LoadOutcome<Arc<dyn ProbabilityModel>> {
        let network = load_json::<DenseNetwork>(&self.model_dir.join(SENTIMENT_NETWORK_FILE))
            .and_validate(DenseNetwork::validate)
            .and_validate(|m| self.fits_schema(m.input_width()));
        let primary_failure = match network {
            LoadOutcome::Loaded(model) => return LoadOutcome::Loaded(Arc::new(model)),
            LoadOutcome::Absent => None,
            LoadOutcome::Incompatible(reason) => {
                warn!("Sentiment network unusable, trying logistic artifact: {}", reason);
                Some(reason)
            }
        };

        let logistic = load_json::<LogisticModel>(&self.model_dir.join(SENTIMENT_LOGISTIC_FILE))
            .and_validate(LogisticModel::validate)
            .and_validate(|m| self.fits_schema(m.coefficients.len()));
        match logistic {
            LoadOutcome::Loaded(model) => LoadOutcome::Loaded(Arc::new(model)),
            LoadOutcome::Absent => match primary_failure {
                Some(reason) => LoadOutcome::Incompatible(reason),
                None => LoadOutcome::Absent,
            },
            LoadOutcome::Incompatible(reason) => LoadOutcome::Incompatible(reason),
        }
    }

    fn load_meta_learner(&self) -> LoadOutcome<Arc<dyn ProbabilityModel>> {
        let meta = load_json::<LogisticModel>(&self.model_dir.join(META_LEARNER_FILE))
            .and_validate(|m| {
                if m.coefficients.len() != META_FEATURE_COUNT {
                    return Err(format!(
                        "meta-learner has {} coefficients, expected {}",
                        m.coefficients.len(), META_FEATURE_COUNT
                    ));
                }
                Ok(())
            });
        match meta {
            LoadOutcome::Loaded(model) => LoadOutcome::Loaded(Arc::new(model)),
            LoadOutcome::Absent => LoadOutcome::Absent,
            LoadOutcome::Incompatible(reason) => LoadOutcome::Incompatible(reason),
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.models.status()
    }

    pub fn models(&self) -> &LoadedModels {
        &self.models
    }

    pub fn into_models(self) -> LoadedModels {
        self.models
    }
}

fn report<T>(what: &str, outcome: LoadOutcome<T>) -> Option<T> {
    match outcome {
        LoadOutcome::Loaded(value) => {
            info!("Loaded {}", what);
            Some(value)
        }
        LoadOutcome::Absent => {
            warn!("No {} found, stage will degrade", what);
            None
        }
        LoadOutcome::Incompatible(reason) => {
            warn!("Could not load {}: {}", what, reason);
            None
        }
    }
}
