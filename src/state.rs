use std::sync::Arc;
use crate::generator::ImageGenerator;
use crate::rate_limit::AdmissionController;
use crate::retention::RetentionService;
use crate::storage::ArtifactStore;
// app's shared state, built once at startup

pub struct AppState {
    pub admission: Arc<AdmissionController>,
    pub store: Arc<ArtifactStore>,
    pub retention: Arc<RetentionService>,
    pub generator: Arc<dyn ImageGenerator>,
}
