pub mod error;
pub mod v1;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::pv::PvPredictor;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub predictor: Arc<PvPredictor>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .nest("/api/v1", v1::router(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
