pub mod model;
pub mod predictor;

pub use model::*;
pub use predictor::*;
