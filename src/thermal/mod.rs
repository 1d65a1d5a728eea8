pub mod home;
pub mod hvac;

pub use home::*;
pub use hvac::*;
