pub mod car_charger;
pub mod hvac;
pub mod pool_pump;
pub mod water_heater;

pub use car_charger::*;
pub use hvac::*;
pub use pool_pump::*;
pub use water_heater::*;
