pub mod car;
pub mod pool;
pub mod power;
pub mod weather;

pub use car::*;
pub use pool::*;
pub use power::*;
pub use weather::*;
