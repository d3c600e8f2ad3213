pub mod fleet;
pub mod readiness;

pub use fleet::DeviceFleet;
pub use readiness::{Readiness, ReadinessState};
