pub mod error;
pub mod permit;
pub mod throttle;

pub use error::ThrottleError;
pub use permit::PermitDecision;
pub use throttle::{ProviderThrottle, SuspensionListener};
