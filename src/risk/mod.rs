pub mod breaker;
pub mod sizer;
pub mod throttle;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitBreakerState};
pub use sizer::{position_notional, SizerConfig};
pub use throttle::{RiskThrottle, ThrottleSeverity, ThrottleState};
