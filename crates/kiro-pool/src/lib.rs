pub mod breaker;
pub mod select;
pub mod stats;

pub use breaker::{CircuitBreaker, CircuitState};
pub use select::{LoadRow, SelectedAccount, Selector};
pub use stats::ErrorStats;
