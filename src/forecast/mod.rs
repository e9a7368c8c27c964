//! Forecast refresh: the trigger policy, series preparation, and the
//! adapter over the external forecasting service.

pub mod prepare;
pub mod service;
pub mod trigger;

pub use service::{ForecastService, HttpForecastService};
pub use trigger::ForecastTrigger;
