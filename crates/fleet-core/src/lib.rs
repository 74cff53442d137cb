pub mod config;
pub mod filter;

pub use config::FleetConfig;
pub use filter::{FilterError, FilterField, Filterable, TargetFilter, like_matches};
