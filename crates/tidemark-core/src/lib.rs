pub mod category;
pub mod config;
pub mod error;
pub mod privacy;
pub mod types;

pub use category::Category;
pub use config::TidemarkConfig;
pub use error::{Result, TidemarkError};
pub use privacy::{PrivacyDecision, PrivacyFilter};
pub use types::*;
