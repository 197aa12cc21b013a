pub mod claim_contracts;
pub mod clock;
pub mod config;
pub mod ids;

pub use claim_contracts::{ClaimRenewal, ClaimRequest, ClaimView, MessageView, NewMessage};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClaimConfig, ConfigError, JournalMode};
pub use ids::{HexMaskCodec, IdCodec, MalformedId};

/// Project namespace used when a caller supplies none.
pub const DEFAULT_PROJECT: &str = "";

pub fn project_or_default(project: Option<&str>) -> &str {
    project.unwrap_or(DEFAULT_PROJECT)
}
