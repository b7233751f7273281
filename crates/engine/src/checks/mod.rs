//! The pipeline's built-in checks, one per [`CheckKind`](blockgate_common::CheckKind).

mod external;
mod inspect;
mod lists;
mod rate;

pub use external::{AnomalyCheck, ThreatIntelCheck};
pub use inspect::{GeoCheck, RuleCheck, SignatureCheck};
pub use lists::{ActiveBlockCheck, BlacklistCheck, WhitelistCheck};
pub use rate::RateLimitCheck;
