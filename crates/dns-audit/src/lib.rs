#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Don't care enough to fix
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

pub mod audit;
pub mod cache;
pub mod checks;
pub mod jobs;
pub mod metrics;
pub mod nameserver;
pub mod query;
pub mod util;

pub use self::audit::{AuditConfig, AuditError, Auditor, DomainTask, ZoneError};
pub use self::checks::Finding;
pub use self::jobs::Jobs;
pub use self::nameserver::NetworkClient;
pub use self::query::{NameserverClient, QueryOptions};
