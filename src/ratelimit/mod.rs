//! Rate limiting logic and state management.

mod decision;
mod distributed;
mod facade;
mod gate;
mod local;
mod policy;
mod resolver;
mod rules;
mod subject;
mod window;

pub use decision::{LimiterBackend, RateLimitDecision, RejectionReason, Scope};
pub use distributed::{DistributedRateLimiter, DEFAULT_STORE_TIMEOUT};
pub use facade::{HealthState, HealthStatus, RateLimiter};
pub use gate::{GateOutcome, SubjectState, Verdict, WindowObservation, TOKEN_EPSILON};
pub use local::{LocalRateLimiter, DEFAULT_MAX_SUBJECTS};
pub use policy::RateLimitPolicy;
pub use resolver::{PolicyResolver, PolicyWatcher};
pub use rules::{PolicyFile, PolicyRule, PolicySet, ServiceRule};
pub use subject::{PrincipalTier, RateLimitSubject, SubjectInput};
pub use window::{Window, WindowLimit};
