//! Rate limiting logic and state management.

mod clock;
mod counter;
mod distributed;
mod identity;
mod limiter;
mod policy;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterKey, WindowCounter, WindowState};
pub use distributed::{MeshWindowStore, DEFAULT_STORE_TIMEOUT};
pub use identity::{resolve_identity, Identity, RequestMeta, FORWARDED_FOR, UNKNOWN_IDENTITY};
pub use limiter::{Decision, QuotaInfo, RateLimiter};
pub use policy::{FailureMode, Policy, PolicyName, PolicyRegistry, PolicyRule, PolicyTable, UnknownPolicy};
pub use store::{spawn_sweeper, MemoryWindowStore, StoreError, WindowStore};
