//! Throttling rules, window counters and the decision engine.

mod clock;
mod counter;
mod distributed;
mod limiter;
mod registry;
mod request;
mod resolver;
mod rules;
mod store;

pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{seconds_until_reset, window_index, WindowCounter, WindowKey};
pub use distributed::MeshStore;
pub use limiter::{Decision, FailurePolicy, Throttler, Verdict};
pub use registry::{RuleSet, RuleSetBuilder, ThrottleRule};
pub use request::RequestDescriptor;
pub use resolver::{Discriminator, Resolver};
pub use rules::{DiscriminatorConfig, RuleConfig, RulesConfig, ValueConfig};
pub use store::{CounterStore, MemoryStore, StoreError};
