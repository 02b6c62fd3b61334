pub mod balance;
pub mod circuit;
pub mod health;
pub mod registry;
pub mod resolve;
pub mod sync;

pub use mesh_core::{Error, Result};

pub use balance::StrategySet;
pub use circuit::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use health::{HealthCheckEngine, ProbeKind, ProbeSpec};
pub use registry::{EventFilter, MergeOutcome, ServiceRegistry, Subscription, Sweeper};
pub use resolve::{DnsResolver, ResolutionEngine};
pub use sync::{PeerClient, PeerSyncManager, SyncOutcome, PEER_SECRET_HEADER};
