//! Application Layer - Use cases wiring domain types to ports
//!
//! - `registry`: Agent registry, catch-up reconciliation and unresolved retries
//! - `subscriptions`: Per-token activity subscriptions and the global feeds
//! - `dispatch`: Ordered per-token job workers
//! - `lifecycle`: Buy, monitor and sell state machine
//! - `engine`: Event loop tying the pieces together

pub mod dispatch;
pub mod engine;
pub mod lifecycle;
pub mod registry;
pub mod subscriptions;

pub use dispatch::{TokenDispatcher, TokenJob, TokenJobHandler, DEFAULT_WORKER_IDLE_SECS};
pub use engine::{AgentEngine, EngineBuilder, EngineError, EngineSettings, ShutdownHandle};
pub use lifecycle::{EntryRejection, LaunchOutcome, SampleOutcome, TradeLifecycle};
pub use registry::{AgentRegistry, ReconcileReport, RedriveReport, RegistryCounts};
pub use subscriptions::{SubscriptionError, SubscriptionManager};
