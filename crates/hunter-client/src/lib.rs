//! Retrieval and admission of hunting tasks.

pub mod config;
pub mod fetcher;
pub mod notify;
pub mod pipeline;
pub mod resolver;
pub mod sink;

pub use config::*;
pub use fetcher::{FetchError, HttpTaskSource, TaskSource};
pub use notify::{Notifier, TracingNotifier};
pub use pipeline::{Collaborators, CycleSettings, CycleSummary, HuntingCycle, TaskDecision};
pub use resolver::{AddressResolver, CachingResolver, HttpAddressResolver, ResolveError};
pub use sink::{ChannelSink, ExecutionSink, Handoff};
