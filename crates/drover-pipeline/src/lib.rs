//! Ticket orchestration core.
//!
//! A polling [`Scheduler`] discovers entry-flagged tickets and pushes each
//! one through exactly one [`Pipeline`] stage per cycle. Stage state lives
//! entirely in tracker markers; this crate holds the transition table, the
//! stage handlers, retry accounting, and the process-wide rate-limit guard.

pub mod events;
pub mod guard;
pub mod handlers;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod rules;
pub mod scheduler;
pub mod transition;
pub mod workspace;

pub use events::{DroverEvent, EventEmitter};
pub use guard::RateLimitGuard;
pub use handlers::{HandlerRegistry, StageContext, StageHandler};
pub use pipeline::Pipeline;
pub use retry::RetryLedger;
pub use rules::{load_rules, ResolvedRules};
pub use scheduler::{step_ticket, Scheduler};
pub use transition::{rule, Budget, OnSuccess, StageRule};
