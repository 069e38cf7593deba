//! Rule evaluation engine: scheduling, per-tick evaluation, alert state and
//! the PUSH hook.

pub mod evaluator;
pub mod expr;
mod health;
pub mod point;
pub mod push;
pub mod reduce;
pub mod scheduler;
pub mod state;

pub use evaluator::{EvalError, EvalOutcome, Evaluator};
pub use expr::{Expr, ExprError};
pub use health::{HealthRegistry, RuleHealth};
pub use point::{MetricPoint, PointError};
pub use push::{PushHook, PushOutcome};
pub use reduce::ReduceFn;
pub use scheduler::{ReconcileReport, Scheduler};
pub use state::{AlertStateStore, AlertStatus};
