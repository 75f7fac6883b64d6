//! Threshold alerts over the latest sample.
//!
//! Conditions are expressions (`expr`) loaded from the alert config
//! (`condition`). Each tick advances a per-condition episode (`state`) and
//! yields the notices to deliver (`evaluator`).

pub mod condition;
pub mod evaluator;
pub mod expr;
pub mod state;

pub use condition::{AlertCondition, Severity};
pub use evaluator::{Notice, NoticeKind, Tick, evaluate_tick, mark_notified};
pub use expr::{ExprError, Expression};
pub use state::{AlertFiring, AlertStore, AlertStoreError, PendingAlert};
