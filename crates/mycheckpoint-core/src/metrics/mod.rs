//! Column catalogue: which names are gauges, which are counters, and how raw
//! server values are turned into integers.

mod classify;
mod lookup;
mod normalize;
mod variables;

pub use classify::{Classification, ColumnKind};
pub use lookup::{ColumnLookup, ColumnRef};
pub use normalize::{is_neglectable_variable, normalize_value};
pub use variables::{
    MONITORED_GLOBAL_VARIABLES, OS_COUNTER_COLUMNS, OS_GAUGE_COLUMNS, REPLICATION_COLUMNS,
    SIGNED_STATUS_VARIABLES,
};
