//! Column naming used by expressions.
//!
//! A bare name reads the column value; `<name>_diff` reads the interval
//! delta, `<name>_psec` the per-second rate, and `ts_diff_seconds` the
//! interval length.

/// Reference parsed from an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRef<'a> {
    Elapsed,
    Value(&'a str),
    Delta(&'a str),
    Rate(&'a str),
}

impl<'a> ColumnRef<'a> {
    pub fn parse(name: &'a str) -> Self {
        if name == "ts_diff_seconds" {
            ColumnRef::Elapsed
        } else if let Some(column) = name.strip_suffix("_diff") {
            ColumnRef::Delta(column)
        } else if let Some(column) = name.strip_suffix("_psec") {
            ColumnRef::Rate(column)
        } else {
            ColumnRef::Value(name)
        }
    }
}

/// Anything expressions can be evaluated against.
pub trait ColumnLookup {
    /// `None` when the name does not resolve to any column; `Some(None)`
    /// when the column exists but has no value.
    fn lookup(&self, name: &str) -> Option<Option<f64>>;
}

impl<T: ColumnLookup + ?Sized> ColumnLookup for &T {
    fn lookup(&self, name: &str) -> Option<Option<f64>> {
        (**self).lookup(name)
    }
}
