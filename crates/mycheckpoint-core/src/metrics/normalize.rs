/// Status variables that are noise for trending and are never stored.
pub fn is_neglectable_variable(name: &str) -> bool {
    name.starts_with("ssl_") || name.starts_with("ndb_") || name == "last_query_cost"
}

/// Converts a raw server value into a stored integer.
///
/// `off`/`no` → 0, `on`/`yes` → 1, `demand` → 2. Decimal values are
/// truncated toward zero. Anything else (empty, paths, names) is `None`.
pub fn normalize_value(raw: &str) -> Option<i64> {
    let v = raw.trim();
    match v.to_ascii_lowercase().as_str() {
        "" => None,
        "off" | "no" => Some(0),
        "on" | "yes" => Some(1),
        "demand" => Some(2),
        s => s
            .parse::<i64>()
            .ok()
            .or_else(|| s.parse::<u64>().ok().map(|n| n.min(i64::MAX as u64) as i64))
            .or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            }),
    }
}
