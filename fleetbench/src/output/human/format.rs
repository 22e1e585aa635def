/// Renders a nanosecond response time with a unit that keeps it readable.
pub(crate) fn format_nanos(nanos: f64) -> String {
    const US: f64 = 1_000.0;
    const MS: f64 = 1_000_000.0;
    const S: f64 = 1_000_000_000.0;

    if !nanos.is_finite() {
        return "n/a".to_string();
    }
    if nanos >= S {
        return format!("{:.2}s", nanos / S);
    }
    if nanos >= MS {
        return format!("{:.2}ms", nanos / MS);
    }
    if nanos >= US {
        return format!("{:.2}µs", nanos / US);
    }
    format!("{nanos:.0}ns")
}

pub(crate) fn format_nanos_opt(nanos: Option<f64>) -> String {
    nanos.map_or_else(|| "n/a".to_string(), format_nanos)
}

pub(crate) fn format_rate(v: Option<f64>) -> String {
    match v {
        Some(v) if v.is_finite() => format!("{v:.0}/s"),
        _ => "n/a".to_string(),
    }
}
