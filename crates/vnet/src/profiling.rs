//! Lightweight layer/functional scopes.
//!
//! Every scope enters a `tracing` span so forward passes show up nested in any subscriber. When
//! `VNET_PROFILE` is set, scopes additionally accumulate call counts and inclusive wall time into
//! a process-wide table that [`take_report`] drains.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::span::EnteredSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKind {
    Layer,
    Functional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ProfilerKey {
    kind: ScopeKind,
    name: &'static str,
    implementation: &'static str,
}

/// Aggregated timings for one scope key.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeStat {
    pub kind: ScopeKind,
    pub name: &'static str,
    pub implementation: &'static str,
    pub calls: u64,
    pub total: Duration,
}

fn table() -> &'static Mutex<HashMap<ProfilerKey, (u64, Duration)>> {
    static TABLE: OnceLock<Mutex<HashMap<ProfilerKey, (u64, Duration)>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// RAII guard returned by the scope constructors.
pub struct ScopeGuard {
    _span: EnteredSpan,
    timing: Option<(ProfilerKey, Instant)>,
}

impl ScopeGuard {
    fn new(key: ProfilerKey) -> Self {
        let span = match key.kind {
            ScopeKind::Layer => tracing::debug_span!("layer", name = key.name),
            ScopeKind::Functional => tracing::trace_span!(
                "functional",
                op = key.name,
                implementation = key.implementation
            ),
        };
        let timing = crate::env::profile_enabled().then(|| (key, Instant::now()));
        ScopeGuard {
            _span: span.entered(),
            timing,
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some((key, start)) = self.timing.take() {
            let elapsed = start.elapsed();
            if let Ok(mut table) = table().lock() {
                let entry = table.entry(key).or_insert((0, Duration::ZERO));
                entry.0 += 1;
                entry.1 += elapsed;
            }
        }
    }
}

#[inline]
pub fn layer_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey {
        kind: ScopeKind::Layer,
        name,
        implementation: "",
    })
}

#[inline]
pub fn functional_scope(op: &'static str, implementation: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey {
        kind: ScopeKind::Functional,
        name: op,
        implementation,
    })
}

/// Drains the accumulated statistics, sorted by descending total time.
pub fn take_report() -> Vec<ScopeStat> {
    let drained: Vec<_> = match table().lock() {
        Ok(mut table) => table.drain().collect(),
        Err(_) => Vec::new(),
    };
    let mut stats: Vec<ScopeStat> = drained
        .into_iter()
        .map(|(key, (calls, total))| ScopeStat {
            kind: key.kind,
            name: key.name,
            implementation: key.implementation,
            calls,
            total,
        })
        .collect();
    stats.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(b.name)));
    stats
}

/// Renders a report as an aligned text table.
pub fn format_report(stats: &[ScopeStat]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:<40} {:>8} {:>12}",
        "kind", "scope", "calls", "total_ms"
    );
    for stat in stats {
        let kind = match stat.kind {
            ScopeKind::Layer => "layer",
            ScopeKind::Functional => "functional",
        };
        let label = if stat.implementation.is_empty() {
            stat.name.to_string()
        } else {
            format!("{}[{}]", stat.name, stat.implementation)
        };
        let _ = writeln!(
            out,
            "{:<10} {:<40} {:>8} {:>12.3}",
            kind,
            label,
            stat.calls,
            stat.total.as_secs_f64() * 1e3
        );
    }
    out
}
