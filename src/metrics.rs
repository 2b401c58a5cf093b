use std::{
    collections::BTreeMap,
    fmt::Write,
    sync::{Mutex, MutexGuard, OnceLock},
};

static METRICS: OnceLock<Mutex<MetricsState>> = OnceLock::new();

// 适配器调用时延分桶上界（毫秒），最后一档为 +Inf
const LATENCY_BUCKETS_MS: [u128; 5] = [50, 100, 250, 1000, 5000];

#[derive(Default)]
struct MetricsState {
    admissions: u64,
    rejections: BTreeMap<&'static str, u64>,
    transitions: BTreeMap<&'static str, u64>,
    adapter_ok: u64,
    adapter_err: u64,
    adapter_latency_sum_ms: u128,
    adapter_hist_buckets: [u64; 6],
    retries: u64,
    lease_skips: u64,
    leases_lost: u64,
    attestations_accepted: u64,
    attestations_rejected: u64,
    slashes: u64,
    reconcile_runs: u64,
}

fn state() -> MutexGuard<'static, MetricsState> {
    let lock = METRICS.get_or_init(|| Mutex::new(MetricsState::default()));
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(), // 避免因锁污染导致 panic
    }
}

pub fn inc_admitted() {
    state().admissions += 1;
}

pub fn inc_rejected(kind: &'static str) {
    *state().rejections.entry(kind).or_insert(0) += 1;
}

pub fn inc_transition(to: &'static str) {
    *state().transitions.entry(to).or_insert(0) += 1;
}

pub fn observe_adapter_call(latency_ms: u128, ok: bool) {
    let mut s = state();
    if ok {
        s.adapter_ok += 1;
    } else {
        s.adapter_err += 1;
    }
    s.adapter_latency_sum_ms = s.adapter_latency_sum_ms.saturating_add(latency_ms);
    let idx = LATENCY_BUCKETS_MS
        .iter()
        .position(|upper| latency_ms < *upper)
        .unwrap_or(LATENCY_BUCKETS_MS.len());
    s.adapter_hist_buckets[idx] += 1;
}

pub fn inc_retry() {
    state().retries += 1;
}

pub fn inc_lease_skip() {
    state().lease_skips += 1;
}

pub fn inc_lease_lost() {
    state().leases_lost += 1;
}

pub fn inc_attestation(accepted: bool) {
    let mut s = state();
    if accepted {
        s.attestations_accepted += 1;
    } else {
        s.attestations_rejected += 1;
    }
}

pub fn inc_slash() {
    state().slashes += 1;
}

pub fn inc_reconcile_run() {
    state().reconcile_runs += 1;
}

fn counter(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

pub fn render_prometheus() -> String {
    let s = state();
    let mut out = String::new();

    counter(&mut out, "ironbridge_admissions_total", "Transfers admitted", s.admissions);

    out.push_str("# HELP ironbridge_rejections_total Transfers rejected at admission\n");
    out.push_str("# TYPE ironbridge_rejections_total counter\n");
    for (kind, v) in &s.rejections {
        let _ = writeln!(out, "ironbridge_rejections_total{{kind=\"{kind}\"}} {v}");
    }

    out.push_str("# HELP ironbridge_transitions_total State transitions by target status\n");
    out.push_str("# TYPE ironbridge_transitions_total counter\n");
    for (to, v) in &s.transitions {
        let _ = writeln!(out, "ironbridge_transitions_total{{to=\"{to}\"}} {v}");
    }

    out.push_str("# HELP ironbridge_adapter_calls_total Chain adapter calls\n");
    out.push_str("# TYPE ironbridge_adapter_calls_total counter\n");
    let _ = writeln!(out, "ironbridge_adapter_calls_total{{result=\"ok\"}} {}", s.adapter_ok);
    let _ = writeln!(out, "ironbridge_adapter_calls_total{{result=\"err\"}} {}", s.adapter_err);

    out.push_str("# HELP ironbridge_adapter_latency_ms Chain adapter call latency\n");
    out.push_str("# TYPE ironbridge_adapter_latency_ms histogram\n");
    let mut cumulative = 0u64;
    for (i, upper) in LATENCY_BUCKETS_MS.iter().enumerate() {
        cumulative += s.adapter_hist_buckets[i];
        let _ = writeln!(out, "ironbridge_adapter_latency_ms_bucket{{le=\"{upper}\"}} {cumulative}");
    }
    cumulative += s.adapter_hist_buckets[LATENCY_BUCKETS_MS.len()];
    let _ = writeln!(out, "ironbridge_adapter_latency_ms_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(out, "ironbridge_adapter_latency_ms_sum {}", s.adapter_latency_sum_ms);
    let _ = writeln!(out, "ironbridge_adapter_latency_ms_count {cumulative}");

    counter(&mut out, "ironbridge_retries_total", "Transient failures retried", s.retries);
    counter(&mut out, "ironbridge_lease_skips_total", "Processing skipped on busy lease", s.lease_skips);
    counter(&mut out, "ironbridge_leases_lost_total", "Passes abandoned after losing the lease", s.leases_lost);

    out.push_str("# HELP ironbridge_attestations_total Attestation submissions\n");
    out.push_str("# TYPE ironbridge_attestations_total counter\n");
    let _ = writeln!(
        out,
        "ironbridge_attestations_total{{result=\"accepted\"}} {}",
        s.attestations_accepted
    );
    let _ = writeln!(
        out,
        "ironbridge_attestations_total{{result=\"rejected\"}} {}",
        s.attestations_rejected
    );

    counter(&mut out, "ironbridge_slashes_total", "Validator slashing events", s.slashes);
    counter(&mut out, "ironbridge_reconcile_runs_total", "Reconciliation sweeps", s.reconcile_runs);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_counters() {
        inc_admitted();
        inc_rejected("rate_limit");
        inc_transition("locking");
        observe_adapter_call(75, true);
        observe_adapter_call(9_000, false);

        let text = render_prometheus();
        assert!(text.contains("ironbridge_admissions_total"));
        assert!(text.contains("ironbridge_rejections_total{kind=\"rate_limit\"}"));
        assert!(text.contains("ironbridge_transitions_total{to=\"locking\"}"));
        assert!(text.contains("ironbridge_adapter_latency_ms_bucket{le=\"+Inf\"}"));
    }
}
