//! Метрики клиента в формате Prometheus (RED: Rate, Errors, Duration).

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::result_code_text;

/// Верхние границы корзин гистограммы длительности (в секундах). +Inf даётся отдельно как count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Гистограмма для одной операции: корзины + счётчик + сумма (в микросекундах).
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        // Non-cumulative storage: only the first bucket with secs <= le.
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

/// Operation labels with their own request/error/duration series.
const OPS: [&str; 10] = [
    "bind", "search", "add", "modify", "delete", "modify_dn", "compare", "extended", "abandon", "unbind",
];

#[derive(Debug, Default)]
struct OpStats {
    requests: AtomicU64,
    errors: AtomicU64,
    duration: DurationHistogram,
}

/// Счётчики метрик соединения (thread-safe, lock-free).
#[derive(Debug)]
pub struct Metrics {
    ops: [OpStats; 10],
    errors_other: AtomicU64,
    /// Frames handed to a waiting slot.
    pub responses_delivered: AtomicU64,
    /// Frames with no owner (unknown ID, notices, abandoned slots).
    pub frames_dropped: AtomicU64,
    pub slots_full: AtomicU64,
    /// Ошибки декодирования входящих сообщений (невалидный BER).
    pub decode_errors: AtomicU64,
    pub unexpected_responses: AtomicU64,
    pub timeouts: AtomicU64,
    pub network_shutdowns: AtomicU64,
    /// Result codes seen in decoded responses.
    result_codes: DashMap<u32, AtomicU64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            ops: Default::default(),
            errors_other: AtomicU64::new(0),
            responses_delivered: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            slots_full: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            unexpected_responses: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            network_shutdowns: AtomicU64::new(0),
            result_codes: DashMap::new(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn op(&self, op: &str) -> Option<&OpStats> {
        OPS.iter().position(|name| *name == op).map(|i| &self.ops[i])
    }

    /// Увеличивает счётчик отправленных запросов по типу операции.
    #[inline]
    pub fn inc_request(&self, op: &str) {
        if let Some(stats) = self.op(op) {
            stats.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn inc_error(&self, op: &str) {
        match self.op(op) {
            Some(stats) => stats.errors.fetch_add(1, Ordering::Relaxed),
            None => self.errors_other.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Учитывает длительность запроса (RED: Duration), успешного или нет.
    #[inline]
    pub fn observe_duration(&self, op: &str, duration: Duration) {
        if let Some(stats) = self.op(op) {
            stats.duration.observe(duration);
        }
    }

    #[inline]
    pub fn inc_result_code(&self, code: u32) {
        self.result_codes
            .entry(code)
            .or_insert_with(AtomicU64::default)
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self, op: &str) -> u64 {
        self.op(op).map_or(0, |s| s.requests.load(Ordering::Relaxed))
    }

    pub fn errors(&self, op: &str) -> u64 {
        self.op(op).map_or(0, |s| s.errors.load(Ordering::Relaxed))
    }

    pub fn result_code_count(&self, code: u32) -> u64 {
        self.result_codes
            .get(&code)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Рендер метрик в текстовом формате Prometheus (exposition format).
    pub fn render(&self) -> String {
        let mut out = String::new();

        for (name, help, counter) in [
            ("responses_delivered_total", "Responses delivered to a waiting request.", &self.responses_delivered),
            ("frames_dropped_total", "Inbound messages dropped (no owner, notice, abandoned).", &self.frames_dropped),
            ("slots_full_total", "Responses dropped because the slot held an unconsumed response.", &self.slots_full),
            ("decode_errors_total", "Inbound messages that failed BER/LDAP decoding.", &self.decode_errors),
            ("unexpected_responses_total", "Responses whose tag did not match the request.", &self.unexpected_responses),
            ("timeouts_total", "Requests cancelled by their deadline.", &self.timeouts),
            ("network_shutdowns_total", "Connection shutdowns after a network error or EOF.", &self.network_shutdowns),
        ] {
            out.push_str(&format!("# HELP ldap_client_{} {}\n", name, help));
            out.push_str(&format!("# TYPE ldap_client_{} counter\n", name));
            out.push_str(&format!("ldap_client_{} {}\n", name, counter.load(Ordering::Relaxed)));
        }

        out.push_str("# HELP ldap_client_requests_total LDAP requests sent by operation.\n");
        out.push_str("# TYPE ldap_client_requests_total counter\n");
        for (op, stats) in OPS.iter().zip(&self.ops) {
            out.push_str(&format!(
                "ldap_client_requests_total{{op=\"{}\"}} {}\n",
                op,
                stats.requests.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_client_errors_total Failed requests by operation.\n");
        out.push_str("# TYPE ldap_client_errors_total counter\n");
        for (op, stats) in OPS.iter().zip(&self.ops) {
            out.push_str(&format!(
                "ldap_client_errors_total{{op=\"{}\"}} {}\n",
                op,
                stats.errors.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "ldap_client_errors_total{{op=\"other\"}} {}\n",
            self.errors_other.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_client_result_codes_total Result codes received from the server.\n");
        out.push_str("# TYPE ldap_client_result_codes_total counter\n");
        let mut codes: Vec<(u32, u64)> = self
            .result_codes
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect();
        codes.sort_unstable();
        for (code, count) in codes {
            out.push_str(&format!(
                "ldap_client_result_codes_total{{code=\"{}\",text=\"{}\"}} {}\n",
                code,
                result_code_text(code),
                count
            ));
        }

        // RED: Duration, гистограмма длительности запросов по операциям
        out.push_str("# HELP ldap_client_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE ldap_client_request_duration_seconds histogram\n");
        for (op, stats) in OPS.iter().zip(&self.ops) {
            let hist = &stats.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_client_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_client_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_client_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_client_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::Metrics;
    use std::time::Duration;

    #[test]
    fn test_request_and_error_counters() {
        let m = Metrics::default();
        m.inc_request("delete");
        m.inc_request("delete");
        m.inc_request("nonsense");
        m.inc_error("delete");
        m.inc_error("nonsense");
        assert_eq!(m.requests("delete"), 2);
        assert_eq!(m.errors("delete"), 1);
        let out = m.render();
        assert!(out.contains("ldap_client_requests_total{op=\"delete\"} 2"));
        assert!(out.contains("ldap_client_errors_total{op=\"other\"} 1"));
    }

    #[test]
    fn test_result_codes_metric() {
        let m = Metrics::default();
        m.inc_result_code(0);
        m.inc_result_code(32);
        m.inc_result_code(32);
        assert_eq!(m.result_code_count(32), 2);
        let out = m.render();
        assert!(out.contains("ldap_client_result_codes_total{code=\"32\",text=\"No Such Object\"} 2"));
        let success = out.find("code=\"0\"").unwrap();
        let missing = out.find("code=\"32\"").unwrap();
        assert!(success < missing);
    }

    #[test]
    fn test_duration_histogram_is_cumulative() {
        let m = Metrics::default();
        m.observe_duration("search", Duration::from_millis(3));
        m.observe_duration("search", Duration::from_millis(40));
        m.observe_duration("search", Duration::from_secs(30));
        let out = m.render();
        assert!(out.contains("ldap_client_request_duration_seconds_bucket{op=\"search\",le=\"0.005\"} 1"));
        assert!(out.contains("ldap_client_request_duration_seconds_bucket{op=\"search\",le=\"0.05\"} 2"));
        assert!(out.contains("ldap_client_request_duration_seconds_bucket{op=\"search\",le=\"10\"} 2"));
        assert!(out.contains("ldap_client_request_duration_seconds_bucket{op=\"search\",le=\"+Inf\"} 3"));
        assert!(out.contains("ldap_client_request_duration_seconds_count{op=\"search\"} 3"));
    }

    #[test]
    fn test_connection_counters_rendered() {
        let m = Metrics::default();
        Metrics::inc(&m.frames_dropped);
        Metrics::inc(&m.network_shutdowns);
        let out = m.render();
        assert!(out.contains("ldap_client_frames_dropped_total 1"));
        assert!(out.contains("ldap_client_network_shutdowns_total 1"));
        assert!(out.contains("ldap_client_timeouts_total 0"));
    }
}
