use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time view of one backend for the operator dashboard.
#[derive(Clone, Debug, Serialize)]
pub struct ServerStat {
    pub name: String,
    pub url: String,
    #[serde(serialize_with = "duration_ms")]
    pub avg: Duration,
    pub degraded: bool,
    pub initialized: bool,
    pub requests: u64,
    pub error_rate: f64,
    pub probe_ok: Option<bool>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl ServerStat {
    /// Ranking for operator display: initialized first, then non-degraded,
    /// then lower error rate, then lower average latency. Equal entries keep
    /// their insertion order under a stable sort.
    pub fn rank(&self, other: &Self) -> Ordering {
        other
            .initialized
            .cmp(&self.initialized)
            .then(self.degraded.cmp(&other.degraded))
            .then(self.error_rate.total_cmp(&other.error_rate))
            .then(self.avg.cmp(&other.avg))
    }
}

fn duration_ms<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(d.as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(name: &str, avg: Duration, degraded: bool, initialized: bool) -> ServerStat {
        ServerStat {
            name: name.to_string(),
            url: format!("http://{name}.local"),
            avg,
            degraded,
            initialized,
            requests: 0,
            error_rate: 0.0,
            probe_ok: None,
            last_health_check: None,
        }
    }

    fn names(stats: &[ServerStat]) -> Vec<&str> {
        stats.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn ranks_initialized_healthy_fast_servers_first() {
        let mut stats = vec![
            stat("1", Duration::from_secs(1), false, true),
            stat("2", Duration::from_secs(1), true, true),
            stat("3", Duration::ZERO, false, false),
            stat("4", Duration::from_millis(10), false, true),
            stat("5", Duration::ZERO, true, true),
        ];
        stats.sort_by(|a, b| a.rank(b));
        assert_eq!(names(&stats), vec!["4", "1", "5", "2", "3"]);
    }

    #[test]
    fn lower_error_rate_wins_over_latency() {
        let mut clean = stat("clean", Duration::from_secs(2), false, true);
        clean.error_rate = 0.0;
        let mut flaky = stat("flaky", Duration::from_millis(1), false, true);
        flaky.error_rate = 50.0;
        let mut stats = vec![flaky, clean];
        stats.sort_by(|a, b| a.rank(b));
        assert_eq!(names(&stats), vec!["clean", "flaky"]);
    }

    #[test]
    fn ordering_is_stable_across_repeated_sorts() {
        let mut stats = vec![
            stat("a", Duration::from_secs(1), false, true),
            stat("b", Duration::from_secs(1), false, true),
            stat("c", Duration::from_secs(1), false, true),
        ];
        stats.sort_by(|a, b| a.rank(b));
        assert_eq!(names(&stats), vec!["a", "b", "c"]);
        stats.sort_by(|a, b| a.rank(b));
        assert_eq!(names(&stats), vec!["a", "b", "c"]);
    }
}
