//! Posterior summary statistics.
//!
//! Summaries are computed from kept draws only (burn-in already removed).
//! Quantiles use linear interpolation between order statistics; the Monte
//! Carlo error is the batch-means estimate with `floor(sqrt(n))` batches.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Posterior summary of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub mean: f64,
    pub sd: f64,
    pub q2_5: f64,
    pub q25: f64,
    pub q50: f64,
    pub q75: f64,
    pub q97_5: f64,
    /// Undefined with fewer than two batches.
    pub mc_err: Option<f64>,
}

/// Summary of a named node, in model order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStat {
    pub id: String,
    /// Undecorated parameter name used for grouping.
    pub param: String,
    pub summary: NodeSummary,
}

/// Quantile `q` in [0, 1] of already sorted values.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

fn mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len() as f64
}

/// Sample standard deviation (n − 1 denominator); 0 for a single value.
fn sample_sd(x: &[f64]) -> f64 {
    if x.len() < 2 {
        return 0.0;
    }
    let m = mean(x);
    (x.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (x.len() - 1) as f64).sqrt()
}

/// Batch-means Monte Carlo standard error.
pub fn batch_means_error(draws: &[f64]) -> Option<f64> {
    let batches = (draws.len() as f64).sqrt().floor() as usize;
    if batches < 2 {
        return None;
    }
    let size = draws.len() / batches;
    let means: Vec<f64> = draws
        .chunks_exact(size)
        .take(batches)
        .map(mean)
        .collect();
    Some(sample_sd(&means) / (batches as f64).sqrt())
}

/// Summarize a chain of draws; `None` for an empty chain.
pub fn summarize(draws: &[f64]) -> Option<NodeSummary> {
    if draws.is_empty() {
        return None;
    }
    let mut sorted = draws.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(NodeSummary {
        mean: mean(draws),
        sd: sample_sd(draws),
        q2_5: quantile_sorted(&sorted, 0.025),
        q25: quantile_sorted(&sorted, 0.25),
        q50: quantile_sorted(&sorted, 0.5),
        q75: quantile_sorted(&sorted, 0.75),
        q97_5: quantile_sorted(&sorted, 0.975),
        mc_err: batch_means_error(draws),
    })
}

/// Deviance information criterion: mean deviance plus the effective number
/// of parameters `pD = mean deviance − deviance at the posterior mean`.
pub fn dic(deviances: &[f64], deviance_at_mean: f64) -> f64 {
    let dbar = mean(deviances);
    dbar + (dbar - deviance_at_mean)
}

/// Render node statistics as a table, with a blank line between parameter
/// groups.
pub fn format_group_stats(stats: &[NodeStat]) -> String {
    let width = stats.iter().map(|s| s.id.len()).max().unwrap_or(4).max(4);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<width$} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}",
        "name", "mean", "std", "2.5q", "25q", "50q", "75q", "97.5q", "mc_err"
    );
    let mut last: Option<&str> = None;
    for stat in stats {
        if last.is_some_and(|p| p != stat.param) {
            out.push('\n');
        }
        last = Some(stat.param.as_str());
        let s = &stat.summary;
        let mc = s.mc_err.map_or_else(|| "-".to_string(), |e| format!("{e:.5}"));
        let _ = writeln!(
            out,
            "{:<width$} {:>9.5} {:>9.5} {:>9.5} {:>9.5} {:>9.5} {:>9.5} {:>9.5} {:>9}",
            stat.id, s.mean, s.sd, s.q2_5, s.q25, s.q50, s.q75, s.q97_5, mc
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantiles_interpolate() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile_sorted(&v, 0.5), 3.0);
        assert_eq!(quantile_sorted(&v, 0.25), 2.0);
        assert!((quantile_sorted(&v, 0.975) - 4.9).abs() < 1e-12);
        assert_eq!(quantile_sorted(&[7.0], 0.1), 7.0);
        assert!(quantile_sorted(&[], 0.5).is_nan());
    }

    #[test]
    fn test_summarize_basic() {
        let draws: Vec<f64> = (1..=100).map(f64::from).collect();
        let s = summarize(&draws).unwrap();
        assert!((s.mean - 50.5).abs() < 1e-12);
        assert!((s.q50 - 50.5).abs() < 1e-12);
        assert!(s.q2_5 < s.q25 && s.q25 < s.q75 && s.q75 < s.q97_5);
        assert!(s.mc_err.unwrap() > 0.0);
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn test_batch_means_constant_chain() {
        assert_eq!(batch_means_error(&[2.0; 64]), Some(0.0));
        assert_eq!(batch_means_error(&[1.0, 2.0, 3.0]), None);
    }

    #[test]
    fn test_dic() {
        // Dbar = 10, Dhat = 8 → pD = 2 → DIC = 12.
        assert_eq!(dic(&[9.0, 11.0], 8.0), 12.0);
    }

    #[test]
    fn test_format_groups_params() {
        let s = summarize(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let stat = |id: &str, param: &str| NodeStat {
            id: id.into(),
            param: param.into(),
            summary: s.clone(),
        };
        let text = format_group_stats(&[stat("a", "a"), stat("a_tau", "a"), stat("v", "v")]);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("name"));
        assert_eq!(lines.len(), 5);
        assert!(lines[3].is_empty());
        assert!(lines[4].starts_with("v "));
    }

    #[test]
    fn test_summary_json_with_missing_error() {
        let s = summarize(&[1.0, 2.0]).unwrap();
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"mc_err\":null"));
        let back: NodeSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
