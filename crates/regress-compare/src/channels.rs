//! Comparison of channel reports: JSON documents with a `Channels` map of
//! named time series and a `Header` describing timestep count and shape.

use crate::{CompareOptions, ComparisonResult, Method, MismatchLog, Outcome};
use regress_core::{canonical_json_digest, load_json_file};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::warn;

/// Layout of each channel's `Data`, declared by the reference header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelShape {
    /// `Data` is an array of per-bin time series.
    Binned,
    /// `Data` is a single time series.
    Flat,
}

impl ChannelShape {
    /// Only a header can declare the shape: `Subchannel_Metadata` marks a
    /// binned report, an InsetChart type or a `Timesteps` count a flat one.
    pub fn detect(report: &Value) -> Option<Self> {
        let header = report.get("Header")?;
        if header.get("Subchannel_Metadata").is_some() {
            return Some(ChannelShape::Binned);
        }
        let inset = header.get("Report_Type").and_then(|v| v.as_str()) == Some("InsetChart");
        if inset || header.get("Timesteps").is_some() {
            return Some(ChannelShape::Flat);
        }
        None
    }
}

pub(crate) fn compare_channels(
    reference: &Path,
    candidate: &Path,
    opts: &CompareOptions,
    method: Method,
) -> ComparisonResult {
    let (ref_json, cand_json) = match (load_json_file(reference), load_json_file(candidate)) {
        (Ok(r), Ok(c)) => (r, c),
        (Err(e), _) | (_, Err(e)) => {
            return ComparisonResult::new(Outcome::Error, method, candidate)
                .with_detail(format!("Failed to parse JSON output: {}", e));
        }
    };

    let Some(ref_channels) = ref_json.get("Channels").and_then(|v| v.as_object()) else {
        return ComparisonResult::new(Outcome::Fail, method, candidate)
            .with_detail("Non-Channel JSON failed hash check.");
    };
    let Some(cand_channels) = cand_json.get("Channels").and_then(|v| v.as_object()) else {
        return ComparisonResult::new(Outcome::Fail, method, candidate)
            .with_detail("Reference has Channel data and Test file does not.");
    };

    let mut res = ComparisonResult::new(Outcome::Pass, method, candidate);
    if canonical_json_digest(&ref_json["Channels"]) == canonical_json_digest(&cand_json["Channels"])
    {
        return res;
    }

    let report_name = candidate
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ref_names: BTreeSet<&str> = ref_channels.keys().map(String::as_str).collect();
    let cand_names: BTreeSet<&str> = cand_channels.keys().map(String::as_str).collect();
    let missing: Vec<&str> = ref_names.difference(&cand_names).copied().collect();
    let new: Vec<&str> = cand_names.difference(&ref_names).copied().collect();

    let mut failed = false;
    let mut detail = String::new();

    if !missing.is_empty() {
        failed = true;
        detail.push_str(&format!("Missing channels:\n{}\n", missing.join("\n")));
    }

    if !new.is_empty() {
        let msg = format!(
            "{} has {} channels not found in the reference ({}). Please update your reference {}.",
            report_name,
            new.len(),
            new.join(", "),
            report_name
        );
        warn!("{}", msg);
        res.warnings.push(msg);
        if opts.new_channels_fail {
            failed = true;
            detail.push_str(&format!(
                "New channels not found in reference:\n{}\n",
                new.join("\n")
            ));
        }
    }

    let ref_steps = header_timesteps(&ref_json);
    let cand_steps = header_timesteps(&cand_json);
    if let (Some(r), Some(c)) = (ref_steps, cand_steps) {
        if r != c {
            let msg = format!(
                "test {} has timesteps {} DIFFERING from ref {} timesteps {}!",
                report_name, c, report_name, r
            );
            if opts.automated {
                failed = true;
                detail.push_str(&msg);
                detail.push('\n');
            } else {
                warn!("{}", msg);
                res.warnings.push(msg);
            }
        }
    }

    let mut log = MismatchLog::new(opts.mismatch_cap);
    let mut compared = 0usize;
    if !failed {
        let common: Vec<&str> = ref_names.intersection(&cand_names).copied().collect();
        let steps = match (ref_steps, cand_steps) {
            (Some(r), Some(c)) => Some(r.min(c)),
            _ => None,
        };
        let outcome = match ChannelShape::detect(&ref_json) {
            Some(ChannelShape::Binned) => {
                compare_binned(&ref_json, &cand_json, &common, steps, &mut log)
            }
            Some(ChannelShape::Flat) => {
                compare_flat(&ref_json, &cand_json, &common, steps, &mut log)
            }
            None => Err(format!(
                "{} - Files are different but cannot do deep dive.",
                report_name
            )),
        };
        match outcome {
            Ok(n) => compared = n,
            Err(msg) => {
                failed = true;
                detail.push_str(&msg);
                detail.push('\n');
            }
        }
    }

    // The digests differ, so a walk that saw nothing cannot vouch for the file.
    if !failed && log.is_empty() && compared == 0 {
        failed = true;
        detail.push_str(&format!(
            "{} - Channels differ but no values could be compared.\n",
            report_name
        ));
    }

    if !log.is_empty() {
        failed = true;
        detail.push_str(&format!(
            "{} value mismatches (Channel [Bin] Timestep Reference_Value Test_Value)",
            log.total()
        ));
    }

    let (lines, skipped) = log.into_parts();
    res.mismatches = lines;
    res.skipped_mismatches = skipped;
    res.detail = detail.trim_end().to_string();
    if failed {
        res.outcome = Outcome::Fail;
    }
    res
}

fn header_timesteps(report: &Value) -> Option<u64> {
    report.get("Header")?.get("Timesteps")?.as_u64()
}

fn channel_data<'a>(report: &'a Value, name: &str) -> Option<&'a Vec<Value>> {
    report.get("Channels")?.get(name)?.get("Data")?.as_array()
}

fn num_bins(report: &Value) -> Option<u64> {
    report
        .get("Header")?
        .get("Subchannel_Metadata")?
        .get("NumBinsPerAxis")?
        .get(0)?
        .get(0)?
        .as_u64()
}

/// Numeric values compare by magnitude so `1` and `1.0` agree.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn render(v: Option<&Value>) -> String {
    v.map(|v| v.to_string())
        .unwrap_or_else(|| "<missing>".to_string())
}

fn compare_flat(
    ref_json: &Value,
    cand_json: &Value,
    common: &[&str],
    steps: Option<u64>,
    log: &mut MismatchLog,
) -> Result<usize, String> {
    let mut compared = 0;
    for name in common {
        let empty = Vec::new();
        let r = channel_data(ref_json, name).unwrap_or(&empty);
        let c = channel_data(cand_json, name).unwrap_or(&empty);
        if steps.is_none() && r.len() != c.len() {
            return Err(format!(
                "Channel {}: reference has {} steps and test has {} steps",
                name,
                r.len(),
                c.len()
            ));
        }
        let shared = steps.map(|s| s as usize).unwrap_or(r.len());
        if shared > r.len() || shared > c.len() {
            return Err(format!(
                "Reference has {} steps and test has {} steps, but the header says the min Timesteps is {}",
                r.len(),
                c.len(),
                shared
            ));
        }
        for t in 0..shared {
            if !same_value(&r[t], &c[t]) {
                log.push(format!("{} {} {} {}", name, t, r[t], c[t]));
            }
        }
        compared += shared;
    }
    Ok(compared)
}

fn compare_binned(
    ref_json: &Value,
    cand_json: &Value,
    common: &[&str],
    steps: Option<u64>,
    log: &mut MismatchLog,
) -> Result<usize, String> {
    let ref_bins = num_bins(ref_json);
    let cand_bins = num_bins(cand_json);
    let (Some(ref_bins), Some(cand_bins)) = (ref_bins, cand_bins) else {
        return Err("Binned report without NumBinsPerAxis in its Subchannel_Metadata".to_string());
    };
    if ref_bins != cand_bins {
        return Err(format!(
            "Reference(NumBinsPerAxis={}) != Test(NumBinsPerAxis={})",
            ref_bins, cand_bins
        ));
    }
    let bins = ref_bins as usize;
    let mut compared = 0;
    for name in common {
        let empty = Vec::new();
        let r = channel_data(ref_json, name).unwrap_or(&empty);
        let c = channel_data(cand_json, name).unwrap_or(&empty);
        for bin in 0..bins {
            let rb = r.get(bin).and_then(|v| v.as_array());
            let cb = c.get(bin).and_then(|v| v.as_array());
            // Without a Timesteps count every step of either side is checked.
            let shared = steps.map(|s| s as usize).unwrap_or_else(|| {
                rb.map(|v| v.len())
                    .unwrap_or(0)
                    .max(cb.map(|v| v.len()).unwrap_or(0))
            });
            for t in 0..shared {
                let rv = rb.and_then(|v| v.get(t));
                let cv = cb.and_then(|v| v.get(t));
                let equal = match (rv, cv) {
                    (Some(a), Some(b)) => same_value(a, b),
                    _ => false,
                };
                if !equal {
                    log.push(format!("{} {} {} {} {}", name, bin, t, render(rv), render(cv)));
                }
            }
            compared += shared;
        }
    }
    Ok(compared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::temp_root;
    use crate::{compare, ReportKind};
    use serde_json::json;
    use std::fs;
    use std::path::PathBuf;

    fn inset(timesteps: u64, channels: Value) -> Value {
        json!({
            "Header": {"Report_Type": "InsetChart", "Timesteps": timesteps},
            "Channels": channels
        })
    }

    fn series(len: usize, f: impl Fn(usize) -> f64) -> Value {
        json!({"Units": "", "Data": (0..len).map(f).collect::<Vec<_>>()})
    }

    fn write_pair(tag: &str, reference: &Value, candidate: &Value) -> (PathBuf, PathBuf, PathBuf) {
        let root = temp_root(tag);
        let r = root.join("ref_InsetChart.json");
        let c = root.join("InsetChart.json");
        fs::write(&r, serde_json::to_vec_pretty(reference).unwrap()).unwrap();
        fs::write(&c, serde_json::to_vec(candidate).unwrap()).unwrap();
        (root, r, c)
    }

    #[test]
    fn reordered_but_equal_channels_pass() {
        let reference = inset(3, json!({"A": series(3, |t| t as f64), "B": series(3, |_| 1.0)}));
        let candidate = inset(3, json!({"B": series(3, |_| 1.0), "A": series(3, |t| t as f64)}));
        let (root, r, c) = write_pair("equal", &reference, &candidate);
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Pass, "{}", res.describe());
        assert_eq!(res.method, Method::Structural(ReportKind::Channels));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn new_channel_fails_even_when_values_match() {
        let reference = inset(3, json!({"A": series(3, |_| 0.0), "B": series(3, |_| 1.0)}));
        let candidate = inset(
            3,
            json!({"A": series(3, |_| 0.0), "B": series(3, |_| 1.0), "C": series(3, |_| 2.0)}),
        );
        let (root, r, c) = write_pair("new_chan", &reference, &candidate);
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.detail.contains("New channels"), "{}", res.detail);
        assert!(!res.detail.contains("Missing channels"), "{}", res.detail);
        assert_eq!(res.warnings.len(), 1);
        assert!(res.warnings[0].contains("(C)"));
        assert!(res.mismatches.is_empty());

        let lenient = CompareOptions {
            new_channels_fail: false,
            ..CompareOptions::default()
        };
        let res = compare(&r, &c, &lenient);
        assert_eq!(res.outcome, Outcome::Pass, "{}", res.describe());
        assert_eq!(res.warnings.len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_channel_fails_and_is_listed() {
        let reference = inset(3, json!({"A": series(3, |_| 0.0), "B": series(3, |_| 1.0)}));
        let candidate = inset(3, json!({"A": series(3, |_| 0.0)}));
        let (root, r, c) = write_pair("missing_chan", &reference, &candidate);
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert_eq!(res.detail, "Missing channels:\nB");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn timestep_drift_fails_only_in_automated_mode() {
        let reference = inset(100, json!({"A": series(100, |t| t as f64)}));
        let candidate = inset(
            90,
            json!({"A": series(90, |t| if t == 50 { -1.0 } else { t as f64 })}),
        );
        let (root, r, c) = write_pair("timesteps", &reference, &candidate);

        let automated = CompareOptions {
            automated: true,
            ..CompareOptions::default()
        };
        let res = compare(&r, &c, &automated);
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.detail.contains("timesteps 90"), "{}", res.detail);
        assert!(res.mismatches.is_empty());

        let interactive = CompareOptions::default();
        let res = compare(&r, &c, &interactive);
        assert_eq!(res.warnings.len(), 1);
        assert!(res.warnings[0].contains("DIFFERING"));
        // The value walk covers min(100, 90) steps and finds the planted diff.
        assert_eq!(res.mismatches, vec!["A 50 50.0 -1.0".to_string()]);
        assert_eq!(res.outcome, Outcome::Fail);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn timestep_drift_alone_is_non_failing_when_interactive() {
        let reference = inset(100, json!({"A": series(100, |_| 3.0)}));
        let candidate = inset(90, json!({"A": series(90, |_| 3.0)}));
        let (root, r, c) = write_pair("drift_only", &reference, &candidate);
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Pass, "{}", res.describe());
        assert_eq!(res.warnings.len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn flat_mismatches_are_capped_with_overflow_count() {
        let reference = inset(30, json!({"A": series(30, |_| 0.0)}));
        let candidate = inset(30, json!({"A": series(30, |_| 1.0)}));
        let (root, r, c) = write_pair("cap", &reference, &candidate);
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert_eq!(res.mismatches.len(), 10);
        assert_eq!(res.skipped_mismatches, 20);
        assert_eq!(res.mismatches[0], "A 0 0.0 1.0");
        assert!(res.describe().contains("20 more mismatches"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn short_channel_data_fails_against_header() {
        let reference = inset(5, json!({"A": series(5, |_| 0.0)}));
        let candidate = inset(5, json!({"A": series(4, |_| 1.0)}));
        let (root, r, c) = write_pair("short", &reference, &candidate);
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.detail.contains("test has 4 steps"), "{}", res.detail);
        let _ = fs::remove_dir_all(root);
    }

    fn binned(bins: u64, data: Value) -> Value {
        json!({
            "Header": {
                "Timesteps": 3,
                "Subchannel_Metadata": {"NumBinsPerAxis": [[bins]]}
            },
            "Channels": {"Prevalence": {"Data": data}}
        })
    }

    #[test]
    fn binned_report_compares_bin_by_bin() {
        let reference = binned(2, json!([[0, 1, 2], [3, 4, 5]]));
        let candidate = binned(2, json!([[0, 1, 2], [3, 9, 5]]));
        let (root, r, c) = write_pair("binned", &reference, &candidate);
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert_eq!(res.mismatches, vec!["Prevalence 1 1 4 9".to_string()]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn binned_report_with_different_bin_count_fails() {
        let reference = binned(2, json!([[0, 1, 2], [3, 4, 5]]));
        let candidate = binned(1, json!([[0, 1, 2]]));
        let (root, r, c) = write_pair("bins", &reference, &candidate);
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.detail.contains("NumBinsPerAxis=2"), "{}", res.detail);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn headerless_truncated_report_fails() {
        let reference = json!({"Channels": {"A": {"Data": [1, 2, 3, 4, 5]}}});
        let candidate = json!({"Channels": {"A": {"Data": [1, 2]}}});
        let (root, r, c) = write_pair("headerless", &reference, &candidate);
        let automated = CompareOptions {
            automated: true,
            ..CompareOptions::default()
        };
        let res = compare(&r, &c, &automated);
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.detail.contains("cannot do deep dive"), "{}", res.detail);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn inset_without_timesteps_requires_equal_lengths() {
        let header = json!({"Report_Type": "InsetChart"});
        let reference = json!({"Header": header, "Channels": {"A": {"Data": [1, 2, 3]}}});
        let candidate = json!({"Header": header, "Channels": {"A": {"Data": [1, 2]}}});
        let (root, r, c) = write_pair("no_timesteps", &reference, &candidate);
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.detail.contains("test has 2 steps"), "{}", res.detail);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn binned_report_without_bin_count_fails() {
        let report = |data: Value| {
            json!({
                "Header": {"Subchannel_Metadata": {}},
                "Channels": {"Prevalence": {"Data": data}}
            })
        };
        let (root, r, c) = write_pair("no_bins", &report(json!([[1, 2]])), &report(json!([[9, 9]])));
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.detail.contains("NumBinsPerAxis"), "{}", res.detail);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn differing_channels_with_nothing_to_compare_fail() {
        let reference = inset(0, json!({"A": {"Units": "people", "Data": []}}));
        let candidate = inset(0, json!({"A": {"Units": "persons", "Data": []}}));
        let (root, r, c) = write_pair("empty_walk", &reference, &candidate);
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.detail.contains("no values could be compared"), "{}", res.detail);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn non_channel_json_fails_on_hash() {
        let (root, r, c) = write_pair("plain", &json!({"patients": [1]}), &json!({"patients": [2]}));
        let res = compare(&r, &c, &CompareOptions::default());
        assert_eq!(res.outcome, Outcome::Fail);
        assert!(res.detail.contains("Non-Channel"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn shape_detection_follows_header() {
        assert_eq!(
            ChannelShape::detect(&binned(1, json!([[1]]))),
            Some(ChannelShape::Binned)
        );
        assert_eq!(
            ChannelShape::detect(&inset(1, json!({}))),
            Some(ChannelShape::Flat)
        );
        assert_eq!(
            ChannelShape::detect(&json!({"Channels": {"A": {"Data": [[1], [2]]}}})),
            None
        );
        assert_eq!(
            ChannelShape::detect(&json!({"Channels": {"A": {"Data": [1, 2]}}})),
            None
        );
    }
}
