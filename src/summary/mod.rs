use serde_json::Value;

use crate::core::{Severity, VulnerabilitySummary};

/// Counts every vulnerability of every result target by reported severity.
///
/// Input that does not look like a scanner report yields an all-zero summary.
/// No severity filtering happens here; the scanner already applied it.
pub fn summarize(report: &Value) -> VulnerabilitySummary {
    let mut summary = VulnerabilitySummary::default();

    let Some(results) = report.get("Results").and_then(Value::as_array) else {
        return summary;
    };

    for result in results {
        let Some(vulns) = result.get("Vulnerabilities").and_then(Value::as_array) else {
            continue;
        };
        for vuln in vulns {
            let severity = vuln
                .get("Severity")
                .and_then(Value::as_str)
                .map(Severity::from_label)
                .unwrap_or(Severity::Unknown);
            summary.record(severity);
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report_with(severities: &[&str]) -> Value {
        let vulns: Vec<Value> = severities
            .iter()
            .map(|s| json!({"VulnerabilityID": "CVE-0000-0000", "Severity": s}))
            .collect();
        json!({"ArtifactName": "nginx:latest", "Results": [{"Target": "nginx", "Vulnerabilities": vulns}]})
    }

    #[test]
    fn counts_by_severity_without_refiltering() {
        let summary = summarize(&report_with(&["CRITICAL", "CRITICAL", "LOW"]));
        assert_eq!(
            summary,
            VulnerabilitySummary {
                critical: 2,
                high: 0,
                medium: 0,
                low: 1,
                unknown: 0,
                total: 3,
            }
        );
    }

    #[test]
    fn total_matches_buckets_across_targets() {
        let report = json!({
            "Results": [
                {"Target": "os", "Vulnerabilities": [
                    {"Severity": "HIGH"}, {"Severity": "MEDIUM"}, {"Severity": "UNKNOWN"}
                ]},
                {"Target": "no vulns", "Vulnerabilities": null},
                {"Target": "lib", "Vulnerabilities": [
                    {"Severity": "LOW"}, {"Severity": "HIGH"}
                ]},
                {"Target": "missing key"}
            ]
        });
        let summary = summarize(&report);
        let sum: u64 = Severity::ALL.iter().map(|s| summary.count(*s)).sum();
        assert_eq!(summary.total, 5);
        assert_eq!(sum, summary.total);
        assert_eq!(summary.high, 2);
    }

    #[test]
    fn missing_or_odd_severity_goes_to_unknown() {
        let report = json!({"Results": [{"Vulnerabilities": [
            {"VulnerabilityID": "CVE-1"},
            {"Severity": "NEGLIGIBLE"},
            {"Severity": 3},
            {"Severity": "critical"}
        ]}]});
        let summary = summarize(&report);
        assert_eq!(summary.unknown, 3);
        assert_eq!(summary.critical, 1);
        assert_eq!(summary.total, 4);
    }

    #[test]
    fn malformed_input_is_all_zero() {
        for input in [
            Value::Null,
            json!({}),
            json!([]),
            json!("text"),
            json!({"Results": "nope"}),
            json!({"Results": [1, "x", null]}),
        ] {
            assert_eq!(summarize(&input), VulnerabilitySummary::default(), "{input}");
        }
    }

    #[test]
    fn serializes_with_scanner_labels() {
        let summary = summarize(&report_with(&["HIGH"]));
        let v = serde_json::to_value(summary).expect("serialize");
        assert_eq!(
            v,
            json!({"CRITICAL": 0, "HIGH": 1, "MEDIUM": 0, "LOW": 0, "UNKNOWN": 0, "total": 1})
        );
    }
}
