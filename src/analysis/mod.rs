//! Baseline comparison of collected records.

pub mod diff;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collect::InvocationRecord;
use crate::error::{Error, Result};

/// A collected record plus its difference from the baseline output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisItem {
    #[serde(flatten)]
    pub record: InvocationRecord,
    pub diff: Value,
}

impl AnalysisItem {
    pub fn has_differences(&self) -> bool {
        !diff::is_empty(&self.diff)
    }
}

/// Diff every record's stdout against the baseline's.
///
/// `baseline` is the persisted baseline item; a missing baseline is an error.
/// Records without stdout (failed, timed out) are compared as `null`.
pub fn compare(items: Vec<InvocationRecord>, baseline: Option<&Value>) -> Result<Vec<AnalysisItem>> {
    let baseline = baseline
        .filter(|b| !b.is_null())
        .ok_or_else(|| Error::BadArguments("Cannot run simple analysis. No baseline found.".into()))?;
    let reference = baseline.get("stdout").unwrap_or(&Value::Null);

    Ok(items
        .into_iter()
        .map(|record| {
            let diff = diff::diff(reference, record.stdout().unwrap_or(&Value::Null));
            AnalysisItem { record, diff }
        })
        .collect())
}

/// Wrap records as items with an empty diff.
pub fn passthrough(items: Vec<InvocationRecord>) -> Vec<AnalysisItem> {
    items
        .into_iter()
        .map(|record| AnalysisItem {
            record,
            diff: Value::Object(Default::default()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::Outcome;
    use chrono::Utc;
    use serde_json::json;

    fn succeeded(target: &str, stdout: Value) -> InvocationRecord {
        let mut record = InvocationRecord::pending(target);
        record.complete(Outcome::Success(stdout), Utc::now());
        record
    }

    #[test]
    fn test_identical_output_has_no_differences() {
        let baseline = serde_json::to_value(succeeded("i-0", json!({"a": 1}))).unwrap();
        let items = compare(vec![succeeded("i-1", json!({"a": 1}))], Some(&baseline)).unwrap();
        assert_eq!(items.len(), 1);
        assert!(!items[0].has_differences());
        assert_eq!(items[0].diff, json!({}));
    }

    #[test]
    fn test_changed_output_has_differences() {
        let baseline = serde_json::to_value(succeeded("i-0", json!({"a": 1}))).unwrap();
        let items = compare(vec![succeeded("i-1", json!({"a": 2}))], Some(&baseline)).unwrap();
        assert!(items[0].has_differences());
        assert_eq!(items[0].diff, json!({"a": 2}));
    }

    #[test]
    fn test_missing_baseline_is_bad_arguments() {
        let err = compare(vec![succeeded("i-1", json!({}))], None).unwrap_err();
        assert!(matches!(err, Error::BadArguments(_)));
        let err = compare(vec![], Some(&Value::Null)).unwrap_err();
        assert!(matches!(err, Error::BadArguments(_)));
    }

    #[test]
    fn test_failed_record_compared_as_null() {
        let baseline = serde_json::to_value(succeeded("i-0", json!([1]))).unwrap();
        let mut failed = InvocationRecord::pending("i-1");
        failed.complete(Outcome::Failed("boom".into()), Utc::now());
        let items = compare(vec![failed], Some(&baseline)).unwrap();
        assert_eq!(items[0].diff, json!({"$replace": null}));
    }

    #[test]
    fn test_item_serializes_flat() {
        let item = passthrough(vec![InvocationRecord::pending("i-1")]).remove(0);
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value, json!({"instance_id": "i-1", "status": "Pending", "diff": {}}));
    }
}
