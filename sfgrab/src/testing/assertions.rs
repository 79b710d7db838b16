//! Test assertions for stage outputs.

use crate::core::{StageOutput, StageStatus};

/// Asserts that the output indicates the stage did its work.
pub fn assert_output_ok(output: &StageOutput) {
    assert!(
        output.is_ok(),
        "Expected ok, got status: {:?}",
        output.status
    );
}

/// Asserts that the stage skipped with the given reason.
pub fn assert_output_skipped(output: &StageOutput, reason: &str) {
    assert_eq!(
        output.status,
        StageStatus::Skip,
        "Expected skip, got status: {:?}",
        output.status
    );
    assert_eq!(output.skip_reason.as_deref(), Some(reason));
}

/// Asserts that the output metadata holds `expected` under `key`.
pub fn assert_output_metadata(output: &StageOutput, key: &str, expected: &serde_json::Value) {
    let actual = output.get_metadata(key);
    assert_eq!(
        actual,
        Some(expected),
        "Expected metadata {key} = {expected:?}, got {actual:?}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assertions_accept_matching_outputs() {
        assert_output_ok(&StageOutput::ok());
        assert_output_skipped(&StageOutput::skip("not due"), "not due");
        assert_output_metadata(
            &StageOutput::ok().with_metadata("attempts", serde_json::json!(2)),
            "attempts",
            &serde_json::json!(2),
        );
    }

    #[test]
    #[should_panic(expected = "Expected ok")]
    fn test_assert_ok_rejects_skip() {
        assert_output_ok(&StageOutput::skip("nothing"));
    }
}
