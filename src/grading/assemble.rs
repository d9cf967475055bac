//! Pair parsed records with the tasks that produced them.

use tracing::warn;

use super::error::GradingError;
use super::reply::ParsedReply;
use super::types::{GradedTask, GroupingTask};

/// Match records to tasks by task number.
///
/// Records are sorted by their `Task N` number before pairing, so a model
/// that answers out of order still lines up. The numbers must then be
/// exactly `1..=tasks.len()`; duplicates or gaps are an error rather than
/// a silent misalignment.
pub fn assemble(
    tasks: &[GroupingTask],
    parsed: ParsedReply,
    raw_reply: &str,
) -> Result<Vec<GradedTask>, GradingError> {
    let expected = tasks.len();

    if parsed.records.is_empty() {
        return Err(GradingError::no_records(parsed.rejected.len(), raw_reply));
    }
    if parsed.records.len() != expected {
        return Err(GradingError::count_mismatch(
            expected,
            parsed.records.len(),
            raw_reply,
        ));
    }

    let as_received = parsed.task_numbers();
    let mut records = parsed.records;
    records.sort_by_key(|r| r.task_number);

    let numbered_in_sequence = records
        .iter()
        .enumerate()
        .all(|(idx, r)| r.task_number as usize == idx + 1);
    if !numbered_in_sequence {
        return Err(GradingError::numbering(expected, as_received, raw_reply));
    }

    if as_received.windows(2).any(|w| w[0] > w[1]) {
        warn!(order = ?as_received, "reply records out of order; realigned by task number");
    }

    Ok(tasks
        .iter()
        .cloned()
        .zip(records)
        .map(|(task, record)| GradedTask {
            task,
            result: record.result,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::reply::parse_reply;
    use crate::grading::types::ValueRange;

    fn tasks(n: usize) -> Vec<GroupingTask> {
        (0..n)
            .map(|i| {
                GroupingTask::new(
                    format!("Feature {i}"),
                    [ValueRange::new(0.0, 10.0), ValueRange::above(10.0)],
                    ValueRange::above(0.0),
                )
            })
            .collect()
    }

    fn record(n: u32, grade: u8) -> String {
        format!(
            "Task {n}:\n- Grade: {grade}\n- Reference Count in Sources: {n}0\n\
             - Reference Example Links: https://example.org/{n}\n- Explanation: reason {n}\n"
        )
    }

    fn reply(numbers: &[u32]) -> String {
        numbers
            .iter()
            .map(|&n| record(n, (n % 4 + 1) as u8))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn pairs_one_three_and_ten_tasks_in_order() {
        for k in [1usize, 3, 10] {
            let ts = tasks(k);
            let numbers: Vec<u32> = (1..=k as u32).collect();
            let raw = reply(&numbers);
            let graded = assemble(&ts, parse_reply(&raw), &raw).unwrap();
            assert_eq!(graded.len(), k);
            for (i, g) in graded.iter().enumerate() {
                assert_eq!(g.task.feature_name, format!("Feature {i}"));
                assert_eq!(g.result.explanation, format!("reason {}", i + 1));
            }
        }
    }

    #[test]
    fn reordered_records_are_realigned() {
        let ts = tasks(3);
        let raw = reply(&[2, 3, 1]);
        let graded = assemble(&ts, parse_reply(&raw), &raw).unwrap();
        assert_eq!(graded[0].task.feature_name, "Feature 0");
        assert_eq!(graded[0].result.explanation, "reason 1");
        assert_eq!(graded[2].result.reference_count, "30");
    }

    #[test]
    fn duplicate_numbers_are_rejected() {
        let ts = tasks(3);
        let raw = reply(&[1, 2, 2]);
        match assemble(&ts, parse_reply(&raw), &raw) {
            Err(GradingError::TaskNumberingInconsistent {
                expected, found, ..
            }) => {
                assert_eq!(expected, 3);
                assert_eq!(found, vec![1, 2, 2]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn gap_in_numbers_is_rejected() {
        let ts = tasks(2);
        let raw = reply(&[1, 3]);
        let err = assemble(&ts, parse_reply(&raw), &raw).unwrap_err();
        assert_eq!(err.code(), "task_numbering_inconsistent");
    }

    #[test]
    fn short_reply_is_a_count_mismatch() {
        let ts = tasks(3);
        let raw = reply(&[1, 2]);
        match assemble(&ts, parse_reply(&raw), &raw) {
            Err(GradingError::ResultCountMismatch {
                expected, parsed, ..
            }) => {
                assert_eq!(expected, 3);
                assert_eq!(parsed, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unparseable_reply_reports_no_records() {
        let ts = tasks(2);
        let raw = "I cannot help with that.";
        let err = assemble(&ts, parse_reply(raw), raw).unwrap_err();
        assert!(matches!(err, GradingError::NoRecordsParsed { rejected: 0, .. }));
    }
}
