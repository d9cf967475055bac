use std::process::Command;

use tempfile::tempdir;

fn write_tasks(dir: &std::path::Path) -> std::path::PathBuf {
    let tasks = serde_json::json!([
        {
            "feature_name": "Age in Years",
            "domain_range": [0, 100],
            "groups": [[0, 12], [13, 19], [20, 64], [65, 100]]
        },
        {
            "feature_name": "Monthly Salary in Dollars",
            "domain_range": [0, "inf"],
            "groups": [["-inf", 1000], [1000, 10000], [11000, "inf"]]
        }
    ]);
    let path = dir.join("tasks.json");
    std::fs::write(&path, serde_json::to_string_pretty(&tasks).unwrap()).unwrap();
    path
}

#[test]
fn cli_prompt_renders_without_network() {
    let dir = tempdir().unwrap();
    let tasks = write_tasks(dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_grader"))
        .args(["prompt", "--tasks"])
        .arg(&tasks)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Task 1:\nFeature: Age in Years"));
    assert!(stdout.contains("Grouping: lower than 1000, 1000-10000, more than 11000"));
    assert!(stdout.contains("Range: from 0 to +infinity"));
    assert!(stdout.contains("- Grade:"));
}

#[test]
fn cli_prompt_rejects_invalid_tasks() {
    let dir = tempdir().unwrap();
    let tasks = dir.path().join("tasks.json");
    std::fs::write(
        &tasks,
        r#"[{"feature_name": "BMI", "domain_range": [0, 50], "groups": [[30, 18.5]]}]"#,
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_grader"))
        .args(["prompt", "--tasks"])
        .arg(&tasks)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("InvalidTask"));

    std::fs::write(&tasks, "[]").unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_grader"))
        .args(["prompt", "--tasks"])
        .arg(&tasks)
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn cli_parse_aligns_saved_reply() {
    let dir = tempdir().unwrap();
    let tasks = write_tasks(dir.path());
    let reply_path = dir.path().join("reply.txt");
    std::fs::write(
        &reply_path,
        "Task 2:\n- Grade: 3\n- Reference Count In Sources: 25\n\
         - Reference Example Links: none\n- Explanation: income bands vary\n\n\
         Task 1:\n- Grade: 4\n- Reference Count In Sources: 100+\n\
         - Reference Example Links: none\n- Explanation: standard life stages\n",
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_grader"))
        .args(["parse", "--reply"])
        .arg(&reply_path)
        .arg("--tasks")
        .arg(&tasks)
        .output()
        .unwrap();
    assert!(output.status.success());

    let graded: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(graded[0]["task"]["feature_name"], "Age in Years");
    assert_eq!(graded[0]["result"]["grade"], 4);
    assert_eq!(graded[1]["result"]["grade"], 3);
    assert_eq!(graded[1]["task"]["domain_range"][1], "inf");
}

#[test]
fn cli_parse_fails_on_short_reply() {
    let dir = tempdir().unwrap();
    let tasks = write_tasks(dir.path());
    let reply_path = dir.path().join("reply.txt");
    std::fs::write(
        &reply_path,
        "Task 1:\n- Grade: 4\n- Reference Count In Sources: 1\n\
         - Reference Example Links: none\n- Explanation: only one\n",
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_grader"))
        .args(["parse", "--reply"])
        .arg(&reply_path)
        .arg("--tasks")
        .arg(&tasks)
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ResultCountMismatch"));
}

#[test]
fn cli_agreement_reports_json() {
    let dir = tempdir().unwrap();
    let csv_path = dir.path().join("responses.csv");
    std::fs::write(
        &csv_path,
        ",ID,Q1,Q2,Q3,Q4\n0,r1,4,2,4,1\n1,r2,4,3,4,1\n2,r3,3,2,4,2\n",
    )
    .unwrap();
    let out_path = dir.path().join("report.json");

    let status = Command::new(env!("CARGO_BIN_EXE_grader"))
        .args(["agreement", "--responses"])
        .arg(&csv_path)
        .args(["--ranking", "gpt=4,2,4,1", "--ranking", "short=4,2"])
        .arg("--out")
        .arg(&out_path)
        .status()
        .unwrap();
    assert!(status.success());

    let raw = std::fs::read_to_string(&out_path).unwrap();
    let report: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(report["respondents"], 3);
    assert_eq!(report["questions"], 4);
    assert!(report["fleiss_kappa"].is_number());
    assert!(report["krippendorff_alpha"].as_f64().unwrap() > 0.5);
    assert_eq!(report["quiz_vector"].as_array().unwrap().len(), 4);
    assert_eq!(report["rankings"][0]["name"], "gpt");
    assert!(report["rankings"][0]["spearman"]["statistic"].as_f64().unwrap() > 0.9);
    assert_eq!(report["rankings"][1]["name"], "short");
}

#[test]
fn cli_grade_requires_credentials() {
    let dir = tempdir().unwrap();
    let tasks = write_tasks(dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_grader"))
        .env_remove("OPENAI_API_KEY")
        .args(["grade", "--provider", "openai", "--tasks"])
        .arg(&tasks)
        .arg("--out")
        .arg(dir.path().join("out.jsonl"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("OPENAI_API_KEY"));
}
