//! Runbook files shipped with the crate.

use std::path::PathBuf;

use clusteradm_mgmt::Runbook;

fn runbook(name: &str) -> Runbook {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("runbooks")
        .join(name);
    Runbook::from_file(&path).unwrap()
}

#[tokio::test]
async fn test_dev_runbook() {
    let runbook = runbook("dev.toml");
    assert!(runbook.problems().is_empty());
    let report = runbook.run().await.unwrap();
    assert!(report.passed, "{}", serde_json::to_string_pretty(&report).unwrap());

    let rescan = report.steps[3].result.as_ref().unwrap();
    assert!(rescan["unmanaged"].as_array().unwrap().is_empty());
    assert!(rescan["missing"].as_array().unwrap().is_empty());

    let status = report.steps[4].result.as_ref().unwrap();
    let members = status["members"].as_array().unwrap();
    assert_eq!(members.len(), 2);
    assert!(members.iter().all(|m| m["status"] == "ONLINE"));
    let roles: Vec<&str> = members.iter().filter_map(|m| m["role"].as_str()).collect();
    assert!(roles.contains(&"PRIMARY"));
    assert!(roles.contains(&"SECONDARY"));
}

#[tokio::test]
async fn test_global_runbook() {
    let report = runbook("global.toml").run().await.unwrap();
    assert!(report.passed, "{}", serde_json::to_string_pretty(&report).unwrap());
    assert_eq!(report.failed(), 0);

    let status = report.steps.last().unwrap().result.as_ref().unwrap();
    assert_eq!(status["primary_cluster"], "west");
    assert_eq!(status["status"], "HEALTHY");
}
