// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end CLI tests against a tempdir-backed data directory.

use assert_cmd::Command;
use predicates::prelude::*;

fn verifactu(data_dir: &std::path::Path) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("verifactu").expect("binary `verifactu` should be built");
    cmd.arg("--data-dir").arg(data_dir);
    cmd
}

#[test]
fn help_exits_zero_and_contains_expected_text() {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("verifactu").expect("binary `verifactu` should be built");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("VERI*FACTU"))
        .stdout(predicate::str::contains("create-record"))
        .stdout(predicate::str::contains("reconcile"))
        .stdout(predicate::str::contains("daemon"));
}

#[test]
fn create_record_then_list_round_trips() {
    let dir = tempfile::tempdir().unwrap();

    verifactu(dir.path())
        .args([
            "create-record",
            "--issuer-nif",
            "B12345678",
            "--issuer-name",
            "Acme S.L.",
            "--invoice-number",
            "F2024-001",
            "--invoice-date",
            "2024-12-25",
            "--invoice-type",
            "f1",
            "--base-amount",
            "100.00",
            "--tax-rate",
            "21.00",
            "--tax-amount",
            "21.00",
            "--total-amount",
            "121.00",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("F2024-001"));

    verifactu(dir.path())
        .args(["list-records", "--issuer-nif", "B12345678"])
        .assert()
        .success()
        .stdout(predicate::str::contains("F2024-001"));
}

#[test]
fn create_record_rejects_inconsistent_total() {
    let dir = tempfile::tempdir().unwrap();

    verifactu(dir.path())
        .args([
            "create-record",
            "--issuer-nif",
            "B12345678",
            "--issuer-name",
            "Acme S.L.",
            "--invoice-number",
            "F2024-001",
            "--invoice-date",
            "2024-12-25",
            "--invoice-type",
            "f1",
            "--base-amount",
            "100.00",
            "--tax-rate",
            "21.00",
            "--tax-amount",
            "21.00",
            "--total-amount",
            "999.00",
        ])
        .assert()
        .failure();
}

#[test]
fn probe_connection_without_certificate_reports_unreachable() {
    let dir = tempfile::tempdir().unwrap();

    verifactu(dir.path())
        .arg("probe-connection")
        .assert()
        .failure()
        .stdout(predicate::str::contains("unreachable"));
}

#[test]
fn recover_manual_rejects_malformed_hash() {
    let dir = tempfile::tempdir().unwrap();

    verifactu(dir.path())
        .args(["recover-manual", "--issuer-nif", "B12345678", "--last-hash", "not-a-hash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("InvalidHash"));
}

#[test]
fn set_mode_persists_then_is_blocked_once_locked() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("verifactu.toml");
    std::fs::write(
        &config_path,
        "mode = \"no_verifactu\"\nenvironment = \"testing\"\nsoftware_name = \"acme-pos\"\nsoftware_version = \"1.0\"\n",
    )
    .unwrap();

    let mut first = verifactu(dir.path());
    first.args(["--config"]).arg(&config_path).args(["set-mode", "--mode", "verifactu"]);
    first.assert().failure(); // verifactu mode requires a certificate_path

    let mut switch_back = verifactu(dir.path());
    switch_back.args(["--config"]).arg(&config_path).args(["set-mode", "--mode", "no-verifactu"]);
    switch_back.assert().success().stdout(predicate::str::contains("NoVerifactu"));

    // The first-ever append locks the mode for the current fiscal year.
    let mut create = verifactu(dir.path());
    create.args(["--config"]).arg(&config_path).args([
        "create-record",
        "--issuer-nif",
        "B12345678",
        "--issuer-name",
        "Acme S.L.",
        "--invoice-number",
        "F2024-001",
        "--invoice-date",
        "2024-12-25",
        "--invoice-type",
        "f1",
        "--base-amount",
        "100.00",
        "--tax-rate",
        "21.00",
        "--tax-amount",
        "21.00",
        "--total-amount",
        "121.00",
    ]);
    create.assert().success();

    let mut blocked = verifactu(dir.path());
    blocked.args(["--config"]).arg(&config_path).args(["set-mode", "--mode", "verifactu"]);
    blocked
        .assert()
        .failure()
        .stderr(predicate::str::contains("operating mode is locked"));
}
