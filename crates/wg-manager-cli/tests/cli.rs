//! Binary-level tests for the `wg-manager` command.

use assert_cmd::Command;
use predicates::prelude::*;

const PRIVATE: &str = "GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1kc=";
const PEER: &str = "ZIbfqEjc7LKm2sPNK2kKOpVM5BDQbmWrWBBBnEOPmgU=";

fn wg_manager() -> Command {
    Command::cargo_bin("wg-manager").expect("binary built")
}

#[test]
fn genkey_prints_a_key() {
    wg_manager()
        .arg("genkey")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^[A-Za-z0-9+/]{43}=\n$").expect("regex"));
}

#[test]
fn pubkey_reads_stdin() {
    let expected = wg_manager::PrivateKey::from_base64(PRIVATE)
        .expect("key")
        .public_key()
        .to_base64();
    wg_manager()
        .arg("pubkey")
        .write_stdin(format!("{PRIVATE}\n"))
        .assert()
        .success()
        .stdout(format!("{expected}\n"));
}

#[test]
fn validate_conf_file() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let path = dir.path().join("wg0.conf");
    std::fs::write(
        &path,
        format!(
            "[Interface]\nPrivateKey = {PRIVATE}\nAddress = 10.0.0.1/24\n\n\
             [Peer]\nPublicKey = {PEER}\nAllowedIPs = 10.0.0.2/32\n"
        ),
    )
    .expect("write config");

    wg_manager()
        .args(["validate", path.to_str().expect("utf-8 path")])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration for wg0 is valid"));
}

#[test]
fn validate_reports_field() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let path = dir.path().join("wg0.json");
    std::fs::write(&path, r#"{"name": "wg0", "fwmark": "0xZZZZ"}"#).expect("write config");

    wg_manager()
        .args(["validate", path.to_str().expect("utf-8 path")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid fwmark"));
}
