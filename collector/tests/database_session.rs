//! Database collection against a stand-in SQL*Plus.
//!
//! One test only: the script is written and then executed, which must not
//! race with other tests forking.

use config::{Catalogs, Options, Platform};
use dbcollect_collector::collectors::DatabaseCollector;
use dbcollect_collector::Context;
use model::{Record, Status};
use std::fs;
use std::os::unix::fs::PermissionsExt;

const FAKE_SQLPLUS: &str = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    prompt\ *) echo "${line#prompt }" ;;
    *sgainfo*) sleep 5 ;;
    select*) echo "$ORACLE_SID|$line" ;;
  esac
done
"#;

#[tokio::test]
async fn test_instance_queries() {
    let home = tempfile::tempdir().unwrap();
    let bin = home.path().join("bin");
    fs::create_dir(&bin).unwrap();
    let sqlplus = bin.join("sqlplus");
    fs::write(&sqlplus, FAKE_SQLPLUS).unwrap();
    fs::set_permissions(&sqlplus, fs::Permissions::from_mode(0o755)).unwrap();

    let work = tempfile::tempdir().unwrap();
    let mut options = Options::default().with_tempdir(work.path());
    options.timeouts.sql = std::time::Duration::from_secs(2);
    let ctx = Context::new(options, &Catalogs::builtin(), Platform::Linux, "oracle");
    let collector = DatabaseCollector::new(&ctx);

    // no home: one skipped record
    let mut records: Vec<Record> = Vec::new();
    collector.collect_instance("NOHOME", None, &mut records).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name(), "oracle/NOHOME/instance.jsonp");
    assert_eq!(records[0].status(), Status::Skipped);

    // queries up to the one that hangs, which fails and ends the session
    let mut records: Vec<Record> = Vec::new();
    collector
        .collect_instance("ORCL", Some(home.path()), &mut records)
        .await
        .unwrap();

    let names: Vec<&str> = records.iter().map(|r| r.name()).collect();
    assert_eq!(
        names,
        vec![
            "oracle/ORCL/instance.jsonp",
            "oracle/ORCL/database.jsonp",
            "oracle/ORCL/version.jsonp",
            "oracle/ORCL/parameters.jsonp",
            "oracle/ORCL/sga.jsonp",
        ]
    );
    assert_eq!(records[0].status(), Status::Ok);
    assert_eq!(records[0].payload(), b"ORCL|select * from v$instance;\n");
    // the reply timeout or the external wrapper ends it, whichever is first
    assert!(records[4].status().is_failure());
    assert!(records[4].metadata().contains_key("reason"));
}
