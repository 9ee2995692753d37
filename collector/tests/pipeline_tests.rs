//! Worker and exchange behavior, with both ends in one process.

use async_trait::async_trait;
use config::{Options, Platform};
use dbcollect_collector::exchange::pair;
use dbcollect_collector::*;
use flate2::read::GzDecoder;
use model::{ExitCode, Record, Status};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

/// Privileged tasks emitting numbered records.
struct RootRecords {
    count: usize,
    names: Vec<String>,
}

impl RootRecords {
    fn new(count: usize) -> Self {
        Self {
            count,
            names: Vec::new(),
        }
    }

    fn named(names: &[&str]) -> Self {
        Self {
            count: 0,
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl RootTasks for RootRecords {
    async fn collect(&self, emit: &mut dyn RecordEmitter) -> Result<()> {
        for i in 0..self.count {
            emit.emit(
                Record::new(format!("cmd_root/item{}.jsonp", i), Status::Ok)
                    .with_payload(format!("payload {}", i)),
            )
            .await?;
        }
        for name in &self.names {
            emit.emit(Record::new(name.as_str(), Status::Ok).with_payload("root"))
                .await?;
        }
        Ok(())
    }
}

/// Local collection writing the given names.
struct Local(Vec<&'static str>);

#[async_trait]
impl LocalCollection for Local {
    async fn collect(&self, sink: &mut Sink) -> Result<()> {
        for name in &self.0 {
            sink.emit(Record::new(*name, Status::Ok).with_payload("local"))
                .await?;
        }
        Ok(())
    }
}

struct PanickingLocal;

#[async_trait]
impl LocalCollection for PanickingLocal {
    async fn collect(&self, sink: &mut Sink) -> Result<()> {
        sink.emit(Record::new("cmd/before.jsonp", Status::Ok)).await?;
        panic!("local collector bug");
    }
}

struct SlowLocal;

#[async_trait]
impl LocalCollection for SlowLocal {
    async fn collect(&self, sink: &mut Sink) -> Result<()> {
        sink.emit(Record::new("cmd/first.jsonp", Status::Ok)).await?;
        tokio::time::sleep(Duration::from_secs(60)).await;
        sink.emit(Record::new("cmd/never.jsonp", Status::Ok)).await
    }
}

fn options() -> Options {
    let mut options = Options::default();
    options.timeouts.handshake = Duration::from_millis(300);
    options.timeouts.send = Duration::from_millis(300);
    options.timeouts.receive = Duration::from_millis(600);
    options
}

fn main_worker(options: &Options, consumer: Consumer, dir: &Path) -> MainWorker {
    MainWorker::new(options.clone(), consumer, dir.join("bundle.tar.gz"))
        .hostname("db01")
        .platform(Platform::Linux)
}

/// Entry names and payloads of a bundle, without the host prefix.
fn bundle(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (name.strip_prefix("db01/").unwrap().to_string(), data)
        })
        .collect()
}

fn names(entries: &[(String, Vec<u8>)]) -> Vec<&str> {
    entries.iter().map(|(name, _)| name.as_str()).collect()
}

mod ordering {
    use super::*;

    #[tokio::test]
    async fn test_records_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (producer, consumer) = pair().unwrap();
        let options = options();
        let mut root = RootWorker::new(&options, producer).elevated(true);
        let mut main = main_worker(&options, consumer, dir.path());

        let tasks = RootRecords::new(CHANNEL_CAPACITY);
        let local = Local(vec!["cmd/uname.jsonp"]);
        let (root_code, main_code) = tokio::join!(root.run(&tasks), main.run(&local));

        assert_eq!(root_code, ExitCode::Success);
        assert_eq!(main_code, ExitCode::Success);
        assert_eq!(root.state(), RootState::Exited);
        assert_eq!(main.state(), MainState::Closed);

        let entries = bundle(main.bundle().unwrap());
        assert_eq!(
            names(&entries),
            vec![
                "meta.json",
                "cmd_root/item0.jsonp",
                "cmd_root/item1.jsonp",
                "cmd_root/item2.jsonp",
                "cmd_root/item3.jsonp",
                "cmd_root/item4.jsonp",
                "cmd/uname.jsonp",
            ]
        );
        for i in 0..CHANNEL_CAPACITY {
            assert!(entries[i + 1].1.ends_with(format!("\npayload {}", i).as_bytes()));
        }
    }

    #[tokio::test]
    async fn test_more_records_than_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let (producer, consumer) = pair().unwrap();
        let options = options();
        let mut root = RootWorker::new(&options, producer).elevated(true);
        let mut main = main_worker(&options, consumer, dir.path());

        let tasks = RootRecords::new(40);
        let local = Local(vec![]);
        let (root_code, main_code) = tokio::join!(root.run(&tasks), main.run(&local));

        assert_eq!(root_code, ExitCode::Success);
        assert_eq!(main_code, ExitCode::Success);
        assert_eq!(root.sent(), 40);
        let entries = bundle(main.bundle().unwrap());
        assert_eq!(entries.len(), 41);
        assert_eq!(entries[40].0, "cmd_root/item39.jsonp");
    }
}

mod degraded {
    use super::*;

    #[tokio::test]
    async fn test_no_ready_signal_skips_privileged_collection() {
        let dir = tempfile::tempdir().unwrap();
        let (producer, consumer) = pair().unwrap();
        let options = options();
        let mut root = RootWorker::new(&options, producer).elevated(true);

        let start = Instant::now();
        assert_eq!(root.run(&RootRecords::new(3)).await, ExitCode::Success);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(root.sent(), 0);

        let mut main = main_worker(&options, consumer, dir.path());
        assert_eq!(main.run(&Local(vec!["cmd/df.jsonp"])).await, ExitCode::Success);
        let entries = bundle(main.bundle().unwrap());
        assert_eq!(names(&entries), vec!["meta.json", "cmd/df.jsonp"]);
    }

    #[tokio::test]
    async fn test_saturated_channel_aborts_producer() {
        let (producer, mut consumer) = pair().unwrap();
        let options = options();
        let mut root = RootWorker::new(&options, producer).elevated(true);
        consumer.signal_ready().await.unwrap();

        let start = Instant::now();
        let code = root.run(&RootRecords::new(20)).await;
        assert_eq!(code, ExitCode::ChannelFull);
        assert_eq!(code.code(), 45);
        assert_eq!(root.state(), RootState::Aborted);
        assert!(start.elapsed() < Duration::from_secs(5));

        // the consumer is not stuck either
        assert_eq!(consumer.drain(), CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_producer_crash_mid_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (mut producer, consumer) = pair().unwrap();
        let options = options();
        let mut main = main_worker(&options, consumer, dir.path());

        let crash = async move {
            assert!(producer.wait_ready(Duration::from_secs(5)).await.unwrap());
            for i in 0..2 {
                producer
                    .send(Record::new(format!("cmd_root/r{}.jsonp", i), Status::Ok), Duration::from_secs(1))
                    .await
                    .unwrap();
            }
            drop(producer);
        };
        let local = Local(vec!["cmd/uptime.jsonp"]);
        let (_, code) = tokio::join!(crash, main.run(&local));

        assert_eq!(code, ExitCode::Success);
        let entries = bundle(main.bundle().unwrap());
        assert_eq!(
            names(&entries),
            vec!["meta.json", "cmd_root/r0.jsonp", "cmd_root/r1.jsonp", "cmd/uptime.jsonp"]
        );
    }

    #[tokio::test]
    async fn test_silent_producer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (mut producer, consumer) = pair().unwrap();
        let options = options();
        let mut main = main_worker(&options, consumer, dir.path());

        let stall = async {
            assert!(producer.wait_ready(Duration::from_secs(5)).await.unwrap());
            producer
                .send(Record::new("cmd_root/only.jsonp", Status::Ok), Duration::from_secs(1))
                .await
                .unwrap();
        };
        let start = Instant::now();
        let local = Local(vec!["cmd/free.jsonp"]);
        let (_, code) = tokio::join!(stall, main.run(&local));

        assert_eq!(code, ExitCode::Success);
        assert!(start.elapsed() >= options.timeouts.receive);
        let entries = bundle(main.bundle().unwrap());
        assert_eq!(
            names(&entries),
            vec!["meta.json", "cmd_root/only.jsonp", "cmd/free.jsonp"]
        );
        drop(producer);
    }
}

mod bundle_integrity {
    use super::*;

    #[tokio::test]
    async fn test_each_name_appears_once() {
        let dir = tempfile::tempdir().unwrap();
        let (producer, consumer) = pair().unwrap();
        let options = options();
        let mut root = RootWorker::new(&options, producer).elevated(true);
        let mut main = main_worker(&options, consumer, dir.path());

        let tasks = RootRecords::named(&["shared.jsonp", "cmd_root/a.jsonp", "shared.jsonp"]);
        let local = Local(vec!["shared.jsonp", "cmd/b.jsonp"]);
        let (_, code) = tokio::join!(root.run(&tasks), main.run(&local));

        assert_eq!(code, ExitCode::Success);
        let entries = bundle(main.bundle().unwrap());
        assert_eq!(
            names(&entries),
            vec!["meta.json", "shared.jsonp", "cmd_root/a.jsonp", "cmd/b.jsonp"]
        );
        assert!(entries[1].1.ends_with(b"\nroot"));
    }

    #[tokio::test]
    async fn test_run_log_is_last_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("dbcollect-test.log");
        std::fs::write(&log, "INFO collection started\n").unwrap();

        let (producer, consumer) = pair().unwrap();
        let options = options();
        let mut root = RootWorker::new(&options, producer).elevated(false);
        let mut main = main_worker(&options, consumer, dir.path()).log_path(&log);

        let tasks = RootRecords::new(1);
        let local = Local(vec!["cmd/x.jsonp"]);
        let (_, code) = tokio::join!(root.run(&tasks), main.run(&local));
        assert_eq!(code, ExitCode::Success);

        let entries = bundle(main.bundle().unwrap());
        let (name, data) = entries.last().unwrap();
        assert_eq!(name, "dbcollect.log");
        assert_eq!(data, b"INFO collection started\n");
    }

    #[tokio::test]
    async fn test_panic_still_closes_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let (producer, consumer) = pair().unwrap();
        let options = options();
        let mut root = RootWorker::new(&options, producer).elevated(false);
        let mut main = main_worker(&options, consumer, dir.path());

        let tasks = RootRecords::new(0);
        let local = PanickingLocal;
        let (_, code) = tokio::join!(root.run(&tasks), main.run(&local));
        assert_eq!(code, ExitCode::Bug);
        assert_eq!(main.state(), MainState::Closed);
        let entries = bundle(main.bundle().unwrap());
        assert_eq!(names(&entries), vec!["meta.json", "cmd/before.jsonp"]);
    }

    #[tokio::test]
    async fn test_interrupt_still_closes_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let (producer, consumer) = pair().unwrap();
        let options = options();
        let mut root = RootWorker::new(&options, producer).elevated(false);
        let mut main = main_worker(&options, consumer, dir.path());

        let cancel = tokio::time::sleep(Duration::from_millis(300));
        let tasks = RootRecords::new(0);
        let local = SlowLocal;
        let (_, code) = tokio::join!(root.run(&tasks), main.run_until(&local, cancel));
        assert_eq!(code, ExitCode::Interrupted);
        let entries = bundle(main.bundle().unwrap());
        assert_eq!(names(&entries), vec!["meta.json", "cmd/first.jsonp"]);
    }
}

mod setup {
    use super::*;

    #[tokio::test]
    async fn test_unwritable_bundle_is_setup_failure() {
        let (_producer, consumer) = pair().unwrap();
        let mut main = MainWorker::new(options(), consumer, "/nonexistent/dir/bundle.tar.gz");
        let code = main.run(&Local(vec![])).await;
        assert_eq!(code, ExitCode::SetupFailed);
        assert_eq!(main.state(), MainState::Failed);
        assert!(main.bundle().is_none());
    }

    #[tokio::test]
    async fn test_unknown_target_user() {
        let result = resolve_target_identity(Some("dbcollect-no-such-user"));
        assert!(matches!(result, Err(Error::NoSuchUser(_))));
        assert_eq!(result.unwrap_err().exit_code(), ExitCode::IdentityUnavailable);
    }
}

mod protocol {
    use super::*;

    #[tokio::test]
    async fn test_record_sent_before_ready_is_kept() {
        let (mut producer, mut consumer) = pair().unwrap();
        producer
            .send(Record::new("early.jsonp", Status::Ok).with_payload("x"), Duration::from_secs(1))
            .await
            .unwrap();
        producer.send_done(Duration::from_secs(1)).await.unwrap();
        producer.send_done(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            producer.send(Record::new("late.jsonp", Status::Ok), Duration::from_secs(1)).await,
            Err(Error::Protocol(_))
        ));

        consumer.signal_ready().await.unwrap();
        match consumer.receive(Duration::from_secs(1)).await.unwrap() {
            Message::Record(record) => {
                assert_eq!(record.name(), "early.jsonp");
                assert_eq!(record.payload(), b"x");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(consumer.receive(Duration::from_secs(1)).await.unwrap(), Message::Done);
        assert_eq!(consumer.drain(), 0);
    }
}
