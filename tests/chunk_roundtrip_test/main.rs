use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bolero::check;
use ibb::binlog0purge::BinlogEngine;
use ibb::binlog0rd::{BinlogReader, ReadMode};
use ibb::fsp0binlog::BinlogConfig;
use ibb::log::Redo;

fn main() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let base = temp_dir.path().to_path_buf();
    let case = AtomicU64::new(0);

    check!()
        .with_type()
        .for_each(|(gtid_event, payload): &(Vec<u8>, Vec<u8>)| {
            // A fresh binlog directory per case; position state must not
            // leak between runs.
            let case = case.fetch_add(1, Ordering::Relaxed);
            let dir = base.join(format!("case-{case}"));
            std::fs::create_dir_all(&dir).unwrap();

            let cfg = BinlogConfig {
                directory: dir.clone(),
                page_size_shift: 12,
                size_in_pages: 32,
                state_interval_pages: 4,
                flush_log_at_trx_commit: 1,
                force_recovery: false,
                max_total_size: 0,
                expire_seconds: 0,
            };
            let redo = Arc::new(Redo::new());
            let mut engine = BinlogEngine::start(cfg, redo).expect("start binlog engine");

            engine
                .sys
                .write_commit_record(gtid_event, payload, None, None, None)
                .expect("write commit record");

            // A commit record read back must return the GTID event bytes
            // followed by the payload, bit for bit, regardless of how the
            // record was chunked across pages and files.
            let mut expected = gtid_event.clone();
            expected.extend_from_slice(payload);

            let mut reader = BinlogReader::new(engine.sys.clone(), ReadMode::Dirty, 0, 0);
            let mut got = Vec::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = reader.read_binlog_data(&mut buf).expect("read binlog data");
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[..n]);
            }
            assert_eq!(
                got, expected,
                "reader returned different bytes than were committed"
            );

            engine.close(true);
            drop(engine);
            std::fs::remove_dir_all(&dir).ok();
        });
}
