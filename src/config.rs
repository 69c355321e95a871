use std::path::PathBuf;

use clap::Parser;

use crate::fsp0binlog::BinlogConfig;
use crate::univ;
use crate::ut0ut::UT_IS_2POW;

/// Longest path the file layer accepts.
pub const OS_FILE_MAX_PATH: usize = 4000;
/// Room that must remain for a file name within the path bound.
pub const NAME_MAX: usize = 255;

/// Recognized engine options for the binlog storage core.
#[derive(Parser, Debug)]
pub struct Config {
    #[clap(
        long = "binlog-directory",
        help = "Directory holding the binlog tablespace files; defaults to the current directory"
    )]
    pub binlog_directory: Option<PathBuf>,

    #[clap(
        long = "max-binlog-size",
        default_value = "1073741824",
        help = "Size of each binlog tablespace file, in bytes"
    )]
    pub max_binlog_size: u64,

    #[clap(
        long = "binlog-state-interval",
        default_value = "1048576",
        help = "Spacing of differential GTID state snapshots, in bytes; a power of two >= the page size"
    )]
    pub binlog_state_interval: u64,

    #[clap(long = "page-size", default_value = "16384")]
    pub page_size: u32,

    #[clap(
        long = "flush-log-at-trx-commit",
        default_value = "1",
        help = "0: no redo flush at commit; 1: durable flush; 2: write without sync"
    )]
    pub flush_log_at_trx_commit: u8,

    #[clap(long = "force-recovery", default_value = "false")]
    pub force_recovery: bool,

    #[clap(
        long = "max-binlog-total-size",
        default_value = "0",
        help = "Autopurge binlogs above this total size, in bytes; 0 disables"
    )]
    pub max_binlog_total_size: u64,

    #[clap(
        long = "binlog-expire-log-seconds",
        default_value = "0",
        help = "Autopurge binlogs older than this; 0 disables"
    )]
    pub binlog_expire_log_seconds: u64,
}

impl Config {
    /// Validate and clamp the options into the runtime binlog
    /// configuration.
    pub fn to_binlog_config(&self) -> std::io::Result<BinlogConfig> {
        let page_size_shift = univ::page_size_shift(self.page_size);
        let page_size = 1u64 << page_size_shift;

        // max_binlog_size is clamped to [4 pages, u32::MAX + 1 pages).
        let mut pages = self.max_binlog_size >> page_size_shift;
        if pages > u32::MAX as u64 {
            log::warn!(
                "requested max_binlog_size is larger than the maximum tablespace size, \
                 truncated to {}",
                (u32::MAX as u64) << page_size_shift
            );
            pages = u32::MAX as u64;
        } else if pages < 4 {
            log::warn!(
                "requested max_binlog_size is smaller than the minimum supported size, \
                 raised to {}",
                4 * page_size
            );
            pages = 4;
        }

        if self.binlog_state_interval < page_size
            || !UT_IS_2POW(
                u32::try_from(self.binlog_state_interval >> page_size_shift)
                    .map_err(|_| invalid("binlog-state-interval out of range"))?,
            )
        {
            return Err(invalid(
                "binlog-state-interval must be a power of two and at least the page size",
            ));
        }

        if !(0..=2).contains(&self.flush_log_at_trx_commit) {
            return Err(invalid("flush-log-at-trx-commit must be 0, 1 or 2"));
        }

        let directory = self
            .binlog_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        if directory.as_os_str().len() > OS_FILE_MAX_PATH - NAME_MAX {
            return Err(invalid("binlog-directory path is too long"));
        }

        Ok(BinlogConfig {
            directory,
            page_size_shift,
            size_in_pages: pages as u32,
            state_interval_pages: self.binlog_state_interval >> page_size_shift,
            flush_log_at_trx_commit: self.flush_log_at_trx_commit,
            force_recovery: self.force_recovery,
            max_total_size: self.max_binlog_total_size,
            expire_seconds: self.binlog_expire_log_seconds,
        })
    }
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, msg)
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::Config;

    #[test]
    fn test_defaults_validate() {
        let config = Config::parse_from(["test"]);
        let cfg = config.to_binlog_config().unwrap();
        assert_eq!(cfg.page_size_shift, 14);
        assert_eq!(cfg.size_in_pages, 65536);
        assert_eq!(cfg.state_interval_pages, 64);
    }

    #[test]
    fn test_small_size_clamped() {
        let config = Config::parse_from(["test", "--max-binlog-size", "1000"]);
        let cfg = config.to_binlog_config().unwrap();
        assert_eq!(cfg.size_in_pages, 4);
    }

    #[test]
    fn test_bad_state_interval_rejected() {
        let config = Config::parse_from(["test", "--binlog-state-interval", "100000"]);
        assert!(config.to_binlog_config().is_err());
    }

    #[test]
    fn test_overlong_directory_rejected() {
        let long = format!("/{}", "d".repeat(super::OS_FILE_MAX_PATH));
        let config = Config::parse_from(["test", "--binlog-directory", &long]);
        assert!(config.to_binlog_config().is_err());
    }
}
