//! `CASTLE_DEBUG` trace-category parsing and sink setup (§6.4, §10.1).
//!
//! Distinct from the `log` facade used for the library's own operational logging: this is a
//! second, opt-in channel for dumping raw request/response traffic, matching the source's
//! own separate debug-trace mechanism. Categories are parsed once at connect time; an
//! unrecognised category name is logged and ignored rather than rejected, since a newer
//! client talking to an older engine (or vice versa) should not refuse to connect over it.

use std::io::Write;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Mutex;

use castle_proto::constants::{ENV_DEBUG, ENV_DEBUG_FD, ENV_DEBUG_FILE};
use castle_proto::Response;

mod categories {
    pub const REQS: u8 = 1 << 0;
    pub const VALUES: u8 = 1 << 1;
    pub const STATS: u8 = 1 << 2;
    pub const RESPS: u8 = 1 << 3;
}

fn parse_categories(spec: &str) -> u8 {
    let mut mask = 0u8;
    for token in spec.split(',') {
        match token.trim() {
            "reqs" => mask |= categories::REQS,
            "values" => mask |= categories::VALUES,
            "stats" => mask |= categories::STATS,
            "resps" => mask |= categories::RESPS,
            "" => {}
            other => log::warn!("unrecognised {ENV_DEBUG} category {other:?}, ignoring"),
        }
    }
    mask
}

fn open_sink() -> Option<std::fs::File> {
    if let Ok(path) = std::env::var(ENV_DEBUG_FILE) {
        return match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                log::warn!("failed to open {ENV_DEBUG_FILE}={path}: {e}");
                None
            }
        };
    }
    if let Ok(fd_str) = std::env::var(ENV_DEBUG_FD) {
        return match fd_str.parse::<RawFd>() {
            Ok(fd) => Some(unsafe { std::fs::File::from_raw_fd(fd) }),
            Err(e) => {
                log::warn!("failed to parse {ENV_DEBUG_FD}={fd_str}: {e}");
                None
            }
        };
    }
    let dup = unsafe { libc::dup(libc::STDERR_FILENO) };
    if dup < 0 {
        log::warn!("failed to dup stderr for trace sink: {}", std::io::Error::last_os_error());
        return None;
    }
    Some(unsafe { std::fs::File::from_raw_fd(dup) })
}

/// Parsed `CASTLE_DEBUG` configuration: which categories are enabled and where their output
/// goes.
pub struct TraceConfig {
    categories: u8,
    sink: Mutex<std::fs::File>,
}

impl TraceConfig {
    /// Reads `CASTLE_DEBUG`/`CASTLE_DEBUG_FILE`/`CASTLE_DEBUG_FD` from the environment.
    /// Returns `None` if tracing is not enabled (`CASTLE_DEBUG` unset or empty).
    pub fn from_env() -> Option<Self> {
        let spec = std::env::var(ENV_DEBUG).ok()?;
        let categories = parse_categories(&spec);
        if categories == 0 {
            return None;
        }
        let sink = open_sink()?;
        Some(TraceConfig { categories, sink: Mutex::new(sink) })
    }

    pub fn traces_responses(&self) -> bool {
        self.categories & categories::RESPS != 0
    }

    pub fn trace_response(&self, resp: &Response) {
        if !self.traces_responses() {
            return;
        }
        let mut sink = self.sink.lock().expect("trace sink mutex poisoned");
        let _ = writeln!(
            sink,
            "resp call_id={} err={} length={} token={}",
            resp.call_id, resp.err, resp.length, resp.token
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_categories() {
        let mask = parse_categories("reqs,resps");
        assert_eq!(mask, categories::REQS | categories::RESPS);
    }

    #[test]
    fn unrecognised_category_is_ignored_not_rejected() {
        let mask = parse_categories("reqs,bogus");
        assert_eq!(mask, categories::REQS);
    }

    #[test]
    fn empty_spec_enables_nothing() {
        assert_eq!(parse_categories(""), 0);
    }
}
