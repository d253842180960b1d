//! `AMQP_TRACE` tracing hooks.
//!
//! The variable holds space-separated category names: `raw` (bytes in
//! and out), `frm` (frames in and out), `ops` (broker operations), and
//! `err` (errors, on unless explicitly unset). Enabled categories emit
//! `tracing` events on targets under `hematite::`; the broker binary
//! installs a stderr subscriber.

use std::fmt;

/// Which trace categories are enabled for one peer
#[derive(Debug, Clone, Copy)]
pub struct Trace {
    /// Raw bytes each direction
    pub raw: bool,
    /// Decoded frames each direction
    pub frm: bool,
    /// Broker operations
    pub ops: bool,
    /// Errors
    pub err: bool,
}

impl Default for Trace {
    fn default() -> Self {
        Trace {
            raw: false,
            frm: false,
            ops: false,
            err: true,
        }
    }
}

/// Direction tag used in trace output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// Bytes or frames received
    Recv,
    /// Bytes or frames sent
    Sent,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dir::Recv => f.write_str("RECV"),
            Dir::Sent => f.write_str("SENT"),
        }
    }
}

impl Trace {
    /// Reads `AMQP_TRACE` from the environment
    pub fn from_env() -> Self {
        match std::env::var("AMQP_TRACE") {
            Ok(names) => Self::from_categories(&names),
            Err(_) => Self::default(),
        }
    }

    /// Parses a space-separated category list
    pub fn from_categories(names: &str) -> Self {
        let mut trace = Trace::default();
        for name in names.split_whitespace() {
            match name {
                "raw" => trace.raw = true,
                "frm" => trace.frm = true,
                "ops" => trace.ops = true,
                "err" => trace.err = true,
                _ => {}
            }
        }
        trace
    }

    /// Raw byte trace
    pub fn raw(&self, id: &str, dir: Dir, bytes: &[u8]) {
        if self.raw {
            tracing::trace!(target: "hematite::raw", "[{id} raw] {dir}: {bytes:02x?}");
        }
    }

    /// Frame trace
    pub fn frm(&self, id: &str, dir: Dir, channel: u16, body: &dyn fmt::Debug) {
        if self.frm {
            tracing::trace!(target: "hematite::frm", "[{id} frm] {dir}[{channel}]: {body:?}");
        }
    }

    /// Broker operation trace
    pub fn ops(&self, id: &str, what: fmt::Arguments<'_>) {
        if self.ops {
            tracing::debug!(target: "hematite::ops", "[{id} ops] {what}");
        }
    }

    /// Error trace
    pub fn err(&self, id: &str, what: &dyn fmt::Display) {
        if self.err {
            tracing::error!(target: "hematite::err", "[{id} err] {what}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Trace;

    #[test]
    fn parses_categories() {
        let trace = Trace::from_categories("raw frm");
        assert!(trace.raw && trace.frm && !trace.ops);
        assert!(trace.err, "err stays on by default");
    }

    #[test]
    fn empty_enables_only_err() {
        let trace = Trace::from_categories("");
        assert!(!trace.raw && !trace.frm && !trace.ops && trace.err);
    }
}
