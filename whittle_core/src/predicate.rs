//! What counts as a failure: the compiled, immutable predicate the oracle
//! classifies every execution against.
//!
//! Four orthogonal conditions, ORed: exit-status set, termination-signal
//! set, watched-fd substrings, and a wall-clock timeout. A timeout is not
//! a failure; a candidate that hangs classifies PASS.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use thiserror::Error;

/// Errors compiling a predicate from user syntax.
#[derive(Error, Debug)]
pub enum PredicateError {
    #[error("invalid exit-status token {0:?}")]
    BadStatusToken(String),
    #[error("exit status {0} is out of range 0..=255")]
    StatusOutOfRange(i64),
    #[error("invalid signal token {0:?}")]
    BadSignalToken(String),
    #[error("signal {0} is out of range 1..=64")]
    SignalOutOfRange(i64),
    #[error("file descriptor {0} cannot be watched")]
    BadWatchedFd(i64),
}

/// A substring watched for on one of the child's file descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteWatch {
    pub fd: i32,
    pub needle: Vec<u8>,
}

/// Raw, user-supplied predicate settings before compilation.
#[derive(Debug, Clone, Default)]
pub struct PredicateSpec {
    /// Comma lists of `N` / `L-H` tokens, optionally `~`-prefixed.
    pub status: Vec<String>,
    /// Comma lists of signal numbers or names; `ANY` means 1..=64.
    pub signals: Vec<String>,
    /// `(fd, substring)` pairs.
    pub writes: Vec<(i32, Vec<u8>)>,
    /// Milliseconds; 0 disables the timeout.
    pub timeout_ms: u64,
    /// Shell-wrapper mode: signals fold into the status set as `s | 0x80`.
    pub shell: bool,
}

/// The compiled failure predicate.
#[derive(Debug, Clone)]
pub struct FailurePredicate {
    status: BTreeSet<u8>,
    signals: BTreeSet<u8>,
    writes: Vec<WriteWatch>,
    timeout: Option<Duration>,
    /// Hook for a future program-counter match clause (debugger attach).
    /// Never populated today.
    #[allow(dead_code)]
    pc_match: Option<u64>,
}

impl FailurePredicate {
    /// Compiles user syntax into the immutable predicate.
    ///
    /// After parsing, shell mode folds each signal `s` into the status set
    /// as `s | 0x80` (the shell wrapper's exit convention) and clears the
    /// signal set. If status, signals, and writes are all still empty, the
    /// status set defaults to any non-zero exit.
    pub fn compile(spec: &PredicateSpec) -> Result<Self, PredicateError> {
        let mut status = parse_status_lists(&spec.status)?;
        let mut signals = parse_signal_lists(&spec.signals)?;

        let mut writes = Vec::with_capacity(spec.writes.len());
        for (fd, needle) in &spec.writes {
            if *fd < 0 {
                return Err(PredicateError::BadWatchedFd(i64::from(*fd)));
            }
            if !needle.is_empty() {
                writes.push(WriteWatch {
                    fd: *fd,
                    needle: needle.clone(),
                });
            }
        }

        if spec.shell {
            for &sig in &signals {
                status.insert(sig | 0x80);
            }
            signals.clear();
        }

        if status.is_empty() && signals.is_empty() && writes.is_empty() {
            status.extend(1..=u8::MAX);
        }

        let timeout = match spec.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Self {
            status,
            signals,
            writes,
            timeout,
            pc_match: None,
        })
    }

    pub fn matches_status(&self, code: i32) -> bool {
        u8::try_from(code).is_ok_and(|c| self.status.contains(&c))
    }

    pub fn matches_signal(&self, signal: i32) -> bool {
        u8::try_from(signal).is_ok_and(|s| self.signals.contains(&s))
    }

    pub fn writes(&self) -> &[WriteWatch] {
        &self.writes
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Distinct watched fds, ascending.
    pub fn watched_fds(&self) -> Vec<i32> {
        let fds: BTreeSet<i32> = self.writes.iter().map(|w| w.fd).collect();
        fds.into_iter().collect()
    }

    /// Longest needle watched on `fd`; 0 when the fd is unwatched.
    pub fn max_needle_len(&self, fd: i32) -> usize {
        self.writes
            .iter()
            .filter(|w| w.fd == fd)
            .map(|w| w.needle.len())
            .max()
            .unwrap_or(0)
    }
}

/// Parses comma lists of `N` / `L-H` tokens with `~` complements into the
/// final status set `S⁺ \ S⁻`. An empty `S⁺` with a non-empty `S⁻` starts
/// from the full 0..=255 range. `H < L` ranges are empty, not errors.
fn parse_status_lists(specs: &[String]) -> Result<BTreeSet<u8>, PredicateError> {
    let mut plus: BTreeSet<u8> = BTreeSet::new();
    let mut minus: BTreeSet<u8> = BTreeSet::new();
    let mut saw_minus = false;

    for spec in specs {
        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (negated, body) = match token.strip_prefix('~') {
                Some(rest) => (true, rest),
                None => (false, token),
            };
            let into = if negated {
                saw_minus = true;
                &mut minus
            } else {
                &mut plus
            };
            match body.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_status_code(lo, token)?;
                    let hi = parse_status_code(hi, token)?;
                    // An inverted range selects nothing.
                    into.extend(lo..=hi);
                }
                None => {
                    into.insert(parse_status_code(body, token)?);
                }
            }
        }
    }

    if plus.is_empty() && saw_minus {
        plus.extend(0..=u8::MAX);
    }
    Ok(&plus - &minus)
}

fn parse_status_code(body: &str, token: &str) -> Result<u8, PredicateError> {
    let value: i64 = body
        .trim()
        .parse()
        .map_err(|_| PredicateError::BadStatusToken(token.to_owned()))?;
    u8::try_from(value).map_err(|_| PredicateError::StatusOutOfRange(value))
}

/// Parses comma lists of signal numbers or names. `SIGSEGV` and `SEGV` are
/// both accepted; `ANY` expands to 1..=64; `~` complements as for statuses.
fn parse_signal_lists(specs: &[String]) -> Result<BTreeSet<u8>, PredicateError> {
    let mut plus: BTreeSet<u8> = BTreeSet::new();
    let mut minus: BTreeSet<u8> = BTreeSet::new();
    let mut saw_minus = false;

    for spec in specs {
        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (negated, body) = match token.strip_prefix('~') {
                Some(rest) => (true, rest),
                None => (false, token),
            };
            let into = if negated {
                saw_minus = true;
                &mut minus
            } else {
                &mut plus
            };
            if body.eq_ignore_ascii_case("ANY") {
                into.extend(1..=64u8);
            } else {
                into.insert(parse_signal(body, token)?);
            }
        }
    }

    if plus.is_empty() && saw_minus {
        plus.extend(1..=64u8);
    }
    Ok(&plus - &minus)
}

fn parse_signal(body: &str, token: &str) -> Result<u8, PredicateError> {
    if let Ok(value) = body.parse::<i64>() {
        if !(1..=64).contains(&value) {
            return Err(PredicateError::SignalOutOfRange(value));
        }
        return Ok(value as u8);
    }
    let upper = body.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    let signal = Signal::from_str(&name)
        .map_err(|_| PredicateError::BadSignalToken(token.to_owned()))?;
    Ok(signal as i32 as u8)
}
