//! Deciding whether a candidate still reproduces the failure.
//!
//! [`CommandOracle`] materializes the candidate, expands the command
//! template, runs the subject in its own session under the failure
//! predicate, and classifies the execution FAIL or PASS. Child processes,
//! pipes, and temp files are released on every exit path; the whole call is
//! bounded by the predicate's timeout plus kill-and-reap epsilon.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Instant;

use log::{debug, info};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe, Pid};
use thiserror::Error;

use crate::chunkset::ChunkSet;
use crate::materialize::Materializer;
use crate::predicate::FailurePredicate;
use crate::template::{CommandTemplate, TemplateError};

/// Exit status shells report when exec fails. Spawn errors that mean "the
/// subject could not be started" classify through this code, so they only
/// count as failures if the user's status set says so.
const EXEC_FAILURE_STATUS: i32 = 127;

/// The oracle's answer for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The candidate still reproduces the failure.
    Fail,
    /// The candidate does not reproduce (including timeouts).
    Pass,
}

impl Verdict {
    pub fn is_fail(self) -> bool {
        matches!(self, Verdict::Fail)
    }
}

/// A verdict plus how it was reached. Timeouts always classify PASS, but
/// the engine counts them separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOutcome {
    pub verdict: Verdict,
    /// The subject hit the wall-clock deadline and was group-killed.
    pub timed_out: bool,
}

impl From<Verdict> for QueryOutcome {
    fn from(verdict: Verdict) -> Self {
        Self {
            verdict,
            timed_out: false,
        }
    }
}

/// Errors the oracle cannot classify away: broken plumbing, not a broken
/// subject.
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("failed to materialize candidate: {0}")]
    Materialize(#[source] io::Error),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("failed to set up child pipes: {0}")]
    Pipe(#[source] io::Error),
    #[error("failed to spawn subject: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed supervising subject: {0}")]
    Supervise(#[source] io::Error),
}

/// A boolean procedure over candidates.
///
/// The engine only ever sees this seam; tests drive it through
/// [`FnOracle`] while production uses [`CommandOracle`].
pub trait Oracle {
    fn query(&mut self, candidate: &ChunkSet) -> Result<QueryOutcome, OracleError>;
}

/// Adapter turning a closure into an [`Oracle`], for in-process checks and
/// test harnesses. Closure verdicts never time out.
pub struct FnOracle<F>(pub F);

impl<F> Oracle for FnOracle<F>
where
    F: FnMut(&ChunkSet) -> Result<Verdict, OracleError>,
{
    fn query(&mut self, candidate: &ChunkSet) -> Result<QueryOutcome, OracleError> {
        (self.0)(candidate).map(QueryOutcome::from)
    }
}

/// Sliding substring search over one stream, keeping only enough overlap to
/// catch needles split across reads.
#[derive(Debug)]
struct SubstringWindow {
    needles: Vec<Vec<u8>>,
    window: Vec<u8>,
    keep: usize,
}

impl SubstringWindow {
    fn new(needles: Vec<Vec<u8>>) -> Self {
        let keep = needles.iter().map(Vec::len).max().unwrap_or(1) - 1;
        Self {
            needles,
            window: Vec::new(),
            keep,
        }
    }

    /// Appends `bytes` and reports whether any needle is now visible.
    fn push_and_scan(&mut self, bytes: &[u8]) -> bool {
        self.window.extend_from_slice(bytes);
        if self
            .needles
            .iter()
            .any(|needle| contains(&self.window, needle))
        {
            return true;
        }
        if self.window.len() > self.keep {
            let cut = self.window.len() - self.keep;
            self.window.drain(..cut);
        }
        false
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.len() <= haystack.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// One watched child fd: the parent's read end plus the match state.
#[derive(Debug)]
struct Watch {
    target: RawFd,
    reader: File,
    scanner: SubstringWindow,
    open: bool,
}

/// Runs candidates under the failure predicate.
pub struct CommandOracle {
    template: CommandTemplate,
    predicate: FailurePredicate,
    materializer: Materializer,
}

impl CommandOracle {
    pub fn new(
        template: CommandTemplate,
        predicate: FailurePredicate,
        materializer: Materializer,
    ) -> Self {
        Self {
            template,
            predicate,
            materializer,
        }
    }

    pub fn predicate(&self) -> &FailurePredicate {
        &self.predicate
    }

    /// Materializes a chunk set in memory (for writing the final result).
    pub fn extract(&mut self, chunks: &ChunkSet) -> Result<Vec<u8>, OracleError> {
        self.materializer
            .extract(chunks)
            .map_err(OracleError::Materialize)
    }

    fn run(&mut self, argv: &[OsString], case_path: &Path) -> Result<QueryOutcome, OracleError> {
        let watched_fds = self.predicate.watched_fds();
        // Write ends live above stderr and above every watched fd so that
        // neither the standard fd setup nor the dup2 loop in the child can
        // clobber a pipe before it is installed.
        let relocate_above = watched_fds.iter().copied().max().unwrap_or(0).max(2) + 1;

        // One pipe per distinct watched fd.
        let mut watches: Vec<Watch> = Vec::with_capacity(watched_fds.len());
        let mut write_ends: Vec<(OwnedFd, RawFd)> = Vec::with_capacity(watched_fds.len());
        for target in watched_fds {
            let (read_end, write_end) =
                pipe().map_err(|e| OracleError::Pipe(io::Error::from(e)))?;
            let write_end =
                raise_fd(write_end, relocate_above).map_err(OracleError::Pipe)?;
            let reader = File::from(read_end);
            set_nonblocking(reader.as_raw_fd()).map_err(OracleError::Pipe)?;
            let needles: Vec<Vec<u8>> = self
                .predicate
                .writes()
                .iter()
                .filter(|w| w.fd == target)
                .map(|w| w.needle.clone())
                .collect();
            watches.push(Watch {
                target,
                reader,
                scanner: SubstringWindow::new(needles),
                open: true,
            });
            write_ends.push((write_end, target));
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if self.template.stdin_input() {
            let case = File::open(case_path).map_err(OracleError::Spawn)?;
            cmd.stdin(Stdio::from(case));
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let dup_pairs: Vec<(RawFd, RawFd)> = write_ends
            .iter()
            .map(|(fd, target)| (fd.as_raw_fd(), *target))
            .collect();
        let read_ends: Vec<RawFd> = watches.iter().map(|w| w.reader.as_raw_fd()).collect();
        // Runs in the forked child between fork and exec: only
        // async-signal-safe calls.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                for &fd in &read_ends {
                    libc::close(fd);
                }
                for &(write_fd, target) in &dup_pairs {
                    if libc::dup2(write_fd, target) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                for &(write_fd, _) in &dup_pairs {
                    libc::close(write_fd);
                }
                Ok(())
            });
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound
                        | io::ErrorKind::PermissionDenied
                        | io::ErrorKind::InvalidInput
                ) =>
            {
                // The subject never started; observably the same as the
                // child exiting with the shell's exec-failure status.
                debug!("subject failed to start ({err}); classifying as exit {EXEC_FAILURE_STATUS}");
                return Ok(self.classify_status_only(EXEC_FAILURE_STATUS).into());
            }
            Err(err) => return Err(OracleError::Spawn(err)),
        };
        // Parent side: the child owns the write ends now.
        drop(write_ends);

        let mut guard = ChildGuard::new(child);
        let deadline = self.predicate.timeout().map(|t| Instant::now() + t);

        let (matched, mut timed_out) =
            supervise_watches(&mut watches, deadline).map_err(OracleError::Supervise)?;
        if matched || timed_out {
            guard.kill_group();
        }

        let reap_deadline = if matched || timed_out { None } else { deadline };
        let (status, reap_timed_out) = guard.reap(reap_deadline).map_err(OracleError::Supervise)?;
        timed_out |= reap_timed_out;

        let verdict = if matched {
            Verdict::Fail
        } else if timed_out {
            info!("subject timed out; classifying PASS");
            Verdict::Pass
        } else {
            self.classify_exit(status)
        };
        Ok(QueryOutcome { verdict, timed_out })
    }

    fn classify_exit(&self, status: ExitStatus) -> Verdict {
        if let Some(code) = status.code() {
            return self.classify_status_only(code);
        }
        if let Some(signal) = status.signal() {
            if self.predicate.matches_signal(signal) {
                return Verdict::Fail;
            }
        }
        Verdict::Pass
    }

    fn classify_status_only(&self, code: i32) -> Verdict {
        if self.predicate.matches_status(code) {
            Verdict::Fail
        } else {
            Verdict::Pass
        }
    }
}

impl Oracle for CommandOracle {
    fn query(&mut self, candidate: &ChunkSet) -> Result<QueryOutcome, OracleError> {
        // The TempPath unlinks the candidate file when this frame unwinds,
        // on success and error alike.
        let case_path = self
            .materializer
            .write(candidate)
            .map_err(OracleError::Materialize)?;
        let contents = if self.template.needs_contents() {
            Some(
                self.materializer
                    .extract(candidate)
                    .map_err(OracleError::Materialize)?,
            )
        } else {
            None
        };
        let argv = self.template.expand(&case_path, contents.as_deref())?;
        let outcome = self.run(&argv, &case_path)?;
        debug!(
            "candidate of {} bytes in {} chunks -> {:?}",
            candidate.size(),
            candidate.len(),
            outcome.verdict
        );
        Ok(outcome)
    }
}

/// Waits on the watched fds until a needle matches, every fd reaches EOF,
/// or the deadline expires. Returns `(matched, timed_out)`.
fn supervise_watches(
    watches: &mut [Watch],
    deadline: Option<Instant>,
) -> io::Result<(bool, bool)> {
    while watches.iter().any(|w| w.open) {
        let timeout = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Ok((false, true));
                }
                let ms = (d - now).as_millis().min(u128::from(u16::MAX)) as u16;
                PollTimeout::from(ms.max(1))
            }
            None => PollTimeout::NONE,
        };

        let open: Vec<usize> = (0..watches.len()).filter(|&i| watches[i].open).collect();
        let mut poll_fds: Vec<PollFd> = open
            .iter()
            .map(|&i| PollFd::new(watches[i].reader.as_fd(), PollFlags::POLLIN))
            .collect();
        let ready = match poll(&mut poll_fds, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        };
        let readable: Vec<usize> = poll_fds
            .iter()
            .zip(&open)
            .filter(|(pfd, _)| {
                pfd.revents().is_some_and(|r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                })
            })
            .map(|(_, &i)| i)
            .collect();
        drop(poll_fds);
        if ready == 0 {
            // Timeout slice elapsed; the deadline check at the top decides.
            continue;
        }

        for i in readable {
            if drain_watch(&mut watches[i])? {
                return Ok((true, false));
            }
        }
    }
    Ok((false, false))
}

/// Reads everything currently available on one watch. Returns true on a
/// substring match.
fn drain_watch(watch: &mut Watch) -> io::Result<bool> {
    let mut buf = [0u8; 4096];
    loop {
        match watch.reader.read(&mut buf) {
            Ok(0) => {
                watch.open = false;
                return Ok(false);
            }
            Ok(n) => {
                if watch.scanner.push_and_scan(&buf[..n]) {
                    debug!("matched watched substring on fd {}", watch.target);
                    return Ok(true);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Owns the child through supervision; kills and reaps the whole process
/// group if dropped before a clean reap.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn kill_group(&self) {
        // The child called setsid, so its pid names the whole group. ESRCH
        // just means everything already exited.
        let _ = killpg(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL);
    }

    /// Waits for the child, killing the group first if `deadline` expires.
    /// Returns the exit status and whether the deadline was hit. Without a
    /// deadline the wait is unbounded (the caller either killed the group
    /// already or configured no timeout).
    fn reap(&mut self, deadline: Option<Instant>) -> io::Result<(ExitStatus, bool)> {
        let mut timed_out = false;
        let status = match deadline {
            None => self.child.wait()?,
            Some(d) => loop {
                if let Some(status) = self.child.try_wait()? {
                    break status;
                }
                if Instant::now() >= d {
                    timed_out = true;
                    self.kill_group();
                    break self.child.wait()?;
                }
                std::thread::sleep(std::time::Duration::from_millis(2));
            },
        };
        self.reaped = true;
        Ok((status, timed_out))
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill_group();
            let _ = self.child.wait();
        }
    }
}

fn raise_fd(fd: OwnedFd, min: RawFd) -> io::Result<OwnedFd> {
    if fd.as_raw_fd() >= min {
        return Ok(fd);
    }
    let raised = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD, min) };
    if raised < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raised) })
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::PredicateSpec;
    use crate::source::Source;
    use std::io::Write as _;

    fn oracle_for(input: &[u8], template: &str, spec: PredicateSpec) -> CommandOracle {
        let mut tmp = tempfile::tempfile().expect("failed to create temp input");
        tmp.write_all(input).expect("failed to seed input");
        let source = Source::from_file(tmp).expect("seekable");
        let materializer = Materializer::new(source).expect("temp dir");
        let template =
            CommandTemplate::parse(template, spec.shell, false).expect("template must parse");
        let predicate = FailurePredicate::compile(&spec).expect("predicate must compile");
        CommandOracle::new(template, predicate, materializer)
    }

    #[test]
    fn window_matches_needle_split_across_reads() {
        let mut scanner = SubstringWindow::new(vec![b"hello".to_vec()]);
        assert!(!scanner.push_and_scan(b"xx hel"));
        assert!(scanner.push_and_scan(b"lo yy"));
    }

    #[test]
    fn window_discards_bytes_that_cannot_start_a_match() {
        let mut scanner = SubstringWindow::new(vec![b"abc".to_vec()]);
        for _ in 0..1000 {
            assert!(!scanner.push_and_scan(b"xyzw"));
        }
        assert!(scanner.window.len() <= 2);
    }

    #[test]
    fn exit_status_in_the_set_is_a_failure() {
        let mut oracle = oracle_for(
            b"ignored",
            "sh -c 'exit 42'",
            PredicateSpec {
                status: vec!["42".into()],
                ..PredicateSpec::default()
            },
        );
        assert_eq!(
            oracle.query(&ChunkSet::whole(7)).expect("query").verdict,
            Verdict::Fail
        );
    }

    #[test]
    fn exit_status_outside_the_set_passes() {
        let mut oracle = oracle_for(
            b"ignored",
            "sh -c 'exit 3'",
            PredicateSpec {
                status: vec!["42".into()],
                ..PredicateSpec::default()
            },
        );
        assert_eq!(
            oracle.query(&ChunkSet::whole(7)).expect("query").verdict,
            Verdict::Pass
        );
    }

    #[test]
    fn termination_signal_in_the_set_is_a_failure() {
        let mut oracle = oracle_for(
            b"ignored",
            "sh -c 'kill -9 $$'",
            PredicateSpec {
                signals: vec!["SIGKILL".into()],
                ..PredicateSpec::default()
            },
        );
        assert_eq!(
            oracle.query(&ChunkSet::whole(7)).expect("query").verdict,
            Verdict::Fail
        );
    }

    #[test]
    fn watched_substring_on_stdout_is_a_failure_and_kills_the_subject() {
        let mut oracle = oracle_for(
            b"ignored",
            "sh -c 'echo boom; exec sleep 10'",
            PredicateSpec {
                writes: vec![(1, b"boom".to_vec())],
                timeout_ms: 30_000,
                ..PredicateSpec::default()
            },
        );
        let started = Instant::now();
        assert_eq!(
            oracle.query(&ChunkSet::whole(7)).expect("query").verdict,
            Verdict::Fail
        );
        assert!(
            started.elapsed() < std::time::Duration::from_secs(5),
            "match must kill the subject instead of waiting it out"
        );
    }

    #[test]
    fn clean_exit_without_the_substring_passes() {
        let mut oracle = oracle_for(
            b"ignored",
            "sh -c 'echo fine'",
            PredicateSpec {
                writes: vec![(1, b"boom".to_vec())],
                ..PredicateSpec::default()
            },
        );
        assert_eq!(
            oracle.query(&ChunkSet::whole(7)).expect("query").verdict,
            Verdict::Pass
        );
    }

    #[test]
    fn timeout_classifies_pass() {
        let mut oracle = oracle_for(
            b"ignored",
            "sh -c 'sleep 30'",
            PredicateSpec {
                status: vec!["1".into()],
                timeout_ms: 50,
                ..PredicateSpec::default()
            },
        );
        let started = Instant::now();
        let outcome = oracle.query(&ChunkSet::whole(7)).expect("query");
        assert_eq!(outcome.verdict, Verdict::Pass);
        assert!(outcome.timed_out, "the deadline must be reported");
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn prompt_exits_do_not_report_a_timeout() {
        let mut oracle = oracle_for(
            b"ignored",
            "sh -c 'exit 1'",
            PredicateSpec {
                timeout_ms: 30_000,
                ..PredicateSpec::default()
            },
        );
        let outcome = oracle.query(&ChunkSet::whole(7)).expect("query");
        assert_eq!(outcome.verdict, Verdict::Fail);
        assert!(!outcome.timed_out);
    }

    #[test]
    fn candidate_bytes_reach_the_subject_file() {
        let mut oracle = oracle_for(
            b"needleXXX",
            "grep -q needle @",
            PredicateSpec {
                status: vec!["0".into()],
                ..PredicateSpec::default()
            },
        );
        // Whole input contains the word.
        assert_eq!(
            oracle.query(&ChunkSet::whole(9)).expect("query").verdict,
            Verdict::Fail
        );
        // The tail alone does not.
        let tail = ChunkSet::from_chunks(vec![crate::chunkset::Chunk::new(6, 9)]);
        assert_eq!(oracle.query(&tail).expect("query").verdict, Verdict::Pass);
    }

    #[test]
    fn stdin_mode_feeds_the_candidate_on_fd_zero() {
        let mut oracle = oracle_for(
            b"hello\n",
            "sh -c 'read x; test \"$x\" = hello' <@",
            PredicateSpec {
                status: vec!["0".into()],
                ..PredicateSpec::default()
            },
        );
        assert_eq!(
            oracle.query(&ChunkSet::whole(6)).expect("query").verdict,
            Verdict::Fail
        );
    }

    #[test]
    fn missing_subject_classifies_through_the_status_rules() {
        let mut oracle = oracle_for(
            b"ignored",
            "/definitely/not/a/real/binary",
            PredicateSpec {
                status: vec!["42".into()],
                ..PredicateSpec::default()
            },
        );
        assert_eq!(
            oracle.query(&ChunkSet::whole(7)).expect("query").verdict,
            Verdict::Pass
        );
    }
}
