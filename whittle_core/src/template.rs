//! The user's command template, parsed once and expanded per candidate.
//!
//! Grammar (argv mode): space separates arguments; `\c` escapes (`\\`,
//! `\'`, `\"`, `\n`, `\r`, `\t`, `\@` recognized, anything else passes
//! through as the two characters `\c`); `'…'` and `"…"` group runs and are
//! stripped; `@` expands to the candidate file path and `@@` to its
//! contents; a template that never mentions the candidate gets the path
//! appended as a trailing argument; a trailing `<@` instead feeds the
//! candidate on stdin.
//!
//! In shell mode the whole template becomes the second argument to
//! `sh -c`: quotes are preserved with internal quotes and backslashes
//! backslash-escaped, and `@@` contents are single-quoted with the
//! `'\''` idiom (a NUL byte in the contents is an error there).

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::path::Path;

use thiserror::Error;

/// Errors from template parsing or expansion.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("command template is empty")]
    Empty,
    #[error("unterminated {0}-quoted string in command template")]
    UnterminatedQuote(char),
    #[error("candidate contents contain a NUL byte and cannot be spliced into a shell command")]
    NulInContents,
    #[error("template requires candidate contents but none were supplied")]
    ContentsRequired,
}

/// One substitutable piece of an argument.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Lit(Vec<u8>),
    /// `@`: the absolute candidate file path.
    Path,
    /// `@@`: the candidate file contents.
    Contents,
}

#[derive(Debug, Clone, Default)]
struct ArgSpec {
    pieces: Vec<Piece>,
}

impl ArgSpec {
    fn push_byte(&mut self, b: u8) {
        if let Some(Piece::Lit(lit)) = self.pieces.last_mut() {
            lit.push(b);
        } else {
            self.pieces.push(Piece::Lit(vec![b]));
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push_byte(b);
        }
    }
}

/// A parsed command template.
///
/// Parsing happens once per run; [`CommandTemplate::expand`] is called per
/// candidate and never re-parses.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    /// Argv mode: one spec per argument. Shell mode: exactly one spec
    /// holding the whole `sh -c` string.
    args: Vec<ArgSpec>,
    shell: bool,
    stdin_input: bool,
    /// Whether any `@`/`@@` token appeared.
    substitutes: bool,
}

impl CommandTemplate {
    /// Parses `raw`. `stdin_input` forces stdin delivery (the
    /// `--write-to-stdin` flag); a trailing `<@` in argv mode does the same.
    pub fn parse(raw: &str, shell: bool, stdin_input: bool) -> Result<Self, TemplateError> {
        let mut raw = raw.trim();
        let mut stdin_input = stdin_input;
        if !shell {
            if let Some(stripped) = raw.strip_suffix("<@") {
                raw = stripped.trim_end();
                stdin_input = true;
            }
        }
        if raw.is_empty() {
            return Err(TemplateError::Empty);
        }

        let mut template = if shell {
            Self::parse_shell(raw)?
        } else {
            Self::parse_argv(raw)?
        };
        template.stdin_input = stdin_input;
        if template.args.is_empty() {
            return Err(TemplateError::Empty);
        }
        Ok(template)
    }

    fn parse_argv(raw: &str) -> Result<Self, TemplateError> {
        let bytes = raw.as_bytes();
        let mut args: Vec<ArgSpec> = Vec::new();
        let mut current = ArgSpec::default();
        let mut started = false;
        let mut substitutes = false;
        let mut quote: Option<u8> = None;
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];
            match b {
                b'\\' => {
                    started = true;
                    i += 1;
                    match bytes.get(i) {
                        Some(&(c @ (b'\\' | b'\'' | b'"' | b'@'))) => current.push_byte(c),
                        Some(b'n') => current.push_byte(b'\n'),
                        Some(b'r') => current.push_byte(b'\r'),
                        Some(b't') => current.push_byte(b'\t'),
                        Some(&c) => current.push_bytes(&[b'\\', c]),
                        None => current.push_byte(b'\\'),
                    }
                }
                b'\'' | b'"' => match quote {
                    Some(q) if q == b => quote = None,
                    Some(_) => current.push_byte(b),
                    None => {
                        quote = Some(b);
                        started = true;
                    }
                },
                b' ' if quote.is_none() => {
                    if started {
                        args.push(std::mem::take(&mut current));
                        started = false;
                    }
                }
                b'@' => {
                    started = true;
                    if bytes.get(i + 1) == Some(&b'@') {
                        current.pieces.push(Piece::Contents);
                        i += 1;
                    } else {
                        current.pieces.push(Piece::Path);
                    }
                    substitutes = true;
                }
                _ => {
                    started = true;
                    current.push_byte(b);
                }
            }
            i += 1;
        }
        if let Some(q) = quote {
            return Err(TemplateError::UnterminatedQuote(q as char));
        }
        if started {
            args.push(current);
        }

        Ok(Self {
            args,
            shell: false,
            stdin_input: false,
            substitutes,
        })
    }

    fn parse_shell(raw: &str) -> Result<Self, TemplateError> {
        let bytes = raw.as_bytes();
        let mut spec = ArgSpec::default();
        let mut substitutes = false;
        let mut quote: Option<u8> = None;
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];
            match b {
                b'\\' => {
                    i += 1;
                    match bytes.get(i) {
                        // Recognized escapes resolve, then get re-protected
                        // for the shell where needed.
                        Some(&(c @ (b'\\' | b'\'' | b'"'))) => spec.push_bytes(&[b'\\', c]),
                        Some(b'@') => spec.push_byte(b'@'),
                        Some(b'n') => spec.push_byte(b'\n'),
                        Some(b'r') => spec.push_byte(b'\r'),
                        Some(b't') => spec.push_byte(b'\t'),
                        Some(&c) => spec.push_bytes(&[b'\\', c]),
                        None => spec.push_byte(b'\\'),
                    }
                }
                b'\'' | b'"' => match quote {
                    Some(q) if q == b => {
                        quote = None;
                        spec.push_byte(b);
                    }
                    Some(_) => spec.push_bytes(&[b'\\', b]),
                    None => {
                        quote = Some(b);
                        spec.push_byte(b);
                    }
                },
                b'@' => {
                    if bytes.get(i + 1) == Some(&b'@') {
                        spec.pieces.push(Piece::Contents);
                        i += 1;
                    } else {
                        spec.pieces.push(Piece::Path);
                    }
                    substitutes = true;
                }
                _ => spec.push_byte(b),
            }
            i += 1;
        }
        if let Some(q) = quote {
            return Err(TemplateError::UnterminatedQuote(q as char));
        }

        Ok(Self {
            args: vec![spec],
            shell: true,
            stdin_input: false,
            substitutes,
        })
    }

    /// Whether the candidate is fed on the child's stdin.
    pub fn stdin_input(&self) -> bool {
        self.stdin_input
    }

    /// Whether expansion needs the candidate contents (`@@` present).
    pub fn needs_contents(&self) -> bool {
        self.args
            .iter()
            .any(|a| a.pieces.iter().any(|p| *p == Piece::Contents))
    }

    /// Builds the argv for one candidate. `contents` must be `Some` when
    /// [`CommandTemplate::needs_contents`] is true.
    pub fn expand(
        &self,
        path: &Path,
        contents: Option<&[u8]>,
    ) -> Result<Vec<OsString>, TemplateError> {
        if self.shell {
            self.expand_shell(path, contents)
        } else {
            self.expand_argv(path, contents)
        }
    }

    fn expand_argv(
        &self,
        path: &Path,
        contents: Option<&[u8]>,
    ) -> Result<Vec<OsString>, TemplateError> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        for spec in &self.args {
            let mut arg = Vec::new();
            for piece in &spec.pieces {
                match piece {
                    Piece::Lit(lit) => arg.extend_from_slice(lit),
                    Piece::Path => arg.extend_from_slice(path.as_os_str().as_bytes()),
                    Piece::Contents => {
                        // Spliced verbatim into the current argument.
                        let bytes = contents.ok_or(TemplateError::ContentsRequired)?;
                        arg.extend_from_slice(bytes);
                    }
                }
            }
            argv.push(OsString::from_vec(arg));
        }
        if !self.substitutes && !self.stdin_input {
            argv.push(path.as_os_str().to_owned());
        }
        Ok(argv)
    }

    fn expand_shell(
        &self,
        path: &Path,
        contents: Option<&[u8]>,
    ) -> Result<Vec<OsString>, TemplateError> {
        let spec = &self.args[0];
        let mut command = Vec::new();
        for piece in &spec.pieces {
            match piece {
                Piece::Lit(lit) => command.extend_from_slice(lit),
                Piece::Path => command.extend_from_slice(path.as_os_str().as_bytes()),
                Piece::Contents => {
                    let bytes = contents.ok_or(TemplateError::ContentsRequired)?;
                    command.extend_from_slice(&shell_single_quote(bytes)?);
                }
            }
        }
        if !self.substitutes && !self.stdin_input {
            command.push(b' ');
            command.extend_from_slice(path.as_os_str().as_bytes());
        }
        Ok(vec![
            OsString::from("sh"),
            OsString::from("-c"),
            OsString::from_vec(command),
        ])
    }
}

/// Single-quotes arbitrary bytes for `sh -c`, closing and reopening the
/// quotes around embedded `'` characters.
fn shell_single_quote(bytes: &[u8]) -> Result<Vec<u8>, TemplateError> {
    if bytes.contains(&0) {
        return Err(TemplateError::NulInContents);
    }
    let mut out = Vec::with_capacity(bytes.len() + 2);
    out.push(b'\'');
    for &b in bytes {
        if b == b'\'' {
            out.extend_from_slice(b"'\\''");
        } else {
            out.push(b);
        }
    }
    out.push(b'\'');
    Ok(out)
}
