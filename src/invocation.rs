//! Invocation descriptors and the reuse decision.
//!
//! A descriptor is the argv the backend script is started with plus an
//! optional replacement environment. Whether a new invocation may be fed to
//! the live dispatcher, instead of starting a fresh process, is a pure
//! function of the two descriptors so the policy can be tested without any
//! I/O.

/// What a caller wants executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program and arguments; `argv[0]` is the executable identity used for
    /// reuse matching (looked up on `PATH` unless absolute).
    pub argv: Vec<String>,
    /// `None` inherits the daemon environment; `Some` replaces it wholesale
    /// with the given KEY=VALUE pairs. Nothing is injected either way.
    pub envp: Option<Vec<String>>,
}

impl Invocation {
    pub fn new(argv: Vec<String>, envp: Option<Vec<String>>) -> Self {
        Invocation { argv, envp }
    }

    /// The executable identity.
    pub fn argv0(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    /// Encode `argv[1..]` as one dispatcher request line.
    ///
    /// Tokens are joined with a tab so that individual arguments may contain
    /// spaces; the dispatcher splits on tab at the far end.
    pub fn request_line(&self) -> String {
        self.argv[1..].join("\t")
    }
}

/// Outcome of comparing a new invocation against the live child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseDecision {
    /// Same executable, same environment: write one request line to the
    /// dispatcher already running.
    Reuse,
    /// Anything differs: retire the live child, then launch fresh.
    Rotate,
}

/// Decide whether `next` can be served by the child described by
/// `live_argv0`/`live_envp`.
///
/// Reuse requires the executable identity to match string-for-string and
/// the environment to match element-for-element, in order; an absent
/// environment only matches an absent environment.
pub fn decide_reuse(
    next: &Invocation,
    live_argv0: Option<&str>,
    live_envp: Option<&[String]>,
) -> ReuseDecision {
    if live_argv0 != Some(next.argv0()) {
        return ReuseDecision::Rotate;
    }
    if next.envp.as_deref() != live_envp {
        return ReuseDecision::Rotate;
    }
    ReuseDecision::Reuse
}

/// Parse a single KEY=VALUE or KEY= string into (key, value).
pub fn parse_env_var(s: &str) -> (String, String) {
    if let Some(pos) = s.find('=') {
        (s[..pos].to_string(), s[pos + 1..].to_string())
    } else {
        (s.to_string(), String::new())
    }
}
