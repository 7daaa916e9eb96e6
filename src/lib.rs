/// backend-spawn — core library
///
/// Supervises one backend helper process at a time for a package-management
/// daemon: launching (or reusing) dispatcher scripts, framing their stdout
/// into line events, and classifying how each child went away. The `spawn`
/// module is the supervisor itself; `invocation` holds the descriptor and
/// reuse policy, `outbuf` the line framing, `config` the daemon
/// configuration knob, and `schema`/`run` the JSON CLI surface.
pub mod config;
pub mod invocation;
pub mod outbuf;
pub mod run;
pub mod schema;
pub mod spawn;
