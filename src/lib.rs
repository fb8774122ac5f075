//! AlephAuto backend library.
//!
//! Job orchestration engine for periodic code-maintenance pipelines. The
//! library exposes the job server, the secrets resilience layer, the git
//! workflow manager, the migration transformer, and the HTTP surface that
//! the `alephauto-backend` binary wires together.

pub mod core;
pub mod gitflow;
pub mod jobs;
pub mod logging;
pub mod migration;
pub mod pipelines;
pub mod secrets;
pub mod server;
pub mod state;
pub mod telemetry;
