// CasareRPA Orchestrator Core
//
// Distributed job-dispatch engine: accepts workflow submissions, persists
// them, routes them to robot agents over long-lived sessions, recovers
// work when robots vanish, fires cron schedules and streams live state to
// observers.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::Config;
