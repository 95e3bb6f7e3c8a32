//! Corvus: a self-hosted deployment orchestration engine. This crate is
//! the core described in spec §1 — source staging, build execution, serve
//! publishing, state tracking, and teardown/expiration — and deliberately
//! stops short of the HTTP handler layer, which is an external collaborator
//! (see spec §1 and §6).

pub mod build;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod publisher;
pub mod reaper;
pub mod runtime;
pub mod stager;
pub mod store;
pub mod teardown;

pub use dispatch::DispatchSurface;
pub use error::{Error, ErrorKind};
pub use model::{Deployment, DeploymentId, EnvVars, Slug, SourceSpec, Status};
