//! Declarative REST API step testing.
//!
//! A [`TestCase`] is a sequence of phases (preconditions, setup,
//! execution, cleanup), each a list of [`Step`]s. The
//! [`DefaultTestRunner`] drives every step through an injected
//! [`HttpClient`], verifies the response, and feeds extracted
//! values forward through a per-case [`VariableContext`].

pub mod auth;
pub mod condition;
pub mod config;
pub mod context;
pub mod extractor;
pub mod http;
pub mod interpolate;
pub mod model;
pub mod path;
pub mod report;
pub mod runner;
pub mod validator;
pub mod value;

pub use config::*;
pub use context::{Provenance, TrackedVariable, VariableContext};
pub use http::{HttpClient, HttpResponse, PreparedRequest, ReqwestClient};
pub use model::*;
pub use runner::*;

/// Crate version, as reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
