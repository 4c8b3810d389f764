//! bwtester: a two-way UDP bandwidth tester.
//!
//! An initiator and a responder negotiate a test over a small control
//! protocol, then each side sends a paced stream of AES-CTR generated
//! packets that the other side verifies against the shared per-test key.
//! The responder keeps its measurement so the initiator can fetch it
//! afterwards and report both directions.

pub mod client;
pub mod config;
pub mod engine;
pub mod params;
pub mod prg;
pub mod report;
pub mod server;
pub mod sync;
pub mod transport;
pub mod wire;

pub use client::{ClientError, ClientOptions, Initiator, Phase, RetryPolicy};
pub use config::BwtesterConfig;
pub use params::{AuthKey, DirectionSpec, ParamError, TestParameters, TestResult};
pub use report::{DirectionReport, TestReport};
pub use server::{Responder, ServerOptions};
