//! # DGFacade
//!
//! A request-dispatch facade: typed requests arrive over HTTP, WebSocket,
//! Kafka, RabbitMQ, or ActiveMQ, get routed to a per-user handler under
//! bounded concurrency with TTL enforcement, and produce either a single
//! terminal response or a streaming session.
//!
//! ## Modules
//!
//! - `model`: wire and internal data types shared by every component
//! - `error`: crate-wide fault taxonomy mapped onto `DGResponse`
//! - `config`: operational configuration loaded from the environment
//! - `registry`: Handler Configuration Registry (copy-on-write routing table)
//! - `users`: User / API-Key Service (copy-on-write identity table)
//! - `actor`: Handler Actor & Supervisor (per-invocation worker, pool admission)
//! - `streaming`: Streaming Session Manager (long-lived producer lifecycle)
//! - `engine`: Execution Engine (the single entry point ingress adapters call)
//! - `transport`: Publisher/Subscriber abstraction over Kafka, AMQP, ActiveMQ, WebSocket
//! - `ring`: Recent-State Ring (bounded operator-visible invocation log)
//! - `logger`: structured logging setup built on `tracing`

pub mod actor;
pub mod config;
pub mod engine;
pub mod error;
pub mod logger;
pub mod model;
pub mod registry;
pub mod ring;
pub mod streaming;
pub mod transport;
pub mod users;

/// Re-export of the types most callers assembling an `ExecutionEngine` need.
pub mod prelude {
    pub use crate::actor::{Handler, HandlerDirectory, HandlerOutcome};
    pub use crate::config::Config;
    pub use crate::engine::ExecutionEngine;
    pub use crate::error::{Error, Result};
    pub use crate::model::{DGRequest, DGResponse, DGStatus, HandlerConfig, SourceChannel};
    pub use crate::registry::HandlerRegistry;
    pub use crate::streaming::{StreamProducer, StreamingSessionManager, UpdatePublisher};
    pub use crate::users::UserService;
    pub use crate::logger::{init_with_default, LoggerConfig};
}
