//! # World Server Library
//!
//! This library provides the dispatch and scheduling core of the game-world
//! server. It turns a stream of typed binary frames into work for game-logic
//! handlers, runs recurring world jobs on cron triggers, and keeps network
//! I/O isolated from slow processing.
//!
//! ## Core Responsibilities
//!
//! ### Message Dispatch
//! Every connection gets a reader task that cuts its byte stream into frames,
//! decodes each frame through the [`registry::MessageRegistry`] and submits
//! the result to a named processor. Unknown message types are logged and
//! dropped; a malformed frame closes the connection.
//!
//! ### Processing Pipeline
//! Each [`processor::Processor`] is a bounded queue drained by its own worker
//! tasks. Work from one connection is routed to one lane, so a client's
//! messages are handled in the order they arrived. What happens when a queue
//! is full (wait, drop the newest, drop the oldest) is configured per
//! processor.
//!
//! ### Recurring Jobs
//! The [`scheduler::Scheduler`] fires jobs on six-field cron triggers
//! (`second minute hour day month weekday`). A job that is still running when
//! its next slot comes up skips that slot instead of piling up.
//!
//! ## Architecture Design
//!
//! ### Explicit Context
//! There are no global singletons. The [`kernel::Kernel`] owns processors,
//! scheduler, randomness service, network monitor and connection table, and
//! hands handlers a cloneable [`kernel::Context`].
//!
//! ### TCP Transport
//! Connections are reliable ordered byte streams. Frames are
//! `length: u16 | type_id: u16 | payload`, little-endian, with `length`
//! covering the whole frame.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Owner handles and the connection table:
//! - Owner id assignment and `max_clients` enforcement
//! - Activity tracking and idle-timeout sweeping
//! - Per-connection outbound frame queues
//!
//! ### Registry Module (`registry`)
//! Type id to decoder/handler table, and dispatch into processors.
//!
//! ### Processor Module (`processor`)
//! Bounded queues, worker lanes, backpressure policies and shutdown draining.
//!
//! ### Scheduler Module (`scheduler`)
//! Cron parsing, the driver loop and job lifecycle.
//!
//! ### Random Module (`random`)
//! Race-free random draws for game outcomes, served by a single owning task.
//!
//! ### Network Module (`network`)
//! TCP accept loop and the per-connection reader and writer.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::handlers::register_builtin;
//! use server::kernel::Kernel;
//! use server::network::NetworkServer;
//! use server::registry::MessageRegistry;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = MessageRegistry::new();
//!     register_builtin(&mut registry)?;
//!
//!     let kernel = Kernel::new(ServerConfig::default(), registry)?;
//!     kernel.start();
//!
//!     let server = NetworkServer::bind("127.0.0.1:5816", kernel.context(), kernel.registry()).await?;
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     kernel.stop().await;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod kernel;
pub mod monitor;
pub mod network;
pub mod processor;
pub mod random;
pub mod registry;
pub mod scheduler;

pub use error::{HandlerError, HandlerResult, Result, ServerError};
