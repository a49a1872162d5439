//! Type-routed decode and dispatch.
//!
//! Each message type is registered once, with the processor that runs its
//! handler. Dispatch decodes the payload into the concrete message, binds it
//! to the owner that sent it, and submits the resulting work item.

use crate::client_manager::Owner;
use crate::error::{HandlerResult, Result, ServerError};
use crate::kernel::Context;
use crate::processor::{EnqueueOutcome, WorkItem};
use log::{debug, trace, warn};
use shared::{CodecError, Frame, WireMessage};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;

type BuildItem =
    Box<dyn Fn(&[u8], Owner, Context) -> std::result::Result<WorkItem, CodecError> + Send + Sync>;

struct Route {
    message: &'static str,
    processor: String,
    build: BuildItem,
}

/// Message type table. Built at startup, then frozen inside the kernel.
#[derive(Default)]
pub struct MessageRegistry {
    routes: HashMap<u16, Route>,
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|(id, route)| (*id, route.message, route.processor.as_str()))
            .collect();
        routes.sort_unstable();
        f.debug_struct("MessageRegistry")
            .field("routes", &routes)
            .finish()
    }
}

fn short_type_name<M>() -> &'static str {
    let full = std::any::type_name::<M>();
    full.rsplit("::").next().unwrap_or(full)
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `M` to `handler` on the named processor.
    ///
    /// Registering the same type id twice is a configuration error.
    pub fn register<M, F, Fut>(&mut self, processor: &str, handler: F) -> Result<()>
    where
        M: WireMessage,
        F: Fn(M, Owner, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if let Some(existing) = self.routes.get(&M::TYPE_ID) {
            warn!(
                "Message type {} is already bound to {}",
                M::TYPE_ID,
                existing.message
            );
            return Err(ServerError::DuplicateMessageType(M::TYPE_ID));
        }

        let message = short_type_name::<M>();
        let build: BuildItem = Box::new(move |payload, owner, ctx| {
            let decoded = M::decode_payload(payload)?;
            let task = handler(decoded, owner.clone(), ctx);
            Ok(WorkItem::message(owner, M::TYPE_ID, message, task))
        });

        debug!(
            "Registered message type {} ({}) on processor '{}'",
            M::TYPE_ID,
            message,
            processor
        );
        self.routes.insert(
            M::TYPE_ID,
            Route {
                message,
                processor: processor.to_string(),
                build,
            },
        );
        Ok(())
    }

    pub fn contains(&self, type_id: u16) -> bool {
        self.routes.contains_key(&type_id)
    }

    pub fn processor_for(&self, type_id: u16) -> Option<&str> {
        self.routes.get(&type_id).map(|route| route.processor.as_str())
    }

    pub fn type_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.routes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Decodes `payload` as `type_id` and submits it for `owner`.
    ///
    /// Unknown types are counted, logged and reported as
    /// `UnknownMessageType`, which callers treat as non-fatal. A payload that
    /// does not decode is `MalformedFrame`.
    pub async fn dispatch(
        &self,
        type_id: u16,
        payload: &[u8],
        owner: &Owner,
        ctx: &Context,
    ) -> Result<EnqueueOutcome> {
        let Some(route) = self.routes.get(&type_id) else {
            ctx.monitor().unknown_type();
            warn!(
                "Dropping frame from owner {}: {}",
                owner.id(),
                ServerError::UnknownMessageType(type_id)
            );
            return Err(ServerError::UnknownMessageType(type_id));
        };

        let item = (route.build)(payload, owner.clone(), ctx.clone())?;
        trace!(
            "Owner {} -> {} on '{}'",
            owner.id(),
            route.message,
            route.processor
        );
        ctx.submit(&route.processor, item).await
    }

    pub async fn dispatch_frame(
        &self,
        frame: &Frame,
        owner: &Owner,
        ctx: &Context,
    ) -> Result<EnqueueOutcome> {
        self.dispatch(frame.type_id, &frame.payload, owner, ctx).await
    }

    pub(crate) fn processors(&self) -> impl Iterator<Item = (u16, &str)> {
        self.routes
            .iter()
            .map(|(id, route)| (*id, route.processor.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::HandlerError;
    use crate::kernel::Kernel;
    use serde::{Deserialize, Serialize};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        value: u32,
    }

    impl WireMessage for Ping {
        const TYPE_ID: u16 = 7;
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        value: u32,
    }

    impl WireMessage for Pong {
        const TYPE_ID: u16 = 8;
    }

    fn ping_registry(calls: Arc<AtomicUsize>) -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry
            .register::<Ping, _, _>("server", move |ping, owner, _ctx| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    owner.send(&Pong { value: ping.value + 1 })?;
                    Ok::<(), HandlerError>(())
                }
            })
            .unwrap();
        registry
    }

    fn config() -> ServerConfig {
        ServerConfig {
            drain_delay_secs: 0,
            ..ServerConfig::default()
        }
    }

    async fn connect(kernel: &Kernel) -> (Owner, mpsc::Receiver<bytes::Bytes>) {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let ctx = kernel.context();
        let mut clients = ctx.clients().write().await;
        clients.add_client(addr).unwrap()
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = ping_registry(Arc::new(AtomicUsize::new(0)));
        let err = assert_err!(registry.register::<Ping, _, _>("world", |_, _, _| async { Ok(()) }));
        assert!(matches!(err, ServerError::DuplicateMessageType(7)));
        assert_eq!(registry.processor_for(7), Some("server"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_helpers() {
        let mut registry = ping_registry(Arc::new(AtomicUsize::new(0)));
        assert_ok!(registry.register::<Pong, _, _>("world", |_, _, _| async { Ok(()) }));

        assert!(registry.contains(8));
        assert!(!registry.contains(9));
        assert_eq!(registry.type_ids(), vec![7, 8]);
        assert!(format!("{:?}", registry).contains("Ping"));
    }

    #[tokio::test]
    async fn test_dispatch_runs_handler_and_replies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let kernel = assert_ok!(Kernel::new(
            config(),
            ping_registry(Arc::clone(&calls))
        ));
        let ctx = kernel.context();
        let (owner, mut outbound) = connect(&kernel).await;

        let payload = assert_ok!(Ping { value: 41 }.encode_payload());
        let outcome = assert_ok!(kernel.registry().dispatch(7, &payload, &owner, &ctx).await);
        assert_eq!(outcome, EnqueueOutcome::Accepted);

        let reply = outbound.recv().await.unwrap();
        assert_eq!(assert_ok!(Pong::decode(&reply)), Pong { value: 42 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        kernel.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped_and_counted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let kernel = assert_ok!(Kernel::new(
            config(),
            ping_registry(Arc::clone(&calls))
        ));
        let ctx = kernel.context();
        let (owner, _outbound) = connect(&kernel).await;

        let err = assert_err!(kernel.registry().dispatch(999, &[], &owner, &ctx).await);
        assert!(matches!(err, ServerError::UnknownMessageType(999)));
        assert!(!err.is_fatal_to_connection());
        assert_eq!(ctx.monitor().snapshot().unknown_types, 1);
        assert!(owner.is_alive());
    }

    #[tokio::test]
    async fn test_short_payload_is_malformed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let kernel = assert_ok!(Kernel::new(
            config(),
            ping_registry(Arc::clone(&calls))
        ));
        let ctx = kernel.context();
        let (owner, _outbound) = connect(&kernel).await;

        let err = assert_err!(kernel.registry().dispatch(7, &[1, 2], &owner, &ctx).await);
        assert!(matches!(err, ServerError::MalformedFrame(_)));
        assert!(err.is_fatal_to_connection());

        kernel.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_route_to_missing_processor_fails_at_startup() {
        let mut registry = MessageRegistry::new();
        assert_ok!(registry.register::<Ping, _, _>("combat", |_, _, _| async { Ok(()) }));

        let err = assert_err!(Kernel::new(config(), registry));
        assert!(matches!(err, ServerError::UnknownProcessor(name) if name == "combat"));
    }
}
