//! Built-in message handlers: handshake, heartbeat, chat and disconnect.

use crate::client_manager::Owner;
use crate::error::{HandlerResult, Result};
use crate::kernel::Context;
use crate::registry::MessageRegistry;
use log::{debug, info, warn};
use shared::{
    Connect, Connected, Disconnect, Disconnected, Heartbeat, Talk, WireMessage, CLIENT_VERSION,
};

/// Processor that runs connection-originated work.
pub const SERVER_PROCESSOR: &str = "server";

pub fn register_builtin(registry: &mut MessageRegistry) -> Result<()> {
    registry.register::<Connect, _, _>(SERVER_PROCESSOR, on_connect)?;
    registry.register::<Heartbeat, _, _>(SERVER_PROCESSOR, on_heartbeat)?;
    registry.register::<Talk, _, _>(SERVER_PROCESSOR, on_talk)?;
    registry.register::<Disconnect, _, _>(SERVER_PROCESSOR, on_disconnect)?;
    Ok(())
}

async fn on_connect(message: Connect, owner: Owner, ctx: Context) -> HandlerResult {
    if message.client_version != CLIENT_VERSION {
        warn!(
            "Client {} speaks version {}, expected {}",
            owner.id(),
            message.client_version,
            CLIENT_VERSION
        );
        owner.send(&Disconnected {
            reason: format!(
                "unsupported client version {} (server speaks {})",
                message.client_version, CLIENT_VERSION
            ),
        })?;
        ctx.disconnect(owner.id()).await;
        return Ok(());
    }

    owner.send(&Connected {
        client_id: owner.id(),
    })?;
    info!("Client {} completed handshake", owner.id());
    Ok(())
}

async fn on_heartbeat(message: Heartbeat, owner: Owner, _ctx: Context) -> HandlerResult {
    owner.touch();
    owner.send(&message)?;
    Ok(())
}

/// Relays a chat line. The sender is stamped with the owner id; an empty
/// recipient broadcasts, otherwise it names the target client id.
async fn on_talk(mut message: Talk, owner: Owner, ctx: Context) -> HandlerResult {
    message.sender = owner.id().to_string();

    let targets = {
        let clients = ctx.clients().read().await;
        if message.recipient.is_empty() {
            clients.owners()
        } else {
            let target = message
                .recipient
                .parse::<u32>()
                .ok()
                .and_then(|id| clients.get(id));
            match target {
                Some(target) => vec![target],
                None => {
                    return Err(format!("no client '{}' to talk to", message.recipient).into())
                }
            }
        }
    };

    let frame = message.encode()?;
    for target in targets {
        if let Err(e) = target.send_frame(frame.clone()) {
            debug!("Talk from {} not delivered to {}: {}", owner.id(), target.id(), e);
        }
    }
    Ok(())
}

async fn on_disconnect(_message: Disconnect, owner: Owner, ctx: Context) -> HandlerResult {
    if ctx.disconnect(owner.id()).await {
        info!("Client {} disconnected on request", owner.id());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::ServerError;
    use crate::kernel::Kernel;
    use bytes::Bytes;
    use shared::Frame;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn kernel() -> Kernel {
        let mut registry = MessageRegistry::new();
        register_builtin(&mut registry).unwrap();
        let config = ServerConfig {
            drain_delay_secs: 0,
            ..ServerConfig::default()
        };
        Kernel::new(config, registry).unwrap()
    }

    async fn join(ctx: &Context, port: u16) -> (Owner, mpsc::Receiver<Bytes>) {
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let mut clients = ctx.clients().write().await;
        clients.add_client(addr).unwrap()
    }

    async fn deliver<M: WireMessage>(kernel: &Kernel, owner: &Owner, message: &M) {
        let ctx = kernel.context();
        let payload = message.encode_payload().unwrap();
        assert_ok!(
            kernel
                .registry()
                .dispatch(M::TYPE_ID, &payload, owner, &ctx)
                .await
        );
    }

    #[test]
    fn test_builtin_types_registered_once() {
        let mut registry = MessageRegistry::new();
        assert_ok!(register_builtin(&mut registry));
        assert_eq!(registry.type_ids(), vec![1001, 1003, 1005, 1006]);

        let err = assert_err!(register_builtin(&mut registry));
        assert!(matches!(err, ServerError::DuplicateMessageType(1001)));
    }

    #[tokio::test]
    async fn test_connect_replies_with_client_id() {
        let kernel = kernel();
        let (owner, mut outbound) = join(&kernel.context(), 5000).await;

        deliver(&kernel, &owner, &Connect { client_version: CLIENT_VERSION }).await;

        let reply = outbound.recv().await.unwrap();
        let connected = assert_ok!(Connected::decode(&reply));
        assert_eq!(connected.client_id, owner.id());
        assert!(owner.is_alive());
    }

    #[tokio::test]
    async fn test_connect_with_wrong_version_is_refused() {
        let kernel = kernel();
        let ctx = kernel.context();
        let (owner, mut outbound) = join(&ctx, 5000).await;

        deliver(&kernel, &owner, &Connect { client_version: 99 }).await;
        owner.closed().await;

        let reply = outbound.recv().await.unwrap();
        let refused = assert_ok!(Disconnected::decode(&reply));
        assert!(refused.reason.contains("99"));
        assert!(ctx.clients().read().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_is_echoed() {
        let kernel = kernel();
        let (owner, mut outbound) = join(&kernel.context(), 5000).await;

        deliver(&kernel, &owner, &Heartbeat { timestamp: 1234 }).await;

        let reply = outbound.recv().await.unwrap();
        assert_eq!(assert_ok!(Heartbeat::decode(&reply)).timestamp, 1234);
    }

    #[tokio::test]
    async fn test_talk_broadcasts_and_stamps_sender() {
        let kernel = kernel();
        let ctx = kernel.context();
        let (alice, mut alice_rx) = join(&ctx, 5001).await;
        let (_bob, mut bob_rx) = join(&ctx, 5002).await;

        let talk = Talk {
            sender: "spoofed".to_string(),
            recipient: String::new(),
            text: "hello".to_string(),
        };
        deliver(&kernel, &alice, &talk).await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            let frame = assert_ok!(Frame::parse(&rx.recv().await.unwrap()));
            let heard = assert_ok!(Talk::from_frame(&frame));
            assert_eq!(heard.sender, alice.id().to_string());
            assert_eq!(heard.text, "hello");
        }
    }

    #[tokio::test]
    async fn test_talk_to_single_recipient() {
        let kernel = kernel();
        let ctx = kernel.context();
        let (alice, mut alice_rx) = join(&ctx, 5001).await;
        let (bob, mut bob_rx) = join(&ctx, 5002).await;

        let talk = Talk {
            sender: String::new(),
            recipient: bob.id().to_string(),
            text: "psst".to_string(),
        };
        deliver(&kernel, &alice, &talk).await;

        let heard = assert_ok!(Talk::decode(&bob_rx.recv().await.unwrap()));
        assert_eq!(heard.text, "psst");

        kernel.stop().await;
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_closes_owner() {
        let kernel = kernel();
        let ctx = kernel.context();
        let (owner, _outbound) = join(&ctx, 5000).await;

        deliver(&kernel, &owner, &Disconnect).await;
        owner.closed().await;

        assert!(ctx.clients().read().await.get(owner.id()).is_none());
    }
}
