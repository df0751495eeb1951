//! Single-player stand-in for the networked buses.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use lanbus_protocol::{Message, MessageType, Payload};

use crate::requests::Outcome;
use crate::{BusError, DeliveryReport, HandlerRegistry, HandlerResult, MessageBus, Origin};

/// An in-process bus for single-player mode.
///
/// No sockets and no framing: `send` runs every matching handler right
/// away, on the caller's task, and returns after the last one. Handlers
/// see [`Origin::Local`].
#[derive(Debug, Default)]
pub struct LocalMessageBus {
    registry: HandlerRegistry,
    running: AtomicBool,
}

impl LocalMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl MessageBus for LocalMessageBus {
    type Endpoint = ();

    async fn start(&self, _endpoint: ()) -> Result<(), BusError> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| BusError::AlreadyRunning)?;
        tracing::info!("local bus started");
        Ok(())
    }

    async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("local bus stopped");
        }
    }

    /// Dispatches locally. There are no peers, so `target` is ignored.
    async fn send(
        &self,
        message: Message,
        target: Option<SocketAddr>,
        blocking: bool,
    ) -> Result<DeliveryReport, BusError> {
        if !self.is_running() {
            return Err(BusError::NotRunning);
        }
        if let Some(target) = target {
            tracing::trace!(%target, "local bus ignores target address");
        }
        if let Payload::Print(print) = &message.payload {
            tracing::info!(text = %print.text, "print request");
        }

        let outcome = self.registry.dispatch(&message, Origin::Local);

        let mut report = DeliveryReport::default();
        if blocking && message.requires_response() {
            report.record(
                Origin::Local,
                match outcome {
                    Ok(()) => Outcome::Acknowledged,
                    Err(error) => Outcome::Failed(error),
                },
            );
        } else if let Err(error) = outcome {
            tracing::warn!(id = %message.id, %error, "local handler failed");
        }
        Ok(report)
    }

    fn register_data_handler<F>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(&Message, Origin) -> HandlerResult + Send + Sync + 'static,
    {
        self.registry.register(message_type, handler);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    use lanbus_protocol::{GameRequest, MessageId, PrintRequest, RequestSuccess};

    use super::*;

    async fn started() -> LocalMessageBus {
        let bus = LocalMessageBus::new();
        bus.start(()).await.unwrap();
        bus
    }

    #[tokio::test]
    async fn test_send_before_start_is_not_running() {
        let bus = LocalMessageBus::new();
        let result = bus.send(PrintRequest::new("hi").into(), None, true).await;
        assert!(matches!(result, Err(BusError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_twice_is_already_running() {
        let bus = started().await;
        assert!(matches!(bus.start(()).await, Err(BusError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_send_dispatches_synchronously_with_local_origin() {
        let bus = started().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        bus.register_data_handler(MessageType::PrintRequest, move |message, origin| {
            if let Payload::Print(print) = &message.payload {
                log.lock().unwrap().push((print.text.clone(), origin));
            }
            Ok(())
        });

        let report = bus.send(PrintRequest::new("hi").into(), None, true).await.unwrap();

        // Already handled by the time send returns.
        assert_eq!(*seen.lock().unwrap(), vec![("hi".to_string(), Origin::Local)]);
        assert_eq!(report.acknowledged, vec![Origin::Local]);
    }

    #[tokio::test]
    async fn test_supertype_handler_sees_every_request_kind() {
        let bus = started().await;
        let any = Arc::new(AtomicUsize::new(0));
        let games = Arc::new(AtomicUsize::new(0));
        {
            let any = Arc::clone(&any);
            bus.register_data_handler(MessageType::Message, move |_, _| {
                any.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            let games = Arc::clone(&games);
            bus.register_data_handler(MessageType::GameRequest, move |_, _| {
                games.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        bus.send(PrintRequest::new("a").into(), None, false).await.unwrap();
        bus.send(GameRequest::new("create_game", vec![7]).into(), None, false)
            .await
            .unwrap();

        assert_eq!(any.load(Ordering::SeqCst), 2);
        assert_eq!(games.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocking_request_reports_handler_failure() {
        let bus = started().await;
        bus.register_data_handler(MessageType::GameRequest, |_, _| Err("no map".into()));

        let report = bus
            .send(GameRequest::new("create_game", vec![]).into(), None, true)
            .await
            .unwrap();
        assert_eq!(report.failed, vec![(Origin::Local, "no map".to_string())]);
    }

    #[tokio::test]
    async fn test_non_blocking_and_response_sends_return_empty_report() {
        let bus = started().await;
        let addr: SocketAddr = "10.0.0.1:40000".parse().unwrap();

        let report = bus
            .send(PrintRequest::new("x").into(), Some(addr), false)
            .await
            .unwrap();
        assert_eq!(report.target_count(), 0);

        let ack = RequestSuccess {
            request_id: MessageId::random(),
        };
        let report = bus.send(ack.into(), None, true).await.unwrap();
        assert_eq!(report.target_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_then_send_is_not_running() {
        let bus = started().await;
        bus.stop().await;
        bus.stop().await;
        let result = bus.send(PrintRequest::new("late").into(), None, false).await;
        assert!(matches!(result, Err(BusError::NotRunning)));
    }
}
