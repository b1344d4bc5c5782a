//! Operations, requests, envelopes and the message-type registry.
//!
//! An [`Operation`] is applied to a service with no reply; a [`Request`]
//! must answer exactly once through its [`OperationContext`]. Both travel
//! between members as an [`Envelope`] whose `message_type` selects the
//! decode-and-run function recorded in the [`MessageRegistry`].

use crate::error::{ClusterError, Result};
use crate::service::Service;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::trace;

/// A message applied to a service of type `S` without a reply.
pub trait Operation<S: Service>: Serialize + DeserializeOwned + Send + 'static {
    /// Stable identifier used to pick the handler on the receiving member.
    fn message_type() -> String;

    fn run(self, service: &mut S);
}

/// A message applied to a service of type `S` that answers with `Reply`.
pub trait Request<S: Service>: Serialize + DeserializeOwned + Send + 'static {
    type Reply: Serialize + DeserializeOwned + Send + 'static;

    /// Stable identifier used to pick the handler on the receiving member.
    fn message_type() -> String;

    /// Must call `ctx.reply` exactly once on the success path.
    fn run(self, service: &mut S, ctx: OperationContext<Self::Reply>);
}

/// Reply channel of a single in-flight request.
///
/// `reply` consumes the context, so a second reply cannot be written.
/// Dropping it without replying surfaces to the caller as
/// [`ClusterError::ReplyDropped`].
#[derive(Debug)]
pub struct OperationContext<R> {
    reply_tx: oneshot::Sender<R>,
}

impl<R> OperationContext<R> {
    pub fn channel() -> (Self, oneshot::Receiver<R>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        (Self { reply_tx }, reply_rx)
    }

    pub fn reply(self, value: R) {
        if self.reply_tx.send(value).is_err() {
            trace!("reply discarded, caller no longer waiting");
        }
    }
}

/// Serialized message addressed to a named service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub service: String,
    pub message_type: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn operation<S: Service, O: Operation<S>>(service: impl Into<String>, operation: &O) -> Result<Self> {
        Ok(Self {
            service: service.into(),
            message_type: O::message_type(),
            payload: encode(operation)?,
        })
    }

    pub fn request<S: Service, Q: Request<S>>(service: impl Into<String>, request: &Q) -> Result<Self> {
        Ok(Self {
            service: service.into(),
            message_type: Q::message_type(),
            payload: encode(request)?,
        })
    }
}

/// Encode a payload with the wire codec.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a payload with the wire codec.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Stages an inbound message passes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStage {
    Received,
    Deserialized,
    Dispatched,
    Executed,
    Replied,
    Dropped,
}

/// Encoded reply still being produced by a request handler.
pub type PendingReply = BoxFuture<'static, Result<Vec<u8>>>;

pub type OperationHandler = fn(&mut dyn Service, &[u8]) -> Result<()>;
pub type RequestHandler = fn(&mut dyn Service, &[u8]) -> Result<PendingReply>;

/// Decode-and-run function for one message type.
#[derive(Clone, Copy)]
pub enum Handler {
    Operation(OperationHandler),
    Request(RequestHandler),
}

/// Mapping from message type to handler, populated at startup.
#[derive(Default)]
pub struct MessageRegistry {
    handlers: HashMap<String, Handler>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_operation<S: Service, O: Operation<S>>(&mut self) -> &mut Self {
        self.handlers
            .insert(O::message_type(), Handler::Operation(run_operation::<S, O>));
        self
    }

    pub fn register_request<S: Service, Q: Request<S>>(&mut self) -> &mut Self {
        self.handlers
            .insert(Q::message_type(), Handler::Request(run_request::<S, Q>));
        self
    }

    pub fn handler(&self, message_type: &str) -> Result<Handler> {
        self.handlers
            .get(message_type)
            .copied()
            .ok_or_else(|| ClusterError::UnknownMessageType(message_type.to_string()))
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn downcast<'a, S: Service>(service: &'a mut dyn Service, message_type: &str) -> Result<&'a mut S> {
    let name = service.context().name().to_string();
    service
        .as_any_mut()
        .downcast_mut::<S>()
        .ok_or_else(|| ClusterError::ServiceTypeMismatch {
            service: name,
            message_type: message_type.to_string(),
        })
}

fn run_operation<S: Service, O: Operation<S>>(service: &mut dyn Service, payload: &[u8]) -> Result<()> {
    let message_type = O::message_type();
    let service = downcast::<S>(service, &message_type)?;
    let operation: O = decode(payload)?;
    trace!(%message_type, stage = ?DispatchStage::Deserialized);
    operation.run(service);
    trace!(%message_type, stage = ?DispatchStage::Executed);
    Ok(())
}

fn run_request<S: Service, Q: Request<S>>(service: &mut dyn Service, payload: &[u8]) -> Result<PendingReply> {
    let message_type = Q::message_type();
    let service = downcast::<S>(service, &message_type)?;
    let request: Q = decode(payload)?;
    trace!(%message_type, stage = ?DispatchStage::Deserialized);

    let (ctx, reply_rx) = OperationContext::channel();
    request.run(service, ctx);
    trace!(%message_type, stage = ?DispatchStage::Executed);

    Ok(Box::pin(async move {
        match reply_rx.await {
            Ok(reply) => {
                trace!(%message_type, stage = ?DispatchStage::Replied);
                encode(&reply)
            }
            Err(_) => {
                trace!(%message_type, stage = ?DispatchStage::Dropped);
                Err(ClusterError::ReplyDropped(message_type))
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceContext;
    use std::any::Any;

    struct Echo {
        context: ServiceContext,
        seen: Vec<String>,
    }

    impl Service for Echo {
        fn context(&self) -> &ServiceContext {
            &self.context
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Other {
        context: ServiceContext,
    }

    impl Service for Other {
        fn context(&self) -> &ServiceContext {
            &self.context
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Note(String);

    impl Operation<Echo> for Note {
        fn message_type() -> String {
            "test.note".to_string()
        }

        fn run(self, service: &mut Echo) {
            service.seen.push(self.0);
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Count;

    impl Request<Echo> for Count {
        type Reply = usize;

        fn message_type() -> String {
            "test.count".to_string()
        }

        fn run(self, service: &mut Echo, ctx: OperationContext<usize>) {
            ctx.reply(service.seen.len());
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Forgetful;

    impl Request<Echo> for Forgetful {
        type Reply = bool;

        fn message_type() -> String {
            "test.forgetful".to_string()
        }

        fn run(self, _service: &mut Echo, _ctx: OperationContext<bool>) {}
    }

    fn registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry
            .register_operation::<Echo, Note>()
            .register_request::<Echo, Count>()
            .register_request::<Echo, Forgetful>();
        registry
    }

    fn echo() -> Echo {
        Echo {
            context: ServiceContext::detached("echo"),
            seen: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_operation_then_request() {
        let registry = registry();
        let mut service = echo();

        let envelope = Envelope::operation::<Echo, _>("echo", &Note("hi".into())).unwrap();
        let Handler::Operation(run) = registry.handler(&envelope.message_type).unwrap() else {
            panic!("expected operation handler");
        };
        run(&mut service, &envelope.payload).unwrap();

        let envelope = Envelope::request::<Echo, _>("echo", &Count).unwrap();
        let Handler::Request(run) = registry.handler(&envelope.message_type).unwrap() else {
            panic!("expected request handler");
        };
        let reply = run(&mut service, &envelope.payload).unwrap().await.unwrap();
        assert_eq!(decode::<usize>(&reply).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_reply_is_reported() {
        let registry = registry();
        let mut service = echo();

        let envelope = Envelope::request::<Echo, _>("echo", &Forgetful).unwrap();
        let Handler::Request(run) = registry.handler(&envelope.message_type).unwrap() else {
            panic!("expected request handler");
        };
        let result = run(&mut service, &envelope.payload).unwrap().await;
        assert!(matches!(result, Err(ClusterError::ReplyDropped(t)) if t == "test.forgetful"));
    }

    #[test]
    fn test_wrong_service_type() {
        let registry = registry();
        let mut other = Other {
            context: ServiceContext::detached("other"),
        };

        let envelope = Envelope::operation::<Echo, _>("other", &Note("x".into())).unwrap();
        let Handler::Operation(run) = registry.handler(&envelope.message_type).unwrap() else {
            panic!("expected operation handler");
        };
        assert!(matches!(
            run(&mut other, &envelope.payload),
            Err(ClusterError::ServiceTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_message_type() {
        assert!(matches!(
            registry().handler("nope"),
            Err(ClusterError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn test_context_replies_once() {
        let (ctx, mut rx) = OperationContext::channel();
        ctx.reply(7u32);
        assert_eq!(rx.try_recv().unwrap(), 7);
    }
}
