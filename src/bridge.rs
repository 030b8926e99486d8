//! Request/response channel between the controller and the page context.
//!
//! Calls are typed on the controller side: every page method is a struct
//! implementing [`RemoteCall`], which fixes both its wire name and its reply
//! type. On the wire a call travels as an [`Envelope`]. The receiving side
//! ([`Endpoint`], or the injected page runtime) looks the method up in its
//! handler table; unknown methods get no reply at all.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::action::ElementId;
use crate::annotate::SnapshotPayload;
use crate::{Error, Result};

/// Methods the page runtime answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Annotate,
    ResolveMarker,
    Ripple,
    CopyToClipboard,
}

impl Method {
    pub const ALL: [Method; 4] = [
        Method::Annotate,
        Method::ResolveMarker,
        Method::Ripple,
        Method::CopyToClipboard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Annotate => "annotate",
            Method::ResolveMarker => "resolveMarker",
            Method::Ripple => "ripple",
            Method::CopyToClipboard => "copyToClipboard",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

/// A typed call into the page context.
pub trait RemoteCall: Serialize + DeserializeOwned + Send + Sync + 'static {
    const METHOD: Method;
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

/// Walk the document, mark interactable elements and return the reduced tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Annotate {}

impl RemoteCall for Annotate {
    const METHOD: Method = Method::Annotate;
    type Output = SnapshotPayload;
}

/// Look up the element carrying `element_id` and return its unique marker,
/// assigning one on first reference. `None` when the element is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveMarker {
    pub element_id: ElementId,
}

impl RemoteCall for ResolveMarker {
    const METHOD: Method = Method::ResolveMarker;
    type Output = Option<String>;
}

/// Short-lived visual ripple at a viewport point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ripple {
    pub x: f64,
    pub y: f64,
}

impl RemoteCall for Ripple {
    const METHOD: Method = Method::Ripple;
    type Output = ();
}

/// Put text on the page's clipboard. Replies whether the copy succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyToClipboard {
    pub text: String,
}

impl RemoteCall for CopyToClipboard {
    const METHOD: Method = Method::CopyToClipboard;
    type Output = bool;
}

/// Wire form of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl Envelope {
    pub fn for_call<C: RemoteCall>(call: &C) -> Result<Self> {
        Ok(Self {
            method: C::METHOD.as_str().to_string(),
            args: serde_json::to_value(call)?,
        })
    }
}

/// Delivery failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The page context has not initialized its receiver yet.
    #[error("could not establish connection, receiving end does not exist")]
    NoReceiver,
    #[error("{0}")]
    Failed(String),
}

/// Carries envelopes to the page context.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope. `Ok(None)` means the receiver did not reply.
    async fn send(&self, envelope: &Envelope) -> std::result::Result<Option<Value>, ChannelError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, envelope: &Envelope) -> std::result::Result<Option<Value>, ChannelError> {
        (**self).send(envelope).await
    }
}

/// Default number of delivery attempts.
pub const DEFAULT_MAX_TRIES: u32 = 2;
/// Default pause before retrying an undelivered call.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(3000);

/// Controller side of the channel.
pub struct Bridge<T> {
    transport: T,
    max_tries: u32,
    backoff: Duration,
}

impl<T: Transport> Bridge<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            max_tries: DEFAULT_MAX_TRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Override the retry budget for undelivered calls.
    pub fn with_retry(mut self, max_tries: u32, backoff: Duration) -> Self {
        self.max_tries = max_tries.max(1);
        self.backoff = backoff;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Invoke a page method and decode its reply.
    ///
    /// Only [`ChannelError::NoReceiver`] is retried. A missing reply is a
    /// [`Error::ChannelTimeout`], never a typed error.
    pub async fn call<C: RemoteCall>(&self, call: &C) -> Result<C::Output> {
        let envelope = Envelope::for_call(call)?;
        let method = C::METHOD.as_str();

        for attempt in 1..=self.max_tries {
            match self.transport.send(&envelope).await {
                Ok(Some(reply)) => {
                    debug!("bridge: {} replied", method);
                    return serde_json::from_value(reply).map_err(|e| {
                        Error::Channel(format!("unexpected reply to {}: {}", method, e))
                    });
                }
                Ok(None) => {
                    return Err(Error::ChannelTimeout(format!("no reply to {}", method)));
                }
                Err(ChannelError::NoReceiver) => {
                    warn!(
                        "bridge: {} not delivered (attempt {}/{}), receiver not ready",
                        method, attempt, self.max_tries
                    );
                    if attempt < self.max_tries {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Err(ChannelError::Failed(msg)) => return Err(Error::Channel(msg)),
            }
        }

        Err(Error::ChannelTimeout(format!(
            "{}: receiving end not ready after {} attempt(s)",
            method, self.max_tries
        )))
    }
}

type SyncHandler = Box<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;
type AsyncHandler =
    Box<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, String>> + Send + Sync>;

enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// Receiving side of the channel, hosted in-process.
///
/// Handlers are registered per [`RemoteCall`] type, so argument and reply
/// types are checked at compile time. Unregistered or unknown method names
/// are ignored without a reply.
#[derive(Default)]
pub struct Endpoint {
    handlers: HashMap<Method, Handler>,
}

impl Endpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler.
    pub fn on<C, F>(&mut self, handler: F) -> &mut Self
    where
        C: RemoteCall,
        F: Fn(C) -> C::Output + Send + Sync + 'static,
    {
        let wrapped: SyncHandler = Box::new(move |args| {
            let call: C = serde_json::from_value(args).map_err(|e| e.to_string())?;
            serde_json::to_value(handler(call)).map_err(|e| e.to_string())
        });
        self.handlers.insert(C::METHOD, Handler::Sync(wrapped));
        self
    }

    /// Register a handler whose reply is produced asynchronously.
    pub fn on_async<C, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        C: RemoteCall,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = C::Output> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: AsyncHandler = Box::new(move |args| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let call: C = serde_json::from_value(args).map_err(|e| e.to_string())?;
                let out = handler(call).await;
                serde_json::to_value(out).map_err(|e| e.to_string())
            })
        });
        self.handlers.insert(C::METHOD, Handler::Async(wrapped));
        self
    }

    /// Dispatch one envelope. `None` means no reply is sent.
    pub async fn receive(&self, envelope: &Envelope) -> Option<std::result::Result<Value, String>> {
        let method = Method::from_name(&envelope.method)?;
        let handler = self.handlers.get(&method)?;
        let reply = match handler {
            Handler::Sync(f) => f(envelope.args.clone()),
            Handler::Async(f) => f(envelope.args.clone()).await,
        };
        Some(reply)
    }
}

#[async_trait]
impl Transport for Endpoint {
    async fn send(&self, envelope: &Envelope) -> std::result::Result<Option<Value>, ChannelError> {
        match self.receive(envelope).await {
            None => Ok(None),
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(msg)) => Err(ChannelError::Failed(msg)),
        }
    }
}
