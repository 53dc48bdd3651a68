//! Message handler seam used by the consumer and by the add pipeline fallback.

use crate::message::Message;
use async_trait::async_trait;
use std::future::Future;

/// Error type returned by handlers; any error type can be boxed into it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes a single reserved (or locally redirected) message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
///
/// ```rust
/// use polled_queue::handler::{handler_fn, HandlerError};
/// use polled_queue::Message;
///
/// let handler = handler_fn(|message: Message| async move {
///     println!("{} bytes for {}", message.payload.len(), message.task_name);
///     Ok::<_, HandlerError>(())
/// });
/// ```
pub struct FnHandler<F> {
    func: F,
}

pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { func }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.func)(message.clone()).await
    }
}
