use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::channel::Channel;
use crate::error::Result;
use crate::message::Message;

/// Receives inbound messages of a [`Channel`].
///
/// Returning `Ok(true)` claims the message and stops the chain.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, msg: &Message, channel: &Channel) -> Result<bool>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message, &Channel) -> Result<bool> + Send + Sync,
{
    fn handle(&self, msg: &Message, channel: &Channel) -> Result<bool> {
        self(msg, channel)
    }
}

/// Ordered list of handlers, appended to while the channel runs.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Arc<RwLock<Vec<Arc<dyn MessageHandler>>>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handler: Arc<dyn MessageHandler>) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn MessageHandler>> {
        match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Offers `msg` to each handler in turn until one claims it.
    ///
    /// A failing handler ends the dispatch of this message; its error is
    /// returned. Handlers are called without holding the chain lock, so
    /// they may add further handlers.
    pub fn dispatch(&self, msg: &Message, channel: &Channel) -> Result<bool> {
        for handler in self.snapshot() {
            match handler.handle(msg, channel) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    warn!("handler failed on {}: {}", msg, e);
                    return Err(e);
                }
            }
        }
        Ok(false)
    }
}
