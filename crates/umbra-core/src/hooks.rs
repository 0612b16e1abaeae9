//! Extension hooks around the interception pipeline.
//!
//! Subscribers run synchronously in registration order. The first one to
//! return [`Interception::Replaced`] wins and later subscribers are skipped.

use std::fmt;
use std::sync::Arc;

use crate::message::{InterceptedRequest, InterceptedResponse};
use crate::url_rewriter::RewriteContext;

/// Named points in the pipeline where extensions may intervene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Before dispatch.
    Request,
    /// After the upstream fetch, before any rewriting.
    BeforeMod,
    /// After rewriting, before the response leaves the relay.
    Response,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::Request => "request",
            HookPoint::BeforeMod => "beforemod",
            HookPoint::Response => "response",
        }
    }
}

/// What a subscriber sees.
#[derive(Debug, Clone, Copy)]
pub enum HookEvent<'a> {
    Request {
        request: &'a InterceptedRequest,
        ctx: &'a RewriteContext,
    },
    Response {
        request: &'a InterceptedRequest,
        response: &'a InterceptedResponse,
        ctx: &'a RewriteContext,
    },
}

impl HookEvent<'_> {
    pub fn request(&self) -> &InterceptedRequest {
        match self {
            HookEvent::Request { request, .. } | HookEvent::Response { request, .. } => request,
        }
    }

    pub fn response(&self) -> Option<&InterceptedResponse> {
        match self {
            HookEvent::Request { .. } => None,
            HookEvent::Response { response, .. } => Some(response),
        }
    }

    pub fn context(&self) -> &RewriteContext {
        match self {
            HookEvent::Request { ctx, .. } | HookEvent::Response { ctx, .. } => ctx,
        }
    }
}

/// Result of a hook dispatch.
#[derive(Debug)]
pub enum Interception {
    Continue,
    Replaced(InterceptedResponse),
}

impl Interception {
    pub fn is_replaced(&self) -> bool {
        matches!(self, Interception::Replaced(_))
    }
}

/// Hook subscriber callback.
pub type HookFn = Arc<dyn Fn(&HookEvent<'_>) -> Interception + Send + Sync>;

struct Subscriber {
    point: HookPoint,
    name: String,
    callback: HookFn,
}

/// Ordered list of named hook subscribers.
#[derive(Default, Clone)]
pub struct HookRegistry {
    subscribers: Vec<Arc<Subscriber>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.subscribers
                    .iter()
                    .map(|s| format!("{}:{}", s.point.as_str(), s.name)),
            )
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a subscriber for `point`.
    pub fn subscribe<F>(&mut self, point: HookPoint, name: impl Into<String>, callback: F)
    where
        F: Fn(&HookEvent<'_>) -> Interception + Send + Sync + 'static,
    {
        self.subscribers.push(Arc::new(Subscriber {
            point,
            name: name.into(),
            callback: Arc::new(callback),
        }));
    }

    /// Number of subscribers registered for `point`.
    pub fn count(&self, point: HookPoint) -> usize {
        self.subscribers.iter().filter(|s| s.point == point).count()
    }

    /// Runs the subscribers of `point` in order until one replaces the result.
    pub fn dispatch(&self, point: HookPoint, event: &HookEvent<'_>) -> Interception {
        for subscriber in self.subscribers.iter().filter(|s| s.point == point) {
            if let Interception::Replaced(response) = (subscriber.callback)(event) {
                tracing::debug!(
                    hook = point.as_str(),
                    subscriber = %subscriber.name,
                    "Hook replaced response"
                );
                return Interception::Replaced(response);
            }
        }
        Interception::Continue
    }
}
