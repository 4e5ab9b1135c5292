//! The responder seam.
//!
//! The pipeline needs exactly one thing from the routing layer: a way to
//! turn a [`Request`] into a future [`Response`]. Routing, middleware and
//! content handling all live behind this trait.

use std::future::Future;

use axum::body::Body;
use futures_util::future::BoxFuture;
use tower::ServiceExt;

use crate::http::{BoxError, Request, Response};

pub trait Responder: Send + Sync + 'static {
    fn respond(&self, request: Request) -> BoxFuture<'static, Result<Response, BoxError>>;
}

/// Responder backed by an async function.
#[derive(Clone)]
pub struct ResponderFn<F>(F);

/// Wraps `f` as a [`Responder`].
pub fn responder_fn<F, Fut>(f: F) -> ResponderFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, BoxError>> + Send + 'static,
{
    ResponderFn(f)
}

impl<F, Fut> Responder for ResponderFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, BoxError>> + Send + 'static,
{
    fn respond(&self, request: Request) -> BoxFuture<'static, Result<Response, BoxError>> {
        Box::pin((self.0)(request))
    }
}

impl Responder for axum::Router {
    fn respond(&self, request: Request) -> BoxFuture<'static, Result<Response, BoxError>> {
        let router = self.clone();
        Box::pin(async move {
            let request = request.map(Body::from);
            let response = match router.oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
            Ok(Response::from(response))
        })
    }
}
