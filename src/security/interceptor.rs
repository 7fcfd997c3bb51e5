// RPC presentation of the auth gate as a tower layer
use axum::{
    extract::Request,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::security::auth::AuthGate;
use crate::security::middleware::RequestContext;

/// Wraps RPC routes so every call is authenticated before it is dispatched.
///
/// The check runs once when the call is made. For streaming calls that is
/// stream establishment: messages read from the body afterwards are not
/// re-checked.
#[derive(Clone)]
pub struct BearerAuthLayer {
    gate: AuthGate,
}

impl BearerAuthLayer {
    pub fn new(gate: AuthGate) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for BearerAuthLayer {
    type Service = BearerAuth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuth {
            gate: self.gate.clone(),
            inner,
        }
    }
}

#[derive(Clone)]
pub struct BearerAuth<S> {
    gate: AuthGate,
    inner: S,
}

impl<S> Service<Request> for BearerAuth<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        // The readied service is the one that must handle this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let gate = self.gate.clone();

        Box::pin(async move {
            match gate.authenticate(request.headers()).await {
                Ok(agent) => {
                    RequestContext::ensure(&mut request).set_identity(agent.clone());
                    request.extensions_mut().insert(agent);
                    inner.call(request).await
                }
                Err(e) => Ok(e.into_response()),
            }
        })
    }
}
