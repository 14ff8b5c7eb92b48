use std::sync::Arc;

use axum::extract::Request;
use axum::handler::Handler;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::{self, Next};
use axum::routing::get;
use axum::Router;
use tokio::net::{TcpListener, ToSocketAddrs};
use tower::ServiceBuilder;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::gate::{tenant_gate, Principal};
use crate::health::health_router;
use crate::state::TenancyState;

/// Header set by a trusted authenticating proxy.
pub const REMOTE_USER_ID: &str = "x-remote-user-id";
pub const REMOTE_SUPERUSER: &str = "x-remote-superuser";

type PrincipalFn = Arc<dyn Fn(&HeaderMap) -> Option<Principal> + Send + Sync>;

#[derive(Clone, Copy, Default)]
struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Principal from the trusted proxy headers, if present.
pub fn trusted_header_principal(headers: &HeaderMap) -> Option<Principal> {
    let user_id = headers
        .get(REMOTE_USER_ID)?
        .to_str()
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;
    let is_superuser = headers
        .get(REMOTE_SUPERUSER)
        .and_then(|v| v.to_str().ok())
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);
    Some(Principal {
        user_id,
        is_superuser,
    })
}

/// Router builder with the gate, health routes and request tracing.
#[derive(Clone)]
pub struct TenancyApp {
    pub state: TenancyState,
    pub router: Router<()>,
    principal: Option<PrincipalFn>,
}

impl TenancyApp {
    pub fn new(state: TenancyState) -> Self {
        Self {
            state,
            router: Router::new(),
            principal: None,
        }
    }

    pub fn use_router(mut self, path: &str, router: Router<()>) -> Self {
        self.router = if path.is_empty() || path == "/" {
            self.router.merge(router)
        } else {
            self.router.nest(path, router)
        };
        self
    }

    pub fn use_get<H, T>(self, path: &str, handler: H) -> Self
    where
        H: Handler<T, ()> + Clone + Send + 'static,
        T: 'static,
    {
        let router = Router::new().route(path, get(handler));
        self.use_router("/", router)
    }

    /// How the authenticated user is derived from a request.
    pub fn with_principal<F>(mut self, resolve: F) -> Self
    where
        F: Fn(&HeaderMap) -> Option<Principal> + Send + Sync + 'static,
    {
        self.principal = Some(Arc::new(resolve));
        self
    }

    pub fn into_router(self) -> Router {
        let gated = self
            .router
            .merge(health_router(self.state.clone()))
            .layer(middleware::from_fn_with_state(self.state.clone(), tenant_gate));

        let authenticated = match self.principal {
            Some(resolve) => gated.layer(middleware::from_fn(move |mut req: Request, next: Next| {
                let resolve = Arc::clone(&resolve);
                async move {
                    if let Some(principal) = resolve(req.headers()) {
                        req.extensions_mut().insert(principal);
                    }
                    next.run(req).await
                }
            })),
            None => gated,
        };

        authenticated.layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
    }

    pub async fn listen<A>(self, addr: A) -> anyhow::Result<()>
    where
        A: ToSocketAddrs,
    {
        let registry = Arc::clone(&self.state.registry);
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening");

        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;

        registry.shutdown().await;
        Ok(())
    }
}
