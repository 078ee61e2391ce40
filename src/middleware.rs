//! Admission middleware for routes that should be rate limited.
//!
//! Wraps a handler in admit → run → refund-on-failure and turns the two
//! kinds of denial into distinct responses: `429` with `Retry-After` for a
//! spent window, `403` with `captcha_required` when the caller has to solve
//! a challenge first. A coordinator that cannot answer, or cannot persist
//! the count, denies with `503` before the handler runs.

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, warn};

use crate::logging::fingerprint;
use crate::models::ErrorBody;
use crate::rate_limit::{Denial, RateLimitResult, Tier};
use crate::state::AppState;

/// Header carrying the signed-in user id. Must be set by a trusted layer in
/// front of this one, never taken from the client as is.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub identifier: String,
    pub tier: Tier,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Works out who is asking: a signed-in user, else the client address.
pub fn resolve_caller(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<Caller> {
    if let Some(user) = header_str(headers, USER_ID_HEADER) {
        return Some(Caller {
            identifier: format!("user:{user}"),
            tier: Tier::Authenticated,
        });
    }

    let ip = header_str(headers, "cf-connecting-ip")
        .map(str::to_owned)
        .or_else(|| {
            header_str(headers, "x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        })
        .or_else(|| peer.map(|addr| addr.ip().to_string()))?;

    Some(Caller {
        identifier: format!("ip:{ip}"),
        tier: Tier::Anonymous,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DenialBody {
    error: &'static str,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    reset_at: chrono::DateTime<chrono::Utc>,
}

fn deny(decision: &RateLimitResult, denial: Denial, retry_after: u64) -> Response {
    match denial {
        Denial::CaptchaRequired => (
            StatusCode::FORBIDDEN,
            Json(DenialBody {
                error: "captcha_required",
                reset_at: decision.reset_at,
            }),
        )
            .into_response(),
        Denial::RateLimited { reset_at } => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(DenialBody {
                    error: "rate_limited",
                    reset_at,
                }),
            )
                .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            response
        }
    }
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody::new("admission_unavailable")),
    )
        .into_response()
}

/// Admits the caller, runs the handler, and hands the admission back when
/// the handler does not succeed.
///
/// The request is counted before the handler runs, in the same actor step as
/// the limit check, so concurrent requests from one caller cannot all pass
/// while a slow handler is still working. They do all run concurrently once
/// admitted; bound per-caller concurrency in front of this layer if that
/// matters.
pub async fn require_admission(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let Some(caller) = resolve_caller(request.headers(), peer) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("unidentified_caller")),
        )
            .into_response();
    };

    let coordinator = &state.coordinator;
    let decision = match coordinator.admit(&caller.identifier, caller.tier).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(id = %fingerprint(&caller.identifier), error = %e, "admission failed");
            return unavailable();
        }
    };
    if let Some(denial) = decision.denial() {
        return deny(&decision, denial, decision.retry_after_secs(coordinator.now()));
    }

    let mut response = next.run(request).await;
    if !response.status().is_success() {
        if let Err(e) = coordinator.refund(&caller.identifier, &decision).await {
            // the caller keeps paying for the failed request
            warn!(id = %fingerprint(&caller.identifier), error = %e, "failed to refund admission");
        }
        return response;
    }

    let headers = response.headers_mut();
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(
        REMAINING_HEADER,
        HeaderValue::from(decision.remaining.saturating_sub(1)),
    );
    response
}
