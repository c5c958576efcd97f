//! Plain HTTP health endpoint for liveness and readiness probes.

use std::convert::Infallible;

use hyper::{
    server::{conn::AddrIncoming, Builder},
    service::{make_service_fn, service_fn},
    Body,
    Method,
    Request,
    Response,
    StatusCode,
};

use crate::{identity::Readiness, shutdown::Shutdown};

pub const HEALTH_PATH: &str = "/health";

fn reply(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

/// `GET /health` answers 200 once the plugin is ready and 503 otherwise.
pub fn respond(
    request: &Request<Body>,
    readiness: &Readiness,
) -> Response<Body> {
    if request.method() != Method::GET || request.uri().path() != HEALTH_PATH {
        return reply(StatusCode::NOT_FOUND, "not found");
    }
    if readiness.is_ready() {
        reply(StatusCode::OK, "ok")
    } else {
        reply(StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serve the health endpoint until `shutdown` fires.
pub async fn serve(
    builder: Builder<AddrIncoming>,
    readiness: Readiness,
    shutdown: Shutdown,
) -> Result<(), hyper::Error> {
    let make_service = make_service_fn(move |_| {
        let readiness = readiness.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request: Request<Body>| {
                let response = respond(&request, &readiness);
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });
    builder
        .serve(make_service)
        .with_graceful_shutdown(shutdown.wait())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    #[test]
    fn follows_readiness() {
        let readiness = Readiness::default();
        assert_eq!(
            respond(&get("/health"), &readiness).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        readiness.set_ready(true);
        assert_eq!(
            respond(&get("/health"), &readiness).status(),
            StatusCode::OK
        );
    }

    #[test]
    fn unknown_routes() {
        let readiness = Readiness::default();
        readiness.set_ready(true);
        assert_eq!(
            respond(&get("/metrics"), &readiness).status(),
            StatusCode::NOT_FOUND
        );
        let post = Request::post("/health").body(Body::empty()).unwrap();
        assert_eq!(respond(&post, &readiness).status(), StatusCode::NOT_FOUND);
    }
}
