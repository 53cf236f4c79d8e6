use axum::{extract::Request, middleware::Next, response::Response};

pub async fn log_requests_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let has_authorization = request.headers().contains_key("authorization");

    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        has_authorization,
        "handled HTTP request"
    );

    response
}
