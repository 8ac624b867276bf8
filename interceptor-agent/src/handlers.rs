use hudsucker::{
    hyper::{
        body::{Bytes, HttpBody, Sender},
        header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST, USER_AGENT},
        Body, Method, Request, Response, StatusCode,
    },
    HttpContext, HttpHandler, RequestOrResponse,
};
use interceptor_core::{
    Decision, RequestDescriptor, ResponseDescriptor, TrafficHook, BODY_PREVIEW_LIMIT,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Upstream body bytes kept for observation. Four bytes per preview
/// character plus one character, so the recorder can still tell a cut body
/// from a complete one.
pub const BODY_CAPTURE_LIMIT: usize = 4 * (BODY_PREVIEW_LIMIT + 1);

/// Hudsucker adapter around a [`TrafficHook`].
///
/// Hudsucker clones the handler for every request and runs
/// `handle_request` and `handle_response` of one exchange on the same clone,
/// so the in-flight request descriptor is kept in a plain field.
#[derive(Clone)]
pub struct InterceptHandler {
    hook: Arc<dyn TrafficHook>,
    current: Option<RequestDescriptor>,
}

impl InterceptHandler {
    pub fn new(hook: Arc<dyn TrafficHook>) -> Self {
        Self {
            hook,
            current: None,
        }
    }

    /// Request half of an exchange
    pub async fn intercept_request(&mut self, req: Request<Body>) -> RequestOrResponse {
        self.current = None;

        // Tunnel setup carries no exchange of its own
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let request = describe_request(&req);
        match self.hook.on_request(&request) {
            Decision::Intercept(interception) => {
                debug!(
                    "Serving rule '{}' for {} {}",
                    interception.rule.pattern, request.method, request.full_url
                );
                // Hudsucker skips handle_response for responses returned here
                self.hook.on_response(&request, &interception.response);
                RequestOrResponse::Response(build_response(&interception.response))
            }
            Decision::PassThrough(_) => {
                self.current = Some(request);
                RequestOrResponse::Request(req)
            }
        }
    }

    /// Response half of a passed-through exchange
    pub async fn observe_response(&mut self, res: Response<Body>) -> Response<Body> {
        let Some(request) = self.current.take() else {
            return res;
        };
        if !self.hook.wants_response(&request) {
            return res;
        }

        let observed = observed_response(&res);
        if is_event_stream(&res) {
            // An event stream may never end; report it without a body
            self.hook.on_response(&request, &observed);
            return res;
        }

        let (parts, body) = res.into_parts();
        let (sender, forwarded) = Body::channel();
        tokio::spawn(tee_body(body, sender, self.hook.clone(), request, observed));
        Response::from_parts(parts, forwarded)
    }
}

/// Status and headers of an upstream response; the body is filled in as
/// it streams past
fn observed_response(res: &Response<Body>) -> ResponseDescriptor {
    let mut response = ResponseDescriptor::new(res.status().as_u16());
    for (name, value) in res.headers() {
        if let Ok(value) = value.to_str() {
            response = response.with_header(name.as_str(), value);
        }
    }
    response
}

fn is_event_stream(res: &Response<Body>) -> bool {
    res.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().starts_with("text/event-stream"))
        .unwrap_or(false)
}

/// Forward `body` chunk by chunk into `sender`, keeping the first
/// [`BODY_CAPTURE_LIMIT`] bytes. The hook sees the response once the
/// capture is full or the body ends, whichever comes first, and before the
/// client sees the end of the body.
async fn tee_body(
    mut body: Body,
    mut sender: Sender,
    hook: Arc<dyn TrafficHook>,
    request: RequestDescriptor,
    observed: ResponseDescriptor,
) {
    let mut captured: Vec<u8> = Vec::new();
    let mut observed = Some(observed);
    let report = |observed: &mut Option<ResponseDescriptor>, captured: &[u8]| {
        if let Some(response) = observed.take() {
            hook.on_response(&request, &response.with_body(Bytes::copy_from_slice(captured)));
        }
    };

    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Upstream body failed for {}: {}", request.full_url, e);
                report(&mut observed, &captured);
                sender.abort();
                return;
            }
        };

        if captured.len() < BODY_CAPTURE_LIMIT {
            let take = chunk.len().min(BODY_CAPTURE_LIMIT - captured.len());
            captured.extend_from_slice(&chunk[..take]);
            if captured.len() == BODY_CAPTURE_LIMIT {
                report(&mut observed, &captured);
            }
        }

        if sender.send_data(chunk).await.is_err() {
            debug!("Client went away during {}", request.full_url);
            report(&mut observed, &captured);
            return;
        }
    }

    report(&mut observed, &captured);
    match body.trailers().await {
        Ok(Some(trailers)) => {
            let _ = sender.send_trailers(trailers).await;
        }
        Ok(None) => {}
        Err(e) => {
            warn!("Upstream trailers failed for {}: {}", request.full_url, e);
            sender.abort();
        }
    }
}

#[async_trait::async_trait]
impl HttpHandler for InterceptHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        self.intercept_request(req).await
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        self.observe_response(res).await
    }
}

/// Describe a proxied request. Origin-form URIs are completed from the
/// `Host` header.
pub fn describe_request(req: &Request<Body>) -> RequestDescriptor {
    let uri = req.uri();
    let host_header = req.headers().get(HOST).and_then(|v| v.to_str().ok());

    let full_url = match (uri.scheme_str(), uri.authority(), host_header) {
        (Some(_), Some(_), _) => uri.to_string(),
        (_, _, Some(host)) => format!(
            "http://{}{}",
            host,
            uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        ),
        _ => uri.to_string(),
    };

    let mut request = RequestDescriptor::new(req.method().as_str(), full_url);
    if request.host.is_empty() {
        if let Some(host) = uri.host().or(host_header) {
            request = request.with_host(host);
        }
    }
    match req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        Some(user_agent) => request.with_user_agent(user_agent),
        None => request,
    }
}

/// Turn a synthesized descriptor into a hyper response
pub fn build_response(response: &ResponseDescriptor) -> Response<Body> {
    let mut res = Response::new(Body::from(response.body.clone()));
    *res.status_mut() = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::OK);

    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                res.headers_mut().append(name, value);
            }
            _ => warn!("Dropping unusable header '{}'", name),
        }
    }
    res
}
