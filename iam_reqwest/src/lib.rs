//! Middleware to automatically attach IAM authorization to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to attach a
//! valid access token from a [`TokenCache`] to each outbound request. The
//! cache renews the token as it goes stale, and holds back requests while an
//! expired token is being replaced. A request is never sent with an expired
//! token: if the replacement cannot be obtained, the request fails with a
//! [`RefreshError`][iam_tokens::RefreshError] instead.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use iam_reqwest::AccessTokenMiddleware;
//! use iam_tokens::TokenCache;
//! use reqwest::Client;
//! # use iam_clock::DurationSecs;
//! # use iam_tokens::{issuer::ConstTokenIssuer, AccessToken, ApiKey, TokenCacheConfig};
//! #
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let issuer = ConstTokenIssuer::new(AccessToken::from_static("token"), DurationSecs(3600));
//! # let token_cache = TokenCache::from_issuer(issuer, ApiKey::from_static("key"), TokenCacheConfig::default()).await.unwrap();
//!
//! let client = AccessTokenMiddleware::new(token_cache).authenticate(Client::default());
//!
//! let req = client
//!     .get("https://example.cloudantnosqldb.appdomain.cloud/_all_dbs");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The middleware can also be configured to add an authorization token
//! only conditionally. This can be useful in the event that you want to
//! use a single common middleware stack with multiple potential backends
//! and want to ensure that specific tokens are used for specific backends.
//!
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a token to a request.
//!
//! ```
//! use iam_reqwest::{
//!     AccessTokenMiddleware, ExactHostMatch, HttpsOnly
//! };
//! use predicates::prelude::PredicateBooleanExt;
//! # use iam_clock::DurationSecs;
//! # use iam_tokens::{issuer::ConstTokenIssuer, AccessToken, ApiKey, TokenCache, TokenCacheConfig};
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let issuer = ConstTokenIssuer::new(AccessToken::from_static("token"), DurationSecs(3600));
//! # let token_cache = TokenCache::from_issuer(issuer, ApiKey::from_static("key"), TokenCacheConfig::default()).await.unwrap();
//!
//! AccessTokenMiddleware::new(token_cache)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("example.com")));
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use bytes::{BufMut, BytesMut};
use iam_clock::Clock;
use iam_tokens::TokenCache;
use predicates::{constant::BooleanPredicate, prelude::*, reflection};
use reqwest::{header, Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Error, Middleware, Next, Result};

const BEARER: &[u8] = b"Bearer ";

/// A middleware that injects an access token into outgoing requests
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<P = BooleanPredicate> {
    token_cache: TokenCache,
    predicate: P,
}

impl AccessTokenMiddleware {
    /// Construct a new middleware from a token cache
    ///
    /// By default, this middleware attaches its token to every request. To
    /// restrict which requests receive it, provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(token_cache: TokenCache) -> Self {
        Self {
            token_cache,
            predicate: predicate::always(),
        }
    }
}

impl<P> AccessTokenMiddleware<P> {
    /// Replaces the current predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> AccessTokenMiddleware<Q> {
        AccessTokenMiddleware {
            token_cache: self.token_cache,
            predicate,
        }
    }

    /// The token cache backing this middleware
    pub fn token_cache(&self) -> &TokenCache {
        &self.token_cache
    }

    async fn authorization_header(&self, req: &Request) -> Result<header::HeaderValue> {
        let token = self.token_cache.access_token().await.map_err(|error| {
            let source: &(dyn std::error::Error + 'static) = &error;
            tracing::warn!(
                error = source,
                request.url = %req.url(),
                "no valid access token available, not sending request"
            );
            Error::middleware(error)
        })?;

        if tracing::enabled!(tracing::Level::TRACE) {
            let now = self.token_cache.config().clock().now();

            tracing::trace!(
                request.url = %req.url(),
                token.status = ?token.token_status_at(now),
                token.until_stale = token.until_stale_at(now).0,
                token.until_expired = token.until_expired_at(now).0,
                "attaching access token"
            );
        }

        let access_token = token.access_token().as_str().as_bytes();
        let mut header_value = BytesMut::with_capacity(BEARER.len() + access_token.len());
        header_value.put_slice(BEARER);
        header_value.put_slice(access_token);
        let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())
            .map_err(Error::middleware)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl<P> AccessTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    /// Binds the middleware to an existing client
    ///
    /// `client` becomes the transport every decorated request is forwarded to.
    pub fn authenticate(self, client: reqwest::Client) -> ClientWithMiddleware {
        ClientBuilder::new(client).with(self).build()
    }
}

#[async_trait::async_trait]
impl<P> Middleware for AccessTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if self.predicate.eval(&req) && !req.headers().contains_key(header::AUTHORIZATION) {
            let value = self.authorization_header(&req).await?;
            req.headers_mut().insert(header::AUTHORIZATION, value);
        }

        next.run(req, extensions).await
    }
}

/// Reports a mismatch against `expected`, naming the part of the request that decided it
fn mismatch<'a, P>(
    predicate: &'a P,
    expected: bool,
    req: &Request,
    part: &'static str,
    observed: &str,
) -> Option<reflection::Case<'a>>
where
    P: Predicate<Request>,
{
    let result = predicate.eval(req);
    (result != expected).then(|| {
        reflection::Case::new(Some(predicate), result)
            .add_product(reflection::Product::new(part, observed.to_owned()))
    })
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        mismatch(self, expected, req, "scheme", req.url().scheme())
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request uses https")
    }
}

/// Only attach an access token if the request is being sent to one service host
///
/// Parsed URLs carry lowercase hosts, so the configured host is lowercased
/// on construction.
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host name
    pub fn new(host: impl Into<String>) -> Self {
        let mut host = host.into();
        host.make_ascii_lowercase();
        Self { host }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(self.host.as_str())
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let host = req.url().host_str().unwrap_or("<no host>");
        mismatch(self, expected, req, "host", host)
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host is {}", self.host)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use iam_clock::{DurationSecs, TestClock, UnixTime};
    use iam_tokens::{
        issuer::{ConstTokenIssuer, IssuerError, TokenIssuer},
        AccessToken, ApiKey, ApiKeyRef, IssuedToken, RefreshError, TokenCacheConfig,
    };
    use reqwest::Client;

    use super::*;

    const TEST_TOKEN: &str = "this-is-a-test-token";
    const BEARER_TEST_TOKEN: &str = "Bearer this-is-a-test-token";
    const START: UnixTime = UnixTime(1_700_000_000);
    const SERVICE_URL: &str = "https://account.cloudantnosqldb.appdomain.cloud/_all_dbs";

    /// Ends the middleware chain, noting the `Authorization` header of each request
    #[derive(Default)]
    struct RecordingTransport {
        seen: Mutex<Vec<Option<String>>>,
    }

    impl RecordingTransport {
        fn seen(&self) -> Vec<Option<String>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Middleware for RecordingTransport {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization = req
                .headers()
                .get(header::AUTHORIZATION)
                .map(|value| value.to_str().unwrap().to_owned());
            self.seen.lock().unwrap().push(authorization);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    fn client_over<P>(
        middleware: AccessTokenMiddleware<P>,
        transport: &Arc<RecordingTransport>,
    ) -> ClientWithMiddleware
    where
        P: Predicate<Request> + Send + Sync + 'static,
    {
        let transport: Arc<dyn reqwest_middleware::Middleware> = transport.clone();
        ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(transport)
            .build()
    }

    fn bearer(token: &str) -> Option<String> {
        Some(format!("Bearer {}", token))
    }

    /// Hands out each scripted response once, after a short delay
    struct ScriptedIssuer {
        responses: Mutex<Vec<std::result::Result<IssuedToken, IssuerError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedIssuer {
        fn new(mut responses: Vec<std::result::Result<IssuedToken, IssuerError>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TokenIssuer for ScriptedIssuer {
        async fn fetch(&self, _: &ApiKeyRef) -> std::result::Result<IssuedToken, IssuerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            let next = self.responses.lock().unwrap().pop();
            next.expect("no scripted response left")
        }
    }

    fn issued(
        token: &'static str,
        expiration: u64,
    ) -> std::result::Result<IssuedToken, IssuerError> {
        Ok(IssuedToken::new(
            AccessToken::from_static(token),
            START + DurationSecs(expiration),
        ))
    }

    async fn prepare_middleware() -> AccessTokenMiddleware {
        let token_cache = TokenCache::from_issuer(
            ConstTokenIssuer::new(AccessToken::from_static(TEST_TOKEN), DurationSecs(3_600)),
            ApiKey::from_static("k1"),
            TokenCacheConfig::default(),
        )
        .await
        .unwrap();

        AccessTokenMiddleware::new(token_cache)
    }

    async fn prepare_scripted(
        issuer: &Arc<ScriptedIssuer>,
        clock: &TestClock,
    ) -> AccessTokenMiddleware {
        let token_cache = TokenCache::from_issuer(
            Arc::clone(issuer),
            ApiKey::from_static("k1"),
            TokenCacheConfig::new(DurationSecs(5), Duration::from_secs(5))
                .with_clock(clock.clone()),
        )
        .await
        .unwrap();

        AccessTokenMiddleware::new(token_cache)
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_with_defaults_attaches_token_to_any_request() {
            let transport = Arc::new(RecordingTransport::default());
            let client = client_over(prepare_middleware().await, &transport);

            client.get(SERVICE_URL).send().await.unwrap();
            client.get("http://localhost:5984").send().await.unwrap();

            assert_eq!(transport.seen(), vec![bearer(TEST_TOKEN), bearer(TEST_TOKEN)]);
        }

        #[tokio::test]
        async fn https_only_skips_plain_http_requests() {
            let transport = Arc::new(RecordingTransport::default());
            let middleware = prepare_middleware().await.with_predicate(HttpsOnly);
            let client = client_over(middleware, &transport);

            client.get(SERVICE_URL).send().await.unwrap();
            client.get("http://localhost:5984").send().await.unwrap();

            assert_eq!(transport.seen(), vec![bearer(TEST_TOKEN), None]);
        }

        #[tokio::test]
        async fn never_predicate_sends_requests_untouched() {
            let transport = Arc::new(RecordingTransport::default());
            let middleware = prepare_middleware()
                .await
                .with_predicate(predicate::never());
            let client = client_over(middleware, &transport);

            let resp = client.get(SERVICE_URL).send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert_eq!(transport.seen(), vec![None]);
        }
    }

    mod when_request_already_contains_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn existing_header_is_left_in_place() {
            let transport = Arc::new(RecordingTransport::default());
            let client = client_over(prepare_middleware().await, &transport);

            client
                .get(SERVICE_URL)
                .bearer_auth("overridden!")
                .send()
                .await
                .unwrap();

            assert_eq!(transport.seen(), vec![bearer("overridden!")]);
        }
    }

    mod when_token_has_expired {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn concurrent_requests_wait_for_one_refresh() {
            let clock = TestClock::new(START);
            let issuer = Arc::new(ScriptedIssuer::new(vec![
                issued("t1", 10),
                issued("t2", 3_600),
            ]));
            let transport = Arc::new(RecordingTransport::default());
            let client = client_over(prepare_scripted(&issuer, &clock).await, &transport);

            client.get(SERVICE_URL).send().await.unwrap();
            clock.inc(11);

            let mut handles = Vec::new();
            for _ in 0..5 {
                let client = client.clone();
                handles.push(tokio::spawn(async move { client.get(SERVICE_URL).send().await }));
            }

            for handle in handles {
                let resp = handle.await.unwrap().unwrap();
                assert_eq!(resp.status(), http::StatusCode::OK);
            }

            let seen = transport.seen();
            assert_eq!(seen[0], bearer("t1"));
            assert_eq!(seen[1..], vec![bearer("t2"); 5]);
            assert_eq!(issuer.calls(), 2);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn failed_refresh_sends_no_request() {
            let clock = TestClock::new(START);
            let issuer = Arc::new(ScriptedIssuer::new(vec![
                issued("t1", 10),
                Err(IssuerError::Rejected {
                    status: 400,
                    body: "Provided API key could not be found.".to_owned(),
                }),
            ]));
            let transport = Arc::new(RecordingTransport::default());
            let client = client_over(prepare_scripted(&issuer, &clock).await, &transport);
            clock.inc(11);

            let mut handles = Vec::new();
            for _ in 0..5 {
                let client = client.clone();
                handles.push(tokio::spawn(async move { client.get(SERVICE_URL).send().await }));
            }

            for handle in handles {
                let err = handle.await.unwrap().unwrap_err();
                match err {
                    Error::Middleware(error) => {
                        let refresh = error
                            .downcast_ref::<RefreshError>()
                            .expect("middleware error is a refresh error");
                        assert!(matches!(refresh, RefreshError::RefreshFailed { .. }));
                    }
                    other => panic!("expected middleware error, got {:?}", other),
                }
            }

            assert!(transport.seen().is_empty());
            assert_eq!(issuer.calls(), 2);
        }
    }

    mod when_bound_to_a_client {
        use wiremock::{
            matchers::{header as header_matcher, method, path},
            Mock, MockServer, ResponseTemplate,
        };

        use super::*;

        #[tokio::test]
        async fn requests_reach_the_server_with_a_bearer_token() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/_all_dbs"))
                .and(header_matcher("authorization", BEARER_TEST_TOKEN))
                .respond_with(ResponseTemplate::new(200).set_body_string(r#"["animaldb"]"#))
                .expect(1)
                .mount(&server)
                .await;

            let client = prepare_middleware().await.authenticate(Client::new());

            let resp = client
                .get(format!("{}/_all_dbs", server.uri()))
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert_eq!(resp.text().await.unwrap(), r#"["animaldb"]"#);
        }

        #[tokio::test]
        async fn server_responses_are_returned_unchanged() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
                .mount(&server)
                .await;

            let client = prepare_middleware().await.authenticate(Client::new());

            let resp = client.get(server.uri()).send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
            assert_eq!(resp.text().await.unwrap(), "unauthorized");
        }
    }

    mod predicates_on_requests {
        use super::*;

        fn request(url: &str) -> Request {
            Request::new(reqwest::Method::GET, url.parse().unwrap())
        }

        #[test]
        fn https_only_reports_the_offending_scheme() {
            assert!(HttpsOnly.eval(&request(SERVICE_URL)));
            assert!(HttpsOnly.find_case(true, &request(SERVICE_URL)).is_none());

            let case = HttpsOnly
                .find_case(true, &request("http://localhost:5984"))
                .expect("plain http is a mismatch");
            assert!(!case.result());
        }

        #[test]
        fn host_match_ignores_configured_case() {
            let predicate = ExactHostMatch::new("Account.CloudantNoSQLDB.appdomain.cloud");

            assert!(predicate.eval(&request(SERVICE_URL)));
            assert!(!predicate.eval(&request("https://other.cloudantnosqldb.appdomain.cloud")));
            assert!(predicate.find_case(false, &request("http://localhost:5984")).is_none());
        }

        #[test]
        fn predicates_compose() {
            let predicate =
                HttpsOnly.and(ExactHostMatch::new("account.cloudantnosqldb.appdomain.cloud"));

            assert!(predicate.eval(&request(SERVICE_URL)));
            assert!(!predicate.eval(&request(
                "http://account.cloudantnosqldb.appdomain.cloud/_all_dbs"
            )));
        }
    }
}
