//! Rate-limit-aware request dispatcher for bucketed REST APIs.
//!
//! This crate provides a [`RequestManager`] that sends requests to an API
//! whose rate limits are not known up front but announced per response
//! through `X-RateLimit-*` headers.
//!
//! # Features
//!
//! - **Bucket discovery**: Routes are grouped into buckets as the API reveals them
//! - **Sequential buckets**: Requests sharing a bucket run one at a time, in order
//! - **Parallel buckets**: Unrelated buckets never wait on each other
//! - **Global budget**: Every request draws from one requests-per-second budget
//! - **Transparent recovery**: 429s are waited out, server errors are retried
//! - **Bounded memory**: Idle bucket hashes and handlers are swept on timers
//!
//! # Buckets
//!
//! Every request path is generalized into a bucket route by replacing resource
//! ids with `:id`. The id following `channels`, `guilds` or `webhooks` is kept
//! aside as the *major parameter*, which partitions a bucket further:
//!
//! ```rust
//! use bucket_dispatch::RouteData;
//! use http::Method;
//!
//! let route = RouteData::generate("/channels/123456789012345678/messages", &Method::GET);
//! assert_eq!(route.bucket_route, "/channels/:id/messages");
//! assert_eq!(route.major_parameter, "123456789012345678");
//! ```
//!
//! Until the API names the bucket of a route, requests to it are queued under
//! a provisional bucket derived from the method and bucket route. Once a
//! response carries `X-RateLimit-Bucket`, later requests move to the announced
//! bucket, while requests already queued finish where they are.
//!
//! # Fail-fast routes
//!
//! By default a rate limited request waits. Latency sensitive call sites can
//! opt out per route prefix, matched on segment boundaries, or with a
//! predicate:
//!
//! ```rust,no_run
//! use bucket_dispatch::RequestManager;
//!
//! let manager = RequestManager::builder()
//!     .token("my-token")
//!     .reject_routes(["/channels"])
//!     .build();
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use bucket_dispatch::{RequestManager, RequestOptions, ResponseBody};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), bucket_dispatch::DispatchError> {
//! let manager = RequestManager::builder()
//!     .token("my-token")
//!     .timeout(Duration::from_secs(10))
//!     .retries(2)
//!     .build();
//!
//! let mut events = manager.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//! });
//!
//! let message = manager
//!     .post(
//!         "/channels/123456789012345678/messages",
//!         RequestOptions::new().json(json!({ "content": "hello" })),
//!     )
//!     .await?;
//!
//! if let ResponseBody::Json(message) = message {
//!     println!("sent message {}", message["id"]);
//! }
//! # Ok(())
//! # }
//! ```

mod body;
mod builder;
mod error;
mod events;
mod global;
mod handler;
mod hash;
mod headers;
mod manager;
mod route;
mod sweeper;
mod transport;
mod types;

// Public re-exports
pub use builder::DispatcherBuilder;
pub use error::{ApiError, DispatchError, ErrorCode, TransportError};
pub use events::RestEvent;
pub use hash::BucketHash;
pub use manager::RequestManager;
pub use route::RouteData;
pub use transport::{FormPart, PreparedBody, PreparedRequest, ReqwestTransport, Transport};
pub use types::{
    ApiRequest, ApiResponse, AuthPrefix, InvalidRequestWarningData, Offset, RateLimitData,
    RateLimitPolicy, RateLimitScope, RawFile, RequestBody, RequestOptions, ResponseBody,
};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, StatusCode};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    /// Answers requests from a script and records when each one was sent.
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        script: Arc<Mutex<VecDeque<ApiResponse>>>,
        sent: Arc<Mutex<Vec<(String, Instant)>>>,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn push(&self, status: u16, headers: &[(&'static str, &'static str)]) {
            let mut map = HeaderMap::new();
            for (name, value) in headers {
                map.insert(*name, HeaderValue::from_static(*value));
            }
            self.script.lock().unwrap().push_back(ApiResponse {
                status: StatusCode::from_u16(status).unwrap(),
                headers: map,
                body: Bytes::new(),
            });
        }

        fn sent_urls(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
        }

        fn sent_at(&self) -> Vec<Instant> {
            self.sent.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError> {
            self.sent.lock().unwrap().push((request.url, Instant::now()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| ApiResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            }))
        }
    }

    fn manager(transport: &ScriptedTransport) -> RequestManager {
        RequestManager::builder()
            .api("http://api.test")
            .token("token")
            .offset(Duration::ZERO)
            .retry_backoff(Duration::from_millis(10))
            .transport(transport.clone())
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_waits_for_reset() {
        let transport = ScriptedTransport::default();
        transport.push(
            200,
            &[
                ("x-ratelimit-limit", "1"),
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset-after", "2"),
            ],
        );
        let manager = manager(&transport);
        let mut events = manager.subscribe();

        manager.get("/gateway/bot", RequestOptions::new()).await.unwrap();
        manager.get("/gateway/bot", RequestOptions::new()).await.unwrap();

        let sent = transport.sent_at();
        assert_eq!(sent[1] - sent[0], Duration::from_secs(2));

        let mut limited = None;
        while let Ok(event) = events.try_recv() {
            if let RestEvent::RateLimited(data) = event {
                limited = Some(data);
            }
        }
        let limited = limited.expect("a rate limit event");
        assert!(!limited.global);
        assert_eq!(limited.route, "/gateway/bot");
        assert_eq!(limited.limit, Some(1));
        assert_eq!(limited.hash, "Global(GET:/gateway/bot)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_bucket_is_sequential() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(100));
        let manager = manager(&transport);

        let mut tasks = Vec::new();
        for i in 0..3 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .get("/users/@me", RequestOptions::new().query("n", i))
                    .await
            }));
            // Let the task queue before spawning the next one.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(
            transport.sent_urls(),
            vec![
                "http://api.test/v10/users/@me?n=0",
                "http://api.test/v10/users/@me?n=1",
                "http://api.test/v10/users/@me?n=2",
            ]
        );
        let sent = transport.sent_at();
        assert!(sent[1] - sent[0] >= Duration::from_millis(100));
        assert!(sent[2] - sent[1] >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_majors_run_in_parallel() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(100));
        let manager = manager(&transport);

        let start = Instant::now();
        let (a, b) = tokio::join!(
            manager.get("/channels/111111111111111111/messages", RequestOptions::new()),
            manager.get("/channels/222222222222222222/messages", RequestOptions::new()),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(manager.handler_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_hash_migration() {
        let transport = ScriptedTransport::default();
        transport.push(200, &[("x-ratelimit-bucket", "abcd")]);
        let manager = manager(&transport);

        manager.get("/users/@me", RequestOptions::new()).await.unwrap();
        assert_eq!(manager.hash_count(), 1);
        assert_eq!(manager.handler_count(), 1);

        // The next request goes to the announced bucket's handler.
        manager.get("/users/@me", RequestOptions::new()).await.unwrap();
        assert_eq!(manager.handler_count(), 2);

        // The provisional handler drains and is swept, the new one stays.
        manager.get("/users/@me", RequestOptions::new()).await.unwrap();
        assert_eq!(manager.handler_count(), 2);
        assert_eq!(manager.sweep_handlers(), 2);
        assert_eq!(manager.handler_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_hash_migration_while_draining() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(100));
        transport.push(200, &[("x-ratelimit-bucket", "abcd")]);
        let manager = manager(&transport);
        let mut events = manager.subscribe();
        let start = Instant::now();

        let mut queued = Vec::new();
        for i in 0..3 {
            let manager = manager.clone();
            queued.push(tokio::spawn(async move {
                manager
                    .get("/users/@me", RequestOptions::new().query("n", i))
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // The first response has announced the bucket, the other two are
        // still queued on the provisional handler.
        tokio::time::sleep_until(start + Duration::from_millis(150)).await;
        manager
            .get("/users/@me", RequestOptions::new().query("n", 3))
            .await
            .unwrap();
        assert_eq!(manager.handler_count(), 2);

        for task in queued {
            task.await.unwrap().unwrap();
        }

        assert_eq!(
            transport.sent_urls(),
            vec![
                "http://api.test/v10/users/@me?n=0",
                "http://api.test/v10/users/@me?n=1",
                "http://api.test/v10/users/@me?n=3",
                "http://api.test/v10/users/@me?n=2",
            ]
        );
        let sent: Vec<_> = transport.sent_at().iter().map(|t| *t - start).collect();
        assert_eq!(
            sent,
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(150),
                Duration::from_millis(200),
            ]
        );

        let mut created = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RestEvent::Debug(message) = event {
                if let Some(id) = message.strip_prefix("Created handler ") {
                    created.push(id.to_string());
                }
            }
        }
        assert_eq!(created, vec!["Global(GET:/users/@me):global", "abcd:global"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sublimited_request_lets_its_bucket_proceed() {
        let transport = ScriptedTransport::default();
        transport.push(
            429,
            &[("retry-after", "10"), ("x-ratelimit-remaining", "4")],
        );
        let manager = manager(&transport);
        let start = Instant::now();

        let send = |n: u32| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .patch("/channels/111111111111111111", RequestOptions::new().query("n", n))
                    .await
                    .map(|_| Instant::now())
            })
        };
        let first = send(1);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = send(2);

        let second_done = second.await.unwrap().unwrap();
        assert!(second_done - start < Duration::from_secs(1));
        let first_done = first.await.unwrap().unwrap();
        assert!(first_done - start >= Duration::from_secs(10));

        assert_eq!(
            transport.sent_urls(),
            vec![
                "http://api.test/v10/channels/111111111111111111?n=1",
                "http://api.test/v10/channels/111111111111111111?n=2",
                "http://api.test/v10/channels/111111111111111111?n=1",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sublimit_is_waited_out_without_counting_a_retry() {
        let transport = ScriptedTransport::default();
        transport.push(429, &[("retry-after", "0.5")]);
        let manager = RequestManager::builder()
            .api("http://api.test")
            .token("token")
            .offset(Duration::ZERO)
            .retries(0)
            .transport(transport.clone())
            .build();

        let start = Instant::now();
        manager
            .patch("/channels/111111111111111111", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert_eq!(transport.sent_at().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_429_blocks_every_bucket() {
        let transport = ScriptedTransport::default();
        transport.push(
            429,
            &[("retry-after", "1"), ("x-ratelimit-global", "true")],
        );
        let manager = manager(&transport);
        let mut events = manager.subscribe();

        let start = Instant::now();
        manager.get("/users/@me", RequestOptions::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));

        let mut saw_global = false;
        while let Ok(event) = events.try_recv() {
            if let RestEvent::RateLimited(data) = event {
                saw_global |= data.global;
            }
        }
        assert!(saw_global);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_budget_is_shared() {
        let transport = ScriptedTransport::default();
        let manager = RequestManager::builder()
            .api("http://api.test")
            .token("token")
            .global_requests_per_second(2)
            .transport(transport.clone())
            .build();

        let start = Instant::now();
        let (a, b, c) = tokio::join!(
            manager.get("/channels/111111111111111111", RequestOptions::new()),
            manager.get("/channels/222222222222222222", RequestOptions::new()),
            manager.get("/channels/333333333333333333", RequestOptions::new()),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let mut sent = transport.sent_at();
        sent.sort();
        assert_eq!(sent[1], start);
        assert!(sent[2] - start >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_exhaust_retries() {
        let transport = ScriptedTransport::default();
        for _ in 0..4 {
            transport.push(503, &[]);
        }
        let manager = manager(&transport);

        let err = manager.get("/users/@me", RequestOptions::new()).await.unwrap_err();
        match err {
            DispatchError::Http { status, .. } => assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.sent_at().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_clears_token() {
        let transport = ScriptedTransport::default();
        transport.push(401, &[]);
        let manager = manager(&transport);

        let err = manager.get("/users/@me", RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Api(ref e) if e.status == StatusCode::UNAUTHORIZED));

        let err = manager.get("/users/@me", RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingToken));

        manager.set_token("fresh");
        manager.get("/users/@me", RequestOptions::new()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_warning() {
        let transport = ScriptedTransport::default();
        for _ in 0..4 {
            transport.push(403, &[]);
        }
        let manager = RequestManager::builder()
            .api("http://api.test")
            .token("token")
            .invalid_request_warning_interval(2)
            .transport(transport.clone())
            .build();
        let mut events = manager.subscribe();

        for _ in 0..4 {
            manager.get("/users/@me", RequestOptions::new()).await.unwrap_err();
        }

        let mut counts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RestEvent::InvalidRequestWarning(data) = event {
                counts.push(data.count);
            }
        }
        assert_eq!(counts, vec![2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_route_rejects() {
        let transport = ScriptedTransport::default();
        transport.push(
            200,
            &[
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset-after", "5"),
            ],
        );
        let manager = RequestManager::builder()
            .api("http://api.test")
            .token("token")
            .reject_routes(["/channels"])
            .transport(transport.clone())
            .build();

        let path = "/channels/111111111111111111/messages";
        manager.get(path, RequestOptions::new()).await.unwrap();
        let err = manager.get(path, RequestOptions::new()).await.unwrap_err();
        match err {
            DispatchError::RateLimited(data) => {
                assert_eq!(data.route, "/channels/:id/messages");
                assert_eq!(data.major_parameter, "111111111111111111");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.sent_at().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_leaves_queue_intact() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(100));
        let manager = manager(&transport);
        let cancel = CancellationToken::new();

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get("/users/@me", RequestOptions::new().query("n", 1)).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = tokio::spawn({
            let manager = manager.clone();
            let cancel = cancel.clone();
            async move {
                manager
                    .get("/users/@me", RequestOptions::new().query("n", 2).cancel_on(cancel))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        let third = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get("/users/@me", RequestOptions::new().query("n", 3)).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        cancel.cancel();

        assert!(matches!(second.await.unwrap(), Err(DispatchError::Cancelled)));
        first.await.unwrap().unwrap();
        third.await.unwrap().unwrap();
        assert_eq!(
            transport.sent_urls(),
            vec![
                "http://api.test/v10/users/@me?n=1",
                "http://api.test/v10/users/@me?n=3",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hash_sweep_respects_lifetime() {
        let transport = ScriptedTransport::default();
        transport.push(200, &[("x-ratelimit-bucket", "abcd")]);
        let manager = RequestManager::builder()
            .api("http://api.test")
            .token("token")
            .hash_lifetime(Duration::from_millis(100))
            .transport(transport.clone())
            .build();

        manager.get("/users/@me", RequestOptions::new()).await.unwrap();
        tokio::time::advance(Duration::from_millis(80)).await;
        manager.get("/users/@me", RequestOptions::new()).await.unwrap();
        tokio::time::advance(Duration::from_millis(70)).await;

        assert_eq!(manager.sweep_hashes(), 0);
        assert_eq!(manager.hash_count(), 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(manager.sweep_hashes(), 1);
        assert_eq!(manager.hash_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweepers_start_and_clear() {
        let transport = ScriptedTransport::default();
        let manager = manager(&transport);
        assert_eq!(manager.sweepers_running(), (true, true));

        manager.clear_hash_sweeper();
        manager.clear_handler_sweeper();
        assert_eq!(manager.sweepers_running(), (false, false));

        let manager = RequestManager::builder()
            .hash_sweep_interval(Duration::ZERO)
            .transport(transport)
            .build();
        assert_eq!(manager.sweepers_running(), (false, true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_sweeper_runs_on_interval() {
        let transport = ScriptedTransport::default();
        let manager = RequestManager::builder()
            .api("http://api.test")
            .token("token")
            .handler_sweep_interval(Duration::from_secs(60))
            .transport(transport.clone())
            .build();
        let mut events = manager.subscribe();

        manager.get("/users/@me", RequestOptions::new()).await.unwrap();
        assert_eq!(manager.handler_count(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(manager.handler_count(), 0);

        let mut swept = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RestEvent::HandlerSweep(ids) = event {
                swept.extend(ids);
            }
        }
        assert_eq!(swept, vec!["Global(GET:/users/@me):global".to_string()]);
    }
}
