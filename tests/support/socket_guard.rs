//! Mock-server startup for HTTP tests, shared by unit and integration tests.
//!
//! Sandboxed runners sometimes forbid binding localhost. Tests then skip
//! with a note on stderr, unless `MEDIAFETCH_REQUIRE_SOCKET_TESTS` is set.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_ENV: &str = "MEDIAFETCH_REQUIRE_SOCKET_TESTS";

/// Starts a mock server, or returns `None` when localhost cannot be bound.
///
/// # Panics
///
/// When binding fails and the require variable is `1`, `true` or `yes`.
#[track_caller]
pub fn start_mock_server_or_skip() -> impl std::future::Future<Output = Option<MockServer>> {
    let caller = Location::caller();
    let bindable = TcpListener::bind("127.0.0.1:0").is_ok();
    async move {
        if bindable {
            return Some(MockServer::start().await);
        }
        let required = std::env::var(REQUIRE_ENV)
            .is_ok_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));
        assert!(
            !required,
            "localhost unavailable for mock server at {caller} while {REQUIRE_ENV} is set"
        );
        eprintln!("skipping {caller}: localhost unavailable for mock server");
        None
    }
}
