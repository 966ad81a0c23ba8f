//! HTTP API for registering subdomains and updating their challenge values.
//!
//! # API Endpoints
//!
//! ## `/healthcheck` (GET)
//!
//!   Returns HTTP 200 (OK) and the JSON body `{"ok":"healthy"}` when the service is operational.
//!
//! ## `/register` (POST)
//!
//!   Creates a new registration with a random username, password and subdomain. The request
//!   body is optional; when present it may restrict which networks can update the subdomain:
//!
//!   ```json
//!   { "allowfrom": ["192.168.100.1/24", "2001:db8::/32"] }
//!   ```
//!
//!   Returns HTTP 201 (Created) and a JSON body of the form:
//!
//!   ```json
//!   {
//!     "username": "eabcdb41-d89f-4580-826f-3e62e9755ef2",
//!     "password": "pbAXVjlIOE01xbut7YnAbkhMQIkcwoHO0ek2j4Q0",
//!     "fulldomain": "d420c923-bbd7-4056-ab64-c3ca54c9b3cf.auth.example.org",
//!     "subdomain": "d420c923-bbd7-4056-ab64-c3ca54c9b3cf",
//!     "allowfrom": ["192.168.100.1/24", "2001:db8::/32"]
//!   }
//!   ```
//!
//!   The password is returned only once. An invalid `allowfrom` entry returns HTTP 400. With
//!   [`Config::disable_registration`][crate::config::Config::disable_registration] set, returns
//!   HTTP 501 (Not Implemented).
//!
//! ## `/update` (POST)
//!
//!   Expects `X-Api-User` and `X-Api-Key` headers carrying the registration's username and
//!   password, and a JSON request body of the form:
//!
//!   ```json
//!   { "subdomain": "d420c923-bbd7-4056-ab64-c3ca54c9b3cf", "txt": "XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX" }
//!   ```
//!
//!   Checks are made in order:
//!
//!   1. The credentials must match a registration, else HTTP 401.
//!   2. The registration must own `subdomain`, else HTTP 403.
//!   3. The client address must be inside one of the registration's `allowfrom` networks (if
//!      any), else HTTP 403. Behind a reverse proxy, set
//!      [`Config::use_header`][crate::config::Config::use_header] to take the client address
//!      from a header such as `X-Forwarded-For`.
//!   4. The `txt` value must be shaped like a [RFC-8555][RFC-8555] [DNS-01] challenge response,
//!      else HTTP 400.
//!
//!   For successful updates, returns HTTP 200 (OK) and a JSON response body of the form:
//!
//!   ```json
//!   { "txt": "XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX" }
//!   ```
//!
//!   The two most recent values are served by the [DNS server][crate::dns].
//!
//!   ```bash
//!   ❯ curl -H "X-Api-User: eabcdb41-d89f-4580-826f-3e62e9755ef2" \
//!       -H "X-Api-Key: pbAXVjlIOE01xbut7YnAbkhMQIkcwoHO0ek2j4Q0" \
//!       --json '{"subdomain":"d420c923-bbd7-4056-ab64-c3ca54c9b3cf","txt":"LPsIwTo7o8BoG0-vjCyGQGBWSVIPxI-i_X336eUOQZo"}' \
//!       http://localhost:3000/update
//!   {"txt":"LPsIwTo7o8BoG0-vjCyGQGBWSVIPxI-i_X336eUOQZo"}
//!   ```
//!
//! Errors are returned as `{"error": "..."}`.
//!
//! [RFC-8555]: https://www.rfc-editor.org/rfc/rfc8555
//! [DNS-01]: https://www.rfc-editor.org/rfc/rfc8555#section-8.4

mod api_error;
mod model;
mod routes;
pub mod server;
pub mod tls;

pub use server::{new, router};
