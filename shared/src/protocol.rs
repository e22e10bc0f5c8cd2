/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Default option values for the tarpit service
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORTS: &str = "8001-9000";
pub const DEFAULT_WRITE_INTERVAL_MS: u64 = 200;
pub const DEFAULT_WRITE_SIZE: usize = 2;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 5;

/// Header block that never reaches its terminating blank line. Repeated
/// cyclically it looks like a server that keeps adding headers forever.
pub const DEFAULT_RESPONSE_TEXT: &str = "HTTP/1.1 200 OK\r\n\
Server: Apache/2.4.41 (Ubuntu)\r\n\
Content-Type: text/html; charset=UTF-8\r\n\
Cache-Control: no-cache, no-store, must-revalidate\r\n\
Vary: Accept-Encoding\r\n\
Set-Cookie: PHPSESSID=7d2f9c41b8e05a63; path=/; HttpOnly\r\n\
X-Frame-Options: SAMEORIGIN\r\n";
