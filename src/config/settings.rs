use anyhow::Result;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Default deadline for unary handlers, seconds.
    pub request_timeout_secs: u64,
    /// How long graceful shutdown waits for streams to drain, seconds.
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Access token lifetime, seconds (default 1 hour).
    pub access_token_ttl_secs: i64,
    /// Refresh token lifetime, seconds (default 24 hours).
    pub refresh_token_ttl_secs: i64,
    /// Test-only switch: accept any known user regardless of password.
    pub disable_auth: bool,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Requests per minute per remote address, consulted on auth failure.
    pub unauth_requests_per_minute: u32,
    /// Requests per minute per authenticated user (overridable per user).
    pub user_requests_per_minute: u32,
    /// Concurrent streams per user per class when the user carries no
    /// explicit `streams_limit`.
    pub default_streams_limit: i32,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub admin: AdminConfig,
    pub node_name: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn new() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                port: env_parse("PORT", 8001),
                host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", 10),
                drain_timeout_secs: env_parse("DRAIN_TIMEOUT_SECS", 5),
            },
            auth: AuthConfig {
                access_token_ttl_secs: env_parse("ACCESS_TOKEN_TTL_SECS", 3600),
                refresh_token_ttl_secs: env_parse("REFRESH_TOKEN_TTL_SECS", 86400),
                disable_auth: std::env::var("DISABLE_AUTH")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            },
            limits: LimitsConfig {
                unauth_requests_per_minute: env_parse("UNAUTH_REQUESTS_PER_MINUTE", 10),
                user_requests_per_minute: env_parse("USER_REQUESTS_PER_MINUTE", 60),
                default_streams_limit: env_parse("DEFAULT_STREAMS_LIMIT", 1),
            },
            admin: AdminConfig {
                name: std::env::var("ADMIN_NAME").unwrap_or_else(|_| "admin".to_string()),
                password: std::env::var("ADMIN_PASSWORD")
                    .expect("ADMIN_PASSWORD must be set in environment variables"),
            },
            node_name: std::env::var("NODE_NAME").unwrap_or_else(|_| {
                format!("steward-{}", &uuid::Uuid::new_v4().to_string()[..8])
            }),
        })
    }

    /// Settings suitable for in-process tests: permissive, no env access.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            server: ServerConfig {
                port: 0,
                host: "127.0.0.1".to_string(),
                request_timeout_secs: 10,
                drain_timeout_secs: 5,
            },
            auth: AuthConfig {
                access_token_ttl_secs: 3600,
                refresh_token_ttl_secs: 86400,
                disable_auth: false,
            },
            limits: LimitsConfig {
                unauth_requests_per_minute: 10,
                user_requests_per_minute: 60,
                default_streams_limit: 1,
            },
            admin: AdminConfig {
                name: "admin".to_string(),
                password: "admin-password".to_string(),
            },
            node_name: "test-node".to_string(),
        }
    }
}
