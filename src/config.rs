//! Resolves CLI flags and environment variables into one [`Config`] value
//! that is threaded into every HTTP handler instead of living in globals
//! (§9 "Global mutable state").

use std::path::PathBuf;

/// How the auth gate (§4.9) should treat inbound requests.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Step 2: accept every request regardless of credentials.
    pub no_auth: bool,
    /// Step 5: a static bearer token configured out of band.
    pub bearer_token: Option<String>,
    /// Basic auth, enabled when both `VIBETUNNEL_USERNAME` and
    /// `VIBETUNNEL_PASSWORD` are set.
    pub basic_auth: Option<(String, String)>,
    /// HMAC secret used to validate bearer tokens as JWTs (step 4).
    pub jwt_secret: Option<String>,
}

/// HQ-mode configuration: either this node *is* an HQ, or it registers
/// itself as a remote with one, or neither.
#[derive(Debug, Clone, Default)]
pub struct HqConfig {
    /// Bearer token remotes must present to be recognized as HQ-to-remote
    /// traffic. Set only when this node acts as an HQ.
    pub hq_bearer_token: Option<String>,
    /// If set, this node registers itself with the named HQ at startup and
    /// unregisters at shutdown (§4.8, "remote mode").
    pub remote_of: Option<RemoteOfConfig>,
}

#[derive(Debug, Clone)]
pub struct RemoteOfConfig {
    pub hq_url: String,
    pub hq_bearer_token: String,
    pub my_name: String,
    pub my_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub control_dir: PathBuf,
    pub bind_address: String,
    pub static_path: Option<PathBuf>,
    pub auth: AuthConfig,
    pub hq: HqConfig,
}

impl Config {
    /// Resolves the control directory from `VIBETUNNEL_CONTROL_DIR`, or the
    /// default `~/.vibetunnel/control` (§4.1).
    #[must_use]
    pub fn default_control_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("VIBETUNNEL_CONTROL_DIR") {
            return PathBuf::from(dir);
        }
        std::env::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vibetunnel/control")
    }

    /// Builds the auth configuration from environment variables, leaving
    /// CLI-supplied bearer/JWT/HQ settings to be layered on by the caller.
    #[must_use]
    pub fn auth_from_env() -> AuthConfig {
        let basic_auth = match (
            std::env::var("VIBETUNNEL_USERNAME"),
            std::env::var("VIBETUNNEL_PASSWORD"),
        ) {
            (Ok(user), Ok(pass)) => Some((user, pass)),
            _ => None,
        };

        AuthConfig {
            no_auth: false,
            bearer_token: None,
            basic_auth,
            jwt_secret: None,
        }
    }

    #[must_use]
    pub fn new(bind_address: String) -> Self {
        Self {
            control_dir: Self::default_control_dir(),
            bind_address,
            static_path: None,
            auth: Self::auth_from_env(),
            hq: HqConfig::default(),
        }
    }
}
