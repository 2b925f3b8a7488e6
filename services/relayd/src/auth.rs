//! Authentication dispatch.
//!
//! The path manager hands every describe/announce/setup request to an
//! [`Authenticator`] together with the path's credential policy and the
//! session's failure history.  The built-in [`StaticAuthenticator`] checks
//! the per-path user/pass pair and IP allowlists from the configuration;
//! alternative backends implement the same trait.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::conf::PathConf;
use crate::session::Credentials;

/// How many failed validations a session may accumulate before the failure
/// becomes critical (connection close plus anti-brute-force pause).
pub const MAX_RETRYABLE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Read,
    Publish,
}

/// One authentication attempt.
#[derive(Debug)]
pub struct AuthRequest<'a> {
    pub action: AuthAction,
    pub path_name: &'a str,
    pub remote_addr: IpAddr,
    pub credentials: &'a Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    /// The session may retry with better credentials.
    NotCritical { hint: String },
    /// The session must be terminated after the anti-brute-force pause.
    Critical { hint: String },
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, conf: &PathConf, request: &AuthRequest<'_>) -> AuthOutcome;
}

// ---------------------------------------------------------------------------
// Static (config-driven) authenticator
// ---------------------------------------------------------------------------

/// Validates against the credential lists embedded in the path config.
#[derive(Debug, Default)]
pub struct StaticAuthenticator;

impl StaticAuthenticator {
    fn check(
        user: Option<&str>,
        pass: Option<&str>,
        ips: &[IpNet],
        request: &AuthRequest<'_>,
    ) -> Result<(), AuthFailure> {
        if !ips.is_empty() && !ips.iter().any(|net| net.contains(&request.remote_addr)) {
            return Err(AuthFailure::IpRejected);
        }
        if user.is_some() || pass.is_some() {
            let creds = request.credentials;
            if user != creds.user.as_deref() || pass != creds.pass.as_deref() {
                return Err(AuthFailure::BadCredentials);
            }
        }
        Ok(())
    }
}

enum AuthFailure {
    BadCredentials,
    IpRejected,
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, conf: &PathConf, request: &AuthRequest<'_>) -> AuthOutcome {
        let result = match request.action {
            AuthAction::Publish => Self::check(
                conf.publish_user.as_deref(),
                conf.publish_pass.as_deref(),
                &conf.publish_ips,
                request,
            ),
            AuthAction::Read => Self::check(
                conf.read_user.as_deref(),
                conf.read_pass.as_deref(),
                &conf.read_ips,
                request,
            ),
        };

        match result {
            Ok(()) => AuthOutcome::Ok,
            // an address outside the allowlist can never retry its way in
            Err(AuthFailure::IpRejected) => AuthOutcome::Critical {
                hint: format!("address {} is not allowed", request.remote_addr),
            },
            Err(AuthFailure::BadCredentials) => {
                // this attempt is failure number prior_failures + 1
                if request.credentials.prior_failures >= MAX_RETRYABLE_FAILURES {
                    AuthOutcome::Critical {
                        hint: "credentials rejected".to_owned(),
                    }
                } else {
                    AuthOutcome::NotCritical {
                        hint: "credentials required".to_owned(),
                    }
                }
            }
        }
    }
}
