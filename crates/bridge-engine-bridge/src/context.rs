use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bridge_auth::AuthConfig;
use bridge_core::descriptor::OptionOverride;
use bridge_firewall::FirewallCollaborator;
use bridge_sessions::SessionManager;
use bridge_trust::{ConnectionLedger, RateLimitConfig, TrustFilter};

/// Everything one bridge needs that does not vary per connection: the
/// shared collaborators plus the knobs a connection consults while running.
pub struct BridgeContext {
    pub trust: Option<Arc<TrustFilter>>,
    pub ledger: Arc<ConnectionLedger>,
    pub rate_limit: RateLimitConfig,
    pub enable_auto_trust: bool,
    pub enable_firewall_ip_blocking: bool,
    pub enable_firewall_subnet_blocking: bool,
    pub firewall: Arc<dyn FirewallCollaborator>,
    pub auth: AuthConfig,
    pub sessions: SessionManager,
    pub global_overrides: BTreeMap<String, OptionOverride>,
    pub log_untrusted_connection_attempts: bool,
    pub inactivity_timeout: Duration,
    pub heartbeat_time: Duration,
    pub watchdog_timer_interval: Duration,
    pub session_keepalive: Duration,
    pub info_throttle: Duration,
}
