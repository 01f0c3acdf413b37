//! Administrative service channel policy: which service operations exist,
//! who may invoke them, and how often.

use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Service operation selectors carried in the service command's flag field.
pub mod svc {
    pub const LOGIN: u16 = 1;
    pub const GET_CLIENT_LIST: u16 = 2;
    pub const KICK_CLIENT: u16 = 3;
    pub const BAN_IP: u16 = 4;
    pub const UNBAN_IP: u16 = 5;
    pub const GET_BAN_LIST: u16 = 6;
    pub const ADMIN_MSG: u16 = 7;
    pub const GET_COMPANY_LIST: u16 = 8;
    pub const REMOVE_COMPANY: u16 = 9;
    pub const SHUTDOWN: u16 = 10;
    pub const FORCE_SYNC: u16 = 11;
    /// Public-listing refresh; the only operation besides login that works
    /// without a session.
    pub const ANNOUNCE: u16 = 12;
}

/// Minimum spacing between two uses of the same service operation,
/// regardless of which client invokes them. Login attempts are exempt so a
/// mistyped password does not lock the operator out for a minute.
pub const SERVICE_COOLDOWN: Duration = Duration::from_secs(60);

/// Gatekeeper for the service channel: password login state per client and
/// the per-operation cooldown clock.
pub struct AdminGate {
    password: Option<String>,
    logged_in: HashSet<u32>,
    last_used: HashMap<u16, Instant>,
}

impl AdminGate {
    /// `password: None` disables the whole channel; every operation is then
    /// refused, including login.
    pub fn new(password: Option<String>) -> Self {
        AdminGate {
            password: password.filter(|p| !p.is_empty()),
            logged_in: HashSet::new(),
            last_used: HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.password.is_some()
    }

    /// Checks the cooldown for `flag` and, when clear, starts a new one.
    pub fn throttled(&mut self, flag: u16) -> bool {
        if flag == svc::LOGIN {
            return false;
        }
        let now = Instant::now();
        if let Some(last) = self.last_used.get(&flag) {
            if now.duration_since(*last) < SERVICE_COOLDOWN {
                return true;
            }
        }
        self.last_used.insert(flag, now);
        false
    }

    /// Validates a login attempt and remembers the session on success.
    pub fn try_login(&mut self, client: u32, password: &str) -> bool {
        let Some(expected) = self.password.as_deref() else {
            warn!("client {} tried to log in but no admin password is set", client);
            return false;
        };
        if expected == password {
            info!("client {} logged in as administrator", client);
            self.logged_in.insert(client);
            true
        } else {
            warn!("client {} failed an administrator login", client);
            false
        }
    }

    pub fn is_logged_in(&self, client: u32) -> bool {
        self.logged_in.contains(&client)
    }

    /// Forgets a session; called when the socket goes away.
    pub fn logout(&mut self, client: u32) {
        self.logged_in.remove(&client);
    }

    /// True when `client` may invoke `flag` right now. Login and announce
    /// are permitted on any enabled channel; everything else needs a
    /// session.
    pub fn authorized(&self, client: u32, flag: u16) -> bool {
        if !self.enabled() {
            return false;
        }
        flag == svc::LOGIN || flag == svc::ANNOUNCE || self.is_logged_in(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_and_session_tracking() {
        let mut gate = AdminGate::new(Some("secret".to_string()));
        assert!(gate.enabled());
        assert!(!gate.try_login(3, "wrong"));
        assert!(!gate.is_logged_in(3));
        assert!(gate.try_login(3, "secret"));
        assert!(gate.is_logged_in(3));
        assert!(gate.authorized(3, svc::KICK_CLIENT));
        assert!(!gate.authorized(4, svc::KICK_CLIENT));
        gate.logout(3);
        assert!(!gate.is_logged_in(3));
    }

    #[test]
    fn test_disabled_channel_refuses_everything() {
        let mut gate = AdminGate::new(None);
        assert!(!gate.enabled());
        assert!(!gate.try_login(1, ""));
        assert!(!gate.authorized(1, svc::LOGIN));

        let mut blank = AdminGate::new(Some(String::new()));
        assert!(!blank.enabled());
        assert!(!blank.try_login(1, ""));
    }

    #[test]
    fn test_cooldown_is_per_operation_and_global() {
        let mut gate = AdminGate::new(Some("pw".to_string()));
        assert!(!gate.throttled(svc::KICK_CLIENT));
        // Second use of the same operation inside the window is refused,
        // whoever asks.
        assert!(gate.throttled(svc::KICK_CLIENT));
        // A different operation has its own clock.
        assert!(!gate.throttled(svc::BAN_IP));
        // Logins never throttle.
        assert!(!gate.throttled(svc::LOGIN));
        assert!(!gate.throttled(svc::LOGIN));
    }
}
