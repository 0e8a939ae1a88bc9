use std::net::Ipv4Addr;
use tokio_util::sync::CancellationToken;

use crate::Discover;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    DiscoveryFailed,
    /// Controller still answers mDNS at the address we already use
    SameAddress,
    AddressChanged(Ipv4Addr),
}

/// Decides when repeated poll failures should trigger a fresh mDNS
/// lookup, and when an address swap has worked. Once in re-discovery
/// mode it stays there until a reconnect to a newly discovered address
/// succeeds; the caller paces attempts.
#[derive(Debug)]
pub struct RediscoveryController {
    failure_threshold: u32,
    enabled: bool,
    consecutive_failures: u32,
    active: bool,
}

impl RediscoveryController {
    pub fn new(failure_threshold: u32, enabled: bool) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            enabled,
            consecutive_failures: 0,
            active: false,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.enabled && !self.active && self.consecutive_failures >= self.failure_threshold {
            log::warn!(
                "{} consecutive failures, entering re-discovery",
                self.consecutive_failures
            );
            self.active = true;
        }
    }

    /// A successful cycle on the current address. Does not leave
    /// re-discovery mode; only a reconnect to a new address does
    pub fn record_success(&mut self) {
        if !self.active {
            self.consecutive_failures = 0;
        }
    }

    pub async fn attempt(
        &mut self,
        discover: &dyn Discover,
        current: &str,
        cancel: &CancellationToken,
    ) -> Outcome {
        let addr = match discover.discover(cancel).await {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("Re-discovery failed: {e:}");
                return Outcome::DiscoveryFailed;
            }
        };

        // Same address: the outage is not explained by the controller
        // moving, treat it as transient and keep looking
        if addr.to_string() == current {
            log::info!("Controller still at {addr}, staying in re-discovery");
            return Outcome::SameAddress;
        }

        log::info!("Controller moved {current} -> {addr}");
        Outcome::AddressChanged(addr)
    }

    /// Result of reconnecting after [`Outcome::AddressChanged`]
    pub fn reconnected(&mut self, ok: bool) {
        if ok {
            log::info!("Reconnected after re-discovery");
            self.active = false;
            self.consecutive_failures = 0;
        } else {
            log::warn!("Reconnect to re-discovered address failed, staying in re-discovery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DiscoveryError;
    use std::sync::Mutex;

    struct FakeDiscover(Mutex<Vec<Result<Ipv4Addr, ()>>>);

    #[async_trait::async_trait]
    impl Discover for FakeDiscover {
        async fn discover(&self, _cancel: &CancellationToken) -> Result<Ipv4Addr, DiscoveryError> {
            match self.0.lock().expect("lock").remove(0) {
                Ok(addr) => Ok(addr),
                Err(()) => Err(DiscoveryError::Cancelled),
            }
        }
    }

    #[test]
    fn enters_mode_at_threshold_only_when_enabled() {
        let mut ctl = RediscoveryController::new(3, true);
        ctl.record_failure();
        ctl.record_failure();
        assert!(!ctl.is_active());
        ctl.record_success();
        ctl.record_failure();
        ctl.record_failure();
        assert!(!ctl.is_active());
        ctl.record_failure();
        assert!(ctl.is_active());

        let mut disabled = RediscoveryController::new(3, false);
        (0..10).for_each(|_| disabled.record_failure());
        assert!(!disabled.is_active());
    }

    #[tokio::test]
    async fn same_address_keeps_mode_new_address_exits() {
        let discover = FakeDiscover(Mutex::new(vec![
            Err(()),
            Ok(Ipv4Addr::new(192, 168, 50, 118)),
            Ok(Ipv4Addr::new(192, 168, 50, 120)),
            Ok(Ipv4Addr::new(192, 168, 50, 120)),
        ]));
        let cancel = CancellationToken::new();
        let mut ctl = RediscoveryController::new(1, true);
        ctl.record_failure();
        assert!(ctl.is_active());

        let current = "192.168.50.118";
        assert_eq!(
            ctl.attempt(&discover, current, &cancel).await,
            Outcome::DiscoveryFailed
        );
        assert_eq!(
            ctl.attempt(&discover, current, &cancel).await,
            Outcome::SameAddress
        );
        assert!(ctl.is_active());

        let moved = Ipv4Addr::new(192, 168, 50, 120);
        assert_eq!(
            ctl.attempt(&discover, current, &cancel).await,
            Outcome::AddressChanged(moved)
        );
        ctl.reconnected(false);
        assert!(ctl.is_active());

        assert_eq!(
            ctl.attempt(&discover, current, &cancel).await,
            Outcome::AddressChanged(moved)
        );
        ctl.reconnected(true);
        assert!(!ctl.is_active());
        assert_eq!(ctl.consecutive_failures(), 0);
    }
}
