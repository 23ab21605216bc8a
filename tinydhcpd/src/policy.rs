//! Address selection and request validation.
//!
//! `Policy` takes no clock and does no I/O of its own; `now` is always
//! passed in by the caller (the Engine), which is what makes the five-step
//! DISCOVER algorithm and four-step REQUEST algorithm exhaustively testable
//! without faking wall-clock time.

use std::net::Ipv4Addr;

use crate::config::SubnetConfig;
use crate::lease::{LeaseError, LeaseState, LeaseTable};
use crate::wire::HardwareAddress;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("no free address remains in the pool")]
    PoolExhausted,
    #[error("address is outside the configured subnet")]
    NotInSubnet,
}

#[derive(Debug)]
pub struct Allocation {
    pub ip: Ipv4Addr,
    pub ttl_secs: u64,
}

pub enum RequestOutcome {
    Ack(Allocation),
    Nak,
}

pub struct Policy<'a> {
    config: &'a SubnetConfig,
}

impl<'a> Policy<'a> {
    pub fn new(config: &'a SubnetConfig) -> Self {
        Self { config }
    }

    /// Runs the five-step DISCOVER allocation order -- reservation, client
    /// hint, existing binding, free pool scan -- inserting an `Offered`
    /// binding on success.
    pub fn select_discover(
        &self,
        leases: &mut LeaseTable,
        hw: HardwareAddress,
        client_ip: Ipv4Addr,
        hint: Option<Ipv4Addr>,
        now: u64,
    ) -> Result<Allocation, PolicyError> {
        leases.reclaim(now);

        // Step 2: a configured reservation always wins.
        if let Some(reserved) = self.config.reservation_for(&hw) {
            let allocation = Allocation {
                ip: reserved,
                ttl_secs: self.config.lease_seconds as u64,
            };
            self.commit_offer(leases, hw, &allocation, now);
            return Ok(allocation);
        }

        // Step 3: honor the client's hint if it matches its own current
        // binding and lies inside the pool.
        if let Some(hint) = hint {
            if self.config.in_range(hint) {
                if let Some(cur) = leases.get(&hw, now) {
                    if cur.ip == hint {
                        let allocation = Allocation {
                            ip: hint,
                            ttl_secs: self.config.lease_seconds as u64,
                        };
                        self.commit_offer(leases, hw, &allocation, now);
                        return Ok(allocation);
                    }
                }
            }
        }

        // Step 4: a client that already knows an address (ciaddr set) and
        // has a current binding gets to keep renewing toward it.
        if client_ip != Ipv4Addr::UNSPECIFIED {
            if let Some(cur) = leases.get(&hw, now) {
                let remaining = cur.expires_at.saturating_sub(now).max(1);
                let allocation = Allocation {
                    ip: cur.ip,
                    ttl_secs: remaining,
                };
                self.commit_offer(leases, hw, &allocation, now);
                return Ok(allocation);
            }
        }

        // Step 5: scan the pool in ascending order for the first free
        // address.
        for candidate in self.config.pool() {
            if !leases.is_in_use(candidate, now) {
                let allocation = Allocation {
                    ip: candidate,
                    ttl_secs: self.config.lease_seconds as u64,
                };
                self.commit_offer(leases, hw, &allocation, now);
                return Ok(allocation);
            }
        }

        Err(PolicyError::PoolExhausted)
    }

    fn commit_offer(&self, leases: &mut LeaseTable, hw: HardwareAddress, allocation: &Allocation, now: u64) {
        // A collision here would mean the scan above raced with itself,
        // which cannot happen since Policy and LeaseTable are both driven
        // single-threaded by the Engine; ignore the (unreachable) error
        // rather than panic.
        let _: Result<(), LeaseError> = leases.upsert(
            hw,
            allocation.ip,
            crate::lease::OFFER_TTL_SECS,
            LeaseState::Offered,
            now,
        );
    }

    /// Runs the four-step REQUEST validation: resolve the requested address,
    /// check it against the subnet, then confirm it matches the client's
    /// existing binding before acking.
    pub fn validate_request(
        &self,
        leases: &mut LeaseTable,
        hw: HardwareAddress,
        hint: Option<Ipv4Addr>,
        client_ip: Ipv4Addr,
        now: u64,
    ) -> RequestOutcome {
        let requested = hint.filter(|ip| *ip != Ipv4Addr::UNSPECIFIED).or({
            if client_ip != Ipv4Addr::UNSPECIFIED {
                Some(client_ip)
            } else {
                None
            }
        });

        let Some(requested) = requested else {
            return RequestOutcome::Nak;
        };

        if !self.config.contains(requested) {
            return RequestOutcome::Nak;
        }

        leases.reclaim(now);

        if let Some(binding) = leases.get(&hw, now) {
            if binding.ip == requested {
                let ttl = self.config.lease_seconds as u64;
                if leases
                    .upsert(hw, requested, ttl, LeaseState::Bound, now)
                    .is_ok()
                {
                    return RequestOutcome::Ack(Allocation {
                        ip: requested,
                        ttl_secs: ttl,
                    });
                }
            }
        }

        RequestOutcome::Nak
    }

    /// RELEASE: unconditionally drop the binding for `hw`.
    pub fn release(&self, leases: &mut LeaseTable, hw: &HardwareAddress) {
        leases.release(hw);
    }

    /// DECLINE: evict `hw`'s current binding and sink `ip` under the
    /// sentinel so it is never offered again.
    pub fn decline(&self, leases: &mut LeaseTable, hw: &HardwareAddress, ip: Ipv4Addr) {
        leases.release(hw);
        leases.mark_declined(ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> SubnetConfig {
        SubnetConfig::new(
            Ipv4Addr::new(192, 168, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 0, 100),
            Ipv4Addr::new(192, 168, 0, 110),
            3600,
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap()
    }

    fn hw(b: u8) -> HardwareAddress {
        HardwareAddress::new(1, &[0, 0, 0, 0, 0, b])
    }

    #[test]
    fn discover_picks_first_free_address_in_range() {
        let config = config();
        let policy = Policy::new(&config);
        let mut leases = LeaseTable::new();

        let allocation = policy
            .select_discover(&mut leases, hw(1), Ipv4Addr::UNSPECIFIED, None, 0)
            .unwrap();

        assert_eq!(allocation.ip, Ipv4Addr::new(192, 168, 0, 100));
    }

    #[test]
    fn discover_honors_reservation_over_pool_scan() {
        let mut reservations = HashMap::new();
        reservations.insert(hw(9), Ipv4Addr::new(192, 168, 0, 50));
        let config = SubnetConfig::new(
            Ipv4Addr::new(192, 168, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 0, 100),
            Ipv4Addr::new(192, 168, 0, 110),
            3600,
            reservations,
            HashMap::new(),
        )
        .unwrap();
        let policy = Policy::new(&config);
        let mut leases = LeaseTable::new();

        let allocation = policy
            .select_discover(&mut leases, hw(9), Ipv4Addr::UNSPECIFIED, None, 0)
            .unwrap();

        assert_eq!(allocation.ip, Ipv4Addr::new(192, 168, 0, 50));
    }

    #[test]
    fn discover_fails_when_pool_exhausted() {
        let config = SubnetConfig::new(
            Ipv4Addr::new(192, 168, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 0, 100),
            Ipv4Addr::new(192, 168, 0, 100),
            3600,
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap();
        let policy = Policy::new(&config);
        let mut leases = LeaseTable::new();

        policy
            .select_discover(&mut leases, hw(1), Ipv4Addr::UNSPECIFIED, None, 0)
            .unwrap();

        let err = policy
            .select_discover(&mut leases, hw(2), Ipv4Addr::UNSPECIFIED, None, 0)
            .unwrap_err();

        assert!(matches!(err, PolicyError::PoolExhausted));
    }

    #[test]
    fn request_acks_when_hint_matches_offered_binding() {
        let config = config();
        let policy = Policy::new(&config);
        let mut leases = LeaseTable::new();
        let allocation = policy
            .select_discover(&mut leases, hw(1), Ipv4Addr::UNSPECIFIED, None, 0)
            .unwrap();

        let outcome = policy.validate_request(&mut leases, hw(1), Some(allocation.ip), Ipv4Addr::UNSPECIFIED, 1);

        match outcome {
            RequestOutcome::Ack(a) => assert_eq!(a.ip, allocation.ip),
            RequestOutcome::Nak => panic!("expected Ack"),
        }
    }

    #[test]
    fn request_naks_out_of_subnet_hint() {
        let config = config();
        let policy = Policy::new(&config);
        let mut leases = LeaseTable::new();

        let outcome = policy.validate_request(
            &mut leases,
            hw(1),
            Some(Ipv4Addr::new(10, 0, 0, 1)),
            Ipv4Addr::UNSPECIFIED,
            0,
        );

        assert!(matches!(outcome, RequestOutcome::Nak));
    }

    #[test]
    fn request_naks_without_prior_offer() {
        let config = config();
        let policy = Policy::new(&config);
        let mut leases = LeaseTable::new();

        let outcome = policy.validate_request(
            &mut leases,
            hw(1),
            Some(Ipv4Addr::new(192, 168, 0, 100)),
            Ipv4Addr::UNSPECIFIED,
            0,
        );

        assert!(matches!(outcome, RequestOutcome::Nak));
    }

    #[test]
    fn decline_then_discover_skips_the_declined_address() {
        let config = SubnetConfig::new(
            Ipv4Addr::new(192, 168, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 0, 100),
            Ipv4Addr::new(192, 168, 0, 101),
            3600,
            HashMap::new(),
            HashMap::new(),
        )
        .unwrap();
        let policy = Policy::new(&config);
        let mut leases = LeaseTable::new();

        policy.decline(&mut leases, &hw(1), Ipv4Addr::new(192, 168, 0, 100));

        let allocation = policy
            .select_discover(&mut leases, hw(2), Ipv4Addr::UNSPECIFIED, None, 0)
            .unwrap();

        assert_eq!(allocation.ip, Ipv4Addr::new(192, 168, 0, 101));
    }

    #[test]
    fn release_then_discover_may_reuse_the_address() {
        let config = config();
        let policy = Policy::new(&config);
        let mut leases = LeaseTable::new();

        let first = policy
            .select_discover(&mut leases, hw(1), Ipv4Addr::UNSPECIFIED, None, 0)
            .unwrap();
        policy.release(&mut leases, &hw(1));

        let second = policy
            .select_discover(&mut leases, hw(2), Ipv4Addr::UNSPECIFIED, None, 0)
            .unwrap();

        assert_eq!(first.ip, second.ip);
    }
}
