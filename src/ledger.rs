//! Per-client accounting of outstanding subscriptions.
//!
//! Two dense counters per client, split by whether the subscription can be
//! satisfied locally or only by a remote node. Mutated exclusively through
//! the bank admit/retire paths; a decrement below zero means those paths
//! disagree with the banks and is fatal.

use crate::error::{Error, Result};
use crate::protocol::ClientId;

#[derive(Debug, Clone, Copy, Default)]
struct Outstanding {
    local: u32,
    remote: u32,
}

#[derive(Debug)]
pub struct QuotaLedger {
    counts: Vec<Outstanding>,
    max_local: u32,
    max_remote: u32,
}

impl QuotaLedger {
    pub fn new(max_clients: u16, max_local: u32, max_remote: u32) -> Self {
        Self {
            counts: vec![Outstanding::default(); usize::from(max_clients)],
            max_local,
            max_remote,
        }
    }

    pub fn in_range(&self, client: ClientId) -> bool {
        usize::from(client) < self.counts.len()
    }

    /// Admits one more subscription for `client`, or refuses without
    /// changing any count.
    pub fn try_charge(&mut self, client: ClientId, remote: bool) -> Result<()> {
        if !self.in_range(client) {
            return Err(Error::ClientOutOfRange(client));
        }
        let entry = &mut self.counts[usize::from(client)];
        let (count, cap) = if remote {
            (&mut entry.remote, self.max_remote)
        } else {
            (&mut entry.local, self.max_local)
        };
        if *count >= cap {
            return Err(Error::QuotaExceeded { client, remote });
        }
        *count += 1;
        Ok(())
    }

    /// Returns one subscription charge. Underflow is a fatal accounting
    /// violation.
    pub fn release(&mut self, client: ClientId, remote: bool) {
        let entry = &mut self.counts[usize::from(client)];
        let count = if remote {
            &mut entry.remote
        } else {
            &mut entry.local
        };
        assert!(
            *count > 0,
            "quota ledger underflow for client {client} (remote: {remote})"
        );
        *count -= 1;
    }

    pub fn outstanding(&self, client: ClientId) -> (u32, u32) {
        match self.counts.get(usize::from(client)) {
            Some(entry) => (entry.local, entry.remote),
            None => (0, 0),
        }
    }

    /// Local request slots still open for `client`, clamped at zero.
    pub fn free_local(&self, client: ClientId) -> u32 {
        let (local, _) = self.outstanding(client);
        self.max_local.saturating_sub(local)
    }

    /// Remote request slots still open for `client`, clamped at zero.
    pub fn free_remote(&self, client: ClientId) -> u32 {
        let (_, remote) = self.outstanding(client);
        self.max_remote.saturating_sub(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_release_round_trip() {
        let mut ledger = QuotaLedger::new(4, 3, 2);
        ledger.try_charge(1, false).expect("local");
        ledger.try_charge(1, true).expect("remote");
        assert_eq!(ledger.outstanding(1), (1, 1));
        assert_eq!(ledger.free_local(1), 2);
        assert_eq!(ledger.free_remote(1), 1);
        ledger.release(1, false);
        ledger.release(1, true);
        assert_eq!(ledger.outstanding(1), (0, 0));
    }

    #[test]
    fn caps_are_split_by_kind() {
        let mut ledger = QuotaLedger::new(2, 1, 2);
        ledger.try_charge(0, false).expect("first local");
        assert_eq!(
            ledger.try_charge(0, false),
            Err(Error::QuotaExceeded {
                client: 0,
                remote: false
            })
        );
        // The remote bucket is unaffected by the exhausted local one.
        ledger.try_charge(0, true).expect("first remote");
        ledger.try_charge(0, true).expect("second remote");
        assert_eq!(
            ledger.try_charge(0, true),
            Err(Error::QuotaExceeded {
                client: 0,
                remote: true
            })
        );
        assert_eq!(ledger.outstanding(0), (1, 2));
    }

    #[test]
    fn out_of_range_client_is_refused() {
        let mut ledger = QuotaLedger::new(2, 1, 1);
        assert_eq!(ledger.try_charge(2, false), Err(Error::ClientOutOfRange(2)));
        assert_eq!(ledger.outstanding(2), (0, 0));
    }

    #[test]
    #[should_panic(expected = "quota ledger underflow")]
    fn release_below_zero_is_fatal() {
        let mut ledger = QuotaLedger::new(1, 1, 1);
        ledger.release(0, false);
    }
}
