//! Funds check/deduct boundary.
//!
//! `require_funds` verifies without touching the balance, `deduct_funds`
//! withdraws, `credit` puts a refund back. Amounts at or below zero are
//! no-ops that report "nothing charged".

use gatemesh_core::{MeshError, MeshResult};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
pub struct Economy {
    balances: Mutex<HashMap<String, f64>>,
}

impl Economy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, account: &str, amount: f64) {
        self.balances
            .lock()
            .unwrap()
            .insert(account.to_string(), amount);
    }

    pub fn balance(&self, account: &str) -> f64 {
        *self.balances.lock().unwrap().get(account).unwrap_or(&0.0)
    }

    /// Check that `account` can afford `amount` without deducting it.
    /// Returns whether anything would actually be charged.
    pub fn require_funds(&self, account: &str, amount: f64) -> MeshResult<bool> {
        if amount <= 0.0 {
            return Ok(false);
        }
        let balances = self.balances.lock().unwrap();
        let balance = *balances.get(account).unwrap_or(&0.0);
        if balance < amount {
            return Err(MeshError::Validation("insufficient funds".into()));
        }
        Ok(true)
    }

    /// Withdraw `amount` from `account`.
    pub fn deduct_funds(&self, account: &str, amount: f64) -> MeshResult<bool> {
        if amount <= 0.0 {
            return Ok(false);
        }
        let mut balances = self.balances.lock().unwrap();
        let balance = balances.entry(account.to_string()).or_insert(0.0);
        if *balance < amount {
            return Err(MeshError::Validation("insufficient funds".into()));
        }
        *balance -= amount;
        debug!(account, amount, balance = *balance, "deducted funds");
        Ok(true)
    }

    /// Return `amount` to `account` (refunds).
    pub fn credit(&self, account: &str, amount: f64) {
        if amount <= 0.0 {
            return;
        }
        let mut balances = self.balances.lock().unwrap();
        *balances.entry(account.to_string()).or_insert(0.0) += amount;
        debug!(account, amount, "credited funds");
    }

    pub fn format(amount: f64) -> String {
        format!("${amount:.2}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_does_not_touch_balance() {
        let economy = Economy::new();
        economy.set_balance("alice", 100.0);
        assert!(economy.require_funds("alice", 10.0).unwrap());
        assert_eq!(economy.balance("alice"), 100.0);
        assert!(economy.require_funds("alice", 200.0).is_err());
    }

    #[test]
    fn deduct_and_refund() {
        let economy = Economy::new();
        economy.set_balance("alice", 100.0);
        assert!(economy.deduct_funds("alice", 10.0).unwrap());
        assert_eq!(economy.balance("alice"), 90.0);
        economy.credit("alice", 10.0);
        assert_eq!(economy.balance("alice"), 100.0);
    }

    #[test]
    fn zero_and_negative_amounts_are_noops() {
        let economy = Economy::new();
        assert!(!economy.require_funds("alice", 0.0).unwrap());
        assert!(!economy.deduct_funds("alice", -5.0).unwrap());
        economy.credit("alice", 0.0);
        assert_eq!(economy.balance("alice"), 0.0);
    }

    #[test]
    fn formats_like_currency() {
        assert_eq!(Economy::format(10.0), "$10.00");
        assert_eq!(Economy::format(0.5), "$0.50");
    }
}
