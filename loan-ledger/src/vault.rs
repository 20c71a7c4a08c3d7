//! Native value custody
//!
//! Balances of external accounts plus the ledger's own escrow. Transfers
//! are first settled against a scratch copy of the touched balances, so a
//! batch that cannot be covered is rejected before anything changes.

use crate::{
    error::{Error, Result},
    types::{AccountId, Amount, Holder, Transfer},
};
use std::collections::{BTreeMap, HashMap};

/// Post-transfer balances of every holder a batch touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Final account balances
    pub balances: Vec<(AccountId, Amount)>,

    /// Final escrow balance
    pub escrow: Amount,
}

/// Account balances and escrow
#[derive(Debug, Clone, Default)]
pub struct Vault {
    balances: HashMap<AccountId, Amount>,
    escrow: Amount,
}

impl Vault {
    /// Empty vault
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted balances
    pub fn from_parts(balances: HashMap<AccountId, Amount>, escrow: Amount) -> Self {
        Self { balances, escrow }
    }

    /// Balance of an account (zero if never seen)
    pub fn balance_of(&self, account: &AccountId) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    /// Value held by the ledger
    pub fn escrow(&self) -> Amount {
        self.escrow
    }

    /// All non-escrow balances
    pub fn balances(&self) -> &HashMap<AccountId, Amount> {
        &self.balances
    }

    /// Sum of all account balances and escrow
    pub fn total_supply(&self) -> Result<Amount> {
        self.balances
            .values()
            .try_fold(self.escrow, |acc, balance| acc.checked_add(*balance))
            .ok_or_else(|| Error::Overflow("total supply".to_string()))
    }

    /// Allocate new value to an account (genesis only)
    pub fn credit(&mut self, account: &AccountId, amount: Amount) -> Result<()> {
        let balance = self.balances.entry(account.clone()).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| Error::Overflow(format!("balance of {}", account)))?;
        Ok(())
    }

    /// Apply `transfers` in order to a scratch copy and return the result
    pub fn settle(&self, transfers: &[Transfer]) -> Result<Settlement> {
        let mut touched: BTreeMap<AccountId, Amount> = BTreeMap::new();
        let mut escrow = self.escrow;

        for transfer in transfers {
            match &transfer.from {
                Holder::Account(account) => {
                    let balance = touched
                        .entry(account.clone())
                        .or_insert_with(|| self.balance_of(account));
                    if *balance < transfer.amount {
                        return Err(Error::InsufficientBalance {
                            account: account.clone(),
                            required: transfer.amount,
                            available: *balance,
                        });
                    }
                    *balance -= transfer.amount;
                }
                Holder::Escrow => {
                    escrow = escrow.checked_sub(transfer.amount).ok_or_else(|| {
                        Error::InvariantViolation(format!(
                            "escrow {} cannot cover payout of {}",
                            escrow, transfer.amount
                        ))
                    })?;
                }
            }

            match &transfer.to {
                Holder::Account(account) => {
                    let balance = touched
                        .entry(account.clone())
                        .or_insert_with(|| self.balance_of(account));
                    *balance = balance
                        .checked_add(transfer.amount)
                        .ok_or_else(|| Error::Overflow(format!("balance of {}", account)))?;
                }
                Holder::Escrow => {
                    escrow = escrow
                        .checked_add(transfer.amount)
                        .ok_or_else(|| Error::Overflow("escrow balance".to_string()))?;
                }
            }
        }

        Ok(Settlement {
            balances: touched.into_iter().collect(),
            escrow,
        })
    }

    /// Install a settlement produced by [`Vault::settle`]
    pub fn apply(&mut self, settlement: &Settlement) {
        for (account, balance) in &settlement.balances {
            self.balances.insert(account.clone(), *balance);
        }
        self.escrow = settlement.escrow;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded_vault() -> (Vault, AccountId, AccountId) {
        let alice = AccountId::new("alice");
        let bob = AccountId::new("bob");
        let mut vault = Vault::new();
        vault.credit(&alice, 10).unwrap();
        vault.credit(&bob, 5).unwrap();
        (vault, alice, bob)
    }

    #[test]
    fn test_settle_moves_value_through_escrow() {
        let (mut vault, alice, bob) = funded_vault();

        let settlement = vault
            .settle(&[Transfer::intake(&alice, 4), Transfer::payout(&bob, 4)])
            .unwrap();
        vault.apply(&settlement);

        assert_eq!(vault.balance_of(&alice), 6);
        assert_eq!(vault.balance_of(&bob), 9);
        assert_eq!(vault.escrow(), 0);
        assert_eq!(vault.total_supply().unwrap(), 15);
    }

    #[test]
    fn test_settle_rejects_uncovered_intake() {
        let (vault, alice, _) = funded_vault();

        let err = vault.settle(&[Transfer::intake(&alice, 11)]).unwrap_err();
        match err {
            Error::InsufficientBalance {
                required, available, ..
            } => {
                assert_eq!(required, 11);
                assert_eq!(available, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_settle_does_not_mutate() {
        let (vault, alice, bob) = funded_vault();

        vault
            .settle(&[Transfer::intake(&alice, 10), Transfer::payout(&bob, 10)])
            .unwrap();

        assert_eq!(vault.balance_of(&alice), 10);
        assert_eq!(vault.balance_of(&bob), 5);
    }

    #[test]
    fn test_escrow_underflow_is_invariant_violation() {
        let (vault, alice, _) = funded_vault();

        let err = vault.settle(&[Transfer::payout(&alice, 1)]).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_unknown_account_has_zero_balance() {
        let vault = Vault::new();
        assert_eq!(vault.balance_of(&AccountId::new("nobody")), 0);
    }
}
