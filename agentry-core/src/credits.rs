//! Credit accounting — per-team balance with an append-only ledger.
//!
//! Every balance mutation writes its ledger entry in the same transaction,
//! so `sum(ledger.amount) == balance` holds at every quiescent point. A
//! deduction and its refund share a correlation id, which is how a failed
//! model call shows up as a net-zero pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::Store;
use crate::vault::parse_store_time;

/// One ledger entry. Negative amounts are deductions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub team_id: Uuid,
    pub amount: i64,
    pub reason: String,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Credit operations over the store.
pub struct Credits {
    store: Arc<Store>,
}

impl Credits {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Current balance; teams with no credits row are at zero.
    pub fn balance(&self, team_id: &Uuid) -> Result<i64> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT balance FROM credits WHERE team_id = ?1",
                [team_id.to_string()],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(0),
                other => Err(other),
            })
        })
    }

    /// Add credits (purchase, promotion). Returns the entry's correlation id.
    pub fn grant(&self, team_id: &Uuid, amount: i64, reason: &str) -> Result<Uuid> {
        if amount <= 0 {
            return Err(EngineError::invalid("grant amount must be positive"));
        }
        let correlation_id = Uuid::new_v4();
        self.apply(team_id, amount, reason, &correlation_id)?;
        Ok(correlation_id)
    }

    /// Deduct `amount` before a model call. Fails with `InsufficientCredits`
    /// without writing anything when the balance is short.
    pub fn try_deduct(
        &self,
        team_id: &Uuid,
        amount: i64,
        reason: &str,
        correlation_id: &Uuid,
    ) -> Result<()> {
        if amount <= 0 {
            return Err(EngineError::invalid("deduction amount must be positive"));
        }
        let team = team_id.to_string();
        self.store.with_tx(|tx| {
            let balance: i64 = tx
                .query_row(
                    "SELECT balance FROM credits WHERE team_id = ?1",
                    [&team],
                    |row| row.get(0),
                )
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(0),
                    other => Err(other),
                })?;
            if balance < amount {
                // Raised through the closure as a sentinel; mapped below.
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            tx.execute(
                "UPDATE credits SET balance = balance - ?2 WHERE team_id = ?1",
                rusqlite::params![team, amount],
            )?;
            tx.execute(
                "INSERT INTO credit_ledger (team_id, amount, reason, correlation_id)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![team, -amount, reason, correlation_id.to_string()],
            )?;
            Ok(())
        })
        .map_err(|e| match e {
            EngineError::Store(crate::error::StoreError::Database(
                rusqlite::Error::QueryReturnedNoRows,
            )) => {
                let balance = self.balance(team_id).unwrap_or(0);
                EngineError::InsufficientCredits {
                    required: amount,
                    balance,
                }
            }
            other => other,
        })?;
        debug!(team_id = %team_id, amount, correlation_id = %correlation_id, "Credits deducted");
        Ok(())
    }

    /// Refund a prior deduction after a provider failure, reusing its
    /// correlation id so the pair nets to zero.
    pub fn refund(
        &self,
        team_id: &Uuid,
        amount: i64,
        reason: &str,
        correlation_id: &Uuid,
    ) -> Result<()> {
        if amount <= 0 {
            return Err(EngineError::invalid("refund amount must be positive"));
        }
        self.apply(team_id, amount, reason, correlation_id)?;
        debug!(team_id = %team_id, amount, correlation_id = %correlation_id, "Credits refunded");
        Ok(())
    }

    fn apply(&self, team_id: &Uuid, amount: i64, reason: &str, correlation_id: &Uuid) -> Result<()> {
        let team = team_id.to_string();
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO credits (team_id, balance) VALUES (?1, ?2)
                 ON CONFLICT (team_id) DO UPDATE SET balance = balance + excluded.balance",
                rusqlite::params![team, amount],
            )?;
            tx.execute(
                "INSERT INTO credit_ledger (team_id, amount, reason, correlation_id)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![team, amount, reason, correlation_id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Most recent ledger entries, newest first.
    pub fn ledger(&self, team_id: &Uuid, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, amount, reason, correlation_id, created_at
                 FROM credit_ledger WHERE team_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![team_id.to_string(), limit as i64],
                |row| {
                    let correlation: String = row.get(3)?;
                    let created: String = row.get(4)?;
                    Ok(LedgerEntry {
                        id: row.get(0)?,
                        team_id: *team_id,
                        amount: row.get(1)?,
                        reason: row.get(2)?,
                        correlation_id: Uuid::parse_str(&correlation).unwrap_or_default(),
                        created_at: parse_store_time(&created),
                    })
                },
            )?;
            rows.collect()
        })
    }

    /// Sum of all ledger entries. Equal to `balance` at quiescence.
    pub fn ledger_sum(&self, team_id: &Uuid) -> Result<i64> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM credit_ledger WHERE team_id = ?1",
                [team_id.to_string()],
                |row| row.get(0),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Credits, Uuid) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let team = Uuid::new_v4();
        store
            .with_conn(|conn| {
                conn.execute("INSERT INTO teams (id, name) VALUES (?1, 't')", [
                    team.to_string()
                ])
            })
            .unwrap();
        (Credits::new(store), team)
    }

    #[test]
    fn test_zero_balance_for_unknown_team() {
        let (credits, _) = setup();
        assert_eq!(credits.balance(&Uuid::new_v4()).unwrap(), 0);
    }

    #[test]
    fn test_grant_and_deduct() {
        let (credits, team) = setup();
        credits.grant(&team, 10, "purchase").unwrap();
        assert_eq!(credits.balance(&team).unwrap(), 10);

        let correlation = Uuid::new_v4();
        credits
            .try_deduct(&team, 3, "model call", &correlation)
            .unwrap();
        assert_eq!(credits.balance(&team).unwrap(), 7);
        assert_eq!(credits.ledger_sum(&team).unwrap(), 7);
    }

    #[test]
    fn test_insufficient_credits() {
        let (credits, team) = setup();
        credits.grant(&team, 2, "purchase").unwrap();
        let err = credits
            .try_deduct(&team, 5, "model call", &Uuid::new_v4())
            .unwrap_err();
        match err {
            EngineError::InsufficientCredits { required, balance } => {
                assert_eq!(required, 5);
                assert_eq!(balance, 2);
            }
            other => panic!("expected InsufficientCredits, got {other:?}"),
        }
        // A failed deduction writes nothing.
        assert_eq!(credits.balance(&team).unwrap(), 2);
        assert_eq!(credits.ledger(&team, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_refund_nets_to_zero_with_shared_correlation() {
        let (credits, team) = setup();
        credits.grant(&team, 10, "purchase").unwrap();

        let correlation = Uuid::new_v4();
        credits
            .try_deduct(&team, 3, "model call", &correlation)
            .unwrap();
        credits
            .refund(&team, 3, "provider failure", &correlation)
            .unwrap();

        assert_eq!(credits.balance(&team).unwrap(), 10);
        assert_eq!(credits.ledger_sum(&team).unwrap(), 10);

        let entries = credits.ledger(&team, 10).unwrap();
        let pair: Vec<&LedgerEntry> = entries
            .iter()
            .filter(|e| e.correlation_id == correlation)
            .collect();
        assert_eq!(pair.len(), 2);
        assert_eq!(pair.iter().map(|e| e.amount).sum::<i64>(), 0);
    }

    #[test]
    fn test_ledger_sum_matches_balance_under_churn() {
        let (credits, team) = setup();
        credits.grant(&team, 100, "purchase").unwrap();
        for i in 0..10 {
            let correlation = Uuid::new_v4();
            credits
                .try_deduct(&team, i + 1, "model call", &correlation)
                .unwrap();
            if i % 2 == 0 {
                credits
                    .refund(&team, i + 1, "provider failure", &correlation)
                    .unwrap();
            }
        }
        assert_eq!(
            credits.balance(&team).unwrap(),
            credits.ledger_sum(&team).unwrap()
        );
    }

    #[test]
    fn test_rejects_non_positive_amounts() {
        let (credits, team) = setup();
        assert!(credits.grant(&team, 0, "x").is_err());
        assert!(credits.grant(&team, -5, "x").is_err());
        assert!(
            credits
                .try_deduct(&team, 0, "x", &Uuid::new_v4())
                .is_err()
        );
        assert!(credits.refund(&team, -1, "x", &Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_ledger_ordering_newest_first() {
        let (credits, team) = setup();
        credits.grant(&team, 1, "first").unwrap();
        credits.grant(&team, 2, "second").unwrap();
        let entries = credits.ledger(&team, 10).unwrap();
        assert_eq!(entries[0].reason, "second");
        assert_eq!(entries[1].reason, "first");
    }
}
