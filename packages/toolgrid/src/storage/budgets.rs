use chrono::{DateTime, Duration, Months, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use toolgrid_types::{
    Budget, BudgetAlert, BudgetId, BudgetPeriod, BudgetScope, ALERT_THRESHOLDS,
};

use super::db::{time, Db, StorageError, StorageResult};
use super::servers::parse_id;

/// One alert row crossing its threshold during a spend recording.
#[derive(Debug, Clone)]
pub struct ThresholdCrossing {
    pub budget: Budget,
    pub threshold: u8,
    pub percentage_used: f64,
}

#[derive(Clone)]
pub struct BudgetStore {
    db: Db,
}

impl BudgetStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Creates the budget and its four alert rows in one transaction.
    /// The partial unique index rejects a second enabled budget for the
    /// same (scope, scope_id, period).
    pub fn create(
        &self,
        name: &str,
        scope: BudgetScope,
        scope_id: Option<&str>,
        budget_credits: f64,
        period: BudgetPeriod,
        enabled: bool,
        enforce_limit: bool,
    ) -> StorageResult<Budget> {
        let now = Utc::now();
        let budget = Budget {
            id: BudgetId::generate(),
            name: name.to_string(),
            scope,
            scope_id: scope_id.map(str::to_string),
            budget_credits,
            period,
            period_start: now,
            period_end: period_end(period, now),
            current_spend: 0.0,
            enabled,
            enforce_limit,
        };

        let result = self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO cost_budgets
                 (id, name, scope, scope_id, budget_credits, period, period_start, period_end,
                  current_spend, enabled, enforce_limit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10)",
                params![
                    budget.id.as_ref(),
                    budget.name,
                    budget.scope.as_str(),
                    budget.scope_id,
                    budget.budget_credits,
                    budget.period.as_str(),
                    time::to_sql(budget.period_start),
                    time::opt_to_sql(budget.period_end),
                    budget.enabled,
                    budget.enforce_limit,
                ],
            )?;
            for threshold in ALERT_THRESHOLDS {
                tx.execute(
                    "INSERT INTO budget_alerts (budget_id, threshold_percent) VALUES (?1, ?2)",
                    params![budget.id.as_ref(), threshold],
                )?;
            }
            Ok(())
        });

        match result {
            Err(StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _)))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::Conflict(format!(
                    "an enabled {} budget for this scope and period already exists",
                    scope.as_str()
                )))
            }
            Err(other) => Err(other),
            Ok(()) => Ok(budget),
        }
    }

    pub fn update(
        &self,
        id: &BudgetId,
        name: Option<&str>,
        budget_credits: Option<f64>,
        enabled: Option<bool>,
        enforce_limit: Option<bool>,
    ) -> StorageResult<Budget> {
        let mut budget = self
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(format!("budget {id}")))?;

        if let Some(name) = name {
            budget.name = name.to_string();
        }
        if let Some(credits) = budget_credits {
            budget.budget_credits = credits;
        }
        if let Some(enabled) = enabled {
            budget.enabled = enabled;
        }
        if let Some(enforce) = enforce_limit {
            budget.enforce_limit = enforce;
        }

        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE cost_budgets SET name = ?2, budget_credits = ?3, enabled = ?4, enforce_limit = ?5
                 WHERE id = ?1",
                params![
                    budget.id.as_ref(),
                    budget.name,
                    budget.budget_credits,
                    budget.enabled,
                    budget.enforce_limit,
                ],
            )
        })?;

        Ok(budget)
    }

    pub fn delete(&self, id: &BudgetId) -> StorageResult<bool> {
        let deleted = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM cost_budgets WHERE id = ?1", [id.as_ref()]))?;
        Ok(deleted > 0)
    }

    pub fn get(&self, id: &BudgetId) -> StorageResult<Option<Budget>> {
        self.db.with_tx(|tx| {
            let budget = tx
                .query_row(
                    &format!("SELECT {BUDGET_COLUMNS} FROM cost_budgets WHERE id = ?1"),
                    [id.as_ref()],
                    row_to_budget,
                )
                .optional()?;
            match budget {
                Some(budget) => Ok(Some(roll_period(tx, budget)?)),
                None => Ok(None),
            }
        })
    }

    pub fn list(&self) -> StorageResult<Vec<Budget>> {
        self.db.with_tx(|tx| {
            let budgets: Vec<Budget> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {BUDGET_COLUMNS} FROM cost_budgets ORDER BY name"
                ))?;
                let rows = stmt.query_map([], row_to_budget)?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            budgets
                .into_iter()
                .map(|budget| roll_period(tx, budget))
                .collect()
        })
    }

    pub fn alerts(&self, id: &BudgetId) -> StorageResult<Vec<BudgetAlert>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT budget_id, threshold_percent, triggered, triggered_at
                 FROM budget_alerts WHERE budget_id = ?1 ORDER BY threshold_percent",
            )?;
            let rows = stmt.query_map([id.as_ref()], |row| {
                Ok(BudgetAlert {
                    budget_id: parse_id(row, 0)?,
                    threshold_percent: row.get(1)?,
                    triggered: row.get(2)?,
                    triggered_at: time::opt_from_sql(row.get(3)?),
                })
            })?;
            rows.collect()
        })
    }

    /// Finds the enabled budget for one (scope, scope_id), expired
    /// periods already rolled.
    pub fn find_enabled(
        &self,
        scope: BudgetScope,
        scope_id: Option<&str>,
    ) -> StorageResult<Option<Budget>> {
        self.db.with_tx(|tx| {
            let budget = find_enabled_tx(tx, scope, scope_id)?;
            match budget {
                Some(budget) => Ok(Some(roll_period(tx, budget)?)),
                None => Ok(None),
            }
        })
    }

    /// Records spend against every applicable budget and evaluates its
    /// alert rows, all in one transaction so a crash cannot leave the
    /// scopes disagreeing. Returns the threshold crossings, widest scope
    /// last.
    pub fn record_spend(
        &self,
        applicable: &[(BudgetScope, Option<String>)],
        credits: f64,
    ) -> StorageResult<Vec<ThresholdCrossing>> {
        if credits <= 0.0 {
            return Ok(Vec::new());
        }

        self.db.with_tx(|tx| {
            let mut crossings = Vec::new();

            for (scope, scope_id) in applicable {
                let budget = match find_enabled_tx(tx, *scope, scope_id.as_deref())? {
                    Some(budget) => roll_period(tx, budget)?,
                    None => continue,
                };

                let new_spend = budget.current_spend + credits;
                tx.execute(
                    "UPDATE cost_budgets SET current_spend = ?2 WHERE id = ?1",
                    params![budget.id.as_ref(), new_spend],
                )?;

                let percentage = if budget.budget_credits > 0.0 {
                    (new_spend / budget.budget_credits) * 100.0
                } else {
                    0.0
                };

                // each alert fires at most once per period
                let pending: Vec<u8> = {
                    let mut stmt = tx.prepare(
                        "SELECT threshold_percent FROM budget_alerts
                         WHERE budget_id = ?1 AND triggered = 0 AND threshold_percent <= ?2
                         ORDER BY threshold_percent",
                    )?;
                    let rows = stmt.query_map(params![budget.id.as_ref(), percentage], |row| {
                        row.get::<_, u8>(0)
                    })?;
                    rows.collect::<rusqlite::Result<_>>()?
                };

                for threshold in pending {
                    tx.execute(
                        "UPDATE budget_alerts SET triggered = 1, triggered_at = ?3
                         WHERE budget_id = ?1 AND threshold_percent = ?2",
                        params![budget.id.as_ref(), threshold, time::to_sql(Utc::now())],
                    )?;
                    let mut crossed = budget.clone();
                    crossed.current_spend = new_spend;
                    crossings.push(ThresholdCrossing {
                        budget: crossed,
                        threshold,
                        percentage_used: percentage,
                    });
                }
            }

            Ok(crossings)
        })
    }

    pub fn insert_violation(
        &self,
        budget: &Budget,
        workflow_id: Option<&str>,
    ) -> StorageResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO budget_violations (id, budget_id, workflow_id, spend, limit_credits, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    uuid::Uuid::new_v4().simple().to_string(),
                    budget.id.as_ref(),
                    workflow_id,
                    budget.current_spend,
                    budget.budget_credits,
                    time::to_sql(Utc::now()),
                ],
            )
        })?;
        Ok(())
    }
}

const BUDGET_COLUMNS: &str = "id, name, scope, scope_id, budget_credits, period, period_start, \
                              period_end, current_spend, enabled, enforce_limit";

fn find_enabled_tx(
    tx: &Transaction,
    scope: BudgetScope,
    scope_id: Option<&str>,
) -> rusqlite::Result<Option<Budget>> {
    tx.query_row(
        &format!(
            "SELECT {BUDGET_COLUMNS} FROM cost_budgets
             WHERE scope = ?1 AND COALESCE(scope_id, '') = COALESCE(?2, '') AND enabled = 1"
        ),
        params![scope.as_str(), scope_id],
        row_to_budget,
    )
    .optional()
}

/// Rolling periods reset lazily on access: expired windows zero the
/// counter, move the period bounds forward, and rearm the alert rows.
/// `total` budgets have no period end and never reset.
fn roll_period(tx: &Transaction, budget: Budget) -> rusqlite::Result<Budget> {
    let now = Utc::now();
    let expired = matches!(budget.period_end, Some(end) if now >= end);
    if !expired {
        return Ok(budget);
    }

    let mut rolled = budget;
    rolled.current_spend = 0.0;
    rolled.period_start = now;
    rolled.period_end = period_end(rolled.period, now);

    tx.execute(
        "UPDATE cost_budgets SET current_spend = 0, period_start = ?2, period_end = ?3 WHERE id = ?1",
        params![
            rolled.id.as_ref(),
            time::to_sql(rolled.period_start),
            time::opt_to_sql(rolled.period_end),
        ],
    )?;
    tx.execute(
        "UPDATE budget_alerts SET triggered = 0, triggered_at = NULL WHERE budget_id = ?1",
        [rolled.id.as_ref()],
    )?;

    Ok(rolled)
}

fn period_end(period: BudgetPeriod, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match period {
        BudgetPeriod::Daily => Some(start + Duration::days(1)),
        BudgetPeriod::Weekly => Some(start + Duration::weeks(1)),
        BudgetPeriod::Monthly => start.checked_add_months(Months::new(1)),
        BudgetPeriod::Total => None,
    }
}

fn row_to_budget(row: &Row<'_>) -> rusqlite::Result<Budget> {
    let scope: String = row.get(2)?;
    let period: String = row.get(5)?;
    Ok(Budget {
        id: parse_id(row, 0)?,
        name: row.get(1)?,
        scope: scope.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        scope_id: row.get(3)?,
        budget_credits: row.get(4)?,
        period: period.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        period_start: time::from_sql(&row.get::<_, String>(6)?),
        period_end: time::opt_from_sql(row.get(7)?),
        current_spend: row.get(8)?,
        enabled: row.get(9)?,
        enforce_limit: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations;

    fn store() -> BudgetStore {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();
        BudgetStore::new(db)
    }

    #[test]
    fn create_makes_four_alert_rows() {
        let store = store();
        let budget = store
            .create("global", BudgetScope::Global, None, 100.0, BudgetPeriod::Total, true, true)
            .unwrap();

        let alerts = store.alerts(&budget.id).unwrap();
        assert_eq!(
            alerts.iter().map(|a| a.threshold_percent).collect::<Vec<_>>(),
            vec![50, 75, 90, 100]
        );
        assert!(alerts.iter().all(|a| !a.triggered));
        assert!(budget.period_end.is_none());
    }

    #[test]
    fn one_enabled_budget_per_scope_and_period() {
        let store = store();
        store
            .create("a", BudgetScope::Global, None, 100.0, BudgetPeriod::Daily, true, true)
            .unwrap();
        assert!(matches!(
            store.create("b", BudgetScope::Global, None, 50.0, BudgetPeriod::Daily, true, true),
            Err(StorageError::Conflict(_))
        ));
        // a different period is fine
        store
            .create("c", BudgetScope::Global, None, 50.0, BudgetPeriod::Monthly, true, true)
            .unwrap();
    }

    #[test]
    fn spend_triggers_each_threshold_once() {
        let store = store();
        store
            .create("global", BudgetScope::Global, None, 100.0, BudgetPeriod::Total, true, true)
            .unwrap();
        let applicable = vec![(BudgetScope::Global, None)];

        let crossings = store.record_spend(&applicable, 40.0).unwrap();
        assert!(crossings.is_empty());

        let crossings = store.record_spend(&applicable, 40.0).unwrap();
        assert_eq!(
            crossings.iter().map(|c| c.threshold).collect::<Vec<_>>(),
            vec![50, 75]
        );

        // thresholds already fired stay fired
        let crossings = store.record_spend(&applicable, 25.0).unwrap();
        assert_eq!(
            crossings.iter().map(|c| c.threshold).collect::<Vec<_>>(),
            vec![90, 100]
        );

        let crossings = store.record_spend(&applicable, 10.0).unwrap();
        assert!(crossings.is_empty());
    }

    #[test]
    fn spend_hits_every_applicable_scope() {
        let store = store();
        store
            .create("wf", BudgetScope::Workflow, Some("wf-1"), 10.0, BudgetPeriod::Total, true, true)
            .unwrap();
        store
            .create("global", BudgetScope::Global, None, 100.0, BudgetPeriod::Total, true, true)
            .unwrap();

        store
            .record_spend(
                &[
                    (BudgetScope::Workflow, Some("wf-1".to_string())),
                    (BudgetScope::Global, None),
                ],
                5.0,
            )
            .unwrap();

        let wf = store
            .find_enabled(BudgetScope::Workflow, Some("wf-1"))
            .unwrap()
            .unwrap();
        let global = store.find_enabled(BudgetScope::Global, None).unwrap().unwrap();
        assert_eq!(wf.current_spend, 5.0);
        assert_eq!(global.current_spend, 5.0);
    }

    #[test]
    fn expired_period_resets_on_access() {
        let store = store();
        let budget = store
            .create("daily", BudgetScope::Global, None, 100.0, BudgetPeriod::Daily, true, true)
            .unwrap();
        store
            .record_spend(&[(BudgetScope::Global, None)], 60.0)
            .unwrap();

        // force the period into the past
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE cost_budgets SET period_end = ?2 WHERE id = ?1",
                    params![
                        budget.id.as_ref(),
                        time::to_sql(Utc::now() - Duration::minutes(1))
                    ],
                )
            })
            .unwrap();

        let rolled = store.get(&budget.id).unwrap().unwrap();
        assert_eq!(rolled.current_spend, 0.0);
        assert!(rolled.period_end.unwrap() > Utc::now());
        // alerts are rearmed for the new period
        assert!(store.alerts(&budget.id).unwrap().iter().all(|a| !a.triggered));
    }
}
