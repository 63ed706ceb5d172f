//! Postgres-backed person store.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `PersistenceError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | PersistenceError |
//! |------------|----------------------|------------------|
//! | Database (unique violation) | `23505` | `Domain(AlreadyExists)` |
//! | Database (other integrity violation) | `23xxx` | `Integrity` |
//! | Database (other) | Any other | `Query` |
//! | PoolTimedOut | N/A | `Timeout` |
//! | Io / Tls / PoolClosed | N/A | `Connection` |
//! | Other | N/A | `Query` |
//!
//! ## Thread Safety
//!
//! `PostgresPersonStore` is `Send + Sync`. The `PersonStore` trait is synchronous,
//! so the store owns a small tokio runtime and blocks on it; call it from plain
//! worker threads, never from inside another runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::runtime::Runtime;
use tracing::instrument;

use taxflow_core::{DebtAmount, DomainError, Entity, Person, PersonId, PersonSnapshot, TaxNumber};

use super::{PersistenceError, PersonStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS person (
    id            UUID PRIMARY KEY,
    tax_number    TEXT NOT NULL UNIQUE,
    first_name    TEXT NOT NULL,
    last_name     TEXT NOT NULL,
    date_of_birth DATE NOT NULL,
    tax_debt      BIGINT NOT NULL DEFAULT 0 CHECK (tax_debt >= 0),
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL
)
"#;

const COLUMNS: &str =
    "id, tax_number, first_name, last_name, date_of_birth, tax_debt, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresPersonStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl PostgresPersonStore {
    /// Connect a pool on a dedicated runtime.
    pub fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("taxflow-pg")
            .enable_all()
            .build()
            .map_err(|e| PersistenceError::Unavailable(format!("failed to start runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(10)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    /// Create the `person` table if it does not exist.
    pub fn ensure_schema(&self) -> Result<(), PersistenceError> {
        self.runtime
            .block_on(sqlx::query(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn insert(&self, snapshot: &PersonSnapshot) -> Result<Person, PersistenceError> {
        let now = Utc::now();
        let person = Person::from_snapshot(snapshot, now);

        let sql = format!(
            "INSERT INTO person ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, 0, $6, $6) RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(*person.id().as_uuid())
            .bind(snapshot.tax_number.as_str())
            .bind(&snapshot.first_name)
            .bind(&snapshot.last_name)
            .bind(snapshot.date_of_birth)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DomainError::already_exists(snapshot.tax_number.as_str()).into()
                } else {
                    map_sqlx_error("create_from_event", e)
                }
            })?;

        person_from_row(&row)
    }

    async fn update(&self, snapshot: &PersonSnapshot) -> Result<Person, PersistenceError> {
        let sql = format!(
            "UPDATE person SET first_name = $2, last_name = $3, date_of_birth = $4, updated_at = $5 \
             WHERE tax_number = $1 RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(snapshot.tax_number.as_str())
            .bind(&snapshot.first_name)
            .bind(&snapshot.last_name)
            .bind(snapshot.date_of_birth)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_from_event", e))?
            .ok_or_else(|| DomainError::not_found(snapshot.tax_number.as_str()))?;

        person_from_row(&row)
    }

    async fn delete(&self, tax_number: &TaxNumber) -> Result<(), PersistenceError> {
        let result = sqlx::query("DELETE FROM person WHERE tax_number = $1")
            .bind(tax_number.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_from_event", e))?;

        if result.rows_affected() == 0 {
            return Err(DomainError::not_found(tax_number.as_str()).into());
        }
        Ok(())
    }

    async fn increment_debt(
        &self,
        tax_number: &TaxNumber,
        amount: DebtAmount,
    ) -> Result<Person, PersistenceError> {
        let cents = i64::try_from(amount.cents())
            .map_err(|_| PersistenceError::Integrity(format!("debt amount {amount} out of range")))?;

        let sql = format!(
            "UPDATE person SET tax_debt = tax_debt + $2, updated_at = $3 \
             WHERE tax_number = $1 RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(tax_number.as_str())
            .bind(cents)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("add_debt", e))?
            .ok_or_else(|| DomainError::not_found(tax_number.as_str()))?;

        person_from_row(&row)
    }

    async fn select(&self, tax_number: &TaxNumber) -> Result<Option<Person>, PersistenceError> {
        let sql = format!("SELECT {COLUMNS} FROM person WHERE tax_number = $1");
        let row = sqlx::query(&sql)
            .bind(tax_number.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_tax_number", e))?;

        row.as_ref().map(person_from_row).transpose()
    }
}

impl PersonStore for PostgresPersonStore {
    #[instrument(skip(self, snapshot), fields(key = %snapshot.tax_number), err)]
    fn create_from_event(&self, snapshot: &PersonSnapshot) -> Result<Person, PersistenceError> {
        self.runtime.block_on(self.insert(snapshot))
    }

    #[instrument(skip(self, snapshot), fields(key = %snapshot.tax_number), err)]
    fn update_from_event(&self, snapshot: &PersonSnapshot) -> Result<Person, PersistenceError> {
        self.runtime.block_on(self.update(snapshot))
    }

    #[instrument(skip(self, snapshot), fields(key = %snapshot.tax_number), err)]
    fn delete_from_event(&self, snapshot: &PersonSnapshot) -> Result<(), PersistenceError> {
        self.runtime.block_on(self.delete(&snapshot.tax_number))
    }

    #[instrument(skip(self), fields(key = %tax_number, amount = %amount), err)]
    fn add_debt(&self, tax_number: &TaxNumber, amount: DebtAmount) -> Result<Person, PersistenceError> {
        self.runtime.block_on(self.increment_debt(tax_number, amount))
    }

    fn find_by_tax_number(&self, tax_number: &TaxNumber) -> Result<Option<Person>, PersistenceError> {
        self.runtime.block_on(self.select(tax_number))
    }
}

fn person_from_row(row: &PgRow) -> Result<Person, PersistenceError> {
    let read = |e: sqlx::Error| PersistenceError::Query(format!("failed to read person row: {e}"));

    let id: uuid::Uuid = row.try_get("id").map_err(read)?;
    let tax_number: String = row.try_get("tax_number").map_err(read)?;
    let first_name: String = row.try_get("first_name").map_err(read)?;
    let last_name: String = row.try_get("last_name").map_err(read)?;
    let date_of_birth: NaiveDate = row.try_get("date_of_birth").map_err(read)?;
    let tax_debt: i64 = row.try_get("tax_debt").map_err(read)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(read)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(read)?;

    let tax_number = TaxNumber::parse(&tax_number)
        .map_err(|e| PersistenceError::Integrity(format!("stored tax number: {e}")))?;
    let tax_debt = u64::try_from(tax_debt)
        .map_err(|_| PersistenceError::Integrity(format!("negative tax debt {tax_debt}")))?;

    Ok(Person::restore(
        PersonId::from_uuid(id),
        tax_number,
        first_name,
        last_name,
        date_of_birth,
        tax_debt,
        created_at,
        updated_at,
    ))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.as_ref() == "23505" => {
                    PersistenceError::Integrity(format!("unique violation: {msg}"))
                }
                Some(code) if code.starts_with("23") => PersistenceError::Integrity(msg),
                _ => PersistenceError::Query(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            PersistenceError::Timeout(format!("pool acquire timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            PersistenceError::Connection(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Io(e) => PersistenceError::Connection(format!("i/o error in {operation}: {e}")),
        sqlx::Error::Tls(e) => PersistenceError::Connection(format!("tls error in {operation}: {e}")),
        other => PersistenceError::Query(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
