use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::info;
use uuid::Uuid;

use shared::domain::{Car, CarId, Driver, DriverId, EntityCounts, Manufacturer, ManufacturerId};

/// Handle to the fleet database.
///
/// Every statement sent to SQLite bumps a shared round-trip counter so callers
/// can check that a view stays within its join plan.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    round_trips: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct NewDriver<'a> {
    pub username: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub license_number: &'a str,
    pub password_hash: &'a str,
}

#[derive(Debug, Clone)]
pub struct DriverCredentials {
    pub driver_id: DriverId,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct StoredSession {
    pub session_key: String,
    pub driver_id: DriverId,
    pub expires_at: DateTime<Utc>,
}

const CAR_COLUMNS: &str = "c.id AS car_id, c.model AS car_model,
     m.id AS manufacturer_id, m.name AS manufacturer_name, m.country AS manufacturer_country";

const DRIVER_COLUMNS: &str = "d.id, d.username, d.first_name, d.last_name, d.license_number";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            round_trips: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Number of statements sent to the database through this handle and its clones.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    fn tick(&self) {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn health_check(&self) -> Result<()> {
        self.tick();
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn entity_counts(&self) -> Result<EntityCounts> {
        self.tick();
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM drivers),
                    (SELECT COUNT(*) FROM cars),
                    (SELECT COUNT(*) FROM manufacturers)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(EntityCounts {
            drivers: row.get::<i64, _>(0),
            cars: row.get::<i64, _>(1),
            manufacturers: row.get::<i64, _>(2),
        })
    }

    // Manufacturers

    pub async fn count_manufacturers(&self, search: Option<&str>) -> Result<i64> {
        self.tick();
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM manufacturers WHERE (?1 IS NULL OR name LIKE ?1 ESCAPE '\\')",
        )
        .bind(search.map(like_pattern))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn list_manufacturers(
        &self,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Manufacturer>> {
        self.tick();
        let rows = sqlx::query(
            "SELECT id, name, country
             FROM manufacturers
             WHERE (?1 IS NULL OR name LIKE ?1 ESCAPE '\\')
             ORDER BY name ASC, id ASC
             LIMIT ?2 OFFSET ?3",
        )
        .bind(search.map(like_pattern))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(manufacturer_from_row).collect())
    }

    pub async fn all_manufacturers(&self) -> Result<Vec<Manufacturer>> {
        self.tick();
        let rows = sqlx::query("SELECT id, name, country FROM manufacturers ORDER BY name ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(manufacturer_from_row).collect())
    }

    pub async fn get_manufacturer(&self, id: ManufacturerId) -> Result<Option<Manufacturer>> {
        self.tick();
        let row = sqlx::query("SELECT id, name, country FROM manufacturers WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(manufacturer_from_row))
    }

    pub async fn manufacturer_name_taken(
        &self,
        name: &str,
        exclude: Option<ManufacturerId>,
    ) -> Result<bool> {
        self.tick();
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM manufacturers WHERE name = ?1 AND (?2 IS NULL OR id <> ?2))",
        )
        .bind(name)
        .bind(exclude.map(|id| id.0))
        .fetch_one(&self.pool)
        .await?;
        Ok(taken)
    }

    pub async fn create_manufacturer(&self, name: &str, country: &str) -> Result<ManufacturerId> {
        self.tick();
        let rec = sqlx::query("INSERT INTO manufacturers (name, country) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(country)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to insert manufacturer '{name}'"))?;
        Ok(ManufacturerId(rec.get::<i64, _>(0)))
    }

    pub async fn update_manufacturer(
        &self,
        id: ManufacturerId,
        name: &str,
        country: &str,
    ) -> Result<bool> {
        self.tick();
        let result = sqlx::query("UPDATE manufacturers SET name = ?, country = ? WHERE id = ?")
            .bind(name)
            .bind(country)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes the manufacturer; its cars go with it through `ON DELETE CASCADE`.
    pub async fn delete_manufacturer(&self, id: ManufacturerId) -> Result<bool> {
        self.tick();
        let result = sqlx::query("DELETE FROM manufacturers WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // Cars

    pub async fn count_cars(&self, search: Option<&str>) -> Result<i64> {
        self.tick();
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM cars WHERE (?1 IS NULL OR model LIKE ?1 ESCAPE '\\')",
        )
        .bind(search.map(like_pattern))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// One page of cars, each joined to its manufacturer in the same statement.
    pub async fn list_cars(&self, search: Option<&str>, limit: i64, offset: i64) -> Result<Vec<Car>> {
        self.tick();
        let rows = sqlx::query(&format!(
            "SELECT {CAR_COLUMNS}
             FROM cars c
             INNER JOIN manufacturers m ON m.id = c.manufacturer_id
             WHERE (?1 IS NULL OR c.model LIKE ?1 ESCAPE '\\')
             ORDER BY c.id ASC
             LIMIT ?2 OFFSET ?3"
        ))
        .bind(search.map(like_pattern))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(car_from_row).collect())
    }

    pub async fn get_car(&self, id: CarId) -> Result<Option<Car>> {
        self.tick();
        let row = sqlx::query(&format!(
            "SELECT {CAR_COLUMNS}
             FROM cars c
             INNER JOIN manufacturers m ON m.id = c.manufacturer_id
             WHERE c.id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(car_from_row))
    }

    pub async fn drivers_for_car(&self, car_id: CarId) -> Result<Vec<Driver>> {
        self.tick();
        let rows = sqlx::query(&format!(
            "SELECT {DRIVER_COLUMNS}
             FROM drivers d
             INNER JOIN cars_drivers cd ON cd.driver_id = d.id
             WHERE cd.car_id = ?
             ORDER BY d.username ASC"
        ))
        .bind(car_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(driver_from_row).collect())
    }

    pub async fn create_car(
        &self,
        model: &str,
        manufacturer_id: ManufacturerId,
        driver_ids: &[DriverId],
    ) -> Result<CarId> {
        let mut tx = self.pool.begin().await?;
        self.tick();
        let rec = sqlx::query("INSERT INTO cars (model, manufacturer_id) VALUES (?, ?) RETURNING id")
            .bind(model)
            .bind(manufacturer_id.0)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("failed to insert car '{model}'"))?;
        let car_id = CarId(rec.get::<i64, _>(0));
        self.replace_car_drivers(&mut tx, car_id, driver_ids).await?;
        tx.commit().await?;
        Ok(car_id)
    }

    pub async fn update_car(
        &self,
        id: CarId,
        model: &str,
        manufacturer_id: ManufacturerId,
        driver_ids: &[DriverId],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        self.tick();
        let result = sqlx::query("UPDATE cars SET model = ?, manufacturer_id = ? WHERE id = ?")
            .bind(model)
            .bind(manufacturer_id.0)
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        self.replace_car_drivers(&mut tx, id, driver_ids).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn replace_car_drivers(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        car_id: CarId,
        driver_ids: &[DriverId],
    ) -> Result<()> {
        self.tick();
        sqlx::query("DELETE FROM cars_drivers WHERE car_id = ?")
            .bind(car_id.0)
            .execute(&mut **tx)
            .await?;
        if driver_ids.is_empty() {
            return Ok(());
        }

        self.tick();
        let mut builder =
            QueryBuilder::<Sqlite>::new("INSERT OR IGNORE INTO cars_drivers (car_id, driver_id) ");
        builder.push_values(driver_ids, |mut row, driver_id| {
            row.push_bind(car_id.0).push_bind(driver_id.0);
        });
        builder
            .build()
            .execute(&mut **tx)
            .await
            .context("failed to link drivers to car")?;
        Ok(())
    }

    pub async fn car_driver_ids(&self, car_id: CarId) -> Result<Vec<DriverId>> {
        self.tick();
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT driver_id FROM cars_drivers WHERE car_id = ? ORDER BY driver_id")
                .bind(car_id.0)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(DriverId).collect())
    }

    /// Adds the driver to the car if absent, removes them otherwise.
    /// Returns whether the driver is assigned afterwards.
    pub async fn toggle_car_driver(&self, car_id: CarId, driver_id: DriverId) -> Result<bool> {
        self.tick();
        let removed = sqlx::query("DELETE FROM cars_drivers WHERE car_id = ? AND driver_id = ?")
            .bind(car_id.0)
            .bind(driver_id.0)
            .execute(&self.pool)
            .await?;
        if removed.rows_affected() > 0 {
            return Ok(false);
        }

        self.tick();
        sqlx::query("INSERT INTO cars_drivers (car_id, driver_id) VALUES (?, ?)")
            .bind(car_id.0)
            .bind(driver_id.0)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    pub async fn delete_car(&self, id: CarId) -> Result<bool> {
        self.tick();
        let result = sqlx::query("DELETE FROM cars WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // Drivers

    pub async fn count_drivers(&self, search: Option<&str>) -> Result<i64> {
        self.tick();
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM drivers WHERE (?1 IS NULL OR username LIKE ?1 ESCAPE '\\')",
        )
        .bind(search.map(like_pattern))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn list_drivers(
        &self,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Driver>> {
        self.tick();
        let rows = sqlx::query(&format!(
            "SELECT {DRIVER_COLUMNS}
             FROM drivers d
             WHERE (?1 IS NULL OR d.username LIKE ?1 ESCAPE '\\')
             ORDER BY d.username ASC, d.id ASC
             LIMIT ?2 OFFSET ?3"
        ))
        .bind(search.map(like_pattern))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(driver_from_row).collect())
    }

    pub async fn all_drivers(&self) -> Result<Vec<Driver>> {
        self.tick();
        let rows = sqlx::query(&format!(
            "SELECT {DRIVER_COLUMNS} FROM drivers d ORDER BY d.username ASC, d.id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(driver_from_row).collect())
    }

    pub async fn get_driver(&self, id: DriverId) -> Result<Option<Driver>> {
        self.tick();
        let row = sqlx::query(&format!("SELECT {DRIVER_COLUMNS} FROM drivers d WHERE d.id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(driver_from_row))
    }

    /// The driver's cars with manufacturers joined: one statement however many cars.
    pub async fn cars_for_driver(&self, driver_id: DriverId) -> Result<Vec<Car>> {
        self.tick();
        let rows = sqlx::query(&format!(
            "SELECT {CAR_COLUMNS}
             FROM cars_drivers cd
             INNER JOIN cars c ON c.id = cd.car_id
             INNER JOIN manufacturers m ON m.id = c.manufacturer_id
             WHERE cd.driver_id = ?
             ORDER BY c.id ASC"
        ))
        .bind(driver_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(car_from_row).collect())
    }

    /// Returns the subset of `ids` that exist, in ascending order.
    pub async fn existing_driver_ids(&self, ids: &[DriverId]) -> Result<Vec<DriverId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.tick();
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT id FROM drivers WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.0);
        }
        separated.push_unseparated(") ORDER BY id");
        let found: Vec<i64> = builder
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await?;
        Ok(found.into_iter().map(DriverId).collect())
    }

    pub async fn username_taken(&self, username: &str) -> Result<bool> {
        self.tick();
        let taken: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM drivers WHERE username = ?)")
                .bind(username)
                .fetch_one(&self.pool)
                .await?;
        Ok(taken)
    }

    pub async fn license_taken(&self, license_number: &str, exclude: Option<DriverId>) -> Result<bool> {
        self.tick();
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM drivers WHERE license_number = ?1 AND (?2 IS NULL OR id <> ?2))",
        )
        .bind(license_number)
        .bind(exclude.map(|id| id.0))
        .fetch_one(&self.pool)
        .await?;
        Ok(taken)
    }

    pub async fn create_driver(&self, driver: &NewDriver<'_>) -> Result<DriverId> {
        self.tick();
        let rec = sqlx::query(
            "INSERT INTO drivers (username, first_name, last_name, license_number, password_hash)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(driver.username)
        .bind(driver.first_name)
        .bind(driver.last_name)
        .bind(driver.license_number)
        .bind(driver.password_hash)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert driver '{}'", driver.username))?;
        Ok(DriverId(rec.get::<i64, _>(0)))
    }

    pub async fn update_driver_license(&self, id: DriverId, license_number: &str) -> Result<bool> {
        self.tick();
        let result = sqlx::query("UPDATE drivers SET license_number = ? WHERE id = ?")
            .bind(license_number)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_driver(&self, id: DriverId) -> Result<bool> {
        self.tick();
        let result = sqlx::query("DELETE FROM drivers WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn credentials_for_username(&self, username: &str) -> Result<Option<DriverCredentials>> {
        self.tick();
        let row = sqlx::query("SELECT id, password_hash FROM drivers WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| DriverCredentials {
            driver_id: DriverId(r.get::<i64, _>(0)),
            password_hash: r.get::<String, _>(1),
        }))
    }

    // Sessions

    pub async fn create_session(&self, driver_id: DriverId, ttl: Duration) -> Result<StoredSession> {
        let session_key = Uuid::new_v4().simple().to_string();
        let created_at = Utc::now();
        let expires_at = created_at
            .checked_add_signed(ttl)
            .context("session lifetime is out of range")?;

        self.tick();
        sqlx::query(
            "INSERT INTO sessions (session_key, driver_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session_key)
        .bind(driver_id.0)
        .bind(created_at.timestamp())
        .bind(expires_at.timestamp())
        .execute(&self.pool)
        .await
        .context("failed to create session")?;

        Ok(StoredSession {
            session_key,
            driver_id,
            expires_at,
        })
    }

    /// Looks up a live session. An expired session is deleted and reported as missing.
    pub async fn load_session(&self, session_key: &str) -> Result<Option<StoredSession>> {
        self.tick();
        let row = sqlx::query(
            "SELECT session_key, driver_id, expires_at FROM sessions WHERE session_key = ?",
        )
        .bind(session_key)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let session = StoredSession {
            session_key: row.get::<String, _>(0),
            driver_id: DriverId(row.get::<i64, _>(1)),
            expires_at: timestamp_to_utc(row.get::<i64, _>(2)),
        };
        if session.expires_at <= Utc::now() {
            info!(driver_id = session.driver_id.0, "session expired");
            self.delete_session(session_key).await?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    pub async fn delete_session(&self, session_key: &str) -> Result<bool> {
        self.tick();
        let result = sqlx::query("DELETE FROM sessions WHERE session_key = ?")
            .bind(session_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn purge_expired_sessions(&self) -> Result<u64> {
        self.tick();
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Atomically adds one to the named counter of a session and returns the new value.
    /// A counter that was never written starts from zero.
    pub async fn increment_session_counter(&self, session_key: &str, name: &str) -> Result<i64> {
        self.tick();
        let value = sqlx::query_scalar(
            "INSERT INTO session_counters (session_key, name, value) VALUES (?, ?, 1)
             ON CONFLICT(session_key, name) DO UPDATE SET value = value + 1
             RETURNING value",
        )
        .bind(session_key)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to bump session counter '{name}'"))?;
        Ok(value)
    }

    pub async fn session_counter(&self, session_key: &str, name: &str) -> Result<i64> {
        self.tick();
        let value: Option<i64> = sqlx::query_scalar(
            "SELECT value FROM session_counters WHERE session_key = ? AND name = ?",
        )
        .bind(session_key)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value.unwrap_or_default())
    }
}

fn manufacturer_from_row(row: &SqliteRow) -> Manufacturer {
    Manufacturer {
        id: ManufacturerId(row.get::<i64, _>("id")),
        name: row.get::<String, _>("name"),
        country: row.get::<String, _>("country"),
    }
}

fn car_from_row(row: &SqliteRow) -> Car {
    Car {
        id: CarId(row.get::<i64, _>("car_id")),
        model: row.get::<String, _>("car_model"),
        manufacturer: Manufacturer {
            id: ManufacturerId(row.get::<i64, _>("manufacturer_id")),
            name: row.get::<String, _>("manufacturer_name"),
            country: row.get::<String, _>("manufacturer_country"),
        },
    }
}

fn driver_from_row(row: &SqliteRow) -> Driver {
    Driver {
        id: DriverId(row.get::<i64, _>("id")),
        username: row.get::<String, _>("username"),
        first_name: row.get::<String, _>("first_name"),
        last_name: row.get::<String, _>("last_name"),
        license_number: row.get::<String, _>("license_number"),
    }
}

fn timestamp_to_utc(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Substring pattern for `LIKE .. ESCAPE '\'` with wildcards in the needle escaped.
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
