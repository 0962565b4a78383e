/// PostgreSQL-backed implementation of PartnerStore
///
/// Uses sqlx with PgPool for connection pooling and production-grade persistence.
/// Supports optional migration execution on startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPool, PgPoolOptions, PgRow},
    Row,
};
use std::time::Duration;

use crate::backfill::{BackfillJob, BackfillType, NewBackfillJob};
use crate::errors::PartnerError;
use crate::store::{BoundingBox, CareRequestPartner, Origin, Partner, PartnerId, PartnerStore};

const PARTNER_COLUMNS: &str = "p.id, p.station_channel_item_id, p.display_name, p.latitude_e6, p.longitude_e6, p.deactivated_at, \
     COALESCE((SELECT array_agg(pip.package_id ORDER BY pip.package_id) \
               FROM partner_insurance_packages pip WHERE pip.partner_id = p.id), '{}'::BIGINT[]) AS insurance_package_ids";

const BACKFILL_COLUMNS: &str = "b.id, b.partner_id, bt.slug AS backfill_type, b.start_date, b.end_date, \
     b.last_processed_care_request_created_at, b.number_of_matches, b.error_description, \
     b.completed_at, b.created_at, b.updated_at";

const BACKFILL_RETURNING: &str = "RETURNING id, partner_id, \
     (SELECT slug FROM backfill_types bt WHERE bt.id = backfill_type_id) AS backfill_type, \
     start_date, end_date, last_processed_care_request_created_at, number_of_matches, \
     error_description, completed_at, created_at, updated_at";

/// PostgreSQL-backed partner store using sqlx connection pool.
pub struct PostgresPartnerStore {
    pool: PgPool,
}

impl PostgresPartnerStore {
    /// Create a new PostgresPartnerStore, connecting to the database at database_url.
    ///
    /// If run_migrations is true, automatically runs pending migrations on startup.
    pub async fn new(database_url: &str, run_migrations: bool) -> Result<Self, PartnerError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await
            .map_err(|e| PartnerError::Storage(format!("Failed to connect to database: {}", e)))?;

        if run_migrations {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| PartnerError::Storage(format!("Migration failed: {}", e)))?;
        }

        Ok(PostgresPartnerStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_partners(&self, condition: &str, bind: PartnerFilter<'_>) -> Result<Vec<Partner>, PartnerError> {
        let sql = format!(
            "SELECT {} FROM partners p WHERE p.deactivated_at IS NULL AND {} ORDER BY p.id",
            PARTNER_COLUMNS, condition
        );
        let query = sqlx::query(&sql);
        let query = match bind {
            PartnerFilter::Ids(ids) => query.bind(ids),
            PartnerFilter::Bounds(b) => query
                .bind(b.lat_min)
                .bind(b.lat_max)
                .bind(b.lng_min)
                .bind(b.lng_max),
        };
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PartnerError::Storage(e.to_string()))?;
        rows.iter().map(row_to_partner).collect()
    }
}

enum PartnerFilter<'a> {
    Ids(&'a [i64]),
    Bounds(BoundingBox),
}

fn storage_err(e: sqlx::Error) -> PartnerError {
    PartnerError::Storage(e.to_string())
}

fn row_to_partner(row: &PgRow) -> Result<Partner, PartnerError> {
    Ok(Partner {
        id: row.try_get("id").map_err(storage_err)?,
        channel_item_id: row.try_get("station_channel_item_id").map_err(storage_err)?,
        name: row.try_get("display_name").map_err(storage_err)?,
        latitude_e6: row.try_get("latitude_e6").map_err(storage_err)?,
        longitude_e6: row.try_get("longitude_e6").map_err(storage_err)?,
        insurance_package_ids: row.try_get("insurance_package_ids").map_err(storage_err)?,
        deactivated_at: row.try_get("deactivated_at").map_err(storage_err)?,
    })
}

fn row_to_association(row: &PgRow) -> Result<CareRequestPartner, PartnerError> {
    let slug: String = row.try_get("origin").map_err(storage_err)?;
    Ok(CareRequestPartner {
        id: row.try_get("id").map_err(storage_err)?,
        care_request_id: row.try_get("station_care_request_id").map_err(storage_err)?,
        partner_id: row.try_get("partner_id").map_err(storage_err)?,
        origin: slug.parse().map_err(PartnerError::Storage)?,
        created_at: row.try_get("created_at").map_err(storage_err)?,
        deleted_at: row.try_get("deleted_at").map_err(storage_err)?,
    })
}

fn row_to_backfill(row: &PgRow) -> Result<BackfillJob, PartnerError> {
    let slug: String = row.try_get("backfill_type").map_err(storage_err)?;
    Ok(BackfillJob {
        id: row.try_get("id").map_err(storage_err)?,
        partner_id: row.try_get("partner_id").map_err(storage_err)?,
        backfill_type: slug.parse().map_err(PartnerError::Storage)?,
        start_date: row.try_get("start_date").map_err(storage_err)?,
        end_date: row.try_get("end_date").map_err(storage_err)?,
        last_processed_cursor: row
            .try_get("last_processed_care_request_created_at")
            .map_err(storage_err)?,
        number_of_matches: row.try_get("number_of_matches").map_err(storage_err)?,
        error_description: row.try_get("error_description").map_err(storage_err)?,
        completed_at: row.try_get("completed_at").map_err(storage_err)?,
        created_at: row.try_get("created_at").map_err(storage_err)?,
        updated_at: row.try_get("updated_at").map_err(storage_err)?,
    })
}

#[async_trait]
impl PartnerStore for PostgresPartnerStore {
    async fn get_partner_by_id(&self, id: PartnerId) -> Result<Partner, PartnerError> {
        let sql = format!("SELECT {} FROM partners p WHERE p.id = $1", PARTNER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| PartnerError::not_found("Partner", id))?;
        row_to_partner(&row)
    }

    async fn get_partner_by_channel_item_id(&self, channel_item_id: i64) -> Result<Partner, PartnerError> {
        let sql = format!(
            "SELECT {} FROM partners p WHERE p.station_channel_item_id = $1",
            PARTNER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(channel_item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| PartnerError::not_found("Partner with channel item id", channel_item_id))?;
        row_to_partner(&row)
    }

    async fn get_partners_by_channel_item_ids(&self, channel_item_ids: &[i64]) -> Result<Vec<Partner>, PartnerError> {
        if channel_item_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_partners("p.station_channel_item_id = ANY($1)", PartnerFilter::Ids(channel_item_ids))
            .await
    }

    async fn get_partners_by_insurance_packages(&self, package_ids: &[i64]) -> Result<Vec<Partner>, PartnerError> {
        if package_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_partners(
            "EXISTS (SELECT 1 FROM partner_insurance_packages pip \
                     WHERE pip.partner_id = p.id AND pip.package_id = ANY($1))",
            PartnerFilter::Ids(package_ids),
        )
        .await
    }

    async fn search_partners_by_location(&self, bounds: BoundingBox) -> Result<Vec<Partner>, PartnerError> {
        self.fetch_partners(
            "p.latitude_e6 BETWEEN $1 AND $2 AND p.longitude_e6 BETWEEN $3 AND $4",
            PartnerFilter::Bounds(bounds),
        )
        .await
    }

    async fn list_active_associations(&self, care_request_id: i64) -> Result<Vec<CareRequestPartner>, PartnerError> {
        let rows = sqlx::query(
            "SELECT crp.id, crp.station_care_request_id, crp.partner_id, o.slug AS origin, crp.created_at, crp.deleted_at \
             FROM care_request_partners crp \
             JOIN care_request_partner_origins o ON o.id = crp.care_request_partner_origin_id \
             WHERE crp.station_care_request_id = $1 AND crp.deleted_at IS NULL \
             ORDER BY crp.created_at, crp.id",
        )
        .bind(care_request_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(row_to_association).collect()
    }

    async fn add_association(
        &self,
        care_request_id: i64,
        partner_id: PartnerId,
        origin: Origin,
    ) -> Result<CareRequestPartner, PartnerError> {
        let row = sqlx::query(
            "INSERT INTO care_request_partners (station_care_request_id, partner_id, care_request_partner_origin_id) \
             SELECT $1, $2, o.id FROM care_request_partner_origins o WHERE o.slug = $3 \
             RETURNING id, station_care_request_id, partner_id, $3::TEXT AS origin, created_at, deleted_at",
        )
        .bind(care_request_id)
        .bind(partner_id)
        .bind(origin.slug())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PartnerError::Storage(format!("Failed to insert care request partner: {}", e)))?
        .ok_or_else(|| PartnerError::Storage(format!("Unknown origin slug: {}", origin)))?;

        row_to_association(&row)
    }

    async fn delete_association(&self, id: i64) -> Result<(), PartnerError> {
        let result = sqlx::query(
            "UPDATE care_request_partners SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(PartnerError::not_found("Care request partner", id));
        }
        Ok(())
    }

    async fn add_backfill(&self, input: NewBackfillJob) -> Result<BackfillJob, PartnerError> {
        let sql = format!(
            "INSERT INTO care_request_partner_backfills (partner_id, backfill_type_id, start_date, end_date) \
             SELECT $1, bt.id, $3, $4 FROM backfill_types bt WHERE bt.slug = $2 {}",
            BACKFILL_RETURNING
        );
        let row = sqlx::query(&sql)
            .bind(input.partner_id)
            .bind(input.backfill_type.slug())
            .bind(input.start_date)
            .bind(input.end_date)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| match e.as_database_error() {
                Some(db) if db.is_unique_violation() => PartnerError::Conflict(format!(
                    "backfill is already in progress for partner {} and type {}",
                    input.partner_id, input.backfill_type
                )),
                _ => PartnerError::Storage(format!("Failed to insert backfill: {}", e)),
            })?
            .ok_or_else(|| PartnerError::Storage(format!("Unknown backfill type: {}", input.backfill_type)))?;

        row_to_backfill(&row)
    }

    async fn get_backfill(&self, id: i64) -> Result<BackfillJob, PartnerError> {
        let sql = format!(
            "SELECT {} FROM care_request_partner_backfills b \
             JOIN backfill_types bt ON bt.id = b.backfill_type_id WHERE b.id = $1",
            BACKFILL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| PartnerError::not_found("Backfill", id))?;
        row_to_backfill(&row)
    }

    async fn get_open_backfill(
        &self,
        partner_id: PartnerId,
        backfill_type: BackfillType,
    ) -> Result<Option<BackfillJob>, PartnerError> {
        let sql = format!(
            "SELECT {} FROM care_request_partner_backfills b \
             JOIN backfill_types bt ON bt.id = b.backfill_type_id \
             WHERE b.partner_id = $1 AND bt.slug = $2 AND b.completed_at IS NULL",
            BACKFILL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(partner_id)
            .bind(backfill_type.slug())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        row.as_ref().map(row_to_backfill).transpose()
    }

    async fn get_pending_backfills(&self) -> Result<Vec<BackfillJob>, PartnerError> {
        let sql = format!(
            "SELECT {} FROM care_request_partner_backfills b \
             JOIN backfill_types bt ON bt.id = b.backfill_type_id \
             WHERE b.completed_at IS NULL ORDER BY b.created_at, b.id",
            BACKFILL_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(row_to_backfill).collect()
    }

    async fn record_backfill_progress(
        &self,
        id: i64,
        cursor: DateTime<Utc>,
        new_matches: i64,
    ) -> Result<BackfillJob, PartnerError> {
        // GREATEST keeps the cursor monotonic even if a stale batch is replayed.
        let sql = format!(
            "UPDATE care_request_partner_backfills SET \
                 last_processed_care_request_created_at = GREATEST(COALESCE(last_processed_care_request_created_at, $2), $2), \
                 number_of_matches = number_of_matches + $3, \
                 updated_at = now() \
             WHERE id = $1 AND completed_at IS NULL {}",
            BACKFILL_RETURNING
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(cursor)
            .bind(new_matches)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PartnerError::Storage(format!("Failed to update backfill progress: {}", e)))?
            .ok_or_else(|| PartnerError::not_found("Open backfill", id))?;

        row_to_backfill(&row)
    }

    async fn complete_backfill(
        &self,
        id: i64,
        error_description: Option<&str>,
    ) -> Result<BackfillJob, PartnerError> {
        let sql = format!(
            "UPDATE care_request_partner_backfills SET \
                 completed_at = now(), error_description = $2, updated_at = now() \
             WHERE id = $1 AND completed_at IS NULL {}",
            BACKFILL_RETURNING
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(error_description)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PartnerError::Storage(format!("Failed to complete backfill: {}", e)))?;

        match row {
            Some(row) => row_to_backfill(&row),
            None => self.get_backfill(id).await,
        }
    }
}
