//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Store trait.

use crate::scan::{Budget, ScanConfig, ScanTarget};
use crate::state::{DiscoveryState, ScanState, SubjectStatus};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Store, StorageError, StorageResult};
use crate::storage::{
    CategoryNode, CategoryPageRecord, FieldChange, HistoryEntry, ObservationOutcome, PageCounter,
    ProductData, ProductObservation, ProductRecord, ScanCounters, ScanProductLink, ScanRecord,
};
use crate::storage::timestamp;
use crate::HarvestError;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;

const SCAN_COLUMNS: &str = "id, state, domain, max_requests, max_concurrent_requests, \
     max_rerequests, target_json, sent_requests, products_gathered, category_pages_sent, \
     category_pages_succeeded, product_pages_sent, product_pages_succeeded, config_hash, \
     created_at, started_at, completed_at";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(HarvestError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, HarvestError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for tests and dry runs)
    pub fn new_in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<ScanRecord> {
    let state: String = row.get(1)?;
    let state = ScanState::from_db_string(&state)
        .ok_or_else(|| conversion_error(1, format!("unknown scan state '{}'", state)))?;

    let target_json: String = row.get(6)?;
    let target: ScanTarget = serde_json::from_str(&target_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(ScanRecord {
        id: row.get(0)?,
        state,
        config: ScanConfig {
            domain: row.get(2)?,
            budget: Budget {
                max_requests: row.get(3)?,
                max_concurrent_requests: row.get::<_, i64>(4)? as usize,
                max_rerequests: row.get(5)?,
            },
            target,
        },
        counters: ScanCounters {
            sent_requests: row.get(7)?,
            products_gathered: row.get(8)?,
            category_pages: PageCounter {
                sent: row.get(9)?,
                succeeded: row.get(10)?,
            },
            product_pages: PageCounter {
                sent: row.get(11)?,
                succeeded: row.get(12)?,
            },
        },
        config_hash: row.get(13)?,
        created_at: row.get(14)?,
        started_at: row.get(15)?,
        completed_at: row.get(16)?,
    })
}

fn status_from_column(row: &Row<'_>, column: usize) -> rusqlite::Result<SubjectStatus> {
    let status: String = row.get(column)?;
    SubjectStatus::from_db_string(&status)
        .ok_or_else(|| conversion_error(column, format!("unknown status '{}'", status)))
}

impl Store for SqliteStorage {
    // ===== Scan Management =====

    fn create_scan(
        &mut self,
        config: &ScanConfig,
        state: ScanState,
        config_hash: Option<&str>,
    ) -> StorageResult<i64> {
        let target_json = serde_json::to_string(&config.target)?;
        let now = timestamp();
        let started_at = (state == ScanState::Active).then(|| now.clone());

        self.conn.execute(
            "INSERT INTO scans (kind, state, domain, max_requests, max_concurrent_requests,
             max_rerequests, target_json, config_hash, created_at, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                config.kind().to_db_string(),
                state.to_db_string(),
                config.domain,
                config.budget.max_requests,
                config.budget.max_concurrent_requests as i64,
                config.budget.max_rerequests,
                target_json,
                config_hash,
                now,
                started_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_scan(&self, scan_id: i64) -> StorageResult<ScanRecord> {
        let sql = format!("SELECT {} FROM scans WHERE id = ?1", SCAN_COLUMNS);
        self.conn
            .query_row(&sql, params![scan_id], scan_from_row)
            .optional()?
            .ok_or(StorageError::ScanNotFound(scan_id))
    }

    fn update_scan_state(&mut self, scan_id: i64, state: ScanState) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE scans SET state = ?1,
             started_at = CASE WHEN ?1 = 'active' AND started_at IS NULL THEN ?2 ELSE started_at END,
             completed_at = CASE WHEN ?1 = 'completed' THEN ?2 ELSE completed_at END
             WHERE id = ?3",
            params![state.to_db_string(), timestamp(), scan_id],
        )?;
        if updated == 0 {
            return Err(StorageError::ScanNotFound(scan_id));
        }
        Ok(())
    }

    fn save_scan_progress(
        &mut self,
        scan_id: i64,
        counters: &ScanCounters,
        budget: &Budget,
    ) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE scans SET sent_requests = ?1, products_gathered = ?2,
             category_pages_sent = ?3, category_pages_succeeded = ?4,
             product_pages_sent = ?5, product_pages_succeeded = ?6,
             max_concurrent_requests = ?7
             WHERE id = ?8",
            params![
                counters.sent_requests,
                counters.products_gathered,
                counters.category_pages.sent,
                counters.category_pages.succeeded,
                counters.product_pages.sent,
                counters.product_pages.succeeded,
                budget.max_concurrent_requests as i64,
                scan_id,
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::ScanNotFound(scan_id));
        }
        Ok(())
    }

    fn delete_scan(&mut self, scan_id: i64) -> StorageResult<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM scans WHERE id = ?1", params![scan_id])?;
        if deleted == 0 {
            return Err(StorageError::ScanNotFound(scan_id));
        }
        Ok(())
    }

    fn oldest_enqueued_scan(&self) -> StorageResult<Option<ScanRecord>> {
        let sql = format!(
            "SELECT {} FROM scans WHERE state = ?1 ORDER BY created_at ASC, id ASC LIMIT 1",
            SCAN_COLUMNS
        );
        let scan = self
            .conn
            .query_row(
                &sql,
                params![ScanState::Enqueued.to_db_string()],
                scan_from_row,
            )
            .optional()?;
        Ok(scan)
    }

    fn list_scans(&self, offset: usize, limit: usize) -> StorageResult<Vec<ScanRecord>> {
        let sql = format!(
            "SELECT {} FROM scans ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
            SCAN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let scans = stmt
            .query_map(params![limit as i64, offset as i64], scan_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scans)
    }

    fn count_scans(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM scans", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn scans_in_states(&self, states: &[ScanState]) -> StorageResult<Vec<ScanRecord>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM scans WHERE state IN ({}) ORDER BY created_at ASC, id ASC",
            SCAN_COLUMNS, placeholders
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let scans = stmt
            .query_map(
                params_from_iter(states.iter().map(|s| s.to_db_string())),
                scan_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scans)
    }

    // ===== Scan Result Sets =====

    fn append_scan_category(
        &mut self,
        scan_id: i64,
        entry: &CategoryPageRecord,
    ) -> StorageResult<()> {
        let asins_json = serde_json::to_string(&entry.asins)?;
        self.conn.execute(
            "INSERT INTO scan_categories (scan_id, name, node_id, page, status, asins_json,
             proxy_country, sent_requests, requested_at, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                scan_id,
                entry.name,
                entry.node_id,
                entry.page,
                entry.status.to_db_string(),
                asins_json,
                entry.proxy_country,
                entry.sent_requests,
                entry.requested_at,
                entry.received_at,
            ],
        )?;
        Ok(())
    }

    fn scan_categories(&self, scan_id: i64) -> StorageResult<Vec<CategoryPageRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, node_id, page, status, asins_json, proxy_country, sent_requests,
             requested_at, received_at
             FROM scan_categories WHERE scan_id = ?1 ORDER BY id",
        )?;

        let entries = stmt
            .query_map(params![scan_id], |row| {
                let asins_json: String = row.get(4)?;
                let asins = serde_json::from_str(&asins_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
                })?;
                Ok(CategoryPageRecord {
                    name: row.get(0)?,
                    node_id: row.get(1)?,
                    page: row.get(2)?,
                    status: status_from_column(row, 3)?,
                    asins,
                    proxy_country: row.get(5)?,
                    sent_requests: row.get(6)?,
                    requested_at: row.get(7)?,
                    received_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn scan_products(&self, scan_id: i64) -> StorageResult<Vec<ScanProductLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.asin, sp.status, sp.observed_rank
             FROM scan_products sp JOIN products p ON p.id = sp.product_id
             WHERE sp.scan_id = ?1 ORDER BY p.asin",
        )?;

        let links = stmt
            .query_map(params![scan_id], |row| {
                Ok(ScanProductLink {
                    asin: row.get(0)?,
                    status: status_from_column(row, 1)?,
                    rank: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(links)
    }

    // ===== Category Trees =====

    fn insert_or_get_category(
        &mut self,
        domain: &str,
        name: &str,
        node_id: &str,
        is_main: bool,
    ) -> StorageResult<i64> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM categories WHERE domain = ?1 AND node_id = ?2",
                params![domain, node_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok(id);
        }

        let discovery = is_main.then(|| DiscoveryState::Created.to_db_string());
        self.conn.execute(
            "INSERT INTO categories (domain, name, node_id, is_main, discovery_state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![domain, name, node_id, is_main, discovery],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    fn link_child(&mut self, parent_id: i64, child_id: i64) -> StorageResult<()> {
        if parent_id == child_id {
            return Err(StorageError::ConstraintViolation(format!(
                "Category {} cannot be its own child",
                parent_id
            )));
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO category_children (parent_id, child_id, position)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(position) + 1, 0)
                              FROM category_children WHERE parent_id = ?1))",
            params![parent_id, child_id],
        )?;
        Ok(())
    }

    fn get_category(&self, category_id: i64) -> StorageResult<CategoryNode> {
        let node = self
            .conn
            .query_row(
                "SELECT id, domain, name, node_id, is_main, discovery_state
                 FROM categories WHERE id = ?1",
                params![category_id],
                |row| {
                    let discovery: Option<String> = row.get(5)?;
                    Ok(CategoryNode {
                        id: row.get(0)?,
                        domain: row.get(1)?,
                        name: row.get(2)?,
                        node_id: row.get(3)?,
                        children: Vec::new(),
                        is_main: row.get(4)?,
                        discovery: discovery.as_deref().and_then(DiscoveryState::from_db_string),
                    })
                },
            )
            .optional()?;

        let mut node = node.ok_or(StorageError::CategoryNotFound(category_id))?;

        let mut stmt = self.conn.prepare(
            "SELECT child_id FROM category_children WHERE parent_id = ?1 ORDER BY position",
        )?;
        node.children = stmt
            .query_map(params![category_id], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;

        Ok(node)
    }

    fn set_discovery_state(
        &mut self,
        category_id: i64,
        state: DiscoveryState,
    ) -> StorageResult<()> {
        let node = self.get_category(category_id)?;
        if !node.is_main {
            return Err(StorageError::ConstraintViolation(format!(
                "Category {} is not a main category",
                category_id
            )));
        }
        self.conn.execute(
            "UPDATE categories SET discovery_state = ?1 WHERE id = ?2",
            params![state.to_db_string(), category_id],
        )?;
        Ok(())
    }

    // ===== Products =====

    fn record_observation(
        &mut self,
        observation: &ProductObservation,
    ) -> StorageResult<ObservationOutcome> {
        let tx = self.conn.transaction()?;
        let now = timestamp();

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, attributes_json FROM products WHERE asin = ?1 AND domain = ?2",
                params![observation.asin, observation.domain],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let created = existing.is_none();
        let (product_id, stored, changed_fields) = match existing {
            Some((id, attributes_json)) => {
                let mut stored: ProductData = serde_json::from_str(&attributes_json)?;
                let changes = match &observation.data {
                    Some(data) => stored.apply(data)?,
                    None => Vec::new(),
                };
                (Some(id), stored, changes)
            }
            None => {
                let mut stored = ProductData::default();
                let changes = match &observation.data {
                    Some(data) => stored.apply(data)?,
                    None => Vec::new(),
                };
                (None, stored, changes)
            }
        };

        let attributes_json = serde_json::to_string(&stored)?;
        let product_id = match product_id {
            Some(id) => {
                tx.execute(
                    "UPDATE products SET status = ?1, scan_id = ?2, attributes_json = ?3,
                     updated_at = ?4 WHERE id = ?5",
                    params![
                        observation.status.to_db_string(),
                        observation.scan_id,
                        attributes_json,
                        now,
                        id
                    ],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO products (asin, domain, status, scan_id, attributes_json,
                     created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        observation.asin,
                        observation.domain,
                        observation.status.to_db_string(),
                        observation.scan_id,
                        attributes_json,
                        now
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.execute(
            "INSERT INTO product_history (product_id, scan_id, status, sent_requests,
             requested_at, received_at, changed_fields_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                product_id,
                observation.scan_id,
                observation.status.to_db_string(),
                observation.sent_requests,
                observation.requested_at,
                observation.received_at,
                serde_json::to_string(&changed_fields)?,
            ],
        )?;

        let observed_rank = observation.data.as_ref().and_then(|d| d.rank);
        tx.execute(
            "INSERT OR REPLACE INTO scan_products (scan_id, product_id, status, observed_rank)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                observation.scan_id,
                product_id,
                observation.status.to_db_string(),
                observed_rank
            ],
        )?;

        tx.commit()?;

        Ok(ObservationOutcome {
            product_id,
            created,
            changed_fields,
        })
    }

    fn get_product(&self, asin: &str, domain: &str) -> StorageResult<Option<ProductRecord>> {
        let product = self
            .conn
            .query_row(
                "SELECT id, asin, domain, status, scan_id, attributes_json
                 FROM products WHERE asin = ?1 AND domain = ?2",
                params![asin, domain],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        status_from_column(row, 3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, asin, domain, status, scan_id, attributes_json)) = product else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT scan_id, status, sent_requests, requested_at, received_at, changed_fields_json
             FROM product_history WHERE product_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    status_from_column(row, 1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut history = Vec::with_capacity(rows.len());
        for (scan_id, status, sent_requests, requested_at, received_at, changes_json) in rows {
            let changed_fields: Vec<FieldChange> = serde_json::from_str(&changes_json)?;
            history.push(HistoryEntry {
                scan_id,
                status,
                sent_requests,
                requested_at,
                received_at,
                changed_fields,
            });
        }

        Ok(Some(ProductRecord {
            id,
            asin,
            domain,
            status,
            scan_id,
            data: serde_json::from_str(&attributes_json)?,
            history,
        }))
    }
}
