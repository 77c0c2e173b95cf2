//! Database schema definitions and migrations
//!
//! This module contains all SQL schema definitions for the asin-harvest database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Scans in every lifecycle state
CREATE TABLE IF NOT EXISTS scans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    state TEXT NOT NULL,
    domain TEXT NOT NULL,
    max_requests INTEGER NOT NULL,
    max_concurrent_requests INTEGER NOT NULL,
    max_rerequests INTEGER NOT NULL,
    target_json TEXT NOT NULL,
    sent_requests INTEGER NOT NULL DEFAULT 0,
    products_gathered INTEGER NOT NULL DEFAULT 0,
    category_pages_sent INTEGER NOT NULL DEFAULT 0,
    category_pages_succeeded INTEGER NOT NULL DEFAULT 0,
    product_pages_sent INTEGER NOT NULL DEFAULT 0,
    product_pages_succeeded INTEGER NOT NULL DEFAULT 0,
    config_hash TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_scans_state ON scans(state, created_at);
CREATE INDEX IF NOT EXISTS idx_scans_created ON scans(created_at);

-- Category trees, one per marketplace domain
CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    name TEXT NOT NULL,
    node_id TEXT NOT NULL,
    is_main INTEGER NOT NULL DEFAULT 0,
    discovery_state TEXT,
    UNIQUE(domain, node_id)
);

-- Ordered parent/child links
CREATE TABLE IF NOT EXISTS category_children (
    parent_id INTEGER NOT NULL REFERENCES categories(id),
    child_id INTEGER NOT NULL REFERENCES categories(id),
    position INTEGER NOT NULL,
    PRIMARY KEY(parent_id, child_id)
);

CREATE INDEX IF NOT EXISTS idx_category_children_parent ON category_children(parent_id, position);

-- One row per (ASIN, domain)
CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asin TEXT NOT NULL,
    domain TEXT NOT NULL,
    status TEXT NOT NULL,
    scan_id INTEGER NOT NULL,
    attributes_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(asin, domain)
);

-- Append-only change log; survives scan deletion
CREATE TABLE IF NOT EXISTS product_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id INTEGER NOT NULL REFERENCES products(id),
    scan_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    sent_requests INTEGER NOT NULL,
    requested_at TEXT NOT NULL,
    received_at TEXT NOT NULL,
    changed_fields_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_product_history_product ON product_history(product_id);

-- Products observed by a scan, with the rank seen at that time
CREATE TABLE IF NOT EXISTS scan_products (
    scan_id INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
    product_id INTEGER NOT NULL REFERENCES products(id),
    status TEXT NOT NULL,
    observed_rank INTEGER,
    PRIMARY KEY(scan_id, product_id)
);

-- Category listing pages fetched by a scan
CREATE TABLE IF NOT EXISTS scan_categories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    node_id TEXT NOT NULL,
    page INTEGER NOT NULL,
    status TEXT NOT NULL,
    asins_json TEXT NOT NULL,
    proxy_country TEXT,
    sent_requests INTEGER NOT NULL,
    requested_at TEXT NOT NULL,
    received_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scan_categories_scan ON scan_categories(scan_id);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
