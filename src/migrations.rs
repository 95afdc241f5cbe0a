//! Idempotent ClickHouse DDL for the OLAP event store (§6 Persisted state layout).
//!
//! Mirrors the host codebase's migration pattern: a flat array of `IF NOT EXISTS`
//! statements run in order against a freshly connected client (no default database yet,
//! so `CREATE DATABASE` itself succeeds on a brand-new instance).

use clickhouse::Client;

pub const DATABASE: &str = "wide_events";

const MIGRATIONS: &[&str] = &[
    "CREATE DATABASE IF NOT EXISTS wide_events",
    r#"
    CREATE TABLE IF NOT EXISTS wide_events.canonical_events (
        tenant_id String,
        project_id String,
        environment LowCardinality(String),
        trace_id String,
        span_id String,
        parent_span_id String,
        timestamp DateTime64(3),
        event_type LowCardinality(String),
        conversation_id String,
        session_id String,
        user_id String,
        agent_name String,
        version String,
        route String,
        attributes_json String,
        INDEX idx_trace_id trace_id TYPE bloom_filter GRANULARITY 4,
        INDEX idx_span_id span_id TYPE bloom_filter GRANULARITY 4
    )
    ENGINE = MergeTree
    PARTITION BY toYYYYMM(timestamp)
    ORDER BY (tenant_id, project_id, trace_id, timestamp)
    TTL toDateTime(timestamp) + INTERVAL 90 DAY DELETE
    "#,
];

/// Runs every migration in order, logging progress. Non-idempotent failures (a genuine DDL
/// error, not "already exists") abort startup — the service must not come up against a
/// half-migrated store.
pub async fn run(client: &Client) -> anyhow::Result<()> {
    for (i, stmt) in MIGRATIONS.iter().enumerate() {
        tracing::info!(step = i + 1, total = MIGRATIONS.len(), "running OLAP migration");
        client.query(stmt).execute().await?;
    }
    tracing::info!("OLAP migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent_ddl() {
        for stmt in MIGRATIONS {
            assert!(
                stmt.contains("IF NOT EXISTS"),
                "migration should be idempotent: {stmt}"
            );
        }
    }
}
