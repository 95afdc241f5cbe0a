//! Trace-summary store (OLTP, §4.3). Row-oriented, backed by SQLite via `rusqlite`, the
//! same way this codebase has always kept its transactional side state — a single
//! `Mutex<Connection>` guarding WAL-mode access, with one `run_migrations` batch and a
//! CRUD method per concern.
//!
//! This is the derived cache (§9 "dual-write consistency"): OLAP remains the sole source
//! of truth, and every row here can in principle be rebuilt by replaying `canonical_events`.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::event::{CanonicalEvent, EventType, ResultStatus};
use crate::models::trace::{TraceListFilters, TraceSummary};

const MAX_CAS_RETRIES: u32 = 5;

pub struct OltpStore {
    conn: Mutex<Connection>,
}

impl OltpStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trace_summaries (
                tenant_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                query TEXT,
                query_ts TEXT,
                response TEXT,
                response_ts TEXT,
                llm_response_ts TEXT,
                model TEXT,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                total_cost REAL NOT NULL DEFAULT 0,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                finish_reason TEXT,
                finish_reason_ts TEXT,
                has_issues INTEGER NOT NULL DEFAULT 0,
                malformed INTEGER NOT NULL DEFAULT 0,
                conversation_id TEXT,
                session_id TEXT,
                user_id TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, trace_id)
            );

            CREATE TABLE IF NOT EXISTS trace_contributing_spans (
                tenant_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                span_id TEXT NOT NULL,
                PRIMARY KEY (tenant_id, trace_id, span_id)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                tenant_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                trace_count INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (tenant_id, conversation_id)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                tenant_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                trace_count INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (tenant_id, session_id)
            );

            CREATE TABLE IF NOT EXISTS users (
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                trace_count INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (tenant_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS conversation_trace_membership (
                tenant_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                PRIMARY KEY (tenant_id, conversation_id, trace_id)
            );

            CREATE TABLE IF NOT EXISTS session_trace_membership (
                tenant_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                PRIMARY KEY (tenant_id, session_id, trace_id)
            );

            CREATE TABLE IF NOT EXISTS user_trace_membership (
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                PRIMARY KEY (tenant_id, user_id, trace_id)
            );

            CREATE TABLE IF NOT EXISTS credentials (
                token_hash TEXT PRIMARY KEY,
                prefix TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                environment TEXT NOT NULL,
                scopes TEXT NOT NULL,
                allowed_origins TEXT
            );

            CREATE TABLE IF NOT EXISTS rate_limit_buckets (
                tenant_id TEXT PRIMARY KEY,
                window_start TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS quota_counters (
                tenant_id TEXT NOT NULL,
                year_month TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, year_month)
            );
            "#,
        )?;
        Ok(())
    }

    /// `upsertTraceSummary(trace_id, events[])` (§4.3). Returns the merged summary.
    ///
    /// Implements the optimistic `version`-column CAS described in §4.3/§5/Open Question 3:
    /// read, merge, write-if-version-unchanged, retry on conflict.
    pub fn upsert_trace_summary(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        trace_id: Uuid,
        events: &[CanonicalEvent],
    ) -> Result<TraceSummary, AppError> {
        for _ in 0..MAX_CAS_RETRIES {
            match self.try_upsert_once(tenant_id, project_id, trace_id, events)? {
                Some(summary) => return Ok(summary),
                None => continue, // version conflict, retry
            }
        }
        Err(AppError::DownstreamUnavailable(
            "trace summary upsert: exhausted CAS retries".to_string(),
        ))
    }

    fn try_upsert_once(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        trace_id: Uuid,
        events: &[CanonicalEvent],
    ) -> Result<Option<TraceSummary>, AppError> {
        let conn = self.conn.lock().unwrap();
        let tenant_s = tenant_id.to_string();
        let trace_s = trace_id.to_string();

        let existing = read_summary_row(&conn, &tenant_s, &trace_s)
            .map_err(|e| AppError::DownstreamUnavailable(format!("oltp read: {e}")))?;
        let read_version = existing.as_ref().map(|s| s.version).unwrap_or(0);
        let extraction_state = read_extraction_state(&conn, &tenant_s, &trace_s)
            .map_err(|e| AppError::DownstreamUnavailable(format!("oltp read: {e}")))?
            .unwrap_or_default();

        let already_contributing: std::collections::HashSet<String> = {
            let mut stmt = conn
                .prepare("SELECT span_id FROM trace_contributing_spans WHERE tenant_id = ?1 AND trace_id = ?2")
                .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?;
            stmt.query_map(params![tenant_s, trace_s], |row| row.get::<_, String>(0))
                .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?
                .collect::<Result<_, _>>()
                .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?
        };

        let mut new_span_ids = std::collections::HashSet::new();
        let new_events: Vec<&CanonicalEvent> = events
            .iter()
            .filter(|e| {
                let span = e.span_id.to_string();
                if already_contributing.contains(&span) {
                    return false;
                }
                new_span_ids.insert(span);
                true
            })
            .collect();

        if new_events.is_empty() && existing.is_some() {
            return Ok(existing);
        }

        let (merged, new_state) =
            merge_summary(tenant_id, project_id, trace_id, existing.clone(), extraction_state, &new_events);

        let tx_result = write_summary_row(&conn, &merged, &new_state, read_version);
        match tx_result {
            Ok(true) => {
                for span in new_span_ids {
                    conn.execute(
                        "INSERT OR IGNORE INTO trace_contributing_spans (tenant_id, trace_id, span_id) VALUES (?1, ?2, ?3)",
                        params![tenant_s, trace_s, span],
                    )
                    .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?;
                }
                update_indices(&conn, tenant_id, trace_id, &new_events)
                    .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?;
                Ok(Some(merged))
            }
            Ok(false) => Ok(None), // CAS conflict, caller retries
            Err(e) => Err(AppError::DownstreamUnavailable(format!("oltp write: {e}"))),
        }
    }

    pub fn get_trace_summary(&self, tenant_id: Uuid, trace_id: Uuid) -> Result<Option<TraceSummary>, AppError> {
        let conn = self.conn.lock().unwrap();
        read_summary_row(&conn, &tenant_id.to_string(), &trace_id.to_string())
            .map_err(|e| AppError::DownstreamUnavailable(format!("oltp read: {e}")))
    }

    /// `listTraces(filters, paging)` (§4.8 Listing surface).
    pub fn list_traces(&self, tenant_id: Uuid, filters: &TraceListFilters) -> Result<(Vec<TraceSummary>, u64), AppError> {
        let conn = self.conn.lock().unwrap();
        let mut where_sql = vec!["tenant_id = ?1".to_string()];
        let mut binds: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(tenant_id.to_string())];

        if let Some(project_id) = filters.project_id {
            binds.push(Box::new(project_id.to_string()));
            where_sql.push(format!("project_id = ?{}", binds.len()));
        }
        if let Some(from) = filters.from {
            binds.push(Box::new(from.to_rfc3339()));
            where_sql.push(format!("start_time >= ?{}", binds.len()));
        }
        if let Some(to) = filters.to {
            binds.push(Box::new(to.to_rfc3339()));
            where_sql.push(format!("start_time <= ?{}", binds.len()));
        }
        if let Some(has_issues) = filters.has_issues {
            binds.push(Box::new(has_issues as i64));
            where_sql.push(format!("has_issues = ?{}", binds.len()));
        }
        if let Some(ref model) = filters.model {
            binds.push(Box::new(model.clone()));
            where_sql.push(format!("model = ?{}", binds.len()));
        }

        let where_clause = where_sql.join(" AND ");
        let count_sql = format!("SELECT COUNT(*) FROM trace_summaries WHERE {where_clause}");
        let bind_refs: Vec<&dyn rusqlite::types::ToSql> = binds.iter().map(|b| b.as_ref()).collect();

        let total: i64 = conn
            .query_row(&count_sql, bind_refs.as_slice(), |row| row.get(0))
            .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?;

        let limit = filters.limit.clamp(1, 1000);
        let sql = format!(
            "SELECT tenant_id, project_id, trace_id, query, response, model, total_tokens, total_cost, \
             start_time, end_time, finish_reason, has_issues, malformed, conversation_id, session_id, user_id, version \
             FROM trace_summaries WHERE {where_clause} ORDER BY start_time DESC LIMIT {limit} OFFSET {}",
            filters.offset
        );

        let mut stmt = conn.prepare(&sql).map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?;
        let rows = stmt
            .query_map(bind_refs.as_slice(), row_to_summary)
            .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?;

        Ok((rows, total as u64))
    }

    pub fn lookup_credential(&self, token_hash: &str) -> Result<Option<CredentialRow>, AppError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT tenant_id, project_id, environment, scopes, allowed_origins FROM credentials WHERE token_hash = ?1",
            params![token_hash],
            |row| {
                Ok(CredentialRow {
                    tenant_id: row.get(0)?,
                    project_id: row.get(1)?,
                    environment: row.get(2)?,
                    scopes: row.get(3)?,
                    allowed_origins: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))
    }

    /// Per-tenant-per-minute rate check (§4.7). Implemented as a fixed calendar-minute window
    /// counter rather than a true token bucket — simpler, and sufficient for the fail-open
    /// posture this sits behind, but it permits a burst at a minute boundary a token bucket
    /// would smooth out. Returns `true` if the request is allowed (and records it).
    pub fn check_rate_limit(&self, tenant_id: Uuid, limit_per_minute: u32, now: DateTime<Utc>) -> Result<bool, AppError> {
        let conn = self.conn.lock().unwrap();
        let tenant_s = tenant_id.to_string();
        let window_start = now.format("%Y-%m-%dT%H:%M").to_string();

        let current: Option<(String, i64)> = conn
            .query_row(
                "SELECT window_start, count FROM rate_limit_buckets WHERE tenant_id = ?1",
                params![tenant_s],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?;

        let count = match current {
            Some((ws, count)) if ws == window_start => count,
            _ => 0,
        };

        if count >= limit_per_minute as i64 {
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO rate_limit_buckets (tenant_id, window_start, count) VALUES (?1, ?2, 1)
             ON CONFLICT(tenant_id) DO UPDATE SET
                count = CASE WHEN window_start = ?2 THEN count + 1 ELSE 1 END,
                window_start = ?2",
            params![tenant_s, window_start],
        )
        .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?;

        Ok(true)
    }

    /// Atomic monthly quota check-and-increment (§4.7).
    pub fn check_and_increment_quota(&self, tenant_id: Uuid, amount: u64, monthly_quota: u64, now: DateTime<Utc>) -> Result<bool, AppError> {
        let conn = self.conn.lock().unwrap();
        let tenant_s = tenant_id.to_string();
        let year_month = now.format("%Y-%m").to_string();

        let current: i64 = conn
            .query_row(
                "SELECT count FROM quota_counters WHERE tenant_id = ?1 AND year_month = ?2",
                params![tenant_s, year_month],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?
            .unwrap_or(0);

        if (current as u64) + amount > monthly_quota {
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO quota_counters (tenant_id, year_month, count) VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id, year_month) DO UPDATE SET count = count + ?3",
            params![tenant_s, year_month, amount as i64],
        )
        .map_err(|e| AppError::DownstreamUnavailable(e.to_string()))?;

        Ok(true)
    }
}

/// Computes a `TraceSummary` from a full event list with no prior state, the same extraction
/// and merge rules `upsert_trace_summary` applies incrementally (§4.3). Used by the
/// reconstruction engine (§4.8 step 7) so a freshly rebuilt summary and the inline-materialized
/// one are computed by the identical code path (R2).
pub fn compute_trace_summary(tenant_id: Uuid, project_id: Uuid, trace_id: Uuid, events: &[CanonicalEvent]) -> TraceSummary {
    let refs: Vec<&CanonicalEvent> = events.iter().collect();
    merge_summary(tenant_id, project_id, trace_id, None, ExtractionState::default(), &refs).0
}

#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub tenant_id: String,
    pub project_id: String,
    pub environment: String,
    pub scopes: String,
    pub allowed_origins: Option<String>,
}

fn read_summary_row(conn: &Connection, tenant_id: &str, trace_id: &str) -> rusqlite::Result<Option<TraceSummary>> {
    conn.query_row(
        "SELECT tenant_id, project_id, trace_id, query, response, model, total_tokens, total_cost, \
         start_time, end_time, finish_reason, has_issues, malformed, conversation_id, session_id, user_id, version \
         FROM trace_summaries WHERE tenant_id = ?1 AND trace_id = ?2",
        params![tenant_id, trace_id],
        row_to_summary,
    )
    .optional()
}

fn row_to_summary(row: &rusqlite::Row) -> rusqlite::Result<TraceSummary> {
    let start_time: String = row.get(8)?;
    let end_time: String = row.get(9)?;
    let start = DateTime::parse_from_rfc3339(&start_time).unwrap_or_default().with_timezone(&Utc);
    let end = DateTime::parse_from_rfc3339(&end_time).unwrap_or_default().with_timezone(&Utc);
    Ok(TraceSummary {
        tenant_id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
        project_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
        trace_id: row.get::<_, String>(2)?.parse().unwrap_or_default(),
        query: row.get(3)?,
        response: row.get(4)?,
        model: row.get(5)?,
        total_tokens: row.get::<_, i64>(6)? as u64,
        total_cost: row.get(7)?,
        start_time: start,
        end_time: end,
        total_latency_ms: (end - start).num_milliseconds(),
        finish_reason: row.get(10)?,
        has_issues: row.get::<_, i64>(11)? != 0,
        malformed: row.get::<_, i64>(12)? != 0,
        conversation_id: row.get(13)?,
        session_id: row.get(14)?,
        user_id: row.get(15)?,
        version: row.get(16)?,
    })
}

/// Bookkeeping alongside `TraceSummary` that isn't part of the public model: the timestamps
/// of the events that most recently produced each last-write-wins scalar, so a later upsert
/// (possibly in an earlier batch, replayed out of order) can decide correctly whether a new
/// candidate actually wins.
///
/// `response_ts`/`llm_response_ts` are tracked separately (not a single timestamp) because
/// `response` has two independent sources with a strict precedence, not a single last-write-wins
/// field: an `output` event's `final_output` always outranks an `llm_call`'s `output`, regardless
/// of which arrived later. `llm_response_ts` only ever governs the value while no `output` event
/// has been seen for the trace; once one is, `response_ts` alone decides and the `llm_call`
/// fallback stops applying even to later batches.
#[derive(Debug, Clone, Default)]
struct ExtractionState {
    query_ts: Option<DateTime<Utc>>,
    response_ts: Option<DateTime<Utc>>,
    llm_response_ts: Option<DateTime<Utc>>,
    finish_reason_ts: Option<DateTime<Utc>>,
}

fn read_extraction_state(conn: &Connection, tenant_id: &str, trace_id: &str) -> rusqlite::Result<Option<ExtractionState>> {
    conn.query_row(
        "SELECT query_ts, response_ts, llm_response_ts, finish_reason_ts FROM trace_summaries WHERE tenant_id = ?1 AND trace_id = ?2",
        params![tenant_id, trace_id],
        |row| {
            let parse = |s: Option<String>| s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc));
            Ok(ExtractionState {
                query_ts: parse(row.get(0)?),
                response_ts: parse(row.get(1)?),
                llm_response_ts: parse(row.get(2)?),
                finish_reason_ts: parse(row.get(3)?),
            })
        },
    )
    .optional()
}

/// Merges a batch of newly-seen events into the existing summary (or creates one), applying
/// the extraction + merge rules of §4.3: `query`/`model` from the earliest `llm_call`,
/// `response` from the latest `output` event (falling back to the latest `llm_call`),
/// `finish_reason` from the latest `llm_call`, counters additive, timestamps min/max.
fn merge_summary(
    tenant_id: Uuid,
    project_id: Uuid,
    trace_id: Uuid,
    existing: Option<TraceSummary>,
    mut state: ExtractionState,
    new_events: &[&CanonicalEvent],
) -> (TraceSummary, ExtractionState) {
    let mut summary = existing.unwrap_or_else(|| TraceSummary {
        tenant_id,
        project_id,
        trace_id,
        query: None,
        response: None,
        model: None,
        total_tokens: 0,
        total_cost: 0.0,
        start_time: new_events.iter().map(|e| e.timestamp).min().unwrap_or_else(Utc::now),
        end_time: new_events.iter().map(|e| e.timestamp).max().unwrap_or_else(Utc::now),
        total_latency_ms: 0,
        finish_reason: None,
        has_issues: false,
        malformed: false,
        conversation_id: None,
        session_id: None,
        user_id: None,
        version: 0,
    });

    // Process in timestamp order so "earliest"/"latest" comparisons are well-defined even
    // when a batch itself arrives out of order.
    let mut ordered: Vec<&&CanonicalEvent> = new_events.iter().collect();
    ordered.sort_by_key(|e| e.timestamp);

    for e in ordered {
        if e.timestamp < summary.start_time {
            summary.start_time = e.timestamp;
        }
        if e.timestamp > summary.end_time {
            summary.end_time = e.timestamp;
        }

        // `event_type = error` also carries layer-2/3/4 signals (attributes.signal); only an
        // explicit error payload should flip has_issues, not a signal sharing the same type.
        if e.event_type == EventType::Error && e.attributes.error.is_some() {
            summary.has_issues = true;
        }

        if let Some(tool) = e.attributes.tool_call.as_ref() {
            match tool.result_status {
                Some(ResultStatus::Error) | Some(ResultStatus::Timeout) => summary.has_issues = true,
                _ => {}
            }
        }

        if let Some(llm) = e.attributes.llm_call.as_ref() {
            if llm.input.is_some() && state.query_ts.is_none_or(|ts| e.timestamp < ts) {
                summary.query = llm.input.clone();
                summary.model = llm.model.clone();
                state.query_ts = Some(e.timestamp);
            }
            // Only authoritative while no `output` event has ever been seen for this trace —
            // an `output` event outranks every `llm_call`, no matter which arrived later.
            if state.response_ts.is_none() && state.llm_response_ts.is_none_or(|ts| e.timestamp >= ts) {
                summary.response = llm.output.clone().or(summary.response.clone());
                if llm.output.is_some() {
                    state.llm_response_ts = Some(e.timestamp);
                }
            }
            if state.finish_reason_ts.is_none_or(|ts| e.timestamp >= ts) && llm.finish_reason.is_some() {
                summary.finish_reason = llm.finish_reason.clone();
                state.finish_reason_ts = Some(e.timestamp);
            }
            summary.total_tokens += llm.total_tokens.unwrap_or(0);
            summary.total_cost += llm.cost.unwrap_or(0.0);
        }

        if let Some(output) = e.attributes.output.as_ref() {
            if let Some(final_output) = output.final_output.as_ref() {
                // `output` events always outrank `llm_call` fallbacks, and among themselves the
                // latest one wins.
                if state.response_ts.is_none_or(|ts| e.timestamp >= ts) {
                    summary.response = Some(final_output.clone());
                    state.response_ts = Some(e.timestamp);
                }
            }
        }

        if e.conversation_id.is_some() {
            summary.conversation_id = e.conversation_id.clone();
        }
        if e.session_id.is_some() {
            summary.session_id = e.session_id.clone();
        }
        if e.user_id.is_some() {
            summary.user_id = e.user_id.clone();
        }
    }

    summary.total_latency_ms = (summary.end_time - summary.start_time).num_milliseconds();
    (summary, state)
}

/// Writes `summary`, succeeding only if the row's current version still matches
/// `expected_version` (optimistic CAS). Returns `Ok(true)` on success, `Ok(false)` on conflict.
fn write_summary_row(conn: &Connection, summary: &TraceSummary, state: &ExtractionState, expected_version: i64) -> rusqlite::Result<bool> {
    let tenant_s = summary.tenant_id.to_string();
    let trace_s = summary.trace_id.to_string();
    let next_version = expected_version + 1;
    let query_ts = state.query_ts.map(|t| t.to_rfc3339());
    let response_ts = state.response_ts.map(|t| t.to_rfc3339());
    let llm_response_ts = state.llm_response_ts.map(|t| t.to_rfc3339());
    let finish_reason_ts = state.finish_reason_ts.map(|t| t.to_rfc3339());

    if expected_version == 0 {
        let changed = conn.execute(
            "INSERT INTO trace_summaries (
                tenant_id, project_id, trace_id, query, query_ts, response, response_ts,
                llm_response_ts, model, total_tokens, total_cost, start_time, end_time,
                finish_reason, finish_reason_ts, has_issues, malformed, conversation_id,
                session_id, user_id, version
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)
            ON CONFLICT(tenant_id, trace_id) DO NOTHING",
            params![
                tenant_s,
                summary.project_id.to_string(),
                trace_s,
                summary.query,
                query_ts,
                summary.response,
                response_ts,
                llm_response_ts,
                summary.model,
                summary.total_tokens as i64,
                summary.total_cost,
                summary.start_time.to_rfc3339(),
                summary.end_time.to_rfc3339(),
                summary.finish_reason,
                finish_reason_ts,
                summary.has_issues as i64,
                summary.malformed as i64,
                summary.conversation_id,
                summary.session_id,
                summary.user_id,
                next_version,
            ],
        )?;
        if changed == 1 {
            return Ok(true);
        }
        // Row was created concurrently between our read and write; caller retries.
        return Ok(false);
    }

    let changed = conn.execute(
        "UPDATE trace_summaries SET
            project_id = ?1, query = ?2, query_ts = ?3, response = ?4, response_ts = ?5,
            llm_response_ts = ?6, model = ?7, total_tokens = ?8, total_cost = ?9,
            start_time = ?10, end_time = ?11, finish_reason = ?12, finish_reason_ts = ?13,
            has_issues = ?14, malformed = ?15, conversation_id = ?16, session_id = ?17,
            user_id = ?18, version = ?19
         WHERE tenant_id = ?20 AND trace_id = ?21 AND version = ?22",
        params![
            summary.project_id.to_string(),
            summary.query,
            query_ts,
            summary.response,
            response_ts,
            llm_response_ts,
            summary.model,
            summary.total_tokens as i64,
            summary.total_cost,
            summary.start_time.to_rfc3339(),
            summary.end_time.to_rfc3339(),
            summary.finish_reason,
            finish_reason_ts,
            summary.has_issues as i64,
            summary.malformed as i64,
            summary.conversation_id,
            summary.session_id,
            summary.user_id,
            next_version,
            tenant_s,
            trace_s,
            expected_version,
        ],
    )?;

    Ok(changed == 1)
}

/// Conversation/session/user index upserts (§4.3). Each index's `trace_count` increments at
/// most once per distinct trace via an insert-or-ignore membership row.
fn update_indices(conn: &Connection, tenant_id: Uuid, trace_id: Uuid, new_events: &[&CanonicalEvent]) -> rusqlite::Result<()> {
    let tenant_s = tenant_id.to_string();
    let trace_s = trace_id.to_string();

    for e in new_events {
        if let Some(conversation_id) = e.conversation_id.as_ref() {
            bump_index(
                conn,
                "conversations",
                "conversation_id",
                "conversation_trace_membership",
                &tenant_s,
                conversation_id,
                &trace_s,
                e.timestamp,
            )?;
        }
        if let Some(session_id) = e.session_id.as_ref() {
            bump_index(
                conn,
                "sessions",
                "session_id",
                "session_trace_membership",
                &tenant_s,
                session_id,
                &trace_s,
                e.timestamp,
            )?;
        }
        if let Some(user_id) = e.user_id.as_ref() {
            bump_index(
                conn,
                "users",
                "user_id",
                "user_trace_membership",
                &tenant_s,
                user_id,
                &trace_s,
                e.timestamp,
            )?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn bump_index(
    conn: &Connection,
    table: &str,
    id_col: &str,
    membership_table: &str,
    tenant_id: &str,
    entity_id: &str,
    trace_id: &str,
    ts: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let ts_s = ts.to_rfc3339();
    let inserted_membership = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {membership_table} (tenant_id, {id_col}, trace_id) VALUES (?1, ?2, ?3)"
        ),
        params![tenant_id, entity_id, trace_id],
    )?;

    conn.execute(
        &format!(
            "INSERT INTO {table} (tenant_id, {id_col}, trace_count, message_count, first_seen, last_seen)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)
             ON CONFLICT(tenant_id, {id_col}) DO UPDATE SET
                trace_count = trace_count + ?3,
                message_count = message_count + 1,
                first_seen = MIN(first_seen, ?4),
                last_seen = MAX(last_seen, ?4)"
        ),
        params![tenant_id, entity_id, inserted_membership as i64, ts_s],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::{Attributes, Environment, LlmCallAttrs};
    use chrono::Duration;

    fn event(trace_id: Uuid, span_id: Uuid, ts_offset_ms: i64, input_tokens_summary: (&str, &str, u64, f64)) -> CanonicalEvent {
        let (query, response, tokens, cost) = input_tokens_summary;
        CanonicalEvent {
            tenant_id: Uuid::nil(),
            project_id: Uuid::nil(),
            environment: Environment::Prod,
            trace_id,
            span_id,
            parent_span_id: None,
            timestamp: Utc::now() + Duration::milliseconds(ts_offset_ms),
            event_type: EventType::LlmCall,
            conversation_id: Some("conv1".to_string()),
            session_id: None,
            user_id: None,
            agent_name: None,
            version: None,
            route: None,
            attributes: Attributes {
                llm_call: Some(LlmCallAttrs {
                    input: Some(query.to_string()),
                    output: Some(response.to_string()),
                    total_tokens: Some(tokens),
                    cost: Some(cost),
                    ..Default::default()
                }),
                ..Default::default()
            },
            scrubbing_metadata: None,
        }
    }

    #[test]
    fn upsert_creates_then_merges_without_double_counting_on_replay() {
        let store = OltpStore::open_in_memory().unwrap();
        let trace_id = Uuid::new_v4();
        let span_id = Uuid::new_v4();
        let ev = event(trace_id, span_id, 0, ("hi", "hello", 5, 0.0001));

        let first = store
            .upsert_trace_summary(Uuid::nil(), Uuid::nil(), trace_id, &[ev.clone()])
            .unwrap();
        assert_eq!(first.total_tokens, 5);
        assert_eq!(first.query.as_deref(), Some("hi"));

        // Replay: same span_id, must not double count (R1).
        let second = store
            .upsert_trace_summary(Uuid::nil(), Uuid::nil(), trace_id, &[ev])
            .unwrap();
        assert_eq!(second.total_tokens, 5);
    }

    #[test]
    fn conversation_index_trace_count_increments_once_per_trace() {
        let store = OltpStore::open_in_memory().unwrap();
        let trace_id = Uuid::new_v4();
        let ev1 = event(trace_id, Uuid::new_v4(), 0, ("a", "b", 1, 0.0));
        let ev2 = event(trace_id, Uuid::new_v4(), 1, ("c", "d", 1, 0.0));
        store
            .upsert_trace_summary(Uuid::nil(), Uuid::nil(), trace_id, &[ev1, ev2])
            .unwrap();

        let conn = store.conn.lock().unwrap();
        let trace_count: i64 = conn
            .query_row(
                "SELECT trace_count FROM conversations WHERE conversation_id = 'conv1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(trace_count, 1);
    }

    #[test]
    fn output_event_outranks_later_llm_call_for_response() {
        let store = OltpStore::open_in_memory().unwrap();
        let trace_id = Uuid::new_v4();

        let mut output_event = event(trace_id, Uuid::new_v4(), 0, ("q", "unused", 0, 0.0));
        output_event.attributes.llm_call = None;
        output_event.event_type = EventType::Output;
        output_event.attributes.output = Some(crate::models::event::OutputAttrs {
            final_output: Some("A".to_string()),
            ..Default::default()
        });

        let llm_event = event(trace_id, Uuid::new_v4(), 1, ("q2", "B", 0, 0.0));

        let summary = store
            .upsert_trace_summary(Uuid::nil(), Uuid::nil(), trace_id, &[output_event, llm_event])
            .unwrap();

        assert_eq!(summary.response.as_deref(), Some("A"));
    }

    #[test]
    fn rate_limit_blocks_after_threshold() {
        let store = OltpStore::open_in_memory().unwrap();
        let tenant = Uuid::new_v4();
        let now = Utc::now();
        assert!(store.check_rate_limit(tenant, 2, now).unwrap());
        assert!(store.check_rate_limit(tenant, 2, now).unwrap());
        assert!(!store.check_rate_limit(tenant, 2, now).unwrap());
    }

    #[test]
    fn quota_blocks_over_monthly_limit() {
        let store = OltpStore::open_in_memory().unwrap();
        let tenant = Uuid::new_v4();
        let now = Utc::now();
        assert!(store.check_and_increment_quota(tenant, 80, 100, now).unwrap());
        assert!(!store.check_and_increment_quota(tenant, 30, 100, now).unwrap());
    }
}
