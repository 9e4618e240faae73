use rusqlite::Connection;

use crate::Result;

// Schema version (increment when changing table definitions)
pub const SCHEMA_VERSION: i32 = 7;

// NOTE: Storage Design Rationale
//
// Why TEXT timestamps?
// - Stored as fixed-width UTC RFC 3339 with microseconds (see time::fmt_ts)
// - Lexicographic comparison equals chronological comparison, so temporal
//   CHECK constraints and ORDER BY work without date functions
//
// Why a partial unique index on (command_id, jsonl_entry_hash)?
// - Two ingest paths (hook callbacks and the transcript tail) can observe
//   the same JSONL line concurrently; the index is the storage-level
//   backstop behind the in-memory recent-hash ring
// - NULL hashes stay exempt so hook-origin turns coexist freely
//
// Why an advisory_locks table?
// - SQLite has no server-side advisory lock facility; a keyed table with
//   a primary-key INSERT gives the same cooperative cross-process
//   exclusion, with owner + acquired_at for stale-holder reclaim

pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current_version != 0 && current_version != SCHEMA_VERSION {
        drop_all_tables(conn)?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            path TEXT NOT NULL UNIQUE,
            git_origin TEXT,
            git_branch TEXT,
            inference_paused INTEGER NOT NULL DEFAULT 0,
            inference_paused_reason TEXT,
            inference_paused_at TEXT
        );

        CREATE TABLE IF NOT EXISTS organisations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS roles (
            id INTEGER PRIMARY KEY,
            organisation_id INTEGER REFERENCES organisations(id) ON DELETE CASCADE,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS personas (
            id INTEGER PRIMARY KEY,
            role_id INTEGER NOT NULL REFERENCES roles(id),
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS positions (
            id INTEGER PRIMARY KEY,
            role_id INTEGER REFERENCES roles(id),
            title TEXT NOT NULL,
            reports_to_id INTEGER REFERENCES positions(id) ON DELETE SET NULL,
            escalates_to_id INTEGER REFERENCES positions(id) ON DELETE SET NULL
        );

        CREATE TABLE IF NOT EXISTS agents (
            id INTEGER PRIMARY KEY,
            session_uuid TEXT NOT NULL UNIQUE,
            project_id INTEGER NOT NULL REFERENCES projects(id),
            persona_id INTEGER REFERENCES personas(id) ON DELETE SET NULL,
            position_id INTEGER REFERENCES positions(id) ON DELETE SET NULL,
            previous_agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
            tmux_session_name TEXT,
            tmux_pane_id TEXT,
            iterm_window_id TEXT,
            started_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            ended_at TEXT,
            prompt_injected_at TEXT,
            guardrails_version_hash TEXT,
            priority_score INTEGER,
            priority_reason TEXT,
            priority_updated_at TEXT,
            context_percent_used INTEGER,
            context_remaining_tokens TEXT,
            context_updated_at TEXT,
            CHECK (
                (priority_score IS NULL AND priority_reason IS NULL AND priority_updated_at IS NULL)
                OR
                (priority_score IS NOT NULL AND priority_reason IS NOT NULL AND priority_updated_at IS NOT NULL)
            )
        );

        CREATE TABLE IF NOT EXISTS commands (
            id INTEGER PRIMARY KEY,
            agent_id INTEGER NOT NULL REFERENCES agents(id),
            state TEXT NOT NULL DEFAULT 'idle',
            started_at TEXT NOT NULL,
            completed_at TEXT,
            instruction TEXT,
            completion_summary TEXT,
            full_command TEXT,
            full_output TEXT,
            plan_file_path TEXT,
            plan_content TEXT,
            plan_approved_at TEXT,
            CHECK (completed_at IS NULL OR completed_at >= started_at)
        );

        CREATE TABLE IF NOT EXISTS turns (
            id INTEGER PRIMARY KEY,
            command_id INTEGER NOT NULL REFERENCES commands(id),
            actor TEXT NOT NULL,
            intent TEXT NOT NULL,
            text TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            timestamp_source TEXT NOT NULL DEFAULT 'inferred',
            jsonl_entry_hash TEXT,
            is_internal INTEGER NOT NULL DEFAULT 0,
            tool_input TEXT,
            file_metadata TEXT,
            answered_by_turn_id INTEGER REFERENCES turns(id) ON DELETE SET NULL,
            summary TEXT,
            summary_generated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            project_id INTEGER REFERENCES projects(id) ON DELETE SET NULL,
            agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
            command_id INTEGER REFERENCES commands(id) ON DELETE SET NULL,
            turn_id INTEGER REFERENCES turns(id) ON DELETE SET NULL
        );

        CREATE TABLE IF NOT EXISTS handoffs (
            id INTEGER PRIMARY KEY,
            agent_id INTEGER NOT NULL UNIQUE REFERENCES agents(id),
            reason TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS activity_metrics (
            id INTEGER PRIMARY KEY,
            bucket_start TEXT NOT NULL,
            is_overall INTEGER NOT NULL DEFAULT 0,
            agent_id INTEGER REFERENCES agents(id) ON DELETE CASCADE,
            project_id INTEGER REFERENCES projects(id) ON DELETE CASCADE,
            turn_count INTEGER NOT NULL DEFAULT 0,
            CHECK (
                (is_overall = 1 AND agent_id IS NULL AND project_id IS NULL)
                OR (is_overall = 0 AND agent_id IS NOT NULL AND project_id IS NULL)
                OR (is_overall = 0 AND project_id IS NOT NULL AND agent_id IS NULL)
            )
        );

        CREATE TABLE IF NOT EXISTS agent_snapshots (
            id INTEGER PRIMARY KEY,
            agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
            captured_at TEXT NOT NULL,
            state TEXT NOT NULL,
            context_percent_used INTEGER,
            open_command_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS inference_calls (
            id INTEGER PRIMARY KEY,
            level TEXT NOT NULL,
            input_hash TEXT NOT NULL,
            cached INTEGER NOT NULL DEFAULT 0,
            input_text TEXT,
            output_text TEXT,
            tokens_in INTEGER,
            tokens_out INTEGER,
            cost_usd REAL,
            latency_ms INTEGER,
            created_at TEXT NOT NULL,
            project_id INTEGER REFERENCES projects(id) ON DELETE SET NULL,
            agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
            command_id INTEGER REFERENCES commands(id) ON DELETE SET NULL,
            turn_id INTEGER REFERENCES turns(id) ON DELETE SET NULL,
            CHECK (
                project_id IS NOT NULL OR agent_id IS NOT NULL
                OR command_id IS NOT NULL OR turn_id IS NOT NULL
            )
        );

        CREATE TABLE IF NOT EXISTS api_call_logs (
            id INTEGER PRIMARY KEY,
            method TEXT NOT NULL,
            path TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            authenticated INTEGER NOT NULL DEFAULT 0,
            request_headers TEXT,
            request_body TEXT,
            response_body TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS objectives (
            id INTEGER PRIMARY KEY,
            text TEXT NOT NULL,
            priority_enabled INTEGER NOT NULL DEFAULT 1,
            is_current INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS advisory_locks (
            namespace INTEGER NOT NULL,
            key INTEGER NOT NULL,
            owner TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            PRIMARY KEY (namespace, key)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_turns_command_hash
            ON turns(command_id, jsonl_entry_hash)
            WHERE jsonl_entry_hash IS NOT NULL;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_activity_bucket_scope
            ON activity_metrics(bucket_start, COALESCE(agent_id, -1), COALESCE(project_id, -1), is_overall);

        CREATE INDEX IF NOT EXISTS idx_agents_project ON agents(project_id);
        CREATE INDEX IF NOT EXISTS idx_agents_ended ON agents(ended_at);
        CREATE INDEX IF NOT EXISTS idx_commands_agent ON commands(agent_id);
        CREATE INDEX IF NOT EXISTS idx_commands_agent_state ON commands(agent_id, state);
        CREATE INDEX IF NOT EXISTS idx_turns_command ON turns(command_id);
        CREATE INDEX IF NOT EXISTS idx_events_agent ON events(agent_id);
        CREATE INDEX IF NOT EXISTS idx_events_type_created ON events(event_type, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_inference_input_hash ON inference_calls(input_hash);
        CREATE INDEX IF NOT EXISTS idx_api_call_logs_created ON api_call_logs(created_at DESC);
        "#,
    )?;

    conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;

    Ok(())
}

fn drop_all_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS advisory_locks;
        DROP TABLE IF EXISTS objectives;
        DROP TABLE IF EXISTS api_call_logs;
        DROP TABLE IF EXISTS inference_calls;
        DROP TABLE IF EXISTS agent_snapshots;
        DROP TABLE IF EXISTS activity_metrics;
        DROP TABLE IF EXISTS handoffs;
        DROP TABLE IF EXISTS events;
        DROP TABLE IF EXISTS turns;
        DROP TABLE IF EXISTS commands;
        DROP TABLE IF EXISTS agents;
        DROP TABLE IF EXISTS positions;
        DROP TABLE IF EXISTS personas;
        DROP TABLE IF EXISTS roles;
        DROP TABLE IF EXISTS organisations;
        DROP TABLE IF EXISTS projects;
        "#,
    )?;
    Ok(())
}
