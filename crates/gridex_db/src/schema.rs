//! Table definitions. Applied by `Store::init`; every statement is
//! idempotent so init can run on every startup.

pub(crate) const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS gx_users (
        id            TEXT PRIMARY KEY,
        username      TEXT NOT NULL UNIQUE,
        password_salt TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        role          TEXT NOT NULL,
        balance       INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
        created_at    TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gx_workers (
        id             TEXT PRIMARY KEY,
        name           TEXT NOT NULL,
        owner_id       TEXT REFERENCES gx_users(id),
        specs_json     TEXT NOT NULL,
        status         TEXT NOT NULL DEFAULT 'offline',
        last_heartbeat TEXT,
        jobs_completed INTEGER NOT NULL DEFAULT 0,
        credits_earned INTEGER NOT NULL DEFAULT 0,
        created_at     TEXT NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_gx_workers_identity
        ON gx_workers(owner_id, name)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gx_jobs (
        id                 TEXT PRIMARY KEY,
        title              TEXT NOT NULL,
        submitter_id       TEXT NOT NULL REFERENCES gx_users(id),
        code               TEXT NOT NULL,
        requirements       TEXT NOT NULL DEFAULT '',
        demands_json       TEXT NOT NULL,
        timeout_seconds    INTEGER NOT NULL,
        credit_cost        INTEGER NOT NULL,
        credit_reward      INTEGER NOT NULL,
        priority           INTEGER NOT NULL DEFAULT 5,
        status             TEXT NOT NULL DEFAULT 'pending',
        assigned_worker_id TEXT REFERENCES gx_workers(id),
        stdout             TEXT,
        stderr             TEXT,
        result_files       TEXT,
        error_log          TEXT,
        sandboxed          INTEGER,
        submitted_at       TEXT NOT NULL,
        started_at         TEXT,
        finished_at        TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gx_job_queue (
        job_id    TEXT PRIMARY KEY REFERENCES gx_jobs(id),
        priority  INTEGER NOT NULL,
        queued_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_gx_job_queue_order
        ON gx_job_queue(priority DESC, queued_at ASC, job_id ASC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gx_credit_ledger (
        id      INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL REFERENCES gx_users(id),
        delta   INTEGER NOT NULL,
        kind    TEXT NOT NULL,
        job_id  TEXT REFERENCES gx_jobs(id),
        at      TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_gx_credit_ledger_user
        ON gx_credit_ledger(user_id)
    "#,
];
