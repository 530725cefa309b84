//! Schema bootstrap
//!
//! Idempotent DDL executed at startup. Every statement is `IF NOT EXISTS`
//! so repeated runs (and concurrent sessions) are safe.

/// Statements executed in order by [`super::CrawlStore::ensure_schema`].
pub(super) const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS crawl_sessions (
        id              UUID PRIMARY KEY,
        name            TEXT NOT NULL,
        seed_urls       TEXT[] NOT NULL DEFAULT '{}',
        configuration   JSONB,
        state           TEXT NOT NULL DEFAULT 'running'
                        CHECK (state IN ('running','completed','failed','cancelled')),
        started_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        completed_at    TIMESTAMPTZ NULL,
        pages_crawled   BIGINT NOT NULL DEFAULT 0,
        pages_failed    BIGINT NOT NULL DEFAULT 0,
        pages_skipped   BIGINT NOT NULL DEFAULT 0,
        total_words     BIGINT NOT NULL DEFAULT 0,
        total_bytes     BIGINT NOT NULL DEFAULT 0,
        error_count     BIGINT NOT NULL DEFAULT 0,
        last_error      TEXT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pages (
        session_id      UUID NOT NULL,
        url             TEXT NOT NULL,
        final_url       TEXT NOT NULL,
        depth           INT NOT NULL CHECK (depth >= 0),
        status_code     INT NULL,
        content_type    TEXT NULL,
        title           TEXT NULL,
        text_length     BIGINT NOT NULL DEFAULT 0,
        total_words     BIGINT NOT NULL DEFAULT 0,
        unique_words    BIGINT NOT NULL DEFAULT 0,
        body_bytes      BIGINT NOT NULL DEFAULT 0,
        fetch_ms        DOUBLE PRECISION NULL,
        extract_ms      DOUBLE PRECISION NULL,
        analyze_ms      DOUBLE PRECISION NULL,
        persist_ms      DOUBLE PRECISION NULL,
        total_ms        DOUBLE PRECISION NULL,
        crawled_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (session_id, url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS word_frequencies (
        session_id  UUID NOT NULL,
        url         TEXT NOT NULL,
        word        TEXT NOT NULL,
        frequency   BIGINT NOT NULL CHECK (frequency >= 1),
        PRIMARY KEY (session_id, url, word)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS links (
        session_id  UUID NOT NULL,
        source_url  TEXT NOT NULL,
        dest_url    TEXT NOT NULL,
        kind        TEXT NOT NULL CHECK (kind IN ('internal','external')),
        PRIMARY KEY (session_id, source_url, dest_url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS session_metrics_timeseries (
        id              BIGSERIAL PRIMARY KEY,
        session_id      UUID NOT NULL,
        recorded_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        pages_crawled   BIGINT NOT NULL,
        bytes_processed BIGINT NOT NULL,
        errors          BIGINT NOT NULL,
        pages_per_sec   DOUBLE PRECISION NOT NULL,
        bytes_per_sec   DOUBLE PRECISION NOT NULL,
        in_flight       BIGINT NOT NULL,
        queue_pending   BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS error_events (
        id          BIGSERIAL PRIMARY KEY,
        session_id  UUID NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        url         TEXT NOT NULL,
        depth       INT NOT NULL DEFAULT 0,
        error_kind  TEXT NOT NULL,
        message     TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS url_queue (
        session_id    UUID NOT NULL,
        url           TEXT NOT NULL,
        parent_url    TEXT NULL,
        depth         INT NOT NULL CHECK (depth >= 0),
        priority      INT NOT NULL DEFAULT 0,
        status        TEXT NOT NULL DEFAULT 'PENDING'
                      CHECK (status IN ('PENDING','IN_FLIGHT','DONE','FAILED','SKIPPED')),
        attempts      INT NOT NULL DEFAULT 0,
        last_error    TEXT NULL,
        discovered_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        leased_until  TIMESTAMPTZ NULL,
        not_before    TIMESTAMPTZ NULL,
        PRIMARY KEY (session_id, url)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_url_queue_lease \
     ON url_queue (session_id, status, priority DESC, depth, discovered_at)",
    "CREATE INDEX IF NOT EXISTS idx_url_queue_expiry \
     ON url_queue (session_id, status, leased_until)",
    "CREATE INDEX IF NOT EXISTS idx_pages_session ON pages (session_id, crawled_at)",
    "CREATE INDEX IF NOT EXISTS idx_word_frequencies_word \
     ON word_frequencies (session_id, word)",
    "CREATE INDEX IF NOT EXISTS idx_metrics_session \
     ON session_metrics_timeseries (session_id, recorded_at)",
    "CREATE INDEX IF NOT EXISTS idx_error_events_session \
     ON error_events (session_id, occurred_at)",
];
