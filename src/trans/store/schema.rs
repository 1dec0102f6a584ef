//! PostgreSQL schema for the transaction store
//!
//! Provisioning is left to operators; tests apply it with `init_schema`.

use sqlx::PgPool;

use crate::trans::error::TransError;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trans_global (
    id                  BIGSERIAL PRIMARY KEY,
    gid                 VARCHAR(128) NOT NULL UNIQUE,
    trans_type          VARCHAR(16)  NOT NULL,
    status              VARCHAR(16)  NOT NULL,
    owner               VARCHAR(128) NOT NULL DEFAULT '',
    next_cron_time      TIMESTAMPTZ  NOT NULL,
    next_cron_interval  BIGINT       NOT NULL,
    timeout_to_fail     BIGINT       NOT NULL,
    custom_data         JSONB        NOT NULL DEFAULT 'null',
    create_time         TIMESTAMPTZ  NOT NULL,
    update_time         TIMESTAMPTZ  NOT NULL,
    finish_time         TIMESTAMPTZ,
    rollback_time       TIMESTAMPTZ,
    rollback_reason     TEXT
);

CREATE INDEX IF NOT EXISTS trans_global_owner_idx ON trans_global (owner);
CREATE INDEX IF NOT EXISTS trans_global_cron_idx ON trans_global (status, next_cron_time);

CREATE TABLE IF NOT EXISTS trans_branch_op (
    id             BIGSERIAL PRIMARY KEY,
    gid            VARCHAR(128) NOT NULL,
    branch_id      VARCHAR(128) NOT NULL,
    op             VARCHAR(16)  NOT NULL,
    url            VARCHAR(1024) NOT NULL DEFAULT '',
    bin_data       BYTEA        NOT NULL DEFAULT '',
    status         VARCHAR(16)  NOT NULL,
    create_time    TIMESTAMPTZ  NOT NULL,
    update_time    TIMESTAMPTZ  NOT NULL,
    finish_time    TIMESTAMPTZ,
    rollback_time  TIMESTAMPTZ,
    CONSTRAINT trans_branch_op_key UNIQUE (gid, branch_id, op)
);
"#;

/// Apply [`SCHEMA_SQL`] (idempotent)
pub async fn init_schema(pool: &PgPool) -> Result<(), TransError> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}
