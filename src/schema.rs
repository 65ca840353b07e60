use std::collections::HashSet;

use crate::Result;
use indoc::formatdoc;
use sqlx::PgPool;

pub const INSTANCE_LEASES: &str = "instance_leases";
pub const CLIENT_REGISTRATIONS: &str = "client_registrations";
pub const CLIENT_REGISTRATIONS_INSTANCE_IDX: &str = "client_registrations_instance_idx";

#[derive(Clone, Debug)]
pub struct SchemaConfig {
    pub base_schema: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            base_schema: "public".to_string(),
        }
    }
}

impl SchemaConfig {
    pub fn new(base_schema: impl Into<String>) -> Self {
        Self {
            base_schema: base_schema.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: PgPool,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();
        let schema = config.base_schema.trim();

        if schema.is_empty() {
            plan.push_warning("schema name is empty; skipping".to_string());
            return Ok(plan);
        }

        let schema_exists = self.existing_schemas().await?.contains(schema);
        if !schema_exists {
            plan.push_action(
                format!("create schema {}", quote_ident(schema)),
                formatdoc!(
                    "create schema if not exists {schema}",
                    schema = quote_ident(schema),
                ),
            );
        }

        let existing_tables = if schema_exists {
            self.existing_tables(schema).await?
        } else {
            HashSet::new()
        };
        ensure_table(
            &mut plan,
            schema,
            &existing_tables,
            INSTANCE_LEASES,
            build_instance_leases_table_sql,
        );
        ensure_table(
            &mut plan,
            schema,
            &existing_tables,
            CLIENT_REGISTRATIONS,
            build_client_registrations_table_sql,
        );

        let existing_indexes = if schema_exists {
            self.existing_indexes(schema).await?
        } else {
            HashSet::new()
        };
        ensure_index(
            &mut plan,
            schema,
            &existing_indexes,
            CLIENT_REGISTRATIONS_INSTANCE_IDX,
            build_client_registrations_instance_index_sql,
        );

        Ok(plan)
    }

    pub async fn apply(&self, plan: &SchemaPlan) -> Result<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for action in &plan.actions {
            sqlx::query(action.sql()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn sync(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let plan = self.plan(config).await?;
        if !plan.is_empty() {
            self.apply(&plan).await?;
        }
        Ok(plan)
    }

    async fn existing_schemas(&self) -> Result<HashSet<String>> {
        let rows =
            sqlx::query_scalar::<_, String>("select schema_name from information_schema.schemata")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_tables(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select table_name from information_schema.tables where table_schema = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_indexes(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select indexname from pg_indexes where schemaname = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
    warnings: Vec<String>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn push_action(&mut self, description: String, sql: String) {
        self.actions.push(SchemaAction { description, sql });
    }

    fn push_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

#[derive(Clone, Debug)]
pub struct SchemaAction {
    description: String,
    sql: String,
}

impl SchemaAction {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

fn ensure_table<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_tables: &HashSet<String>,
    table: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_tables.contains(table) {
        plan.push_action(
            format!("create table {}", qualified_name(schema, table)),
            build_sql(schema),
        );
    }
}

fn ensure_index<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_indexes: &HashSet<String>,
    index: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_indexes.contains(index) {
        plan.push_action(
            format!("create index {}", qualified_name(schema, index)),
            build_sql(schema),
        );
    }
}

fn build_instance_leases_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            instance_id text primary key,
            valid_until timestamptz not null
        )
        ",
        table = qualified_name(schema, INSTANCE_LEASES),
    )
}

fn build_client_registrations_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            client_id text primary key,
            instance_id text not null,
            subscriptions text[] not null,
            auth_collection_ref text not null default '',
            auth_record_ref text not null default '',
            writer_instance_id text not null default ''
        )
        ",
        table = qualified_name(schema, CLIENT_REGISTRATIONS),
    )
}

fn build_client_registrations_instance_index_sql(schema: &str) -> String {
    formatdoc!(
        "
        create index if not exists {index} on {table} (instance_id)
        ",
        index = quote_ident(CLIENT_REGISTRATIONS_INSTANCE_IDX),
        table = qualified_name(schema, CLIENT_REGISTRATIONS),
    )
}

pub fn qualified_name(schema: &str, ident: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(ident))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified() {
        assert_eq!(
            qualified_name("public", "instance_leases"),
            "\"public\".\"instance_leases\""
        );
    }

    #[test]
    fn quote_handles_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn registrations_table_matches_wire_fields() {
        let sql = build_client_registrations_table_sql("rt");
        assert!(sql.contains("\"rt\".\"client_registrations\""));
        assert!(sql.contains("subscriptions text[] not null"));
        assert!(sql.contains("writer_instance_id text not null default ''"));
    }

    #[test]
    fn index_is_on_instance_id() {
        let sql = build_client_registrations_instance_index_sql("public");
        assert!(sql.contains("on \"public\".\"client_registrations\" (instance_id)"));
    }
}
