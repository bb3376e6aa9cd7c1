//! Catalog query sets per source dialect.

use crate::types::SourceDialect;

/// How a catalog query receives its schema/table arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStyle {
    /// Named driver parameters (`:schema`, `@table`, ...).
    Bound,
    /// `{database}`, `{schema}` and `{table}` replaced by quoted identifiers.
    Inline,
}

#[derive(Debug, Clone, Copy)]
pub struct CatalogQuery {
    pub sql: &'static str,
    pub style: QueryStyle,
}

const fn bound(sql: &'static str) -> CatalogQuery {
    CatalogQuery {
        sql,
        style: QueryStyle::Bound,
    }
}

const fn inline(sql: &'static str) -> CatalogQuery {
    CatalogQuery {
        sql,
        style: QueryStyle::Inline,
    }
}

/// Positions of the column attributes in a `columns` result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub name: usize,
    pub data_type: usize,
    pub length: Option<usize>,
    pub precision: Option<usize>,
    pub scale: Option<usize>,
    pub nullable: Option<usize>,
}

const STANDARD_COLUMNS: ColumnLayout = ColumnLayout {
    name: 0,
    data_type: 1,
    length: Some(2),
    precision: Some(3),
    scale: Some(4),
    nullable: Some(5),
};

/// Everything the catalog extractor needs to read one dialect.
#[derive(Debug, Clone, Copy)]
pub struct CatalogQueries {
    pub schemas: CatalogQuery,
    pub tables: CatalogQuery,
    pub views: CatalogQuery,
    pub routines: CatalogQuery,
    pub columns: CatalogQuery,
    /// `None` when the dialect has no statement that returns table DDL.
    pub table_ddl: Option<CatalogQuery>,
    /// Exact row count of one table; yields a single `row_count` cell.
    pub table_count: CatalogQuery,
    pub column_layout: ColumnLayout,
    /// Schemas dropped after listing, compared case-insensitively.
    pub system_schemas: &'static [&'static str],
    pub quote: (char, char),
}

impl CatalogQueries {
    pub fn for_dialect(dialect: SourceDialect) -> &'static CatalogQueries {
        match dialect {
            SourceDialect::Oracle => &ORACLE,
            SourceDialect::Snowflake => &SNOWFLAKE,
            SourceDialect::SqlServer => &SQLSERVER,
            SourceDialect::Teradata => &TERADATA,
            SourceDialect::Netezza => &NETEZZA,
            SourceDialect::Synapse => &SYNAPSE,
            SourceDialect::Redshift => &REDSHIFT,
            SourceDialect::MySql => &MYSQL,
        }
    }

    pub fn quote_ident(&self, ident: &str) -> String {
        let (open, close) = self.quote;
        let escaped = ident.replace(close, &format!("{close}{close}"));
        format!("{open}{escaped}{close}")
    }

    /// Final SQL text and bind list for `query`.
    pub fn prepare(
        &self,
        query: &CatalogQuery,
        database: &str,
        schema: Option<&str>,
        table: Option<&str>,
    ) -> (String, Vec<(&'static str, String)>) {
        match query.style {
            QueryStyle::Bound => {
                let mut binds = Vec::new();
                if let Some(schema) = schema {
                    binds.push(("schema", schema.to_string()));
                }
                if let Some(table) = table {
                    binds.push(("table", table.to_string()));
                }
                (query.sql.to_string(), binds)
            }
            QueryStyle::Inline => {
                let mut sql = query.sql.replace("{database}", &self.quote_ident(database));
                if let Some(schema) = schema {
                    sql = sql.replace("{schema}", &self.quote_ident(schema));
                }
                if let Some(table) = table {
                    sql = sql.replace("{table}", &self.quote_ident(table));
                }
                (sql, Vec::new())
            }
        }
    }

    pub fn is_system_schema(&self, schema: &str) -> bool {
        self.system_schemas
            .iter()
            .any(|s| s.eq_ignore_ascii_case(schema))
    }
}

const ORACLE: CatalogQueries = CatalogQueries {
    schemas: bound(
        "SELECT DISTINCT OWNER AS schema_name FROM ALL_TABLES \
         WHERE OWNER NOT IN ('SYS','SYSTEM','OUTLN','DIP') ORDER BY OWNER",
    ),
    tables: bound(
        "SELECT OWNER AS schema_name, TABLE_NAME AS table_name FROM ALL_TABLES WHERE OWNER = :schema",
    ),
    views: bound(
        "SELECT OWNER AS schema_name, VIEW_NAME AS view_name, TEXT AS view_definition \
         FROM ALL_VIEWS WHERE OWNER = :schema",
    ),
    routines: bound(
        "SELECT OWNER AS schema_name, OBJECT_NAME AS proc_name, OBJECT_TYPE AS proc_type \
         FROM ALL_OBJECTS WHERE OBJECT_TYPE IN ('PROCEDURE','FUNCTION','PACKAGE') AND OWNER = :schema",
    ),
    columns: bound(
        "SELECT COLUMN_NAME, DATA_TYPE, DATA_LENGTH, DATA_PRECISION, DATA_SCALE, NULLABLE \
         FROM ALL_TAB_COLUMNS WHERE OWNER = :schema AND TABLE_NAME = :table ORDER BY COLUMN_ID",
    ),
    table_ddl: Some(bound(
        "SELECT DBMS_METADATA.GET_DDL('TABLE', :table, :schema) AS ddl FROM DUAL",
    )),
    table_count: inline("SELECT COUNT(*) AS row_count FROM {schema}.{table}"),
    column_layout: STANDARD_COLUMNS,
    system_schemas: &[],
    quote: ('"', '"'),
};

const SNOWFLAKE: CatalogQueries = CatalogQueries {
    schemas: inline("SHOW SCHEMAS IN DATABASE {database}"),
    tables: inline("SHOW TABLES IN SCHEMA {database}.{schema}"),
    views: inline("SHOW VIEWS IN SCHEMA {database}.{schema}"),
    routines: inline("SHOW PROCEDURES IN SCHEMA {database}.{schema}"),
    columns: inline("DESCRIBE TABLE {database}.{schema}.{table}"),
    table_ddl: Some(inline(
        "SELECT GET_DDL('TABLE', '{database}.{schema}.{table}') AS ddl",
    )),
    table_count: inline("SELECT COUNT(*) AS row_count FROM {database}.{schema}.{table}"),
    column_layout: ColumnLayout {
        name: 0,
        data_type: 1,
        length: None,
        precision: None,
        scale: None,
        nullable: Some(3),
    },
    system_schemas: &["INFORMATION_SCHEMA"],
    quote: ('"', '"'),
};

const SQLSERVER: CatalogQueries = CatalogQueries {
    schemas: bound(
        "SELECT SCHEMA_NAME AS schema_name FROM INFORMATION_SCHEMA.SCHEMATA \
         WHERE SCHEMA_NAME NOT IN ('sys','INFORMATION_SCHEMA','guest') ORDER BY SCHEMA_NAME",
    ),
    tables: bound(
        "SELECT TABLE_SCHEMA AS schema_name, TABLE_NAME AS table_name FROM INFORMATION_SCHEMA.TABLES \
         WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = @schema",
    ),
    views: bound(
        "SELECT TABLE_SCHEMA AS schema_name, TABLE_NAME AS view_name, VIEW_DEFINITION AS view_definition \
         FROM INFORMATION_SCHEMA.VIEWS WHERE TABLE_SCHEMA = @schema",
    ),
    routines: bound(
        "SELECT ROUTINE_SCHEMA AS schema_name, ROUTINE_NAME AS proc_name, ROUTINE_TYPE AS proc_type, \
         ROUTINE_DEFINITION AS proc_definition FROM INFORMATION_SCHEMA.ROUTINES WHERE ROUTINE_SCHEMA = @schema",
    ),
    columns: bound(
        "SELECT COLUMN_NAME, DATA_TYPE, CHARACTER_MAXIMUM_LENGTH, NUMERIC_PRECISION, NUMERIC_SCALE, IS_NULLABLE \
         FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_SCHEMA = @schema AND TABLE_NAME = @table \
         ORDER BY ORDINAL_POSITION",
    ),
    table_ddl: None,
    table_count: inline("SELECT COUNT(*) AS row_count FROM {schema}.{table}"),
    column_layout: STANDARD_COLUMNS,
    system_schemas: &[],
    quote: ('[', ']'),
};

const TERADATA: CatalogQueries = CatalogQueries {
    schemas: bound(
        "SELECT DatabaseName AS schema_name FROM DBC.DatabasesV WHERE DBKind IN ('D','U') ORDER BY DatabaseName",
    ),
    tables: bound(
        "SELECT DatabaseName AS schema_name, TableName AS table_name FROM DBC.TablesV \
         WHERE DatabaseName = :schema AND TableKind IN ('T','O')",
    ),
    views: bound(
        "SELECT DatabaseName AS schema_name, TableName AS view_name, RequestText AS view_definition \
         FROM DBC.TablesV WHERE DatabaseName = :schema AND TableKind = 'V'",
    ),
    routines: bound(
        "SELECT DatabaseName AS schema_name, ProcedureName AS proc_name, 'PROCEDURE' AS proc_type \
         FROM DBC.ProceduresV WHERE DatabaseName = :schema",
    ),
    columns: bound(
        "SELECT ColumnName, ColumnType, ColumnLength, DecimalTotalDigits, DecimalFractionalDigits, Nullable \
         FROM DBC.ColumnsV WHERE DatabaseName = :schema AND TableName = :table ORDER BY ColumnId",
    ),
    table_ddl: Some(inline("SHOW TABLE {schema}.{table}")),
    table_count: inline("SELECT COUNT(*) AS row_count FROM {schema}.{table}"),
    column_layout: STANDARD_COLUMNS,
    system_schemas: &["DBC", "SYSLIB", "SYSUDTLIB", "TDStats", "SystemFe"],
    quote: ('"', '"'),
};

const NETEZZA: CatalogQueries = CatalogQueries {
    schemas: bound("SELECT SCHEMA AS schema_name FROM _V_SCHEMA WHERE SCHEMA NOT LIKE 'SYSTEM%' ORDER BY SCHEMA"),
    tables: bound(
        "SELECT SCHEMA AS schema_name, TABLENAME AS table_name FROM _V_TABLE WHERE SCHEMA = :schema",
    ),
    views: bound(
        "SELECT SCHEMA AS schema_name, VIEWNAME AS view_name, DEFINITION AS view_definition \
         FROM _V_VIEW WHERE SCHEMA = :schema",
    ),
    routines: bound(
        "SELECT SCHEMA AS schema_name, PROCEDURENAME AS proc_name, 'PROCEDURE' AS proc_type \
         FROM _V_PROCEDURE WHERE SCHEMA = :schema",
    ),
    columns: bound(
        "SELECT ATTNAME AS column_name, FORMAT_TYPE AS data_type FROM _V_RELATION_COLUMN \
         WHERE NAME = :table AND SCHEMA = :schema ORDER BY ATTNUM",
    ),
    table_ddl: None,
    table_count: inline("SELECT COUNT(*) AS row_count FROM {schema}.{table}"),
    column_layout: ColumnLayout {
        name: 0,
        data_type: 1,
        length: None,
        precision: None,
        scale: None,
        nullable: None,
    },
    system_schemas: &["DEFINITION_SCHEMA", "INFORMATION_SCHEMA"],
    quote: ('"', '"'),
};

const SYNAPSE: CatalogQueries = CatalogQueries {
    schemas: bound(
        "SELECT SCHEMA_NAME AS schema_name FROM INFORMATION_SCHEMA.SCHEMATA \
         WHERE SCHEMA_NAME NOT IN ('sys','INFORMATION_SCHEMA') ORDER BY SCHEMA_NAME",
    ),
    routines: bound(
        "SELECT ROUTINE_SCHEMA AS schema_name, ROUTINE_NAME AS proc_name, ROUTINE_TYPE AS proc_type \
         FROM INFORMATION_SCHEMA.ROUTINES WHERE ROUTINE_SCHEMA = @schema",
    ),
    ..SQLSERVER
};

const REDSHIFT: CatalogQueries = CatalogQueries {
    schemas: bound(
        "SELECT nspname AS schema_name FROM pg_namespace \
         WHERE nspname NOT LIKE 'pg_%' AND nspname != 'information_schema' ORDER BY nspname",
    ),
    tables: bound(
        "SELECT schemaname AS schema_name, tablename AS table_name FROM pg_tables WHERE schemaname = :schema",
    ),
    views: bound(
        "SELECT schemaname AS schema_name, viewname AS view_name, definition AS view_definition \
         FROM pg_views WHERE schemaname = :schema",
    ),
    routines: bound(
        "SELECT routine_schema AS schema_name, routine_name AS proc_name, routine_type AS proc_type \
         FROM information_schema.routines WHERE routine_schema = :schema",
    ),
    columns: bound(
        "SELECT column_name, data_type, character_maximum_length, numeric_precision, numeric_scale, is_nullable \
         FROM information_schema.columns WHERE table_schema = :schema AND table_name = :table \
         ORDER BY ordinal_position",
    ),
    table_ddl: Some(inline("SHOW TABLE {schema}.{table}")),
    table_count: inline("SELECT COUNT(*) AS row_count FROM {schema}.{table}"),
    column_layout: STANDARD_COLUMNS,
    system_schemas: &[],
    quote: ('"', '"'),
};

const MYSQL: CatalogQueries = CatalogQueries {
    schemas: bound(
        "SELECT SCHEMA_NAME AS schema_name FROM INFORMATION_SCHEMA.SCHEMATA \
         WHERE SCHEMA_NAME NOT IN ('mysql','information_schema','performance_schema','sys') ORDER BY SCHEMA_NAME",
    ),
    tables: bound(
        "SELECT TABLE_SCHEMA AS schema_name, TABLE_NAME AS table_name FROM INFORMATION_SCHEMA.TABLES \
         WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = :schema",
    ),
    views: bound(
        "SELECT TABLE_SCHEMA AS schema_name, TABLE_NAME AS view_name, VIEW_DEFINITION AS view_definition \
         FROM INFORMATION_SCHEMA.VIEWS WHERE TABLE_SCHEMA = :schema",
    ),
    routines: bound(
        "SELECT ROUTINE_SCHEMA AS schema_name, ROUTINE_NAME AS proc_name, ROUTINE_TYPE AS proc_type, \
         ROUTINE_DEFINITION AS proc_definition FROM INFORMATION_SCHEMA.ROUTINES WHERE ROUTINE_SCHEMA = :schema",
    ),
    columns: bound(
        "SELECT COLUMN_NAME, DATA_TYPE, CHARACTER_MAXIMUM_LENGTH, NUMERIC_PRECISION, NUMERIC_SCALE, IS_NULLABLE \
         FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_SCHEMA = :schema AND TABLE_NAME = :table \
         ORDER BY ORDINAL_POSITION",
    ),
    table_ddl: Some(inline("SHOW CREATE TABLE {schema}.{table}")),
    table_count: inline("SELECT COUNT(*) AS row_count FROM {schema}.{table}"),
    column_layout: STANDARD_COLUMNS,
    system_schemas: &[],
    quote: ('`', '`'),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_dialect_has_queries() {
        for dialect in SourceDialect::ALL {
            let q = CatalogQueries::for_dialect(dialect);
            assert!(!q.schemas.sql.is_empty());
            assert!(!q.columns.sql.is_empty());
        }
    }

    #[test]
    fn test_table_ddl_missing_where_expected() {
        assert!(CatalogQueries::for_dialect(SourceDialect::SqlServer).table_ddl.is_none());
        assert!(CatalogQueries::for_dialect(SourceDialect::Synapse).table_ddl.is_none());
        assert!(CatalogQueries::for_dialect(SourceDialect::Netezza).table_ddl.is_none());
        assert!(CatalogQueries::for_dialect(SourceDialect::MySql).table_ddl.is_some());
    }

    #[test]
    fn test_inline_quoting() {
        let q = CatalogQueries::for_dialect(SourceDialect::Snowflake);
        let (sql, binds) = q.prepare(&q.columns, "ANALYTICS", Some("PUBLIC"), Some("ORD\"ERS"));
        assert_eq!(sql, r#"DESCRIBE TABLE "ANALYTICS"."PUBLIC"."ORD""ERS""#);
        assert!(binds.is_empty());

        let q = CatalogQueries::for_dialect(SourceDialect::MySql);
        let ddl = q.table_ddl.unwrap();
        let (sql, _) = q.prepare(&ddl, "shop", Some("shop"), Some("orders"));
        assert_eq!(sql, "SHOW CREATE TABLE `shop`.`orders`");
    }

    #[test]
    fn test_row_count_query_quotes_per_dialect() {
        let q = CatalogQueries::for_dialect(SourceDialect::Synapse);
        let (sql, binds) = q.prepare(&q.table_count, "dw", Some("dbo"), Some("fact]sales"));
        assert_eq!(sql, "SELECT COUNT(*) AS row_count FROM [dbo].[fact]]sales]");
        assert!(binds.is_empty());

        let q = CatalogQueries::for_dialect(SourceDialect::Snowflake);
        let (sql, _) = q.prepare(&q.table_count, "ANALYTICS", Some("PUBLIC"), Some("ORDERS"));
        assert_eq!(
            sql,
            r#"SELECT COUNT(*) AS row_count FROM "ANALYTICS"."PUBLIC"."ORDERS""#
        );

        for dialect in SourceDialect::ALL {
            let q = CatalogQueries::for_dialect(dialect);
            assert!(q.table_count.sql.contains("{table}"), "{dialect}");
        }
    }

    #[test]
    fn test_bound_parameters() {
        let q = CatalogQueries::for_dialect(SourceDialect::Oracle);
        let (sql, binds) = q.prepare(&q.columns, "ORCL", Some("HR"), Some("EMP"));
        assert!(sql.contains(":schema"));
        assert_eq!(
            binds,
            vec![("schema", "HR".to_string()), ("table", "EMP".to_string())]
        );
    }
}
