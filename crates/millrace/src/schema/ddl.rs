//! DDL statement parsing
//!
//! Turns the SQL carried by binlog `Query` events into [`SchemaDelta`]s.
//! This is a scanner, not a full SQL grammar: it understands exactly the
//! statements that affect the tracked catalog (databases, tables,
//! columns, encodings) and deliberately ignores everything else:
//! indexes, constraints, views, routines and plain DML all yield zero
//! deltas. Statements that look like DDL but cannot be understood yield
//! a [`DdlParseError`] so the pipeline can apply its skip-or-terminate
//! policy.
//!
//! Multi-statement input is split on semicolons with string-literal and
//! comment awareness.

use crate::error::DdlParseError;
use crate::schema::columndef::{ColumnDef, ColumnType};
use crate::schema::delta::{ColumnPosition, SchemaDelta};
use crate::schema::model::Table;

type ParseResult<T> = std::result::Result<T, DdlParseError>;

/// Split possibly multi-statement SQL on `;`, honoring single/double/
/// backquoted strings and both comment styles. Empty statements are
/// dropped.
pub fn split_statements(input: &str) -> Vec<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        // doubled quote is an escape
                        if i + 1 < bytes.len() && bytes[i + 1] == quote {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b';' => {
                let stmt = input[start..i].trim();
                if !stmt.is_empty() {
                    out.push(stmt.to_string());
                }
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    let tail = input[start..].trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

/// Parse a bare column type as INFORMATION_SCHEMA renders it in
/// `COLUMN_TYPE`, e.g. `int(11) unsigned` or `enum('a','b')`.
pub fn parse_column_type(s: &str) -> ParseResult<ColumnType> {
    let mut parser = Parser::new(s, None);
    let mut kind = parser.column_type()?;
    if parser.keyword("UNSIGNED") {
        match &mut kind {
            ColumnType::Int { signed, .. } | ColumnType::BigInt { signed } => *signed = false,
            _ => {}
        }
    }
    Ok(kind)
}

/// Parse SQL into schema deltas. `default_db` resolves unqualified names
/// (it is the session database the statement executed under).
pub fn parse(sql: &str, default_db: Option<&str>) -> ParseResult<Vec<SchemaDelta>> {
    let mut deltas = Vec::new();
    for statement in split_statements(sql) {
        let mut parser = Parser::new(&statement, default_db);
        deltas.extend(parser.statement()?);
    }
    Ok(deltas)
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    default_db: Option<&'a str>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, default_db: Option<&'a str>) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            default_db,
        }
    }

    // ---- statement dispatch ----

    fn statement(&mut self) -> ParseResult<Vec<SchemaDelta>> {
        self.skip_space();
        if self.keyword("CREATE") {
            return self.create();
        }
        if self.keyword("DROP") {
            return self.drop();
        }
        if self.keyword("ALTER") {
            return self.alter();
        }
        if self.keyword("RENAME") {
            if self.keyword("TABLE") || self.keyword("TABLES") {
                return self.rename_tables();
            }
            return Ok(Vec::new());
        }
        // TRUNCATE empties rows, never the definition.
        Ok(Vec::new())
    }

    fn create(&mut self) -> ParseResult<Vec<SchemaDelta>> {
        if self.keyword("DATABASE") || self.keyword("SCHEMA") {
            let if_not_exists = self.if_not_exists();
            let name = self.ident()?;
            let charset = self.database_options()?;
            return Ok(vec![SchemaDelta::CreateDatabase {
                name,
                charset,
                if_not_exists,
            }]);
        }
        // CREATE [TEMPORARY] TABLE
        let temporary = self.keyword("TEMPORARY");
        if self.keyword("TABLE") {
            if temporary {
                // temporary tables never hit the binlog row stream
                return Ok(Vec::new());
            }
            return self.create_table();
        }
        // indexes, views, triggers, users, routines: no catalog effect
        Ok(Vec::new())
    }

    fn create_table(&mut self) -> ParseResult<Vec<SchemaDelta>> {
        let if_not_exists = self.if_not_exists();
        let (db, name) = self.qualified()?;
        let database = self.resolve_db(db)?;

        self.skip_space();
        if self.keyword("LIKE") {
            return Err(self.error("CREATE TABLE ... LIKE requires the source definition"));
        }
        if !self.punct(b'(') {
            // CREATE TABLE ... SELECT and friends
            return Err(self.error("expected column list"));
        }

        let mut table = Table::new(database.clone(), name);
        let mut columns = Vec::new();
        let mut pk: Vec<String> = Vec::new();
        loop {
            self.skip_space();
            if self.constraint_entry(&mut pk)? {
                // consumed an index/constraint entry
            } else {
                let (def, flags) = self.column_def()?;
                if flags.primary_key {
                    pk.push(def.name.clone());
                }
                columns.push(def);
            }
            self.skip_space();
            if self.punct(b',') {
                continue;
            }
            self.expect(b')')?;
            break;
        }

        // table options: only the charset matters to the tracker
        let charset = self.table_options()?;
        if let Some(cs) = &charset {
            table.charset = cs.clone();
            for col in columns.iter_mut() {
                if col.explicit_charset() {
                    continue;
                }
                if let ColumnType::String {
                    charset: col_cs, ..
                } = &mut col.def.kind
                {
                    *col_cs = cs.clone();
                }
            }
        }
        table.columns = columns.into_iter().map(|c| c.into_def()).collect();
        table.pk_columns = pk;

        Ok(vec![SchemaDelta::CreateTable {
            database,
            table,
            if_not_exists,
        }])
    }

    fn drop(&mut self) -> ParseResult<Vec<SchemaDelta>> {
        if self.keyword("DATABASE") || self.keyword("SCHEMA") {
            let if_exists = self.if_exists();
            let name = self.ident()?;
            return Ok(vec![SchemaDelta::DropDatabase { name, if_exists }]);
        }
        let temporary = self.keyword("TEMPORARY");
        if self.keyword("TABLE") {
            let if_exists = self.if_exists();
            let mut deltas = Vec::new();
            loop {
                let (db, name) = self.qualified()?;
                let database = self.resolve_db(db)?;
                if !temporary {
                    deltas.push(SchemaDelta::DropTable {
                        database,
                        table: name,
                        if_exists,
                    });
                }
                self.skip_space();
                if !self.punct(b',') {
                    break;
                }
            }
            return Ok(deltas);
        }
        Ok(Vec::new())
    }

    fn rename_tables(&mut self) -> ParseResult<Vec<SchemaDelta>> {
        let mut deltas = Vec::new();
        loop {
            let (from_db, from) = self.qualified()?;
            let database = self.resolve_db(from_db)?;
            if !self.keyword("TO") {
                return Err(self.error("expected TO in RENAME TABLE"));
            }
            let (to_db, to) = self.qualified()?;
            let to_database = match to_db {
                Some(db) if db != database => Some(db),
                _ => None,
            };
            deltas.push(SchemaDelta::RenameTable {
                database,
                from,
                to_database,
                to,
            });
            self.skip_space();
            if !self.punct(b',') {
                break;
            }
        }
        Ok(deltas)
    }

    fn alter(&mut self) -> ParseResult<Vec<SchemaDelta>> {
        if self.keyword("DATABASE") || self.keyword("SCHEMA") {
            let name = self.ident()?;
            if let Some(charset) = self.database_options()? {
                return Ok(vec![SchemaDelta::ModifyEncoding {
                    database: name,
                    table: None,
                    charset,
                }]);
            }
            return Ok(Vec::new());
        }
        // ALTER [ONLINE|OFFLINE] [IGNORE] TABLE
        self.keyword("ONLINE");
        self.keyword("OFFLINE");
        self.keyword("IGNORE");
        if !self.keyword("TABLE") {
            return Ok(Vec::new());
        }
        let (db, name) = self.qualified()?;
        let database = self.resolve_db(db)?;
        self.alter_specs(&database, &name)
    }

    fn alter_specs(&mut self, database: &str, table: &str) -> ParseResult<Vec<SchemaDelta>> {
        let mut deltas = Vec::new();
        loop {
            self.skip_space();
            if self.at_end() {
                break;
            }

            if self.keyword("ADD") {
                self.alter_add(database, table, &mut deltas)?;
            } else if self.keyword("DROP") {
                self.alter_drop(database, table, &mut deltas)?;
            } else if self.keyword("MODIFY") {
                self.keyword("COLUMN");
                let (def, _) = self.column_def()?;
                let position = self.column_position()?;
                deltas.push(SchemaDelta::ChangeColumn {
                    database: database.to_string(),
                    table: table.to_string(),
                    column: def.name.clone(),
                    def: def.into_def(),
                    position,
                });
            } else if self.keyword("CHANGE") {
                self.keyword("COLUMN");
                let old = self.ident()?;
                let (def, _) = self.column_def()?;
                let position = self.column_position()?;
                deltas.push(SchemaDelta::ChangeColumn {
                    database: database.to_string(),
                    table: table.to_string(),
                    column: old,
                    def: def.into_def(),
                    position,
                });
            } else if self.keyword("RENAME") {
                if self.keyword("COLUMN") || self.keyword("INDEX") || self.keyword("KEY") {
                    return Err(self.error("RENAME COLUMN/INDEX is not supported"));
                }
                let _ = self.keyword("TO") || self.keyword("AS");
                let (to_db, to) = self.qualified()?;
                let to_database = match to_db {
                    Some(db) if db != database => Some(db),
                    _ => None,
                };
                deltas.push(SchemaDelta::RenameTable {
                    database: database.to_string(),
                    from: table.to_string(),
                    to_database,
                    to,
                });
            } else if self.keyword("CONVERT") {
                if !(self.keyword("TO") && self.charset_keyword()) {
                    return Err(self.error("expected CONVERT TO CHARACTER SET"));
                }
                self.punct(b'=');
                let charset = self.charset_name()?;
                self.skip_alter_tail();
                deltas.push(SchemaDelta::ModifyEncoding {
                    database: database.to_string(),
                    table: Some(table.to_string()),
                    charset,
                });
            } else {
                self.keyword("DEFAULT");
                if self.charset_keyword() {
                    self.punct(b'=');
                    let charset = self.charset_name()?;
                    self.skip_alter_tail();
                    deltas.push(SchemaDelta::ModifyEncoding {
                        database: database.to_string(),
                        table: Some(table.to_string()),
                        charset,
                    });
                } else {
                    // ENGINE=, AUTO_INCREMENT=, COMMENT=, ORDER BY,
                    // partition operations, ALGORITHM/LOCK hints: no
                    // catalog effect
                    self.skip_spec();
                }
            }

            self.skip_space();
            if !self.punct(b',') {
                break;
            }
        }
        self.skip_space();
        if !self.at_end() {
            return Err(self.error("trailing input after ALTER TABLE"));
        }
        Ok(deltas)
    }

    fn alter_add(
        &mut self,
        database: &str,
        table: &str,
        deltas: &mut Vec<SchemaDelta>,
    ) -> ParseResult<()> {
        if self.peek_keyword("INDEX")
            || self.peek_keyword("KEY")
            || self.peek_keyword("UNIQUE")
            || self.peek_keyword("FULLTEXT")
            || self.peek_keyword("SPATIAL")
            || self.peek_keyword("CONSTRAINT")
            || self.peek_keyword("PRIMARY")
            || self.peek_keyword("FOREIGN")
            || self.peek_keyword("PARTITION")
            || self.peek_keyword("CHECK")
        {
            self.skip_spec();
            return Ok(());
        }
        self.keyword("COLUMN");
        self.skip_space();
        if self.punct(b'(') {
            // ADD COLUMN (a INT, b INT)
            loop {
                let (def, _) = self.column_def()?;
                deltas.push(SchemaDelta::AddColumn {
                    database: database.to_string(),
                    table: table.to_string(),
                    def: def.into_def(),
                    position: ColumnPosition::Last,
                });
                self.skip_space();
                if self.punct(b',') {
                    continue;
                }
                self.expect(b')')?;
                break;
            }
            return Ok(());
        }
        let (def, _) = self.column_def()?;
        let position = self.column_position()?.unwrap_or(ColumnPosition::Last);
        deltas.push(SchemaDelta::AddColumn {
            database: database.to_string(),
            table: table.to_string(),
            def: def.into_def(),
            position,
        });
        Ok(())
    }

    fn alter_drop(
        &mut self,
        database: &str,
        table: &str,
        deltas: &mut Vec<SchemaDelta>,
    ) -> ParseResult<()> {
        if self.keyword("PRIMARY") || self.keyword("INDEX") || self.keyword("KEY") {
            self.skip_spec();
            return Ok(());
        }
        if self.keyword("FOREIGN") || self.keyword("CONSTRAINT") || self.keyword("CHECK") {
            self.skip_spec();
            return Ok(());
        }
        if self.keyword("PARTITION") {
            self.skip_spec();
            return Ok(());
        }
        self.keyword("COLUMN");
        let column = self.ident()?;
        deltas.push(SchemaDelta::DropColumn {
            database: database.to_string(),
            table: table.to_string(),
            column,
        });
        Ok(())
    }

    // ---- column definitions ----

    fn column_def(&mut self) -> ParseResult<(ParsedColumn, ColumnFlags)> {
        let name = self.ident()?;
        let kind = self.column_type()?;
        let mut col = ParsedColumn {
            def: ColumnDef::new(name, kind),
            explicit_charset: false,
        };
        let mut flags = ColumnFlags::default();

        // attribute soup: order is free-form in MySQL
        loop {
            self.skip_space();
            if self.at_end() || self.peek_any(&[b',', b')']) {
                break;
            }
            if self.peek_keyword("FIRST") || self.peek_keyword("AFTER") {
                break;
            }
            if self.keyword("UNSIGNED") {
                col.make_unsigned();
            } else if self.keyword("SIGNED") || self.keyword("ZEROFILL") {
                // signed is the default; zerofill does not change decoding
            } else if self.charset_keyword() {
                self.punct(b'=');
                let cs = self.charset_name()?;
                col.set_charset(cs);
            } else if self.keyword("COLLATE") {
                self.punct(b'=');
                let _ = self.ident()?;
            } else if self.keyword("NOT") {
                if !self.keyword("NULL") {
                    return Err(self.error("expected NULL after NOT"));
                }
            } else if self.keyword("NULL") {
                // nullable is the default
            } else if self.keyword("DEFAULT") {
                self.skip_value()?;
            } else if self.keyword("ON") {
                // ON UPDATE CURRENT_TIMESTAMP
                self.keyword("UPDATE");
                self.skip_value()?;
            } else if self.keyword("AUTO_INCREMENT") {
                // no decoding impact
            } else if self.keyword("PRIMARY") {
                self.keyword("KEY");
                flags.primary_key = true;
            } else if self.keyword("UNIQUE") {
                self.keyword("KEY");
            } else if self.keyword("KEY") {
                // column-level KEY
            } else if self.keyword("COMMENT") {
                self.skip_value()?;
            } else if self.keyword("GENERATED") || self.keyword("AS") {
                // generated columns: skip the expression and the
                // STORED/VIRTUAL marker
                self.skip_space();
                if self.punct(b'(') {
                    self.skip_parens()?;
                }
                self.keyword("ALWAYS");
                if self.keyword("AS") {
                    self.skip_space();
                    if self.punct(b'(') {
                        self.skip_parens()?;
                    }
                }
                self.keyword("STORED");
                self.keyword("VIRTUAL");
            } else if self.keyword("REFERENCES") {
                self.skip_spec();
            } else if self.keyword("COLUMN_FORMAT") || self.keyword("STORAGE") {
                let _ = self.ident()?;
            } else if self.keyword("SRID") {
                let _ = self.number()?;
            } else if self.keyword("INVISIBLE") || self.keyword("VISIBLE") {
                // column visibility does not affect row images we track
            } else if self.keyword("CHECK") {
                self.skip_space();
                if self.punct(b'(') {
                    self.skip_parens()?;
                }
            } else {
                return Err(self.error("unexpected token in column definition"));
            }
        }
        Ok((col, flags))
    }

    fn column_type(&mut self) -> ParseResult<ColumnType> {
        let type_name = self.ident()?.to_ascii_uppercase();
        let kind = match type_name.as_str() {
            "TINYINT" | "BOOL" | "BOOLEAN" => {
                self.optional_display_width()?;
                ColumnType::Int {
                    bytes: 1,
                    signed: true,
                }
            }
            "SMALLINT" => {
                self.optional_display_width()?;
                ColumnType::Int {
                    bytes: 2,
                    signed: true,
                }
            }
            "MEDIUMINT" => {
                self.optional_display_width()?;
                ColumnType::Int {
                    bytes: 3,
                    signed: true,
                }
            }
            "INT" | "INTEGER" => {
                self.optional_display_width()?;
                ColumnType::Int {
                    bytes: 4,
                    signed: true,
                }
            }
            "BIGINT" => {
                self.optional_display_width()?;
                ColumnType::BigInt { signed: true }
            }
            "SERIAL" => ColumnType::BigInt { signed: false },
            "DECIMAL" | "NUMERIC" | "DEC" | "FIXED" => {
                let (precision, scale) = self.optional_precision_scale()?;
                ColumnType::Decimal {
                    precision: precision.unwrap_or(10),
                    scale: scale.unwrap_or(0),
                }
            }
            "FLOAT" => {
                self.optional_precision_scale()?;
                ColumnType::Float
            }
            "DOUBLE" | "REAL" => {
                self.keyword("PRECISION");
                self.optional_precision_scale()?;
                ColumnType::Double
            }
            "BIT" => {
                let bits = self.optional_display_width()?.unwrap_or(1);
                ColumnType::Bit { bits: bits as u16 }
            }
            "CHAR" | "VARCHAR" | "NCHAR" | "NVARCHAR" => {
                let length = self.optional_display_width()?.unwrap_or(1);
                ColumnType::String {
                    length: length as u32,
                    charset: "utf8mb4".to_string(),
                }
            }
            "TINYTEXT" => ColumnType::String {
                length: 255,
                charset: "utf8mb4".to_string(),
            },
            "TEXT" => {
                self.optional_display_width()?;
                ColumnType::String {
                    length: 65_535,
                    charset: "utf8mb4".to_string(),
                }
            }
            "MEDIUMTEXT" => ColumnType::String {
                length: 16_777_215,
                charset: "utf8mb4".to_string(),
            },
            "LONGTEXT" => ColumnType::String {
                length: u32::MAX,
                charset: "utf8mb4".to_string(),
            },
            "BINARY" | "VARBINARY" => {
                let length = self.optional_display_width()?.unwrap_or(1);
                ColumnType::Binary {
                    length: length as u32,
                }
            }
            "TINYBLOB" => ColumnType::Binary { length: 255 },
            "BLOB" => {
                self.optional_display_width()?;
                ColumnType::Binary { length: 65_535 }
            }
            "MEDIUMBLOB" => ColumnType::Binary {
                length: 16_777_215,
            },
            "LONGBLOB" => ColumnType::Binary { length: u32::MAX },
            "ENUM" => ColumnType::Enum {
                values: self.value_list()?,
            },
            "SET" => ColumnType::Set {
                values: self.value_list()?,
            },
            "DATE" => ColumnType::Date,
            "TIME" => ColumnType::Time {
                fsp: self.optional_display_width()?.unwrap_or(0) as u8,
            },
            "DATETIME" => ColumnType::DateTime {
                fsp: self.optional_display_width()?.unwrap_or(0) as u8,
            },
            "TIMESTAMP" => ColumnType::Timestamp {
                fsp: self.optional_display_width()?.unwrap_or(0) as u8,
            },
            "YEAR" => {
                self.optional_display_width()?;
                ColumnType::Year
            }
            "JSON" => ColumnType::Json,
            "GEOMETRY" | "POINT" | "LINESTRING" | "POLYGON" | "MULTIPOINT"
            | "MULTILINESTRING" | "MULTIPOLYGON" | "GEOMETRYCOLLECTION" => ColumnType::Geometry,
            _ => return Err(self.error("unknown column type")),
        };
        Ok(kind)
    }

    fn column_position(&mut self) -> ParseResult<Option<ColumnPosition>> {
        if self.keyword("FIRST") {
            return Ok(Some(ColumnPosition::First));
        }
        if self.keyword("AFTER") {
            let name = self.ident()?;
            return Ok(Some(ColumnPosition::After(name)));
        }
        Ok(None)
    }

    /// Consume an index/constraint entry inside CREATE TABLE, pulling
    /// primary-key column names out along the way. Returns false when
    /// the next entry is a plain column definition.
    fn constraint_entry(&mut self, pk: &mut Vec<String>) -> ParseResult<bool> {
        if self.keyword("CONSTRAINT") {
            // optional symbol name
            self.skip_space();
            if !self.peek_keyword("PRIMARY")
                && !self.peek_keyword("UNIQUE")
                && !self.peek_keyword("FOREIGN")
                && !self.peek_keyword("CHECK")
            {
                let _ = self.ident()?;
            }
            // fall through to the keyed entry below
        } else if !(self.peek_keyword("PRIMARY")
            || self.peek_keyword("UNIQUE")
            || self.peek_keyword("FOREIGN")
            || self.peek_keyword("KEY")
            || self.peek_keyword("INDEX")
            || self.peek_keyword("FULLTEXT")
            || self.peek_keyword("SPATIAL")
            || self.peek_keyword("CHECK"))
        {
            return Ok(false);
        }

        if self.keyword("PRIMARY") {
            self.keyword("KEY");
            self.skip_space();
            if self.punct(b'(') {
                loop {
                    let name = self.ident()?;
                    pk.push(name);
                    // key length / direction: `name(10) ASC`
                    self.skip_space();
                    if self.punct(b'(') {
                        self.skip_parens()?;
                    }
                    self.keyword("ASC");
                    self.keyword("DESC");
                    self.skip_space();
                    if self.punct(b',') {
                        continue;
                    }
                    self.expect(b')')?;
                    break;
                }
            }
            self.skip_constraint_tail();
            return Ok(true);
        }
        self.skip_spec();
        Ok(true)
    }

    // ---- option clauses ----

    /// `[DEFAULT] CHARACTER SET [=] x` / `CHARSET [=] x`, tolerating a
    /// trailing COLLATE. Used for CREATE/ALTER DATABASE.
    fn database_options(&mut self) -> ParseResult<Option<String>> {
        let mut charset = None;
        loop {
            self.skip_space();
            if self.at_end() {
                break;
            }
            self.keyword("DEFAULT");
            if self.charset_keyword() {
                self.punct(b'=');
                charset = Some(self.charset_name()?);
            } else if self.keyword("COLLATE") {
                self.punct(b'=');
                let _ = self.ident()?;
            } else if self.keyword("ENCRYPTION") {
                self.punct(b'=');
                self.skip_value()?;
            } else {
                break;
            }
        }
        Ok(charset)
    }

    /// Table options after the column list; only the default charset is
    /// interesting, the rest is consumed and ignored.
    fn table_options(&mut self) -> ParseResult<Option<String>> {
        let mut charset = None;
        loop {
            self.skip_space();
            if self.at_end() {
                break;
            }
            self.keyword("DEFAULT");
            if self.charset_keyword() {
                self.punct(b'=');
                charset = Some(self.charset_name()?);
            } else if self.punct(b',') {
                // options may be comma separated
            } else {
                // ENGINE=x, AUTO_INCREMENT=n, COMMENT='x', COLLATE=x ...
                let Ok(_) = self.ident() else {
                    break;
                };
                self.punct(b'=');
                if self.skip_value().is_err() {
                    break;
                }
            }
        }
        Ok(charset)
    }

    fn charset_keyword(&mut self) -> bool {
        if self.keyword("CHARSET") {
            return true;
        }
        let save = self.pos;
        if self.keyword("CHARACTER") && self.keyword("SET") {
            return true;
        }
        self.pos = save;
        false
    }

    fn charset_name(&mut self) -> ParseResult<String> {
        self.skip_space();
        if self.pos < self.bytes.len() && self.bytes[self.pos] == b'\'' {
            return Ok(self.string_lit()?.to_ascii_lowercase());
        }
        Ok(self.ident()?.to_ascii_lowercase())
    }

    fn if_not_exists(&mut self) -> bool {
        let save = self.pos;
        if self.keyword("IF") && self.keyword("NOT") && self.keyword("EXISTS") {
            return true;
        }
        self.pos = save;
        false
    }

    fn if_exists(&mut self) -> bool {
        let save = self.pos;
        if self.keyword("IF") && self.keyword("EXISTS") {
            return true;
        }
        self.pos = save;
        false
    }

    fn resolve_db(&self, db: Option<String>) -> ParseResult<String> {
        match db.or_else(|| self.default_db.map(str::to_string)) {
            Some(db) => Ok(db),
            None => Err(DdlParseError::new(
                "statement has no database qualifier and no session database",
                self.src,
            )),
        }
    }

    // ---- scanner primitives ----

    fn skip_space(&mut self) {
        loop {
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.pos + 1 < self.bytes.len()
                && self.bytes[self.pos] == b'/'
                && self.bytes[self.pos + 1] == b'*'
            {
                self.pos += 2;
                while self.pos + 1 < self.bytes.len()
                    && !(self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/')
                {
                    self.pos += 1;
                }
                self.pos = (self.pos + 2).min(self.bytes.len());
                continue;
            }
            if self.pos + 1 < self.bytes.len()
                && self.bytes[self.pos] == b'-'
                && self.bytes[self.pos + 1] == b'-'
            {
                while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            if self.pos < self.bytes.len() && self.bytes[self.pos] == b'#' {
                while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            break;
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_space();
        self.pos >= self.bytes.len() || self.bytes[self.pos] == b';'
    }

    fn error(&self, message: &str) -> DdlParseError {
        DdlParseError::new(message, self.src).at(self.pos)
    }

    /// Case-insensitive keyword match with a word boundary; advances on
    /// success.
    fn keyword(&mut self, kw: &str) -> bool {
        self.skip_space();
        let end = self.pos + kw.len();
        if end > self.bytes.len() {
            return false;
        }
        if !self.bytes[self.pos..end].eq_ignore_ascii_case(kw.as_bytes()) {
            return false;
        }
        if let Some(&next) = self.bytes.get(end) {
            if next.is_ascii_alphanumeric() || next == b'_' {
                return false;
            }
        }
        self.pos = end;
        true
    }

    fn peek_keyword(&mut self, kw: &str) -> bool {
        let save = self.pos;
        let hit = self.keyword(kw);
        self.pos = save;
        hit
    }

    fn punct(&mut self, ch: u8) -> bool {
        self.skip_space();
        if self.pos < self.bytes.len() && self.bytes[self.pos] == ch {
            self.pos += 1;
            return true;
        }
        false
    }

    fn peek_any(&mut self, chars: &[u8]) -> bool {
        self.skip_space();
        self.pos < self.bytes.len() && chars.contains(&self.bytes[self.pos])
    }

    fn expect(&mut self, ch: u8) -> ParseResult<()> {
        if self.punct(ch) {
            Ok(())
        } else {
            Err(self.error(&format!("expected `{}`", ch as char)))
        }
    }

    /// Backquoted, double-quoted or bare identifier.
    fn ident(&mut self) -> ParseResult<String> {
        self.skip_space();
        if self.pos >= self.bytes.len() {
            return Err(self.error("expected identifier"));
        }
        let quote = self.bytes[self.pos];
        if quote == b'`' || quote == b'"' {
            self.pos += 1;
            let mut out = String::new();
            while self.pos < self.bytes.len() {
                let b = self.bytes[self.pos];
                if b == quote {
                    if self.bytes.get(self.pos + 1) == Some(&quote) {
                        out.push(quote as char);
                        self.pos += 2;
                        continue;
                    }
                    self.pos += 1;
                    return Ok(out);
                }
                // identifiers may be multi-byte; copy the raw char
                let ch_len = utf8_len(b);
                out.push_str(&self.src[self.pos..self.pos + ch_len]);
                self.pos += ch_len;
            }
            return Err(self.error("unterminated quoted identifier"));
        }
        let start = self.pos;
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80 {
                self.pos += utf8_len(b);
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected identifier"));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    /// `[db.]name`
    fn qualified(&mut self) -> ParseResult<(Option<String>, String)> {
        let first = self.ident()?;
        if self.pos < self.bytes.len() && self.bytes[self.pos] == b'.' {
            self.pos += 1;
            let second = self.ident()?;
            return Ok((Some(first), second));
        }
        Ok((None, first))
    }

    fn number(&mut self) -> ParseResult<u64> {
        self.skip_space();
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected number"));
        }
        self.src[start..self.pos]
            .parse()
            .map_err(|_| self.error("number out of range"))
    }

    fn string_lit(&mut self) -> ParseResult<String> {
        self.skip_space();
        if self.pos >= self.bytes.len() || self.bytes[self.pos] != b'\'' {
            return Err(self.error("expected string literal"));
        }
        self.pos += 1;
        let mut out = String::new();
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            if b == b'\\' && self.pos + 1 < self.bytes.len() {
                let escaped = self.bytes[self.pos + 1];
                out.push(match escaped {
                    b'n' => '\n',
                    b't' => '\t',
                    b'r' => '\r',
                    b'0' => '\0',
                    other => other as char,
                });
                self.pos += 2;
                continue;
            }
            if b == b'\'' {
                if self.bytes.get(self.pos + 1) == Some(&b'\'') {
                    out.push('\'');
                    self.pos += 2;
                    continue;
                }
                self.pos += 1;
                return Ok(out);
            }
            let ch_len = utf8_len(b);
            out.push_str(&self.src[self.pos..self.pos + ch_len]);
            self.pos += ch_len;
        }
        Err(self.error("unterminated string literal"))
    }

    /// `(n)` or `(p,s)` display widths; both components optional.
    fn optional_display_width(&mut self) -> ParseResult<Option<u64>> {
        self.skip_space();
        if !self.punct(b'(') {
            return Ok(None);
        }
        let n = self.number()?;
        self.skip_space();
        if self.punct(b',') {
            let _ = self.number()?;
        }
        self.expect(b')')?;
        Ok(Some(n))
    }

    fn optional_precision_scale(&mut self) -> ParseResult<(Option<u8>, Option<u8>)> {
        self.skip_space();
        if !self.punct(b'(') {
            return Ok((None, None));
        }
        let p = self.number()?;
        let mut s = None;
        self.skip_space();
        if self.punct(b',') {
            s = Some(self.number()?);
        }
        self.expect(b')')?;
        Ok((Some(p.min(65) as u8), s.map(|v| v.min(30) as u8)))
    }

    /// `('a','b','c')` value list for ENUM/SET.
    fn value_list(&mut self) -> ParseResult<Vec<String>> {
        self.expect(b'(')?;
        let mut out = Vec::new();
        loop {
            out.push(self.string_lit()?);
            self.skip_space();
            if self.punct(b',') {
                continue;
            }
            self.expect(b')')?;
            break;
        }
        Ok(out)
    }

    /// Skip one value: a string, number, bare word/function call or
    /// parenthesized expression. Used for DEFAULT and option values.
    fn skip_value(&mut self) -> ParseResult<()> {
        self.skip_space();
        if self.pos >= self.bytes.len() {
            return Err(self.error("expected value"));
        }
        match self.bytes[self.pos] {
            b'\'' => {
                let _ = self.string_lit()?;
            }
            b'(' => {
                self.pos += 1;
                self.skip_parens()?;
            }
            b'-' | b'+' => {
                self.pos += 1;
                let _ = self.number()?;
                // fractional part
                if self.pos < self.bytes.len() && self.bytes[self.pos] == b'.' {
                    self.pos += 1;
                    let _ = self.number()?;
                }
            }
            b'0'..=b'9' => {
                let _ = self.number()?;
                if self.pos < self.bytes.len() && self.bytes[self.pos] == b'.' {
                    self.pos += 1;
                    while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                        self.pos += 1;
                    }
                }
            }
            _ => {
                // bare word such as NULL, CURRENT_TIMESTAMP, possibly
                // with a call suffix
                let _ = self.ident()?;
                self.skip_space();
                if self.punct(b'(') {
                    self.skip_parens()?;
                }
            }
        }
        Ok(())
    }

    /// Consume up to and including the matching `)`, respecting nested
    /// parens and string literals. The opening paren is already eaten.
    fn skip_parens(&mut self) -> ParseResult<()> {
        let mut depth = 1usize;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\'' => {
                    let _ = self.string_lit()?;
                    continue;
                }
                b'`' | b'"' => {
                    let _ = self.ident()?;
                    continue;
                }
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos += 1;
                        return Ok(());
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        Err(self.error("unbalanced parentheses"))
    }

    /// Consume the remainder of one alter/constraint spec: everything up
    /// to a top-level comma or the end of the statement.
    fn skip_spec(&mut self) {
        loop {
            self.skip_space();
            if self.pos >= self.bytes.len() {
                return;
            }
            match self.bytes[self.pos] {
                b',' | b';' => return,
                b'\'' => {
                    if self.string_lit().is_err() {
                        self.pos = self.bytes.len();
                        return;
                    }
                }
                b'(' => {
                    self.pos += 1;
                    if self.skip_parens().is_err() {
                        self.pos = self.bytes.len();
                        return;
                    }
                }
                b'`' | b'"' => {
                    if self.ident().is_err() {
                        self.pos = self.bytes.len();
                        return;
                    }
                }
                _ => self.pos += 1,
            }
        }
    }

    /// Tail of an index/constraint definition: USING BTREE, comments...
    fn skip_constraint_tail(&mut self) {
        self.skip_spec();
    }

    /// Remainder of a charset conversion clause (COLLATE x).
    fn skip_alter_tail(&mut self) {
        let save = self.pos;
        if self.keyword("COLLATE") {
            self.punct(b'=');
            if self.ident().is_err() {
                self.pos = save;
            }
        }
    }
}

/// Column definition plus parse-time bookkeeping.
struct ParsedColumn {
    def: ColumnDef,
    explicit_charset: bool,
}

impl ParsedColumn {
    fn make_unsigned(&mut self) {
        match &mut self.def.kind {
            ColumnType::Int { signed, .. } | ColumnType::BigInt { signed } => *signed = false,
            _ => {}
        }
    }

    fn set_charset(&mut self, cs: String) {
        if let ColumnType::String { charset, .. } = &mut self.def.kind {
            *charset = cs;
            self.explicit_charset = true;
        }
    }

    fn explicit_charset(&self) -> bool {
        self.explicit_charset
    }

    fn into_def(self) -> ColumnDef {
        self.def
    }
}

impl std::ops::Deref for ParsedColumn {
    type Target = ColumnDef;
    fn deref(&self) -> &ColumnDef {
        &self.def
    }
}

#[derive(Default)]
struct ColumnFlags {
    primary_key: bool,
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}
