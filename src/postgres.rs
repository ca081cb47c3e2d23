//! PostgreSQL backend for [`DocumentClient`].
//!
//! A database is a schema and a container is a table of JSONB documents
//! keyed by `(partition_key, id)`. Entity tags are random per write and
//! session tokens come from a per-container sequence. Procedures are SQL
//! functions over the container restricted to one partition.

use std::str::FromStr;

use async_trait::async_trait;
use indoc::formatdoc;
use serde_json::{Map, Value};
use sqlx::{
    PgPool, Postgres, Row,
    postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow},
    query::Query,
    types::Json,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    Error, Result,
    client::{
        ClientError, ClientResult, ContainerRef, DatabaseRef, DeleteResponse, DocumentClient,
        ItemResponse, ProcedureResponse, QueryPage, QueryRequest, RequestOptions, StatusCode,
    },
    config::{ConnectionMode, StoreOptions, fnv1a},
    procedure::ProcedureDefinition,
    query::QueryDefinition,
};

const PROCEDURE_QUOTE: &str = "$procedure$";

#[derive(Clone, Debug)]
pub struct PgDocumentClient {
    pool: PgPool,
    mode: ConnectionMode,
}

impl PgDocumentClient {
    /// Open a pool for `options`. `endpoint` is a `postgres://` URL and
    /// `auth_key` is used as the password.
    ///
    /// Gateway mode turns off the prepared statement cache so the client
    /// can sit behind a transaction-pooling proxy.
    pub async fn connect(options: &StoreOptions) -> Result<Self> {
        let mut connect_opts = PgConnectOptions::from_str(&options.endpoint)
            .map_err(|e| Error::Configuration(format!("invalid endpoint: {e}")))?
            .password(&options.auth_key);
        if options.connection_mode == ConnectionMode::Gateway {
            connect_opts = connect_opts.statement_cache_capacity(0);
        }

        let mut pool_opts = PgPoolOptions::new().max_connections(options.max_connections.max(1));
        if let Some(timeout) = options.connect_timeout {
            pool_opts = pool_opts.acquire_timeout(timeout);
        }
        let pool = pool_opts
            .connect_with(connect_opts)
            .await
            .map_err(ClientError::from)?;
        Ok(Self::from_pool(pool, options.connection_mode))
    }

    pub fn from_pool(pool: PgPool, mode: ConnectionMode) -> Self {
        Self { pool, mode }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Plan of the statement the first page of `request` runs, one plan
    /// line per text line.
    #[instrument(skip(self, container, request), fields(container = %container.id))]
    pub async fn explain_page(
        &self,
        container: &ContainerRef,
        request: QueryRequest<'_>,
    ) -> ClientResult<String> {
        let compiled = compile_parameters(request.definition, 1)?;
        let sql = format!(
            "explain {}",
            page_sql(container, &compiled, request.partition_key.is_some())
        );
        let rows = bind_page(
            sqlx::query(&sql),
            compiled.binds,
            request.partition_key,
            i64::from(request.max_item_count.max(1)),
            0,
        )
        .persistent(false)
        .fetch_all(&self.pool)
        .await?;
        let lines = rows
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;
        Ok(lines.join("\n"))
    }

    fn persistent(&self) -> bool {
        self.mode == ConnectionMode::Direct
    }

    async fn exists(&self, container: &ContainerRef, id: &str, partition_key: &str) -> ClientResult<bool> {
        let found: Option<i32> = sqlx::query_scalar(&format!(
            "select 1 from {} where partition_key = $1 and id = $2",
            table_name(container)
        ))
        .bind(partition_key)
        .bind(id)
        .persistent(self.persistent())
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    /// Status for a conditional write that matched no rows.
    async fn missed_write(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
    ) -> ClientError {
        match self.exists(container, id, partition_key).await {
            Ok(true) => ClientError::new(StatusCode::PreconditionFailed, "entity tag mismatch"),
            Ok(false) => ClientError::not_found(format!("document `{id}`")),
            Err(err) => err,
        }
    }

    async fn run_ddl(&self, lock: &[&str], statements: &[String]) -> ClientResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("select pg_advisory_xact_lock($1)")
            .bind(lock_key(lock))
            .execute(&mut *tx)
            .await?;
        for stmt in statements {
            sqlx::query(stmt).persistent(false).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn lock_key(parts: &[&str]) -> i64 {
    // Clamp to positive i64 so advisory locks stay within valid range.
    (fnv1a(parts) & 0x7FFF_FFFF_FFFF_FFFF) as i64
}

fn table_name(container: &ContainerRef) -> String {
    format!(
        "{}.{}",
        quote_ident(&container.database),
        quote_ident(&container.id)
    )
}

fn sequence_name(container: &ContainerRef) -> String {
    format!(
        "{}.{}",
        quote_ident(&container.database),
        quote_ident(&format!("{}_lsn", container.id))
    )
}

fn function_name(container: &ContainerRef, procedure: &str) -> String {
    format!(
        "{}.{}",
        quote_ident(&container.database),
        quote_ident(&format!("{}__{}", container.id, procedure))
    )
}

/// The relation user queries and procedure bodies run against. `body` is
/// the raw column so predicates on it reach the GIN index once the CTE is
/// inlined; `doc` adds the system fields.
fn container_view(container: &ContainerRef, partition_filter: Option<&str>) -> String {
    let filter = partition_filter
        .map(|expr| format!("\n    where t.partition_key = {expr}"))
        .unwrap_or_default();
    formatdoc!(
        "
        select t.id, t.partition_key, t.doc as body,
               t.doc || jsonb_build_object('_etag', t.etag, '_ts', extract(epoch from t.ts)::bigint) as doc
        from {table} t{filter}",
        table = table_name(container),
        filter = filter,
    )
}

fn new_etag() -> String {
    format!("\"{}\"", Uuid::new_v4())
}

fn into_object(document: Value) -> ClientResult<Map<String, Value>> {
    match document {
        Value::Object(mut map) => {
            map.remove("_etag");
            map.remove("_ts");
            Ok(map)
        }
        _ => Err(ClientError::bad_request("document must be a JSON object")),
    }
}

fn with_system_fields(mut document: Map<String, Value>, etag: &str, ts: i64) -> Value {
    document.insert("_etag".into(), Value::String(etag.to_string()));
    document.insert("_ts".into(), Value::from(ts));
    Value::Object(document)
}

fn write_response(document: Map<String, Value>, etag: String, row: &PgRow) -> ClientResult<ItemResponse> {
    let lsn: i64 = row.try_get("lsn")?;
    let ts: i64 = row.try_get("ts")?;
    Ok(ItemResponse {
        document: with_system_fields(document, &etag, ts),
        etag: Some(etag),
        session_token: Some(lsn.to_string()),
    })
}

/// A run of query text. Literals, quoted identifiers and comments are
/// opaque: parameters and keywords are only recognised in code.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Lexeme<'a> {
    Code(&'a str),
    Opaque(&'a str),
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// End of the dollar-quote tag starting at `start`, if it opens one.
fn dollar_tag_end(bytes: &[u8], start: usize) -> Option<usize> {
    if start > 0 && (is_ident_byte(bytes[start - 1]) || bytes[start - 1] == b'$') {
        return None;
    }
    let mut i = start + 1;
    if bytes.get(i).is_some_and(u8::is_ascii_digit) {
        return None;
    }
    while bytes.get(i).copied().is_some_and(is_ident_byte) {
        i += 1;
    }
    (bytes.get(i) == Some(&b'$')).then_some(i + 1)
}

fn lex(text: &str) -> ClientResult<Vec<Lexeme<'_>>> {
    let bytes = text.as_bytes();
    let mut lexemes = Vec::new();
    let mut code_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let end = match bytes[i] {
            quote @ (b'\'' | b'"') => {
                let close = text[i + 1..]
                    .find(char::from(quote))
                    .ok_or_else(|| ClientError::bad_request("unterminated quoted literal"))?;
                i + 1 + close + 1
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                text[i..].find('\n').map_or(bytes.len(), |nl| i + nl)
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let close = text[i + 2..]
                    .find("*/")
                    .ok_or_else(|| ClientError::bad_request("unterminated comment"))?;
                i + 2 + close + 2
            }
            b'$' => match dollar_tag_end(bytes, i) {
                Some(tag_end) => {
                    let tag = &text[i..tag_end];
                    let close = text[tag_end..].find(tag).ok_or_else(|| {
                        ClientError::bad_request("unterminated dollar-quoted literal")
                    })?;
                    tag_end + close + tag.len()
                }
                None => {
                    i += 1;
                    continue;
                }
            },
            _ => {
                i += 1;
                continue;
            }
        };
        if code_start < i {
            lexemes.push(Lexeme::Code(&text[code_start..i]));
        }
        lexemes.push(Lexeme::Opaque(&text[i..end]));
        code_start = end;
        i = end;
    }
    if code_start < bytes.len() {
        lexemes.push(Lexeme::Code(&text[code_start..]));
    }
    Ok(lexemes)
}

fn flush(word: &mut String, words: &mut Vec<String>) {
    if !word.is_empty() {
        words.push(std::mem::take(word).to_ascii_lowercase());
    }
}

/// Whether the outermost query level has an `order by` clause.
fn has_order_by(lexemes: &[Lexeme<'_>]) -> bool {
    let mut depth = 0usize;
    let mut words: Vec<String> = Vec::new();
    let mut word = String::new();

    for lexeme in lexemes {
        let Lexeme::Code(code) = lexeme else {
            flush(&mut word, &mut words);
            continue;
        };
        for ch in code.chars() {
            match ch {
                '(' => {
                    flush(&mut word, &mut words);
                    depth += 1;
                }
                ')' => {
                    flush(&mut word, &mut words);
                    depth = depth.saturating_sub(1);
                }
                c if depth == 0 && (c.is_ascii_alphanumeric() || c == '_') => word.push(c),
                _ => flush(&mut word, &mut words),
            }
        }
    }
    flush(&mut word, &mut words);
    words.windows(2).any(|w| w[0] == "order" && w[1] == "by")
}

/// How a parameter reaches the server.
#[derive(Debug, PartialEq)]
enum Bind<'a> {
    Json(&'a Value),
    TextArray(Vec<String>),
}

impl<'a> Bind<'a> {
    fn text_array(name: &str, value: &'a Value) -> ClientResult<Self> {
        value
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|item| item.as_str().map(str::to_owned))
                    .collect::<Option<Vec<_>>>()
            })
            .map(Bind::TextArray)
            .ok_or_else(|| {
                ClientError::bad_request(format!("parameter `{name}` must be an array of strings"))
            })
    }
}

/// Query text with `@name` parameters rewritten to positional ones.
#[derive(Debug)]
struct CompiledQuery<'a> {
    sql: String,
    binds: Vec<Bind<'a>>,
    ordered: bool,
}

const TEXT_ARRAY_CAST: &str = "::text[]";

/// Rewrite `@name` references in code to `$n`, starting at `$first`.
/// Repeated names share one position. A reference followed by `::text[]`
/// is bound as a text array.
fn compile_parameters(definition: &QueryDefinition, first: usize) -> ClientResult<CompiledQuery<'_>> {
    let text = definition.text();
    let lexemes = lex(text)?;
    let mut sql = String::with_capacity(text.len());
    let mut binds: Vec<Bind<'_>> = Vec::new();
    let mut names: Vec<&str> = Vec::new();

    for lexeme in &lexemes {
        let code = match *lexeme {
            Lexeme::Opaque(opaque) => {
                sql.push_str(opaque);
                continue;
            }
            Lexeme::Code(code) => code,
        };
        let mut chars = code.char_indices().peekable();
        while let Some((start, ch)) = chars.next() {
            let opens_name = ch == '@'
                && chars
                    .peek()
                    .is_some_and(|(_, next)| next.is_ascii_alphabetic() || *next == '_');
            if !opens_name {
                sql.push(ch);
                continue;
            }
            let mut end = start + 1;
            while let Some((idx, next)) = chars.peek().copied() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    end = idx + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let name = &code[start..end];
            let as_text_array = code[end..]
                .get(..TEXT_ARRAY_CAST.len())
                .is_some_and(|cast| cast.eq_ignore_ascii_case(TEXT_ARRAY_CAST));
            let position = match names.iter().position(|n| *n == name) {
                Some(pos) => {
                    let upgrade = match binds[pos] {
                        Bind::Json(value) if as_text_array => Some(value),
                        _ => None,
                    };
                    if let Some(value) = upgrade {
                        binds[pos] = Bind::text_array(name, value)?;
                    }
                    pos
                }
                None => {
                    let value = definition.parameter(name).ok_or_else(|| {
                        ClientError::bad_request(format!("parameter `{name}` is not bound"))
                    })?;
                    names.push(name);
                    binds.push(if as_text_array {
                        Bind::text_array(name, value)?
                    } else {
                        Bind::Json(value)
                    });
                    names.len() - 1
                }
            };
            sql.push('$');
            sql.push_str(&(first + position).to_string());
        }
    }
    Ok(CompiledQuery {
        sql,
        binds,
        ordered: has_order_by(&lexemes),
    })
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    bind: Bind<'q>,
) -> Query<'q, Postgres, PgArguments> {
    match bind {
        Bind::TextArray(items) => query.bind(items),
        Bind::Json(Value::Null) => query.bind(Option::<String>::None),
        Bind::Json(Value::Bool(b)) => query.bind(*b),
        Bind::Json(Value::Number(n)) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Bind::Json(Value::String(s)) => query.bind(s.as_str()),
        Bind::Json(other) => query.bind(Json(other)),
    }
}

/// Statement for one page of `compiled` over `container`. Placeholders after
/// the query's own parameters are the partition key (when `partitioned`),
/// then limit and offset.
fn page_sql(container: &ContainerRef, compiled: &CompiledQuery<'_>, partitioned: bool) -> String {
    let mut next = compiled.binds.len() + 1;
    let view = if partitioned {
        let view = container_view(container, Some(&format!("${next}")));
        next += 1;
        view
    } else {
        container_view(container, None)
    };
    let order = if compiled.ordered { "" } else { " order by 1" };
    formatdoc!(
        "
        with c as (
        {view}
        )
        select q.* from ({user}) as q{order}
        limit ${limit} offset ${offset}",
        view = view,
        user = compiled.sql,
        order = order,
        limit = next,
        offset = next + 1,
    )
}

fn bind_page<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    binds: Vec<Bind<'q>>,
    partition_key: Option<&'q str>,
    limit: i64,
    offset: i64,
) -> Query<'q, Postgres, PgArguments> {
    for bind in binds {
        query = bind_value(query, bind);
    }
    if let Some(pk) = partition_key {
        query = query.bind(pk);
    }
    query.bind(limit).bind(offset)
}

#[async_trait]
impl DocumentClient for PgDocumentClient {
    #[instrument(skip(self))]
    async fn ensure_database(&self, database: &str) -> ClientResult<DatabaseRef> {
        self.run_ddl(
            &["schema", database],
            &[format!("create schema if not exists {}", quote_ident(database))],
        )
        .await?;
        Ok(DatabaseRef {
            id: database.to_string(),
        })
    }

    #[instrument(skip(self, database), fields(database = %database.id))]
    async fn ensure_container(
        &self,
        database: &DatabaseRef,
        container: &str,
        partition_key_path: &str,
    ) -> ClientResult<ContainerRef> {
        let reference = ContainerRef {
            database: database.id.clone(),
            id: container.to_string(),
            partition_key_path: partition_key_path.to_string(),
        };
        let table = table_name(&reference);
        let statements = vec![
            formatdoc!(
                "
                create table if not exists {table} (
                    id text not null,
                    partition_key text not null,
                    doc jsonb not null,
                    etag text not null,
                    lsn bigint not null,
                    ts timestamptz not null default now(),
                    primary key (partition_key, id)
                )",
                table = table,
            ),
            format!(
                "create index if not exists {} on {table} (id)",
                quote_ident(&format!("{container}_id_idx"))
            ),
            format!(
                "create index if not exists {} on {table} using gin (doc jsonb_path_ops)",
                quote_ident(&format!("{container}_doc_idx"))
            ),
            format!("create sequence if not exists {}", sequence_name(&reference)),
        ];
        self.run_ddl(&["container", &database.id, container], &statements)
            .await?;
        debug!(table = %table, "container ready");
        Ok(reference)
    }

    #[instrument(skip(self, container, document, _options), fields(container = %container.id))]
    async fn create_item(
        &self,
        container: &ContainerRef,
        partition_key: &str,
        document: Value,
        _options: &RequestOptions,
    ) -> ClientResult<ItemResponse> {
        let document = into_object(document)?;
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ClientError::bad_request("document has no id"))?;
        let etag = new_etag();
        let sql = formatdoc!(
            "
            insert into {table} (id, partition_key, doc, etag, lsn)
            values ($1, $2, $3, $4, nextval($5::regclass))
            returning lsn, extract(epoch from ts)::bigint as ts",
            table = table_name(container),
        );
        let row = sqlx::query(&sql)
            .bind(&id)
            .bind(partition_key)
            .bind(Json(&document))
            .bind(&etag)
            .bind(sequence_name(container))
            .persistent(self.persistent())
            .fetch_one(&self.pool)
            .await?;
        write_response(document, etag, &row)
    }

    #[instrument(skip(self, container, document, options), fields(container = %container.id))]
    async fn replace_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        document: Value,
        options: &RequestOptions,
    ) -> ClientResult<ItemResponse> {
        let document = into_object(document)?;
        let etag = new_etag();
        let sql = formatdoc!(
            "
            update {table}
            set doc = $3, etag = $4, lsn = nextval($5::regclass), ts = now()
            where partition_key = $2 and id = $1 and ($6::text is null or etag = $6)
            returning lsn, extract(epoch from ts)::bigint as ts",
            table = table_name(container),
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(partition_key)
            .bind(Json(&document))
            .bind(&etag)
            .bind(sequence_name(container))
            .bind(options.if_match.as_deref())
            .persistent(self.persistent())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => write_response(document, etag, &row),
            None => Err(self.missed_write(container, id, partition_key).await),
        }
    }

    /// Reads always see committed writes, so the session token is not needed.
    #[instrument(skip(self, container, _options), fields(container = %container.id))]
    async fn read_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        _options: &RequestOptions,
    ) -> ClientResult<ItemResponse> {
        let sql = format!(
            "select doc, etag, extract(epoch from ts)::bigint as ts from {} where partition_key = $1 and id = $2",
            table_name(container)
        );
        let row = sqlx::query(&sql)
            .bind(partition_key)
            .bind(id)
            .persistent(self.persistent())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ClientError::not_found(format!("document `{id}`")))?;

        let Json(document): Json<Value> = row.try_get("doc")?;
        let etag: String = row.try_get("etag")?;
        let ts: i64 = row.try_get("ts")?;
        Ok(ItemResponse {
            document: with_system_fields(into_object(document)?, &etag, ts),
            etag: Some(etag),
            session_token: None,
        })
    }

    #[instrument(skip(self, container, options), fields(container = %container.id))]
    async fn delete_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        options: &RequestOptions,
    ) -> ClientResult<DeleteResponse> {
        let sql = formatdoc!(
            "
            delete from {table}
            where partition_key = $1 and id = $2 and ($3::text is null or etag = $3)
            returning nextval($4::regclass) as lsn",
            table = table_name(container),
        );
        let lsn: Option<i64> = sqlx::query_scalar(&sql)
            .bind(partition_key)
            .bind(id)
            .bind(options.if_match.as_deref())
            .bind(sequence_name(container))
            .persistent(self.persistent())
            .fetch_optional(&self.pool)
            .await?;
        match lsn {
            Some(lsn) => Ok(DeleteResponse {
                session_token: Some(lsn.to_string()),
            }),
            None => Err(self.missed_write(container, id, partition_key).await),
        }
    }

    #[instrument(skip(self, container, request), fields(container = %container.id))]
    async fn query_page(
        &self,
        container: &ContainerRef,
        request: QueryRequest<'_>,
    ) -> ClientResult<QueryPage> {
        let offset: i64 = match request.continuation {
            Some(token) => token
                .parse()
                .map_err(|_| ClientError::bad_request("invalid continuation token"))?,
            None => 0,
        };
        let page_size = request.max_item_count.max(1);
        let compiled = compile_parameters(request.definition, 1)?;
        let sql = page_sql(container, &compiled, request.partition_key.is_some());

        let rows = bind_page(
            sqlx::query(&sql),
            compiled.binds,
            request.partition_key,
            i64::from(page_size),
            offset,
        )
        .persistent(self.persistent())
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let Json(value): Json<Value> = row.try_get(0)?;
            items.push(value);
        }
        let continuation =
            (items.len() == page_size as usize).then(|| (offset + i64::from(page_size)).to_string());
        Ok(QueryPage {
            items,
            continuation,
        })
    }

    #[instrument(skip(self, container), fields(container = %container.id))]
    async fn delete_procedure(&self, container: &ContainerRef, id: &str) -> ClientResult<()> {
        self.run_ddl(
            &["procedure", &container.database, &container.id],
            &[format!(
                "drop function {}(text, jsonb)",
                function_name(container, id)
            )],
        )
        .await
    }

    #[instrument(skip(self, container, definition), fields(container = %container.id, procedure = %definition.id))]
    async fn create_procedure(
        &self,
        container: &ContainerRef,
        definition: &ProcedureDefinition,
    ) -> ClientResult<()> {
        if definition.body.contains(PROCEDURE_QUOTE) {
            return Err(ClientError::bad_request(
                "procedure body must not contain the function quote tag",
            ));
        }
        let statement = formatdoc!(
            "
            create or replace function {name}(p_partition_key text, p_args jsonb)
            returns jsonb
            language sql stable
            as {quote}
            with c as (
            {view}
            )
            {body}
            {quote}",
            name = function_name(container, &definition.id),
            quote = PROCEDURE_QUOTE,
            view = container_view(container, Some("p_partition_key")),
            body = definition.body,
        );
        self.run_ddl(
            &["procedure", &container.database, &container.id],
            &[statement],
        )
        .await
    }

    #[instrument(skip(self, container, args, _options), fields(container = %container.id))]
    async fn execute_procedure(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        args: Vec<Value>,
        _options: &RequestOptions,
    ) -> ClientResult<ProcedureResponse> {
        let sql = format!("select {}($1, $2)", function_name(container, id));
        let value: Option<Json<Value>> = sqlx::query_scalar(&sql)
            .bind(partition_key)
            .bind(Json(Value::Array(args)))
            .persistent(self.persistent())
            .fetch_one(&self.pool)
            .await?;
        Ok(ProcedureResponse {
            value: value.map_or(Value::Null, |Json(v)| v),
            session_token: None,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn sqlstate_status(code: &str) -> StatusCode {
    match code {
        // unique_violation
        "23505" => StatusCode::Conflict,
        // undefined_function, undefined_table, invalid_schema_name
        "42883" | "42P01" | "3F000" => StatusCode::NotFound,
        // serialization_failure, deadlock_detected
        "40001" | "40P01" => StatusCode::TooManyRequests,
        c if c.starts_with("28") => StatusCode::Unauthorized,
        c if c.starts_with("42") || c.starts_with("22") => StatusCode::BadRequest,
        c if c.starts_with("53") || c.starts_with("57P") || c.starts_with("08") => {
            StatusCode::ServiceUnavailable
        }
        _ => StatusCode::Internal,
    }
}

impl From<sqlx::Error> for ClientError {
    fn from(err: sqlx::Error) -> Self {
        let status = match &err {
            sqlx::Error::Database(db) => db
                .code()
                .map_or(StatusCode::Internal, |code| sqlstate_status(&code)),
            sqlx::Error::RowNotFound => StatusCode::NotFound,
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => StatusCode::ServiceUnavailable,
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::Configuration(_) => StatusCode::BadRequest,
            _ => StatusCode::Internal,
        };
        ClientError::new(status, err.to_string())
    }
}
