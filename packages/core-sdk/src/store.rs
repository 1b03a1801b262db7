use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

/** \brief 文档主键，插入时分配。 */
pub type DocId = i64;

/** \brief 在 `Filter` 中表示主键的字段名。 */
pub const ID_FIELD: &str = "_id";

/**
 * \brief 集合中的一条文档。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocId,
    pub body: Map<String, Value>,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .with_context(|| format!("decode document {}", self.id))
    }
}

/**
 * \brief 把可序列化结构转成文档正文（必须是 JSON 对象）。
 */
pub fn to_body<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("document body must be an object, got {}", other)),
    }
}

/**
 * \brief 字段相等条件的合取；空过滤器匹配全部文档。
 */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    id: Option<DocId>,
    fields: Vec<(String, Value)>,
    /** \brief 主键条件无法成立（非整数 `_id`），不匹配任何文档。 */
    unsatisfiable: bool,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: DocId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        if field == ID_FIELD {
            match value.as_i64() {
                Some(id) if self.id.is_none() || self.id == Some(id) => self.id = Some(id),
                _ => self.unsatisfiable = true,
            }
        } else {
            self.fields.push((field.to_string(), value));
        }
        self
    }

    fn matches(&self, body: &Map<String, Value>) -> bool {
        !self.unsatisfiable
            && self
                .fields
                .iter()
                .all(|(field, expected)| body.get(field) == Some(expected))
    }
}

/**
 * \brief 更新操作：字段赋值加整数自增，对首个匹配文档原子执行。
 */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    set: Map<String, Value>,
    inc: Vec<(String, i64)>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    /** \brief 整体替换正文中的字段（不会删除未出现的字段）。 */
    pub fn set_all(mut self, body: Map<String, Value>) -> Self {
        self.set.extend(body);
        self
    }

    pub fn inc(mut self, field: &str, by: i64) -> Self {
        self.inc.push((field.to_string(), by));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.inc.is_empty()
    }

    fn apply(&self, body: &mut Map<String, Value>) -> Result<()> {
        for (field, value) in &self.set {
            body.insert(field.clone(), value.clone());
        }
        for (field, by) in &self.inc {
            let current = match body.get(field) {
                None | Some(Value::Null) => 0,
                Some(v) => v
                    .as_i64()
                    .ok_or_else(|| anyhow!("cannot increment non-integer field `{}`", field))?,
            };
            body.insert(field.clone(), Value::from(current + by));
        }
        Ok(())
    }
}

/**
 * \brief 文档存储协作方：按集合名读写 JSON 文档。
 */
pub trait DocumentStore: Send + Sync {
    fn insert(&self, collection: &str, body: Map<String, Value>) -> Result<DocId>;

    /** \brief 按插入顺序返回所有匹配文档。 */
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>>;

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        Ok(self.find(collection, filter)?.into_iter().next())
    }

    /** \brief 返回是否有文档被修改。 */
    fn update_one(&self, collection: &str, filter: &Filter, patch: &Patch) -> Result<bool>;

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool>;

    /**
     * \brief 仅当没有文档匹配 `conflict` 时插入；检查与插入原子执行。冲突时返回 `None`。
     */
    fn insert_unless(
        &self,
        collection: &str,
        conflict: &Filter,
        body: Map<String, Value>,
    ) -> Result<Option<DocId>>;

    /**
     * \brief 仅当除目标文档外没有文档匹配 `conflict` 时更新，原子执行。
     * \details 冲突返回 `None`；`Some(false)` 表示没有匹配 `filter` 的文档。
     */
    fn update_one_unless(
        &self,
        collection: &str,
        filter: &Filter,
        conflict: &Filter,
        patch: &Patch,
    ) -> Result<Option<bool>>;
}

/**
 * \brief 基于 SQLite 单表的文档存储。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 打开（必要时创建）数据库文件并迁移。
     */
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open document store {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate(&conn)?;
        tracing::info!(path = %path.display(), "document store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("document store connection poisoned"))
    }
}

/**
 * \brief 建表；重复执行无副作用。
 */
fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            body TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
        "#,
        )
    })
}

fn select(conn: &Connection, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
    if filter.unsatisfiable {
        return Ok(Vec::new());
    }
    let rows: Vec<(DocId, String)> = match filter.id {
        Some(id) => {
            let mut stmt =
                conn.prepare("SELECT id, body FROM documents WHERE collection=?1 AND id=?2")?;
            let rows = stmt
                .query_map(params![collection, id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            rows
        }
        None => {
            let mut stmt = conn
                .prepare("SELECT id, body FROM documents WHERE collection=?1 ORDER BY id ASC")?;
            let rows = stmt
                .query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            rows
        }
    };

    let mut out = Vec::with_capacity(rows.len());
    for (id, raw) in rows {
        let body: Map<String, Value> = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt document {} in `{}`", id, collection))?;
        if filter.matches(&body) {
            out.push(Document { id, body });
        }
    }
    Ok(out)
}

impl DocumentStore for SqliteStore {
    fn insert(&self, collection: &str, body: Map<String, Value>) -> Result<DocId> {
        let raw = serde_json::to_string(&body)?;
        let conn = self.lock()?;
        let id = retry_on_locked(|| {
            conn.execute(
                "INSERT INTO documents (collection, body) VALUES (?1, ?2)",
                params![collection, raw],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::debug!(collection, id, "document inserted");
        Ok(id)
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        let conn = self.lock()?;
        select(&conn, collection, filter)
    }

    fn update_one(&self, collection: &str, filter: &Filter, patch: &Patch) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut doc) = select(&tx, collection, filter)?.into_iter().next() else {
            return Ok(false);
        };
        patch.apply(&mut doc.body)?;
        let raw = serde_json::to_string(&doc.body)?;
        retry_on_locked(|| {
            tx.execute(
                "UPDATE documents SET body=?1 WHERE id=?2",
                params![raw, doc.id],
            )
        })?;
        tx.commit()?;
        tracing::debug!(collection, id = doc.id, "document updated");
        Ok(true)
    }

    fn insert_unless(
        &self,
        collection: &str,
        conflict: &Filter,
        body: Map<String, Value>,
    ) -> Result<Option<DocId>> {
        let raw = serde_json::to_string(&body)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = select(&tx, collection, conflict)?.first() {
            tracing::debug!(collection, existing = existing.id, "insert skipped on conflict");
            return Ok(None);
        }
        let id = retry_on_locked(|| {
            tx.execute(
                "INSERT INTO documents (collection, body) VALUES (?1, ?2)",
                params![collection, raw],
            )?;
            Ok(tx.last_insert_rowid())
        })?;
        tx.commit()?;
        tracing::debug!(collection, id, "document inserted");
        Ok(Some(id))
    }

    fn update_one_unless(
        &self,
        collection: &str,
        filter: &Filter,
        conflict: &Filter,
        patch: &Patch,
    ) -> Result<Option<bool>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut doc) = select(&tx, collection, filter)?.into_iter().next() else {
            return Ok(Some(false));
        };
        let target = doc.id;
        if select(&tx, collection, conflict)?
            .iter()
            .any(|other| other.id != target)
        {
            return Ok(None);
        }
        patch.apply(&mut doc.body)?;
        let raw = serde_json::to_string(&doc.body)?;
        retry_on_locked(|| {
            tx.execute(
                "UPDATE documents SET body=?1 WHERE id=?2",
                params![raw, target],
            )
        })?;
        tx.commit()?;
        tracing::debug!(collection, id = target, "document updated");
        Ok(Some(true))
    }

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool> {
        let conn = self.lock()?;
        let Some(doc) = select(&conn, collection, filter)?.into_iter().next() else {
            return Ok(false);
        };
        let rows = retry_on_locked(|| {
            conn.execute("DELETE FROM documents WHERE id=?1", params![doc.id])
        })?;
        if rows == 0 {
            bail!("document {} vanished during delete", doc.id);
        }
        tracing::debug!(collection, id = doc.id, "document deleted");
        Ok(true)
    }
}

fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                tracing::debug!(attempt, "database busy, retrying");
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
