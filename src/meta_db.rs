use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::error::Result;

/// Reclamation pass for a committed transaction.
pub const TASK_DELETE_PASS: i64 = 1;

#[derive(Debug, Clone)]
pub struct ObjectRow {
    pub trans_id: i64,
    pub size: i64,
    pub md5sum: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SingleObject {
    pub tkey: Vec<u8>,
    pub trans_id: i64,
    pub size: i64,
    pub md5sum: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct IterObject {
    pub trans_id: i64,
    pub tkey: Vec<u8>,
    pub md5sum: Vec<u8>,
    pub size: i64,
    pub last_modified: i64,
}

/// Row shape used by the mirror catch-up scan; carries the rowid so the
/// worker can flip `mirrored` without re-resolving the key.
#[derive(Debug, Clone)]
pub struct UnmirroredObject {
    pub id: i64,
    pub trans_id: i64,
    pub tkey: Vec<u8>,
    pub md5sum: Vec<u8>,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct DelObject {
    pub trans_id: i64,
    pub tkey: Vec<u8>,
    pub md5sum: Vec<u8>,
    pub size: i64,
    pub mirrored: bool,
}

#[derive(Debug, Clone)]
pub struct TransRow {
    pub id: i64,
    pub completed: i64,
    pub active: i64,
}

#[derive(Debug, Clone)]
pub struct TransProperties {
    pub active: i64,
    pub completed: i64,
    pub cd_id: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SizeInfo {
    pub size: i64,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub task_id: i64,
    pub trans_id: i64,
    pub cd_id: i64,
}

/// Local transactional store of object metadata. One instance wraps one
/// SQLite file; the put path and the background worker each open their own.
#[derive(Clone)]
pub struct MetaDb {
    pool: SqlitePool,
}

impl std::fmt::Debug for MetaDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaDb").finish()
    }
}

fn objects_table(cd_id: i64) -> &'static str {
    if cd_id == 0 {
        "objects"
    } else {
        "objects_cd"
    }
}

fn transactions_table(cd_id: i64) -> &'static str {
    if cd_id == 0 {
        "transactions"
    } else {
        "transactions_cd"
    }
}

impl MetaDb {
    pub async fn open(path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = try_log!(
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(opts)
                .await
        );

        let db = Self { pool };
        db.create_tables().await?;
        Ok(db)
    }

    /// Single in-process database for tests.
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:").expect("static options");
        let pool = try_log!(
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(opts)
                .await
        );
        let db = Self { pool };
        db.create_tables().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_tables(&self) -> Result<()> {
        let stmts = [
            "CREATE TABLE IF NOT EXISTS transactions (id INTEGER PRIMARY KEY, completed INTEGER DEFAULT 0, active INTEGER DEFAULT 1, mirrored INTEGER DEFAULT 0)",
            "CREATE TABLE IF NOT EXISTS transactions_cd (id INTEGER PRIMARY KEY, cd_id INTEGER, completed INTEGER DEFAULT 0, active INTEGER DEFAULT 1, mirrored INTEGER DEFAULT 0)",
            "CREATE TABLE IF NOT EXISTS objects ( trans_id INTEGER, tkey BLOB, size INTEGER, md5sum BLOB, last_modified INTEGER, mirrored INTEGER DEFAULT 0, PRIMARY KEY(tkey, trans_id) )",
            "CREATE TABLE IF NOT EXISTS objects_cd ( cd_id INTEGER, trans_id INTEGER, tkey BLOB, size INTEGER, md5sum BLOB, last_modified INTEGER, mirrored INTEGER DEFAULT 0, PRIMARY KEY(cd_id, tkey, trans_id) )",
            "CREATE INDEX IF NOT EXISTS objects_trans_id_idx ON objects(trans_id)",
            "CREATE INDEX IF NOT EXISTS objects_cd_trans_id_idx ON objects_cd(cd_id, trans_id)",
            "CREATE INDEX IF NOT EXISTS objects_last_modified ON objects(last_modified)",
            "CREATE TABLE IF NOT EXISTS generation ( generation INTEGER )",
            "CREATE TABLE IF NOT EXISTS generation_cd ( cd_id INTEGER PRIMARY KEY, generation INTEGER )",
            "CREATE TABLE IF NOT EXISTS tasks ( id INTEGER PRIMARY KEY AUTOINCREMENT, task_id INTEGER, trans_id INTEGER, cd_id INTEGER DEFAULT 0, active INTEGER DEFAULT 0, created INTEGER)",
            "CREATE TABLE IF NOT EXISTS misc ( key TEXT PRIMARY KEY, value TEXT )",
        ];
        for stmt in stmts {
            try_log!(sqlx::query(stmt).execute(&self.pool).await);
        }
        Ok(())
    }

    // ---- transactions table ----

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn new_transaction(&self, cd_id: i64) -> Result<i64> {
        let res = if cd_id == 0 {
            try_log!(
                sqlx::query("INSERT INTO transactions DEFAULT VALUES")
                    .execute(&self.pool)
                    .await
            )
        } else {
            try_log!(
                sqlx::query("INSERT INTO transactions_cd (cd_id) VALUES (?)")
                    .bind(cd_id)
                    .execute(&self.pool)
                    .await
            )
        };
        Ok(res.last_insert_rowid())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn insert_transaction(&self, cd_id: i64, id: i64) -> Result<()> {
        if cd_id == 0 {
            try_log!(
                sqlx::query("INSERT OR REPLACE INTO transactions (id) VALUES (?)")
                    .bind(id)
                    .execute(&self.pool)
                    .await
            );
        } else {
            try_log!(
                sqlx::query("INSERT OR REPLACE INTO transactions_cd (id, cd_id) VALUES (?, ?)")
                    .bind(id)
                    .bind(cd_id)
                    .execute(&self.pool)
                    .await
            );
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_transaction_active(&self, cd_id: i64, active: i64, id: i64) -> Result<()> {
        if cd_id == 0 {
            try_log!(
                sqlx::query("UPDATE transactions SET active=? WHERE id=?")
                    .bind(active)
                    .bind(id)
                    .execute(&self.pool)
                    .await
            );
        } else {
            try_log!(
                sqlx::query("UPDATE transactions_cd SET active=? WHERE cd_id=? AND id=?")
                    .bind(active)
                    .bind(cd_id)
                    .bind(id)
                    .execute(&self.pool)
                    .await
            );
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_transaction_complete(&self, cd_id: i64, completed: i64, id: i64) -> Result<()> {
        if cd_id == 0 {
            try_log!(
                sqlx::query("UPDATE transactions SET completed=? WHERE id=? AND completed<=?")
                    .bind(completed)
                    .bind(id)
                    .bind(completed)
                    .execute(&self.pool)
                    .await
            );
        } else {
            try_log!(
                sqlx::query(
                    "UPDATE transactions_cd SET completed=? WHERE cd_id=? AND id=? AND completed<=?"
                )
                .bind(completed)
                .bind(cd_id)
                .bind(id)
                .bind(completed)
                .execute(&self.pool)
                .await
            );
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_transaction_mirrored(&self, id: i64) -> Result<()> {
        try_log!(
            sqlx::query("UPDATE transactions SET mirrored=1 WHERE id=?")
                .bind(id)
                .execute(&self.pool)
                .await
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_transaction(&self, cd_id: i64, id: i64) -> Result<()> {
        if cd_id == 0 {
            try_log!(
                sqlx::query("DELETE FROM transactions WHERE id=?")
                    .bind(id)
                    .execute(&self.pool)
                    .await
            );
        } else {
            try_log!(
                sqlx::query("DELETE FROM transactions_cd WHERE cd_id=? AND id=?")
                    .bind(cd_id)
                    .bind(id)
                    .execute(&self.pool)
                    .await
            );
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_transaction_ids(&self, cd_id: i64) -> Result<Vec<TransRow>> {
        let rows = if cd_id == 0 {
            try_log!(
                sqlx::query("SELECT id, completed, active FROM transactions")
                    .fetch_all(&self.pool)
                    .await
            )
        } else {
            try_log!(
                sqlx::query("SELECT id, completed, active FROM transactions_cd WHERE cd_id=?")
                    .bind(cd_id)
                    .fetch_all(&self.pool)
                    .await
            )
        };
        rows.into_iter()
            .map(|r| {
                Ok(TransRow {
                    id: try_log!(r.try_get("id")),
                    completed: try_log!(r.try_get("completed")),
                    active: try_log!(r.try_get("active")),
                })
            })
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_transaction_properties(
        &self,
        cd_id: i64,
        id: i64,
    ) -> Result<Option<TransProperties>> {
        let row = if cd_id == 0 {
            try_log!(
                sqlx::query("SELECT active, completed, 0 AS cd_id FROM transactions WHERE id=?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
            )
        } else {
            try_log!(
                sqlx::query(
                    "SELECT active, completed, cd_id FROM transactions_cd WHERE cd_id=? AND id=?"
                )
                .bind(cd_id)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
            )
        };
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(TransProperties {
            active: try_log!(row.try_get("active")),
            completed: try_log!(row.try_get("completed")),
            cd_id: try_log!(row.try_get("cd_id")),
        }))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn is_transaction_active(&self, cd_id: i64, id: i64) -> Result<bool> {
        let row = if cd_id == 0 {
            try_log!(
                sqlx::query("SELECT id FROM transactions WHERE active=1 AND id=?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
            )
        } else {
            try_log!(
                sqlx::query("SELECT id FROM transactions_cd WHERE active=1 AND cd_id=? AND id=?")
                    .bind(cd_id)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
            )
        };
        Ok(row.is_some())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_max_complete_transaction(&self, cd_id: i64) -> Result<Option<i64>> {
        let row = if cd_id == 0 {
            try_log!(
                sqlx::query("SELECT MAX(id) AS max_id FROM transactions WHERE completed=2")
                    .fetch_one(&self.pool)
                    .await
            )
        } else {
            try_log!(
                sqlx::query(
                    "SELECT MAX(id) AS max_id FROM transactions_cd WHERE completed=2 AND cd_id=?"
                )
                .bind(cd_id)
                .fetch_one(&self.pool)
                .await
            )
        };
        Ok(try_log!(row.try_get("max_id")))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_incomplete_transactions(
        &self,
        cd_id: i64,
        max_active: i64,
    ) -> Result<Vec<i64>> {
        let rows = if cd_id == 0 {
            try_log!(
                sqlx::query("SELECT id FROM transactions WHERE completed=0 OR ( completed=1 AND id>? )")
                    .bind(max_active)
                    .fetch_all(&self.pool)
                    .await
            )
        } else {
            try_log!(
                sqlx::query(
                    "SELECT id FROM transactions_cd WHERE cd_id=? AND (completed=0 OR ( completed=1 AND id>? ))"
                )
                .bind(cd_id)
                .bind(max_active)
                .fetch_all(&self.pool)
                .await
            )
        };
        rows.into_iter().map(|r| Ok(try_log!(r.try_get("id")))).collect()
    }

    /// Transactions below `curr_trans_id` that no object row references
    /// anymore and that are finalized or committed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_deletable_transactions(
        &self,
        cd_id: i64,
        curr_trans_id: i64,
    ) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT id FROM {tt} t WHERE {cd} id<? AND completed!=0 AND NOT EXISTS \
             (SELECT * FROM {ot} WHERE trans_id=t.id)",
            tt = transactions_table(cd_id),
            ot = objects_table(cd_id),
            cd = if cd_id == 0 { "" } else { "cd_id=? AND" },
        );
        let mut q = sqlx::query(&sql);
        if cd_id != 0 {
            q = q.bind(cd_id);
        }
        let rows = try_log!(q.bind(curr_trans_id).fetch_all(&self.pool).await);
        rows.into_iter().map(|r| Ok(try_log!(r.try_get("id")))).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_last_finalized_transactions(
        &self,
        cd_id: i64,
        last_trans_id: i64,
        curr_complete_trans_id: i64,
    ) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT id FROM {tt} WHERE completed=1 AND {cd} id>? AND id<?",
            tt = transactions_table(cd_id),
            cd = if cd_id == 0 { "" } else { "cd_id=? AND" },
        );
        let mut q = sqlx::query(&sql);
        if cd_id != 0 {
            q = q.bind(cd_id);
        }
        let rows = try_log!(
            q.bind(last_trans_id)
                .bind(curr_complete_trans_id)
                .fetch_all(&self.pool)
                .await
        );
        rows.into_iter().map(|r| Ok(try_log!(r.try_get("id")))).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_unmirrored_transactions(&self) -> Result<Vec<TransRow>> {
        let rows = try_log!(
            sqlx::query(
                "SELECT id, completed, active FROM transactions WHERE mirrored=0 AND completed!=0"
            )
            .fetch_all(&self.pool)
            .await
        );
        rows.into_iter()
            .map(|r| {
                Ok(TransRow {
                    id: try_log!(r.try_get("id")),
                    completed: try_log!(r.try_get("completed")),
                    active: try_log!(r.try_get("active")),
                })
            })
            .collect()
    }

    // ---- objects table ----

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add_object(
        &self,
        cd_id: i64,
        trans_id: i64,
        tkey: &[u8],
        md5sum: &[u8],
        size: i64,
        last_modified: i64,
    ) -> Result<()> {
        if cd_id == 0 {
            try_log!(
                sqlx::query(
                    "INSERT OR REPLACE INTO objects (trans_id, tkey, md5sum, size, last_modified) VALUES (?, ?, ?, ?, ?)"
                )
                .bind(trans_id)
                .bind(tkey)
                .bind(md5sum)
                .bind(size)
                .bind(last_modified)
                .execute(&self.pool)
                .await
            );
        } else {
            try_log!(
                sqlx::query(
                    "INSERT OR REPLACE INTO objects_cd (cd_id, trans_id, tkey, md5sum, size, last_modified) VALUES (?, ?, ?, ?, ?, ?)"
                )
                .bind(cd_id)
                .bind(trans_id)
                .bind(tkey)
                .bind(md5sum)
                .bind(size)
                .bind(last_modified)
                .execute(&self.pool)
                .await
            );
        }
        Ok(())
    }

    /// Placeholder row for an in-flight put; md5/size follow via
    /// [`MetaDb::update_object_by_rowid`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add_partial_object(&self, cd_id: i64, trans_id: i64, tkey: &[u8]) -> Result<i64> {
        let res = if cd_id == 0 {
            try_log!(
                sqlx::query("INSERT OR REPLACE INTO objects (trans_id, tkey) VALUES (?, ?)")
                    .bind(trans_id)
                    .bind(tkey)
                    .execute(&self.pool)
                    .await
            )
        } else {
            try_log!(
                sqlx::query("INSERT OR REPLACE INTO objects_cd (cd_id, trans_id, tkey) VALUES (?, ?, ?)")
                    .bind(cd_id)
                    .bind(trans_id)
                    .bind(tkey)
                    .execute(&self.pool)
                    .await
            )
        };
        Ok(res.last_insert_rowid())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add_del_marker_object(&self, cd_id: i64, trans_id: i64, tkey: &[u8]) -> Result<()> {
        if cd_id == 0 {
            try_log!(
                sqlx::query("INSERT OR REPLACE INTO objects (trans_id, tkey, size) VALUES (?, ?, -1)")
                    .bind(trans_id)
                    .bind(tkey)
                    .execute(&self.pool)
                    .await
            );
        } else {
            try_log!(
                sqlx::query(
                    "INSERT OR REPLACE INTO objects_cd (cd_id, trans_id, tkey, size) VALUES (?, ?, ?, -1)"
                )
                .bind(cd_id)
                .bind(trans_id)
                .bind(tkey)
                .execute(&self.pool)
                .await
            );
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn update_object_by_rowid(
        &self,
        cd_id: i64,
        md5sum: &[u8],
        size: i64,
        last_modified: i64,
        rowid: i64,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {ot} SET md5sum=?, size=?, last_modified=? WHERE rowid=?",
            ot = objects_table(cd_id)
        );
        try_log!(
            sqlx::query(&sql)
                .bind(md5sum)
                .bind(size)
                .bind(last_modified)
                .bind(rowid)
                .execute(&self.pool)
                .await
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn update_object_md5sum(
        &self,
        cd_id: i64,
        md5sum: &[u8],
        trans_id: i64,
        tkey: &[u8],
    ) -> Result<()> {
        if cd_id == 0 {
            try_log!(
                sqlx::query("UPDATE objects SET md5sum=? WHERE trans_id=? AND tkey=?")
                    .bind(md5sum)
                    .bind(trans_id)
                    .bind(tkey)
                    .execute(&self.pool)
                    .await
            );
        } else {
            try_log!(
                sqlx::query("UPDATE objects_cd SET md5sum=? WHERE cd_id=? AND trans_id=? AND tkey=?")
                    .bind(md5sum)
                    .bind(cd_id)
                    .bind(trans_id)
                    .bind(tkey)
                    .execute(&self.pool)
                    .await
            );
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_partial_object(&self, cd_id: i64, rowid: i64) -> Result<()> {
        let sql = format!("DELETE FROM {ot} WHERE rowid=?", ot = objects_table(cd_id));
        try_log!(sqlx::query(&sql).bind(rowid).execute(&self.pool).await);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_object(&self, cd_id: i64, trans_id: i64, tkey: &[u8]) -> Result<()> {
        if cd_id == 0 {
            try_log!(
                sqlx::query("DELETE FROM objects WHERE trans_id=? AND tkey=?")
                    .bind(trans_id)
                    .bind(tkey)
                    .execute(&self.pool)
                    .await
            );
        } else {
            try_log!(
                sqlx::query("DELETE FROM objects_cd WHERE cd_id=? AND trans_id=? AND tkey=?")
                    .bind(cd_id)
                    .bind(trans_id)
                    .bind(tkey)
                    .execute(&self.pool)
                    .await
            );
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_object_mirrored(&self, rowid: i64) -> Result<()> {
        try_log!(
            sqlx::query("UPDATE objects SET mirrored=1 WHERE rowid=?")
                .bind(rowid)
                .execute(&self.pool)
                .await
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_all_mirrored(&self, mirrored: bool) -> Result<()> {
        let m = i64::from(mirrored);
        try_log!(
            sqlx::query("UPDATE objects SET mirrored=?")
                .bind(m)
                .execute(&self.pool)
                .await
        );
        try_log!(
            sqlx::query("UPDATE transactions SET mirrored=? WHERE completed!=0")
                .bind(m)
                .execute(&self.pool)
                .await
        );
        Ok(())
    }

    /// Resolves `tkey` to the newest revision at or below `curr_trans_id`
    /// among active transactions. Tombstones resolve like any other row;
    /// the caller maps `size == -1` to "not found".
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_object(
        &self,
        cd_id: i64,
        curr_trans_id: i64,
        tkey: &[u8],
    ) -> Result<Option<ObjectRow>> {
        let row = if cd_id == 0 {
            try_log!(
                sqlx::query(
                    "SELECT trans_id, size, md5sum FROM (objects INNER JOIN transactions ON trans_id=transactions.id) \
                     WHERE trans_id<=? AND tkey=? AND active=1 ORDER BY trans_id DESC LIMIT 1"
                )
                .bind(curr_trans_id)
                .bind(tkey)
                .fetch_optional(&self.pool)
                .await
            )
        } else {
            try_log!(
                sqlx::query(
                    "SELECT trans_id, size, md5sum FROM (objects_cd INNER JOIN transactions_cd ON trans_id=transactions_cd.id) \
                     WHERE objects_cd.cd_id=? AND trans_id<=? AND tkey=? AND active=1 ORDER BY trans_id DESC LIMIT 1"
                )
                .bind(cd_id)
                .bind(curr_trans_id)
                .bind(tkey)
                .fetch_optional(&self.pool)
                .await
            )
        };
        row.map(object_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_object_in_transid(
        &self,
        cd_id: i64,
        trans_id: i64,
        tkey: &[u8],
    ) -> Result<Option<ObjectRow>> {
        let row = if cd_id == 0 {
            try_log!(
                sqlx::query(
                    "SELECT trans_id, size, md5sum FROM objects WHERE trans_id=? AND tkey=? AND size!=-1"
                )
                .bind(trans_id)
                .bind(tkey)
                .fetch_optional(&self.pool)
                .await
            )
        } else {
            try_log!(
                sqlx::query(
                    "SELECT trans_id, size, md5sum FROM objects_cd WHERE cd_id=? AND trans_id=? AND tkey=? AND size!=-1"
                )
                .bind(cd_id)
                .bind(trans_id)
                .bind(tkey)
                .fetch_optional(&self.pool)
                .await
            )
        };
        row.map(object_row).transpose()
    }

    /// Newest live revision strictly below `trans_id`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_lower_transid_object(
        &self,
        cd_id: i64,
        tkey: &[u8],
        trans_id: i64,
    ) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT trans_id FROM {ot} WHERE {cd} tkey=? AND trans_id<? AND size!=-1 \
             ORDER BY trans_id DESC LIMIT 1",
            ot = objects_table(cd_id),
            cd = if cd_id == 0 { "" } else { "cd_id=? AND" },
        );
        let mut q = sqlx::query(&sql);
        if cd_id != 0 {
            q = q.bind(cd_id);
        }
        let row = try_log!(q.bind(tkey).bind(trans_id).fetch_optional(&self.pool).await);
        let Some(row) = row else { return Ok(None) };
        Ok(Some(try_log!(row.try_get("trans_id"))))
    }

    /// Any live row at all; emptiness check.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_single_object(&self) -> Result<Option<SingleObject>> {
        let row = try_log!(
            sqlx::query("SELECT tkey, trans_id, size, md5sum FROM objects WHERE size!=-1 LIMIT 1")
                .fetch_optional(&self.pool)
                .await
        );
        let Some(row) = row else { return Ok(None) };
        Ok(Some(SingleObject {
            tkey: try_log!(row.try_get("tkey")),
            trans_id: try_log!(row.try_get("trans_id")),
            size: try_log!(row.try_get("size")),
            md5sum: md5_col(&row)?,
        }))
    }

    // ---- iteration for scrub/rebuild ----

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_initial_objects(&self) -> Result<Vec<IterObject>> {
        let rows = try_log!(
            sqlx::query(
                "SELECT trans_id, tkey, md5sum, size FROM objects WHERE size!=-1 \
                 ORDER BY tkey ASC, trans_id ASC LIMIT 10000"
            )
            .fetch_all(&self.pool)
            .await
        );
        rows.into_iter().map(|r| iter_object(r, false)).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_iter_objects(&self, tkey: &[u8], trans_id: i64) -> Result<Vec<IterObject>> {
        let rows = try_log!(
            sqlx::query(
                "SELECT trans_id, tkey, md5sum, size FROM (objects INNER JOIN transactions ON trans_id=transactions.id) \
                 WHERE (tkey>? OR (tkey=? AND trans_id>?)) AND size!=-1 AND active!=0 \
                 ORDER BY tkey ASC, trans_id ASC LIMIT 10000"
            )
            .bind(tkey)
            .bind(tkey)
            .bind(trans_id)
            .fetch_all(&self.pool)
            .await
        );
        rows.into_iter().map(|r| iter_object(r, false)).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_initial_objects_lm(&self) -> Result<Vec<IterObject>> {
        let rows = try_log!(
            sqlx::query(
                "SELECT trans_id, tkey, md5sum, size, last_modified FROM objects WHERE size!=-1 \
                 ORDER BY last_modified ASC LIMIT 10000"
            )
            .fetch_all(&self.pool)
            .await
        );
        rows.into_iter().map(|r| iter_object(r, true)).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_iter_objects_lm(
        &self,
        last_modified_start: i64,
        last_modified_stop: Option<i64>,
    ) -> Result<Vec<IterObject>> {
        let rows = match last_modified_stop {
            None => try_log!(
                sqlx::query(
                    "SELECT trans_id, tkey, md5sum, size, last_modified FROM (objects INNER JOIN transactions ON trans_id=transactions.id) \
                     WHERE last_modified>=? AND size!=-1 AND active!=0 ORDER BY last_modified ASC LIMIT 10000"
                )
                .bind(last_modified_start)
                .fetch_all(&self.pool)
                .await
            ),
            Some(stop) => try_log!(
                sqlx::query(
                    "SELECT trans_id, tkey, md5sum, size, last_modified FROM (objects INNER JOIN transactions ON trans_id=transactions.id) \
                     WHERE last_modified>? AND size!=-1 AND active!=0 AND last_modified<? ORDER BY last_modified ASC LIMIT 10000"
                )
                .bind(last_modified_start)
                .bind(stop)
                .fetch_all(&self.pool)
                .await
            ),
        };
        rows.into_iter().map(|r| iter_object(r, true)).collect()
    }

    // ---- size queries ----

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_size(&self) -> Result<SizeInfo> {
        let row = try_log!(
            sqlx::query(
                "SELECT SUM(size) AS size, COUNT(size) AS count FROM (objects INNER JOIN transactions ON trans_id=transactions.id) \
                 WHERE size!=-1 AND active!=0"
            )
            .fetch_one(&self.pool)
            .await
        );
        Ok(SizeInfo {
            size: try_log!(row.try_get::<Option<i64>, _>("size")).unwrap_or(0),
            count: try_log!(row.try_get::<Option<i64>, _>("count")).unwrap_or(0),
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_size_partial(&self, tkey: &[u8], trans_id: i64) -> Result<i64> {
        let row = try_log!(
            sqlx::query(
                "SELECT SUM(size) AS size FROM objects WHERE size!=-1 AND (tkey>? OR (tkey=? AND trans_id>?))"
            )
            .bind(tkey)
            .bind(tkey)
            .bind(trans_id)
            .fetch_one(&self.pool)
            .await
        );
        Ok(try_log!(row.try_get::<Option<i64>, _>("size")).unwrap_or(0))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_size_partial_lm(&self, start: i64, stop: Option<i64>) -> Result<i64> {
        let row = match stop {
            None => try_log!(
                sqlx::query(
                    "SELECT SUM(size) AS size FROM (objects INNER JOIN transactions ON trans_id=transactions.id) \
                     WHERE size!=-1 AND last_modified>=? AND active!=0"
                )
                .bind(start)
                .fetch_one(&self.pool)
                .await
            ),
            Some(stop) => try_log!(
                sqlx::query(
                    "SELECT SUM(size) AS size FROM (objects INNER JOIN transactions ON trans_id=transactions.id) \
                     WHERE size!=-1 AND last_modified>? AND last_modified<? AND active!=0"
                )
                .bind(start)
                .bind(stop)
                .fetch_one(&self.pool)
                .await
            ),
        };
        Ok(try_log!(row.try_get::<Option<i64>, _>("size")).unwrap_or(0))
    }

    // ---- reclamation helpers ----

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_transaction_objects(&self, cd_id: i64, trans_id: i64) -> Result<Vec<DelObject>> {
        let sql = format!(
            "SELECT trans_id, tkey, md5sum, size, mirrored FROM {ot} WHERE {cd} trans_id=? AND size != -1 ORDER BY tkey ASC",
            ot = objects_table(cd_id),
            cd = if cd_id == 0 { "" } else { "cd_id=? AND" },
        );
        let mut q = sqlx::query(&sql);
        if cd_id != 0 {
            q = q.bind(cd_id);
        }
        let rows = try_log!(q.bind(trans_id).fetch_all(&self.pool).await);
        rows.into_iter().map(del_object).collect()
    }

    /// Rows in transactions below `curr_trans_id` superseded by a row of
    /// the same `tkey` in `curr_trans_id`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_deletable_objects(
        &self,
        cd_id: i64,
        curr_trans_id: i64,
        ordered: bool,
    ) -> Result<Vec<DelObject>> {
        let order = if ordered {
            "ORDER BY trans_id ASC, tkey ASC"
        } else {
            "ORDER BY tkey ASC"
        };
        let sql = format!(
            "SELECT trans_id, tkey, md5sum, size, mirrored FROM {ot} WHERE {cd} trans_id<? AND \
             tkey IN (SELECT tkey FROM {ot} WHERE trans_id=?) AND size != -1 {order}",
            ot = objects_table(cd_id),
            cd = if cd_id == 0 { "" } else { "cd_id=? AND" },
        );
        let mut q = sqlx::query(&sql);
        if cd_id != 0 {
            q = q.bind(cd_id);
        }
        let rows = try_log!(
            q.bind(curr_trans_id)
                .bind(curr_trans_id)
                .fetch_all(&self.pool)
                .await
        );
        rows.into_iter().map(del_object).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_deletable_objects(&self, cd_id: i64, curr_trans_id: i64) -> Result<()> {
        let sql = format!(
            "DELETE FROM {ot} WHERE {cd} trans_id<? AND tkey IN (SELECT tkey FROM {ot} WHERE trans_id=?)",
            ot = objects_table(cd_id),
            cd = if cd_id == 0 { "" } else { "cd_id=? AND" },
        );
        let mut q = sqlx::query(&sql);
        if cd_id != 0 {
            q = q.bind(cd_id);
        }
        try_log!(
            q.bind(curr_trans_id)
                .bind(curr_trans_id)
                .execute(&self.pool)
                .await
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_transaction_objects(&self, cd_id: i64, trans_id: i64) -> Result<()> {
        let sql = format!(
            "DELETE FROM {ot} WHERE {cd} trans_id=?",
            ot = objects_table(cd_id),
            cd = if cd_id == 0 { "" } else { "cd_id=? AND" },
        );
        let mut q = sqlx::query(&sql);
        if cd_id != 0 {
            q = q.bind(cd_id);
        }
        try_log!(q.bind(trans_id).execute(&self.pool).await);
        Ok(())
    }

    // ---- generation ----

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn insert_generation(&self, generation: i64) -> Result<()> {
        try_log!(
            sqlx::query("INSERT INTO generation (generation) VALUES (?)")
                .bind(generation)
                .execute(&self.pool)
                .await
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn update_generation(&self, generation: i64) -> Result<()> {
        try_log!(
            sqlx::query("UPDATE generation SET generation=?")
                .bind(generation)
                .execute(&self.pool)
                .await
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_generation(&self, cd_id: i64) -> Result<Option<i64>> {
        let row = if cd_id == 0 {
            try_log!(
                sqlx::query("SELECT generation FROM generation")
                    .fetch_optional(&self.pool)
                    .await
            )
        } else {
            try_log!(
                sqlx::query("SELECT generation FROM generation_cd WHERE cd_id=?")
                    .bind(cd_id)
                    .fetch_optional(&self.pool)
                    .await
            )
        };
        let Some(row) = row else { return Ok(None) };
        Ok(Some(try_log!(row.try_get("generation"))))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn update_generation_cd(&self, cd_id: i64, generation: i64) -> Result<()> {
        try_log!(
            sqlx::query("INSERT OR REPLACE INTO generation_cd (cd_id, generation) VALUES (?, ?)")
                .bind(cd_id)
                .bind(generation)
                .execute(&self.pool)
                .await
        );
        Ok(())
    }

    // ---- tasks queue ----

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add_task(
        &self,
        task_id: i64,
        trans_id: i64,
        created: i64,
        cd_id: i64,
    ) -> Result<()> {
        try_log!(
            sqlx::query("INSERT INTO tasks (task_id, trans_id, created, cd_id) VALUES (?, ?, ?, ?)")
                .bind(task_id)
                .bind(trans_id)
                .bind(created)
                .bind(cd_id)
                .execute(&self.pool)
                .await
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_task(&self, created_max: i64) -> Result<Option<TaskRow>> {
        let row = try_log!(
            sqlx::query(
                "SELECT id, task_id, trans_id, cd_id FROM tasks WHERE created<=? OR created IS NULL \
                 ORDER BY id ASC LIMIT 1"
            )
            .bind(created_max)
            .fetch_optional(&self.pool)
            .await
        );
        row.map(task_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_active_task(&self) -> Result<Option<TaskRow>> {
        let row = try_log!(
            sqlx::query(
                "SELECT id, task_id, trans_id, cd_id FROM tasks WHERE active!=0 ORDER BY id ASC LIMIT 1"
            )
            .fetch_optional(&self.pool)
            .await
        );
        row.map(task_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_tasks(&self, created_max: i64, task_id: i64, cd_id: i64) -> Result<Vec<TaskRow>> {
        let rows = try_log!(
            sqlx::query(
                "SELECT id, task_id, trans_id, cd_id FROM tasks WHERE (created<=? OR created IS NULL) \
                 AND task_id=? AND cd_id=? ORDER BY id ASC"
            )
            .bind(created_max)
            .bind(task_id)
            .bind(cd_id)
            .fetch_all(&self.pool)
            .await
        );
        rows.into_iter().map(task_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_task_active(&self, id: i64) -> Result<()> {
        try_log!(
            sqlx::query("UPDATE tasks SET active=1 WHERE id=?")
                .bind(id)
                .execute(&self.pool)
                .await
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn clear_active_tasks(&self) -> Result<()> {
        try_log!(sqlx::query("UPDATE tasks SET active=0").execute(&self.pool).await);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove_task(&self, id: i64) -> Result<()> {
        try_log!(sqlx::query("DELETE FROM tasks WHERE id=?").bind(id).execute(&self.pool).await);
        Ok(())
    }

    /// Seeds a deletion pass for every reclaimable transaction that does
    /// not already have one queued.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn insert_all_deletion_tasks(&self) -> Result<()> {
        try_log!(
            sqlx::query(
                "INSERT INTO tasks(task_id, trans_id, created) \
                 SELECT 1 AS task_id, id AS trans_id, 0 AS created FROM transactions a \
                 WHERE (completed = 2 OR (completed = 1 AND EXISTS \
                    ( SELECT * FROM transactions b WHERE b.id>a.id AND b.completed = 2 )) ) \
                 AND NOT EXISTS (SELECT * FROM tasks t WHERE t.task_id=1 AND t.trans_id=a.id) \
                 ORDER BY id ASC"
            )
            .execute(&self.pool)
            .await
        );
        Ok(())
    }

    // ---- misc ----

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_misc_value(&self, key: &str) -> Result<Option<String>> {
        let row = try_log!(
            sqlx::query("SELECT value FROM misc WHERE key=?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
        );
        let Some(row) = row else { return Ok(None) };
        Ok(Some(try_log!(row.try_get("value"))))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_misc_value(&self, key: &str, value: &str) -> Result<()> {
        try_log!(
            sqlx::query("INSERT OR REPLACE INTO misc (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await
        );
        Ok(())
    }

    // ---- mirror ----

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_unmirrored_objects(&self) -> Result<Vec<UnmirroredObject>> {
        let rows = try_log!(
            sqlx::query(
                "SELECT objects.rowid AS id, trans_id, tkey, md5sum, size FROM \
                 (objects INNER JOIN transactions ON trans_id=transactions.id) \
                 WHERE size!=-1 AND active!=0 AND objects.mirrored=0 AND transactions.completed!=0 \
                 AND transactions.active!=0 ORDER BY last_modified ASC LIMIT 1000"
            )
            .fetch_all(&self.pool)
            .await
        );
        rows.into_iter()
            .map(|r| {
                Ok(UnmirroredObject {
                    id: try_log!(r.try_get("id")),
                    trans_id: try_log!(r.try_get("trans_id")),
                    tkey: try_log!(r.try_get("tkey")),
                    md5sum: md5_col(&r)?,
                    size: try_log!(r.try_get::<Option<i64>, _>("size")).unwrap_or(0),
                })
            })
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn has_unmirrored_objects(&self, trans_id: i64) -> Result<bool> {
        let row = try_log!(
            sqlx::query("SELECT rowid FROM objects WHERE trans_id=? AND mirrored=0 AND size!=-1 LIMIT 1")
                .bind(trans_id)
                .fetch_optional(&self.pool)
                .await
        );
        Ok(row.is_some())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_unmirrored_objects_size(&self) -> Result<SizeInfo> {
        let row = try_log!(
            sqlx::query(
                "SELECT SUM(size) AS size, COUNT(size) AS count FROM \
                 (objects INNER JOIN transactions ON trans_id=transactions.id) \
                 WHERE size!=-1 AND active!=0 AND objects.mirrored=0 AND transactions.completed!=0"
            )
            .fetch_one(&self.pool)
            .await
        );
        Ok(SizeInfo {
            size: try_log!(row.try_get::<Option<i64>, _>("size")).unwrap_or(0),
            count: try_log!(row.try_get::<Option<i64>, _>("count")).unwrap_or(0),
        })
    }
}

fn md5_col(row: &sqlx::sqlite::SqliteRow) -> Result<Vec<u8>> {
    Ok(try_log!(row.try_get::<Option<Vec<u8>>, _>("md5sum")).unwrap_or_default())
}

fn object_row(row: sqlx::sqlite::SqliteRow) -> Result<ObjectRow> {
    Ok(ObjectRow {
        trans_id: try_log!(row.try_get("trans_id")),
        size: try_log!(row.try_get::<Option<i64>, _>("size")).unwrap_or(0),
        md5sum: md5_col(&row)?,
    })
}

fn task_row(row: sqlx::sqlite::SqliteRow) -> Result<TaskRow> {
    Ok(TaskRow {
        id: try_log!(row.try_get("id")),
        task_id: try_log!(row.try_get("task_id")),
        trans_id: try_log!(row.try_get("trans_id")),
        cd_id: try_log!(row.try_get("cd_id")),
    })
}

fn del_object(row: sqlx::sqlite::SqliteRow) -> Result<DelObject> {
    Ok(DelObject {
        trans_id: try_log!(row.try_get("trans_id")),
        tkey: try_log!(row.try_get("tkey")),
        md5sum: md5_col(&row)?,
        size: try_log!(row.try_get::<Option<i64>, _>("size")).unwrap_or(0),
        mirrored: try_log!(row.try_get::<i64, _>("mirrored")) != 0,
    })
}

fn iter_object(row: sqlx::sqlite::SqliteRow, with_last_modified: bool) -> Result<IterObject> {
    Ok(IterObject {
        trans_id: try_log!(row.try_get("trans_id")),
        tkey: try_log!(row.try_get("tkey")),
        md5sum: md5_col(&row)?,
        size: try_log!(row.try_get::<Option<i64>, _>("size")).unwrap_or(0),
        last_modified: if with_last_modified {
            try_log!(row.try_get::<Option<i64>, _>("last_modified")).unwrap_or(0)
        } else {
            0
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transaction_lifecycle() {
        let db = MetaDb::open_memory().await.unwrap();

        let t1 = db.new_transaction(0).await.unwrap();
        assert_eq!(t1, 1);
        assert!(db.is_transaction_active(0, t1).await.unwrap());
        assert_eq!(db.get_max_complete_transaction(0).await.unwrap(), None);

        db.set_transaction_complete(0, 2, t1).await.unwrap();
        assert_eq!(db.get_max_complete_transaction(0).await.unwrap(), Some(t1));

        // completed only moves forward
        db.set_transaction_complete(0, 1, t1).await.unwrap();
        let props = db.get_transaction_properties(0, t1).await.unwrap().unwrap();
        assert_eq!(props.completed, 2);
    }

    #[tokio::test]
    async fn object_resolution_prefers_newest_active() {
        let db = MetaDb::open_memory().await.unwrap();
        let t1 = db.new_transaction(0).await.unwrap();
        let t2 = db.new_transaction(0).await.unwrap();

        db.add_object(0, t1, b"a", &[1u8; 16], 5, 100).await.unwrap();
        db.add_object(0, t2, b"a", &[2u8; 16], 6, 200).await.unwrap();

        let got = db.get_object(0, t2, b"a").await.unwrap().unwrap();
        assert_eq!(got.trans_id, t2);
        assert_eq!(got.md5sum, vec![2u8; 16]);

        // a reader pinned below t2 sees the older revision
        let got = db.get_object(0, t1, b"a").await.unwrap().unwrap();
        assert_eq!(got.trans_id, t1);

        // deactivating t2 hides its revision
        db.set_transaction_active(0, 0, t2).await.unwrap();
        let got = db.get_object(0, t2, b"a").await.unwrap().unwrap();
        assert_eq!(got.trans_id, t1);
    }

    #[tokio::test]
    async fn tombstone_rows_resolve_with_negative_size() {
        let db = MetaDb::open_memory().await.unwrap();
        let t1 = db.new_transaction(0).await.unwrap();
        let t2 = db.new_transaction(0).await.unwrap();

        db.add_object(0, t1, b"k", &[9u8; 16], 3, 10).await.unwrap();
        db.add_del_marker_object(0, t2, b"k").await.unwrap();

        let got = db.get_object(0, t2, b"k").await.unwrap().unwrap();
        assert_eq!(got.size, -1);
        let got = db.get_object(0, t1, b"k").await.unwrap().unwrap();
        assert_eq!(got.size, 3);
    }

    #[tokio::test]
    async fn deletable_objects_and_transactions() {
        let db = MetaDb::open_memory().await.unwrap();
        let t1 = db.new_transaction(0).await.unwrap();
        let t2 = db.new_transaction(0).await.unwrap();

        db.add_object(0, t1, b"a", &[1u8; 16], 1, 1).await.unwrap();
        db.add_object(0, t1, b"only-old", &[1u8; 16], 1, 1).await.unwrap();
        db.add_object(0, t2, b"a", &[2u8; 16], 2, 2).await.unwrap();
        db.set_transaction_complete(0, 2, t1).await.unwrap();
        db.set_transaction_complete(0, 2, t2).await.unwrap();

        let deletable = db.get_deletable_objects(0, t2, false).await.unwrap();
        assert_eq!(deletable.len(), 1);
        assert_eq!(deletable[0].tkey, b"a");
        assert_eq!(deletable[0].trans_id, t1);

        db.delete_deletable_objects(0, t2).await.unwrap();
        assert!(db.get_deletable_objects(0, t2, false).await.unwrap().is_empty());

        // t1 still owns "only-old", so it is not deletable yet
        assert!(db.get_deletable_transactions(0, t2).await.unwrap().is_empty());
        db.delete_transaction_objects(0, t1).await.unwrap();
        assert_eq!(db.get_deletable_transactions(0, t2).await.unwrap(), vec![t1]);
    }

    #[tokio::test]
    async fn deletion_task_seeding_skips_queued() {
        let db = MetaDb::open_memory().await.unwrap();
        let t1 = db.new_transaction(0).await.unwrap();
        let t2 = db.new_transaction(0).await.unwrap();
        db.set_transaction_complete(0, 1, t1).await.unwrap();
        db.set_transaction_complete(0, 2, t2).await.unwrap();

        db.insert_all_deletion_tasks().await.unwrap();
        let tasks = db.get_tasks(i64::MAX, TASK_DELETE_PASS, 0).await.unwrap();
        assert_eq!(tasks.len(), 2);

        // idempotent
        db.insert_all_deletion_tasks().await.unwrap();
        assert_eq!(db.get_tasks(i64::MAX, TASK_DELETE_PASS, 0).await.unwrap().len(), 2);

        db.remove_task(tasks[0].id).await.unwrap();
        assert_eq!(db.get_tasks(i64::MAX, TASK_DELETE_PASS, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tenant_tables_are_disjoint() {
        let db = MetaDb::open_memory().await.unwrap();
        let t = db.new_transaction(7).await.unwrap();
        db.add_object(7, t, b"x", &[3u8; 16], 9, 1).await.unwrap();

        assert!(db.get_object(0, t, b"x").await.unwrap().is_none());
        let got = db.get_object(7, t, b"x").await.unwrap().unwrap();
        assert_eq!(got.size, 9);
    }

    #[tokio::test]
    async fn misc_and_generation() {
        let db = MetaDb::open_memory().await.unwrap();
        assert!(db.get_misc_value("cursor").await.unwrap().is_none());
        db.set_misc_value("cursor", "abc").await.unwrap();
        assert_eq!(db.get_misc_value("cursor").await.unwrap().unwrap(), "abc");

        db.insert_generation(1).await.unwrap();
        db.update_generation(5).await.unwrap();
        assert_eq!(db.get_generation(0).await.unwrap(), Some(5));

        db.update_generation_cd(3, 11).await.unwrap();
        assert_eq!(db.get_generation(3).await.unwrap(), Some(11));
    }
}
