/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::model::{from_ms, to_ms, ActivitySnapshot};
use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Upper bound on ids per `IN (...)` query.
pub const READ_CHUNK: usize = 500;

const SNAPSHOT_COLUMNS: &str =
    "did, handle, display_name, last_post_ms, last_checked_ms, post_count, followers_count, follows_back";

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Clone)]
pub struct AccountCache {
    path: PathBuf,
}

/// Outcome of recording one follower listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowerDiff {
    /// No earlier listing existed for this account.
    pub baseline: bool,
    pub new_followers: Vec<String>,
    pub unfollowed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnfollowerRow {
    pub did: String,
    pub handle: Option<String>,
    pub first_seen_ms: i64,
    pub unfollowed_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerCheckRow {
    pub checked_at_ms: i64,
    pub follower_count: u64,
}

#[derive(Debug, Clone)]
pub struct StatRow {
    pub id: i64,
    pub kind: String,
    pub value: serde_json::Value,
    pub created_at_ms: i64,
}

impl AccountCache {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db dir: {}", parent.display()))?;
        }
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS account_activity (
              did TEXT PRIMARY KEY,
              handle TEXT NOT NULL,
              display_name TEXT NULL,
              last_post_ms INTEGER NOT NULL,
              last_checked_ms INTEGER NOT NULL,
              post_count INTEGER NULL,
              followers_count INTEGER NULL
            );
            CREATE INDEX IF NOT EXISTS idx_account_handle ON account_activity(handle);

            CREATE TABLE IF NOT EXISTS stats (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              kind TEXT NOT NULL,
              value_json TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stats_kind ON stats(kind, created_at_ms DESC);

            CREATE TABLE IF NOT EXISTS follower_snapshots (
              user_did TEXT NOT NULL,
              follower_did TEXT NOT NULL,
              first_seen_ms INTEGER NOT NULL,
              last_seen_ms INTEGER NOT NULL,
              is_current INTEGER NOT NULL DEFAULT 1,
              PRIMARY KEY(user_did, follower_did)
            );
            CREATE INDEX IF NOT EXISTS idx_follower_current
              ON follower_snapshots(user_did, is_current, last_seen_ms DESC);

            CREATE TABLE IF NOT EXISTS follower_checks (
              user_did TEXT PRIMARY KEY,
              checked_at_ms INTEGER NOT NULL,
              follower_count INTEGER NOT NULL
            );
            "#,
        )
        .context("init schema")?;
        ensure_columns(
            &conn,
            "account_activity",
            &[("follows_back", "INTEGER NOT NULL DEFAULT 0")],
        )?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        let _: i64 = conn.query_row("SELECT COUNT(*) FROM account_activity", [], |r| r.get(0))?;
        Ok(())
    }

    pub fn get(&self, did: &str) -> Result<Option<ActivitySnapshot>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM account_activity WHERE did=?1"),
                params![did],
                snapshot_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Bulk read inside one transaction. Missing ids are absent from the map.
    pub fn get_many(&self, dids: &[String]) -> Result<HashMap<String, ActivitySnapshot>> {
        let mut out = HashMap::with_capacity(dids.len());
        if dids.is_empty() {
            return Ok(out);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for chunk in dids.chunks(READ_CHUNK) {
            let sql = format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM account_activity WHERE did IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), snapshot_from_row)?;
            for r in rows {
                let snap = r?;
                out.insert(snap.account_id.clone(), snap);
            }
        }
        tx.commit()?;
        Ok(out)
    }

    /// Writes all snapshots in one transaction. A row is only replaced by a
    /// snapshot checked at the same time or later.
    pub fn upsert_many(&self, snapshots: &[ActivitySnapshot]) -> Result<usize> {
        if snapshots.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO account_activity(did, handle, display_name, last_post_ms, last_checked_ms, post_count, followers_count, follows_back)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(did) DO UPDATE SET
                  handle=excluded.handle,
                  display_name=excluded.display_name,
                  last_post_ms=excluded.last_post_ms,
                  last_checked_ms=excluded.last_checked_ms,
                  post_count=excluded.post_count,
                  followers_count=excluded.followers_count,
                  follows_back=excluded.follows_back
                WHERE excluded.last_checked_ms >= account_activity.last_checked_ms
                "#,
            )?;
            for s in snapshots {
                written += stmt.execute(params![
                    s.account_id,
                    s.handle,
                    s.display_name,
                    to_ms(s.last_post_at),
                    to_ms(s.last_checked_at),
                    s.post_count.map(|v| v as i64),
                    s.follower_count.map(|v| v as i64),
                    s.follows_back as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Replaces the current follower set of `user_did` with `current`.
    /// Followers missing from `current` are kept as unfollowers; a returning
    /// follower becomes current again with a fresh `first_seen`.
    pub fn record_followers(&self, user_did: &str, current: &[String], at_ms: i64) -> Result<FollowerDiff> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let baseline = tx
            .query_row(
                "SELECT 1 FROM follower_checks WHERE user_did=?1",
                params![user_did],
                |_| Ok(()),
            )
            .optional()?
            .is_none();

        let existing = {
            let mut stmt = tx.prepare(
                "SELECT follower_did FROM follower_snapshots WHERE user_did=?1 AND is_current=1",
            )?;
            let rows = stmt.query_map(params![user_did], |r| r.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<HashSet<_>>>()?
        };
        let current_set = current.iter().cloned().collect::<HashSet<_>>();

        let mut unfollowed = existing.difference(&current_set).cloned().collect::<Vec<_>>();
        let mut new_followers = current_set.difference(&existing).cloned().collect::<Vec<_>>();
        unfollowed.sort();
        new_followers.sort();

        {
            let mut gone = tx.prepare(
                "UPDATE follower_snapshots SET is_current=0, last_seen_ms=?3 WHERE user_did=?1 AND follower_did=?2 AND is_current=1",
            )?;
            for did in &unfollowed {
                gone.execute(params![user_did, did, at_ms])?;
            }
            let mut added = tx.prepare(
                r#"
                INSERT INTO follower_snapshots(user_did, follower_did, first_seen_ms, last_seen_ms, is_current)
                VALUES (?1, ?2, ?3, ?3, 1)
                ON CONFLICT(user_did, follower_did) DO UPDATE SET
                  first_seen_ms=excluded.first_seen_ms,
                  last_seen_ms=excluded.last_seen_ms,
                  is_current=1
                "#,
            )?;
            for did in &new_followers {
                added.execute(params![user_did, did, at_ms])?;
            }
        }
        tx.execute(
            "UPDATE follower_snapshots SET last_seen_ms=?2 WHERE user_did=?1 AND is_current=1",
            params![user_did, at_ms],
        )?;
        tx.execute(
            r#"
            INSERT INTO follower_checks(user_did, checked_at_ms, follower_count)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_did) DO UPDATE SET
              checked_at_ms=excluded.checked_at_ms,
              follower_count=excluded.follower_count
            "#,
            params![user_did, at_ms, current_set.len() as i64],
        )?;
        tx.commit()?;
        Ok(FollowerDiff {
            baseline,
            new_followers,
            unfollowed,
        })
    }

    /// Former followers of `user_did`, most recent unfollow first.
    pub fn unfollowers(&self, user_did: &str) -> Result<Vec<UnfollowerRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT f.follower_did, a.handle, f.first_seen_ms, f.last_seen_ms
            FROM follower_snapshots f
            LEFT JOIN account_activity a ON a.did = f.follower_did
            WHERE f.user_did=?1 AND f.is_current=0
            ORDER BY f.last_seen_ms DESC, f.follower_did ASC
            "#,
        )?;
        let rows = stmt.query_map(params![user_did], |r| {
            Ok(UnfollowerRow {
                did: r.get(0)?,
                handle: r.get(1)?,
                first_seen_ms: r.get(2)?,
                unfollowed_at_ms: r.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn last_follower_check(&self, user_did: &str) -> Result<Option<FollowerCheckRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT checked_at_ms, follower_count FROM follower_checks WHERE user_did=?1",
                params![user_did],
                |r| {
                    Ok(FollowerCheckRow {
                        checked_at_ms: r.get(0)?,
                        follower_count: r.get::<_, i64>(1)?.max(0) as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn record_stat(&self, kind: &str, value: &serde_json::Value) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO stats(kind, value_json, created_at_ms) VALUES (?1, ?2, ?3)",
            params![kind, value.to_string(), now_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn latest_stat(&self, kind: &str) -> Result<Option<StatRow>> {
        let conn = self.conn()?;
        let row: Option<(i64, String, String, i64)> = conn
            .query_row(
                "SELECT id, kind, value_json, created_at_ms FROM stats WHERE kind=?1 ORDER BY id DESC LIMIT 1",
                params![kind],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((id, kind, value_json, created_at_ms)) = row else {
            return Ok(None);
        };
        let value = serde_json::from_str(&value_json).unwrap_or(serde_json::Value::Null);
        Ok(Some(StatRow {
            id,
            kind,
            value,
            created_at_ms,
        }))
    }
}

fn snapshot_from_row(r: &Row<'_>) -> rusqlite::Result<ActivitySnapshot> {
    Ok(ActivitySnapshot {
        account_id: r.get(0)?,
        handle: r.get(1)?,
        display_name: r.get(2)?,
        last_post_at: from_ms(r.get(3)?),
        last_checked_at: from_ms(r.get(4)?),
        post_count: r.get::<_, Option<i64>>(5)?.map(|v| v.max(0) as u64),
        follower_count: r.get::<_, Option<i64>>(6)?.map(|v| v.max(0) as u64),
        follows_back: r.get::<_, i64>(7)? != 0,
    })
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(",")
}

fn ensure_columns(conn: &Connection, table: &str, cols: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut existing = std::collections::HashSet::new();
    for r in rows {
        existing.insert(r?);
    }
    for (name, ty) in cols {
        if !existing.contains(*name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {ty}"), [])?;
        }
    }
    Ok(())
}
