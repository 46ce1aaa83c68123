// SQLite persistence for tournament metadata and per-class snapshots.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::collab::TournamentStore;
use crate::model::{Tournament, TournamentClass};

/// SQLite-backed tournament store. Each class is saved as one JSON document
/// keyed by `(tournament_id, class_id)`, so saving after an update rewrites
/// only the class that changed.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tournaments (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS tournament_classes (
                tournament_id TEXT NOT NULL REFERENCES tournaments(id) ON DELETE CASCADE,
                class_id      INTEGER NOT NULL,
                snapshot      TEXT NOT NULL,
                updated_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (tournament_id, class_id)
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ids of every stored tournament, most recently updated first.
    pub fn tournament_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id FROM tournaments ORDER BY updated_at DESC, id")
            .context("failed to prepare tournament_ids query")?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .context("failed to query tournaments")?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context("failed to map tournament rows")?;
        Ok(ids)
    }

    pub fn delete_tournament(&self, tournament_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM tournaments WHERE id = ?1",
            params![tournament_id],
        )
        .context("failed to delete tournament")?;
        Ok(())
    }
}

impl TournamentStore for SqliteStore {
    fn load_tournament(&self, tournament_id: &str) -> Result<Option<Tournament>> {
        let conn = self.conn();
        let header: Option<(String, String)> = conn
            .query_row(
                "SELECT name, description FROM tournaments WHERE id = ?1",
                params![tournament_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to query tournament")?;
        let Some((name, description)) = header else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT class_id, snapshot FROM tournament_classes
                 WHERE tournament_id = ?1 ORDER BY class_id",
            )
            .context("failed to prepare class query")?;
        let rows = stmt
            .query_map(params![tournament_id], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to query tournament classes")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map class rows")?;

        let classes = rows
            .into_iter()
            .map(|(class_id, json)| {
                serde_json::from_str::<TournamentClass>(&json)
                    .with_context(|| format!("failed to deserialize class {class_id}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(Tournament {
            id: tournament_id.to_string(),
            name,
            description,
            classes,
        }))
    }

    fn save_tournament(&self, tournament: &Tournament) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute(
            "INSERT INTO tournaments (id, name, description) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            params![tournament.id, tournament.name, tournament.description],
        )
        .context("failed to save tournament")?;
        tx.execute(
            "DELETE FROM tournament_classes WHERE tournament_id = ?1",
            params![tournament.id],
        )
        .context("failed to clear tournament classes")?;
        for class in &tournament.classes {
            let json = serde_json::to_string(class)
                .with_context(|| format!("failed to serialize class {}", class.id))?;
            tx.execute(
                "INSERT INTO tournament_classes (tournament_id, class_id, snapshot)
                 VALUES (?1, ?2, ?3)",
                params![tournament.id, class.id, json],
            )
            .with_context(|| format!("failed to save class {}", class.id))?;
        }
        tx.commit().context("failed to commit tournament")?;
        Ok(())
    }

    fn save_class(&self, tournament_id: &str, class: &TournamentClass) -> Result<()> {
        let conn = self.conn();
        let json = serde_json::to_string(class)
            .with_context(|| format!("failed to serialize class {}", class.id))?;
        conn.execute(
            "INSERT INTO tournament_classes (tournament_id, class_id, snapshot)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(tournament_id, class_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            params![tournament_id, class.id, json],
        )
        .with_context(|| format!("failed to save class {}", class.id))?;
        conn.execute(
            "UPDATE tournaments SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?1",
            params![tournament_id],
        )
        .context("failed to touch tournament")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
