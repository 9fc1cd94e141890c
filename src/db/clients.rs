use super::{Db, models::Client};
use rusqlite::{OptionalExtension, Result, params};

fn map_client_row(row: &rusqlite::Row<'_>) -> Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        display_name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

impl Db {
    /// Inserts a client. Returns `false` if the id already exists.
    pub fn insert_client(&self, client: &Client) -> Result<bool> {
        let rows = self.conn.execute(
            "INSERT INTO clients (id, display_name, created_at) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING",
            params![client.id, client.display_name, client.created_at],
        )?;
        Ok(rows > 0)
    }

    pub fn get_client(&self, id: &str) -> Result<Option<Client>> {
        self.conn
            .query_row(
                "SELECT id, display_name, created_at FROM clients WHERE id = ?",
                params![id],
                map_client_row,
            )
            .optional()
    }

    /// All clients, ordered by id.
    pub fn list_clients(&self) -> Result<Vec<Client>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, display_name, created_at FROM clients ORDER BY id")?;
        let rows = stmt.query_map([], map_client_row)?;
        rows.collect()
    }
}
