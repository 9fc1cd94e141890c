use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Result, params};

use super::Db;
use super::models::{ChatSession, Message, SessionSummary};

fn map_message_row(row: &rusqlite::Row<'_>) -> Result<Message> {
    let sources_json: String = row.get(3)?;
    let sources = serde_json::from_str(&sources_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Message {
        role: row.get(0)?,
        content: row.get(1)?,
        timestamp: row.get(2)?,
        sources,
    })
}

impl Db {
    /// Create or overwrite a session and its full message list in one transaction.
    ///
    /// `created_at` is kept when the session already exists.
    pub fn save_session(
        &mut self,
        client_id: &str,
        session_id: &str,
        title: &str,
        messages: &[Message],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO chat_sessions (client_id, session_id, title, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(client_id, session_id) DO UPDATE SET
                title = excluded.title,
                updated_at = excluded.updated_at
            "#,
            params![client_id, session_id, title, now],
        )?;

        tx.execute(
            "DELETE FROM chat_messages WHERE client_id = ? AND session_id = ?",
            params![client_id, session_id],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO chat_messages (client_id, session_id, ordinal, role, content, created_at, sources) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for (ordinal, message) in messages.iter().enumerate() {
                let sources = serde_json::to_string(&message.sources)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                stmt.execute(params![
                    client_id,
                    session_id,
                    ordinal as i64,
                    message.role.as_str(),
                    message.content,
                    message.timestamp,
                    sources,
                ])?;
            }
        }

        tx.commit()
    }

    /// Append `new` to a session in one transaction.
    ///
    /// A missing session is created first with `title` and `seed` as its
    /// opening messages; an existing one keeps its title and messages.
    pub fn append_exchange(
        &mut self,
        client_id: &str,
        session_id: &str,
        title: &str,
        seed: &[Message],
        new: &[Message],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;

        let created = tx.execute(
            r#"
            INSERT INTO chat_sessions (client_id, session_id, title, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(client_id, session_id) DO NOTHING
            "#,
            params![client_id, session_id, title, now],
        )? > 0;
        if !created {
            tx.execute(
                "UPDATE chat_sessions SET updated_at = ?3 WHERE client_id = ?1 AND session_id = ?2",
                params![client_id, session_id, now],
            )?;
        }

        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(ordinal) + 1, 0) FROM chat_messages WHERE client_id = ? AND session_id = ?",
            params![client_id, session_id],
            |row| row.get(0),
        )?;
        let prefix: &[Message] = if created { seed } else { &[] };
        let messages = prefix.iter().chain(new);

        {
            let mut stmt = tx.prepare(
                "INSERT INTO chat_messages (client_id, session_id, ordinal, role, content, created_at, sources) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for (offset, message) in messages.enumerate() {
                let sources = serde_json::to_string(&message.sources)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                stmt.execute(params![
                    client_id,
                    session_id,
                    next + offset as i64,
                    message.role.as_str(),
                    message.content,
                    message.timestamp,
                    sources,
                ])?;
            }
        }

        tx.commit()
    }

    pub fn load_session(&self, client_id: &str, session_id: &str) -> Result<Option<ChatSession>> {
        let header = self
            .conn
            .query_row(
                "SELECT title, created_at, updated_at FROM chat_sessions WHERE client_id = ? AND session_id = ?",
                params![client_id, session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, DateTime<Utc>>(1)?,
                        row.get::<_, DateTime<Utc>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((title, created_at, updated_at)) = header else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT role, content, created_at, sources FROM chat_messages WHERE client_id = ? AND session_id = ? ORDER BY ordinal",
        )?;
        let messages = stmt
            .query_map(params![client_id, session_id], map_message_row)?
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(ChatSession {
            id: session_id.to_string(),
            client_id: client_id.to_string(),
            title,
            created_at,
            updated_at,
            messages,
        }))
    }

    /// Sessions of a client, most recently updated first.
    pub fn list_sessions(&self, client_id: &str) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT s.session_id, s.title, s.created_at, s.updated_at,
                   (SELECT COUNT(*) FROM chat_messages m
                    WHERE m.client_id = s.client_id AND m.session_id = s.session_id)
            FROM chat_sessions s
            WHERE s.client_id = ?
            ORDER BY s.updated_at DESC, s.session_id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![client_id], |row| {
            Ok(SessionSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
                message_count: row.get::<_, i64>(4)? as usize,
            })
        })?;
        rows.collect()
    }

    /// Deletes a session and its messages. Returns `false` if it did not exist.
    pub fn delete_session(&self, client_id: &str, session_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM chat_sessions WHERE client_id = ? AND session_id = ?",
            params![client_id, session_id],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Client, Role, SourceCitation};
    use chrono::Duration;

    fn db_with_client() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.insert_client(&Client {
            id: "jane_doe".to_string(),
            display_name: "Jane Doe".to_string(),
            created_at: Utc::now(),
        })
        .unwrap();
        db
    }

    #[test]
    fn test_save_and_load_session() {
        let mut db = db_with_client();
        let now = Utc::now();
        let citation = SourceCitation {
            filename: "session1.txt".to_string(),
            chunk_id: "session1.txt#0000".to_string(),
            sequence: 0,
            score: 0.42,
        };
        let messages = vec![
            Message::user("How is sleep?"),
            Message::assistant("Sleep has improved [1].", vec![citation.clone()]),
        ];
        db.save_session("jane_doe", "s1", "How is sleep?", &messages, now)
            .unwrap();

        let session = db.load_session("jane_doe", "s1").unwrap().unwrap();
        assert_eq!(session.title, "How is sleep?");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].sources, vec![citation]);
        assert!(db.load_session("jane_doe", "missing").unwrap().is_none());
    }

    #[test]
    fn test_update_replaces_messages_and_keeps_created_at() {
        let mut db = db_with_client();
        let t0 = Utc::now();
        db.save_session("jane_doe", "s1", "t", &[Message::user("a")], t0)
            .unwrap();
        let t1 = t0 + Duration::seconds(5);
        db.save_session(
            "jane_doe",
            "s1",
            "t",
            &[Message::user("a"), Message::assistant("b", vec![])],
            t1,
        )
        .unwrap();

        let session = db.load_session("jane_doe", "s1").unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.created_at, t0);
        assert_eq!(session.updated_at, t1);
    }

    #[test]
    fn test_append_exchange_creates_then_appends() {
        let mut db = db_with_client();
        let t0 = Utc::now();
        let seed = [Message::user("earlier"), Message::assistant("reply", vec![])];
        let exchange = [Message::user("How is sleep?"), Message::assistant("Better.", vec![])];
        db.append_exchange("jane_doe", "s1", "earlier", &seed, &exchange, t0)
            .unwrap();

        let session = db.load_session("jane_doe", "s1").unwrap().unwrap();
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.messages[2].content, "How is sleep?");

        // Existing session: seed and title are ignored, messages appended
        let t1 = t0 + Duration::seconds(3);
        let more = [Message::user("And mood?"), Message::assistant("Stable.", vec![])];
        db.append_exchange("jane_doe", "s1", "other", &seed, &more, t1)
            .unwrap();
        let session = db.load_session("jane_doe", "s1").unwrap().unwrap();
        assert_eq!(session.title, "earlier");
        assert_eq!(session.messages.len(), 6);
        assert_eq!(session.messages[5].content, "Stable.");
        assert_eq!(session.created_at, t0);
        assert_eq!(session.updated_at, t1);
    }

    #[test]
    fn test_list_newest_first_and_delete() {
        let mut db = db_with_client();
        let t0 = Utc::now();
        db.save_session("jane_doe", "old", "old", &[Message::user("x")], t0)
            .unwrap();
        db.save_session(
            "jane_doe",
            "new",
            "new",
            &[Message::user("x"), Message::user("y")],
            t0 + Duration::seconds(1),
        )
        .unwrap();

        let list = db.list_sessions("jane_doe").unwrap();
        assert_eq!(list[0].id, "new");
        assert_eq!(list[0].message_count, 2);
        assert_eq!(list[1].id, "old");

        assert!(db.delete_session("jane_doe", "old").unwrap());
        assert!(!db.delete_session("jane_doe", "old").unwrap());
        assert_eq!(db.list_sessions("jane_doe").unwrap().len(), 1);

        let orphans: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM chat_messages WHERE session_id = 'old'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
    }
}
