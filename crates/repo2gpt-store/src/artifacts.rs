use rusqlite::{Connection, OptionalExtension};

use repo2gpt_core::ids::JobId;
use repo2gpt_core::job::Chunk;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Name under which the repomap text is stored.
pub const REPOMAP_ARTIFACT: &str = "repomap.txt";

pub fn insert_artifact(
    conn: &Connection,
    job_id: &JobId,
    name: &str,
    content: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO job_artifacts (job_id, name, content) VALUES (?1, ?2, ?3)",
        rusqlite::params![job_id.as_str(), name, content],
    )?;
    Ok(())
}

pub fn insert_chunk(conn: &Connection, job_id: &JobId, chunk: &Chunk) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO job_chunks (job_id, idx, token_count, files, content)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            job_id.as_str(),
            chunk.index as i64,
            chunk.token_count as i64,
            serde_json::to_string(&chunk.files)?,
            chunk.content,
        ],
    )?;
    Ok(())
}

pub struct ArtifactRepo {
    db: Database,
}

impl ArtifactRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, job_id: &JobId, name: &str) -> Result<String, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT content FROM job_artifacts WHERE job_id = ?1 AND name = ?2",
                [job_id.as_str(), name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("artifact {name} for job {job_id}")))
        })
    }

    /// Chunks in index order.
    pub fn chunks(&self, job_id: &JobId) -> Result<Vec<Chunk>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT idx, token_count, files, content FROM job_chunks
                 WHERE job_id = ?1 ORDER BY idx ASC",
            )?;
            let mut rows = stmt.query([job_id.as_str()])?;
            let mut chunks = Vec::new();
            while let Some(row) = rows.next()? {
                const T: &str = "job_chunks";
                let idx: i64 = row_helpers::get(row, 0, T, "idx")?;
                let tokens: i64 = row_helpers::get(row, 1, T, "token_count")?;
                let files: String = row_helpers::get(row, 2, T, "files")?;
                chunks.push(Chunk {
                    index: idx as usize,
                    token_count: tokens as u64,
                    files: row_helpers::parse_json(&files, T, "files")?,
                    content: row_helpers::get(row, 3, T, "content")?,
                });
            }
            Ok(chunks)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::insert_job;
    use repo2gpt_core::job::JobRequest;
    use repo2gpt_core::source::SourceSpec;

    #[test]
    fn chunks_come_back_in_index_order() {
        let db = Database::in_memory().unwrap();
        let id = JobId::new();
        db.transaction(|c| {
            insert_job(c, &id, &JobRequest::new(SourceSpec::Local { path: "/r".into() }))?;
            for index in [1usize, 0] {
                insert_chunk(
                    c,
                    &id,
                    &Chunk {
                        index,
                        token_count: 10,
                        files: vec![format!("f{index}.py")],
                        content: format!("chunk {index}"),
                    },
                )?;
            }
            insert_artifact(c, &id, REPOMAP_ARTIFACT, "repo\n")
        })
        .unwrap();

        let repo = ArtifactRepo::new(db);
        let chunks = repo.chunks(&id).unwrap();
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(chunks[1].files, vec!["f1.py".to_string()]);
        assert_eq!(repo.get(&id, REPOMAP_ARTIFACT).unwrap(), "repo\n");
        assert!(matches!(
            repo.get(&id, "missing"),
            Err(StoreError::NotFound(_))
        ));
    }
}
