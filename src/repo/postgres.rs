//! PostgreSQL repository.
//!
//! `canvases.canvas_data` stores the `grid[y][x]` blob as JSONB;
//! `pixel_history` is append-only and read back with `DISTINCT ON` to
//! rebuild the per-cell ledger.

use sqlx::{PgPool, QueryBuilder};

use super::{CanvasMeta, CanvasRepo, RepoError, StoredCanvas};
use crate::grid::{Color, GridSnapshot};
use crate::ledger::{Attribution, PixelEdit};

pub struct PgCanvasRepo {
    pool: PgPool,
}

impl PgCanvasRepo {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type CanvasRow = (String, String, i32, i32, bool, serde_json::Value);

fn corrupt(canvas_id: &str, reason: impl std::fmt::Display) -> RepoError {
    RepoError::Corrupt { canvas_id: canvas_id.to_owned(), reason: reason.to_string() }
}

fn to_i32(canvas_id: &str, value: u32) -> Result<i32, RepoError> {
    i32::try_from(value).map_err(|e| corrupt(canvas_id, e))
}

fn to_u32(canvas_id: &str, value: i32) -> Result<u32, RepoError> {
    u32::try_from(value).map_err(|e| corrupt(canvas_id, e))
}

fn meta_from_row(id: String, name: String, width: i32, height: i32, is_private: bool) -> Result<CanvasMeta, RepoError> {
    let width = to_u32(&id, width)?;
    let height = to_u32(&id, height)?;
    Ok(CanvasMeta { id, name, width, height, is_private })
}

#[async_trait::async_trait]
impl CanvasRepo for PgCanvasRepo {
    async fn load_canvas(&self, canvas_id: &str) -> Result<Option<StoredCanvas>, RepoError> {
        let row = sqlx::query_as::<_, CanvasRow>(
            "SELECT id, name, width, height, is_private, canvas_data FROM canvases WHERE id = $1",
        )
        .bind(canvas_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, name, width, height, is_private, canvas_data)) = row else {
            return Ok(None);
        };
        let snapshot: GridSnapshot = serde_json::from_value(canvas_data).map_err(|e| corrupt(canvas_id, e))?;
        let meta = meta_from_row(id, name, width, height, is_private)?;
        Ok(Some(StoredCanvas { meta, snapshot }))
    }

    async fn load_history(&self, canvas_id: &str) -> Result<Vec<PixelEdit>, RepoError> {
        let rows = sqlx::query_as::<_, (i32, i32, String, String, i64)>(
            "SELECT DISTINCT ON (x, y) x, y, color, username, placed_at
             FROM pixel_history
             WHERE canvas_id = $1
             ORDER BY x, y, placed_at DESC, id DESC",
        )
        .bind(canvas_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(x, y, color, username, placed_at)| {
                Ok(PixelEdit {
                    canvas_id: canvas_id.to_owned(),
                    x: to_u32(canvas_id, x)?,
                    y: to_u32(canvas_id, y)?,
                    attribution: Attribution {
                        username,
                        timestamp: placed_at,
                        color: Color::parse(&color).map_err(|e| corrupt(canvas_id, e))?,
                    },
                })
            })
            .collect()
    }

    async fn insert_canvas(&self, canvas: &StoredCanvas) -> Result<(), RepoError> {
        let meta = &canvas.meta;
        let canvas_data = serde_json::to_value(&canvas.snapshot).map_err(|e| corrupt(&meta.id, e))?;
        sqlx::query(
            "INSERT INTO canvases (id, name, width, height, is_private, canvas_data)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&meta.id)
        .bind(&meta.name)
        .bind(to_i32(&meta.id, meta.width)?)
        .bind(to_i32(&meta.id, meta.height)?)
        .bind(meta.is_private)
        .bind(&canvas_data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_snapshot(&self, canvas_id: &str, snapshot: &GridSnapshot) -> Result<(), RepoError> {
        let canvas_data = serde_json::to_value(snapshot).map_err(|e| corrupt(canvas_id, e))?;
        let result = sqlx::query("UPDATE canvases SET canvas_data = $2, updated_at = now() WHERE id = $1")
            .bind(canvas_id)
            .bind(&canvas_data)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(corrupt(canvas_id, "canvas row missing"));
        }
        Ok(())
    }

    async fn append_history(&self, edits: &[PixelEdit]) -> Result<(), RepoError> {
        if edits.is_empty() {
            return Ok(());
        }
        let mut rows = Vec::with_capacity(edits.len());
        for edit in edits {
            rows.push((to_i32(&edit.canvas_id, edit.x)?, to_i32(&edit.canvas_id, edit.y)?, edit));
        }

        let mut builder = QueryBuilder::new("INSERT INTO pixel_history (canvas_id, x, y, color, username, placed_at) ");
        builder.push_values(rows, |mut b, (x, y, edit)| {
            b.push_bind(&edit.canvas_id)
                .push_bind(x)
                .push_bind(y)
                .push_bind(edit.attribution.color.as_str())
                .push_bind(&edit.attribution.username)
                .push_bind(edit.attribution.timestamp);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn list_community(&self) -> Result<Vec<CanvasMeta>, RepoError> {
        let rows = sqlx::query_as::<_, (String, String, i32, i32, bool)>(
            "SELECT id, name, width, height, is_private FROM canvases WHERE NOT is_private ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, name, width, height, is_private)| meta_from_row(id, name, width, height, is_private))
            .collect()
    }
}
