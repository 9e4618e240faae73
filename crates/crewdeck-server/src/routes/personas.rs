use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use crewdeck_store::queries::persona;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::run_blocking;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterPersonaBody {
    pub name: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// `POST /api/personas/register`: 201 with `{slug, id, path}`.
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterPersonaBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let Some(name) = body.name.filter(|n| !n.trim().is_empty()) else {
        return Err(Error::Validation("name is required".to_string()));
    };
    let Some(role) = body.role.filter(|r| !r.trim().is_empty()) else {
        return Err(Error::Validation("role is required".to_string()));
    };
    let slug = slugify(&name);

    let storage = state.storage.clone();
    let description = body.description.clone();
    let slug_for_insert = slug.clone();
    let id = run_blocking(move || {
        let db = storage.connect()?;
        if persona::get_by_slug(db.conn(), &slug_for_insert)?.is_some() {
            return Err(Error::Domain(format!("persona {slug_for_insert} already exists")));
        }
        let role_id = persona::ensure_role(db.conn(), None, role.trim())?;
        Ok(persona::insert_persona(
            db.conn(),
            role_id,
            &slug_for_insert,
            name.trim(),
            description.as_deref(),
            Utc::now(),
        )?)
    })
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "slug": slug,
            "id": id,
            "path": format!("personas/{slug}/skill.md"),
        })),
    ))
}

/// `GET /api/personas/active`, sorted by `(role, name)`.
pub async fn active(State(state): State<AppState>) -> Result<Json<Vec<Value>>> {
    let storage = state.storage.clone();
    let personas = run_blocking(move || {
        let db = storage.connect()?;
        Ok(persona::list_active(db.conn())?)
    })
    .await?;

    Ok(Json(
        personas
            .into_iter()
            .map(|(record, role_name)| {
                json!({
                    "id": record.id,
                    "slug": record.slug,
                    "name": record.name,
                    "role": role_name,
                    "description": record.description,
                })
            })
            .collect(),
    ))
}

fn slugify(name: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in name.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}
