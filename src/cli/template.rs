use super::run::{open_templates, require_config_path};
use crate::config::parse::load_config;
use crate::render::Template;
use crate::storage::TemplateStore;
use chrono::Utc;
use std::path::PathBuf;
use uuid::Uuid;

/// Store a template, generating its id when none is given
pub async fn add(
    config_path: Option<PathBuf>,
    id: Option<String>,
    body: String,
    sender_field: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&require_config_path(config_path))?;
    let store = open_templates(&config).await?;

    let template = Template {
        id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        body,
        sender_field,
        updated_at: Utc::now(),
    };
    store.put_template(&template).await?;

    println!("Template {} saved", template.id);
    Ok(())
}

pub async fn list(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&require_config_path(config_path))?;
    let store = open_templates(&config).await?;

    let templates = store.list_templates().await?;
    println!("{}", serde_json::to_string_pretty(&templates)?);
    Ok(())
}

pub async fn remove(
    config_path: Option<PathBuf>,
    id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&require_config_path(config_path))?;
    let store = open_templates(&config).await?;

    if store.remove_template(&id).await? {
        println!("Template {} removed", id);
        Ok(())
    } else {
        Err(format!("No template with id '{}'", id).into())
    }
}
