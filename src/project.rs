use crate::error::ProjectError;
use crate::model::{Character, SeriesPrompt, Setting, TeamMember, WorkItem};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use uuid::Uuid;

/// Full wizard state: everything needed to resume a run on another machine,
/// including per-item status and attribution so already-successful items
/// are skipped after a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProjectState {
    #[serde(default)]
    pub current_step: u8,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub setting: Option<Setting>,
    #[serde(default)]
    pub context_prompt: String,
    #[serde(default)]
    pub context_preview: Option<WorkItem>,
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub series_prompts: Vec<SeriesPrompt>,
    #[serde(default)]
    pub series_images: Vec<WorkItem>,
    #[serde(default)]
    pub video_prompts: Vec<String>,
    #[serde(default)]
    pub thumbnail_topic: String,
    #[serde(default)]
    pub thumbnail: Option<WorkItem>,
    #[serde(default)]
    pub team_members: Vec<TeamMember>,
    #[serde(default)]
    pub active_member_id: Option<Uuid>,
}

impl ProjectState {
    pub fn new() -> Self {
        let member = TeamMember::new("Member 1");
        Self {
            current_step: 1,
            team_members: vec![member.clone()],
            active_member_id: Some(member.id),
            ..Default::default()
        }
    }

    pub fn active_member_name(&self) -> Option<&str> {
        let id = self.active_member_id?;
        self.team_members
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SaveMetadata {
    #[serde(default)]
    pub saved_by: String,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

/// Save-file envelope: metadata plus the full state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub metadata: SaveMetadata,
    pub app_state: ProjectState,
}

/// Serialize the project to a gzip-compressed JSON snapshot.
pub fn serialize(state: &ProjectState, saved_by: &str) -> anyhow::Result<Vec<u8>> {
    let file = ProjectFile {
        metadata: SaveMetadata {
            saved_by: saved_by.to_string(),
            saved_at: Some(Utc::now()),
        },
        app_state: state.clone(),
    };
    let json = serde_json::to_vec_pretty(&file)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Parse a snapshot. Accepts gzip-compressed bytes, falling back to plain
/// UTF-8 JSON before declaring the file corrupt, and accepts both the
/// envelope form and a bare state. Fails with `InvalidFormat` when the
/// anchor script field or the step indicator is missing; the caller's
/// in-memory state is untouched in that case.
pub fn deserialize(bytes: &[u8]) -> Result<ProjectFile, ProjectError> {
    let text = match gunzip(bytes) {
        Ok(text) => text,
        Err(_) => String::from_utf8(bytes.to_vec())
            .map_err(|_| ProjectError::InvalidFormat("neither gzip nor UTF-8 text".to_string()))?,
    };

    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| ProjectError::InvalidFormat(format!("not valid JSON: {}", e)))?;

    let file: ProjectFile = if value.get("app_state").is_some() {
        serde_json::from_value(value)
            .map_err(|e| ProjectError::InvalidFormat(format!("unreadable project: {}", e)))?
    } else {
        let app_state: ProjectState = serde_json::from_value(value)
            .map_err(|e| ProjectError::InvalidFormat(format!("unreadable project: {}", e)))?;
        ProjectFile {
            metadata: SaveMetadata::default(),
            app_state,
        }
    };

    if file.app_state.script.trim().is_empty() {
        return Err(ProjectError::InvalidFormat(
            "missing script text".to_string(),
        ));
    }
    if file.app_state.current_step == 0 {
        return Err(ProjectError::InvalidFormat(
            "missing step indicator".to_string(),
        ));
    }
    Ok(file)
}

fn gunzip(bytes: &[u8]) -> std::io::Result<String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut text = String::new();
    decoder.read_to_string(&mut text)?;
    Ok(text)
}
