use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a generatable unit. `Retrying` in the UI is a display variant
/// of `Generating` and is never persisted as its own state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    #[default]
    Idle,
    Generating,
    Success,
    Error,
    Cancelled,
}

impl WorkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkStatus::Success | WorkStatus::Error | WorkStatus::Cancelled
        )
    }
}

/// A single generatable unit: one character portrait, one series frame,
/// the context preview, or the thumbnail.
///
/// Field invariant: `Success` implies `asset` present and `failure_reason`
/// absent; `Error`/`Cancelled` the reverse. A stale asset from a previous
/// success may remain visible while the item is `Generating` again and is
/// overwritten atomically on completion. The transition methods below are
/// the only mutation path, so the invariant holds for every reachable item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    /// Originating entity (script line, character). None for singletons.
    #[serde(default)]
    pub source_ref: Option<Uuid>,
    /// Original sequence position within the source, for ordered insertion.
    #[serde(default)]
    pub seq: Option<usize>,
    pub status: WorkStatus,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Team member who triggered the successful generation.
    #[serde(default)]
    pub attributed_to: Option<String>,
}

impl WorkItem {
    pub fn new(source_ref: Option<Uuid>, seq: Option<usize>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_ref,
            seq,
            status: WorkStatus::Idle,
            asset: None,
            failure_reason: None,
            attributed_to: None,
        }
    }

    /// Singleton item with no originating entity (context preview, thumbnail).
    pub fn singleton() -> Self {
        Self::new(None, None)
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkStatus::Success
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Enter `Generating`. A prior asset is left in place so a
    /// regenerate-in-place keeps showing the old result until the new one
    /// lands.
    pub fn begin(&mut self) {
        self.status = WorkStatus::Generating;
        self.failure_reason = None;
    }

    /// Terminal success: asset and attribution are written together.
    pub fn succeed(&mut self, asset: String, actor: Option<&str>) {
        self.status = WorkStatus::Success;
        self.asset = Some(asset);
        self.failure_reason = None;
        if let Some(actor) = actor {
            self.attributed_to = Some(actor.to_string());
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = WorkStatus::Error;
        self.asset = None;
        self.failure_reason = Some(reason.into());
    }

    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.status = WorkStatus::Cancelled;
        self.asset = None;
        self.failure_reason = Some(reason.into());
    }

    /// Overwrite the asset of an already successful item (image edit).
    /// Attribution is replaced, not appended.
    pub fn replace_asset(&mut self, asset: String, attributed_to: String) {
        self.status = WorkStatus::Success;
        self.asset = Some(asset);
        self.failure_reason = None;
        self.attributed_to = Some(attributed_to);
    }
}

/// Insert a work item into a running result list, keeping presentation
/// order regardless of completion order. If an item for the same source
/// already exists it is overwritten in place; otherwise the new item goes
/// immediately before the first entry whose original sequence position is
/// greater, or at the end.
pub fn insert_ordered(list: &mut Vec<WorkItem>, item: WorkItem) {
    if item.source_ref.is_some() {
        if let Some(existing) = list.iter_mut().find(|i| i.source_ref == item.source_ref) {
            *existing = item;
            return;
        }
    }
    let pos = match item.seq {
        Some(seq) => list
            .iter()
            .position(|i| i.seq.map_or(false, |s| s > seq))
            .unwrap_or(list.len()),
        None => list.len(),
    };
    list.insert(pos, item);
}

/// One line of the script, used as the prompt for one series frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPrompt {
    pub id: Uuid,
    pub value: String,
}

impl SeriesPrompt {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            value: value.into(),
        }
    }
}

/// Split a script into one series prompt per non-empty line.
pub fn prompts_from_script(script: &str) -> Vec<SeriesPrompt> {
    script
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(SeriesPrompt::new)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Theme {
    #[serde(default)]
    pub central_idea: String,
    #[serde(default)]
    pub thematic_question: String,
}

/// Scene context extracted from the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Setting {
    #[serde(default)]
    pub place: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub weather: String,
    #[serde(default)]
    pub season: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub social_context: String,
    #[serde(default)]
    pub theme: Theme,
}

impl Setting {
    /// Seed prompt for the context preview, editable by the user afterwards.
    pub fn context_prompt(&self) -> String {
        format!(
            "Main setting: {} at {}. Weather: {} ({}). Atmosphere: {}.",
            self.place, self.time, self.weather, self.season, self.mood
        )
    }
}

/// Character profile as returned by script analysis, before it is given an
/// id and a preview slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CharacterProfile {
    pub name: String,
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub motivation: String,
    #[serde(default)]
    pub conflict: String,
    #[serde(default)]
    pub appearance_and_behavior: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub character_arc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub motivation: String,
    #[serde(default)]
    pub conflict: String,
    #[serde(default)]
    pub appearance_and_behavior: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub character_arc: String,
    #[serde(default)]
    pub preview: Option<WorkItem>,
    /// Asset chosen by the user as the visual reference for series frames.
    #[serde(default)]
    pub reference_image: Option<String>,
}

impl Character {
    pub fn from_profile(profile: CharacterProfile) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: profile.name,
            is_main: profile.is_main,
            goal: profile.goal,
            motivation: profile.motivation,
            conflict: profile.conflict,
            appearance_and_behavior: profile.appearance_and_behavior,
            backstory: profile.backstory,
            character_arc: profile.character_arc,
            preview: None,
            reference_image: None,
        }
    }

    pub fn blank(name: impl Into<String>) -> Self {
        Self::from_profile(CharacterProfile {
            name: name.into(),
            ..Default::default()
        })
    }

    pub fn has_successful_preview(&self) -> bool {
        self.preview.as_ref().map_or(false, |p| p.is_success())
    }
}

/// Result of the structured script analysis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptAnalysis {
    pub setting: Setting,
    pub characters: Vec<CharacterProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: Uuid,
    pub name: String,
}

impl TeamMember {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}
