use crate::config::Config;
use crate::error::GenerateError;
use crate::gemini::{GenerationClient, ImagePayload};
use crate::model::{
    insert_ordered, prompts_from_script, Character, SeriesPrompt, TeamMember, WorkItem, WorkStatus,
};
use crate::orchestrator::{BatchOutcome, CancelToken, ItemGenerator, Orchestrator, QuotaFlag};
use crate::project::{self, ProjectState, SaveMetadata};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const TOTAL_STEPS: u8 = 7;

/// Single batch-level notice shown when a run halts on quota exhaustion.
pub const QUOTA_NOTICE: &str = "API quota limit reached. Save the project and hand it to \
another team member to continue, or retry the failed items once the quota resets.";

/// Owns the project state, the generation client and the run tokens, and
/// sequences which work-item list is active for each wizard step. All
/// generation goes through the orchestrator; this layer is glue.
pub struct WizardSession {
    state: ProjectState,
    client: Arc<dyn GenerationClient>,
    cancel: CancelToken,
    quota: QuotaFlag,
    pacing: Duration,
    language: String,
    last_notice: Option<String>,
}

impl WizardSession {
    pub fn new(client: Arc<dyn GenerationClient>, config: &Config) -> Self {
        Self {
            state: ProjectState::new(),
            client,
            cancel: CancelToken::new(),
            quota: QuotaFlag::new(),
            pacing: Duration::from_millis(config.api_call_delay_ms),
            language: config.language.clone(),
            last_notice: None,
        }
    }

    pub fn state(&self) -> &ProjectState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ProjectState {
        &mut self.state
    }

    /// Handle for an external stop control (e.g. a signal handler).
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn request_stop(&self) {
        self.cancel.request_stop();
    }

    pub fn is_quota_exhausted(&self) -> bool {
        self.quota.is_exhausted()
    }

    pub fn last_notice(&self) -> Option<&str> {
        self.last_notice.as_deref()
    }

    pub fn go_to_step(&mut self, step: u8) {
        self.state.current_step = step.clamp(1, TOTAL_STEPS);
    }

    pub fn next_step(&mut self) {
        self.go_to_step(self.state.current_step + 1);
    }

    pub fn prev_step(&mut self) {
        self.go_to_step(self.state.current_step.saturating_sub(1));
    }

    // --- Team roster ---

    pub fn add_member(&mut self, name: &str) -> Uuid {
        let member = TeamMember::new(name.trim());
        let id = member.id;
        self.state.team_members.push(member);
        if self.state.active_member_id.is_none() {
            self.state.active_member_id = Some(id);
        }
        id
    }

    pub fn remove_member(&mut self, id: Uuid) {
        self.state.team_members.retain(|m| m.id != id);
        if self.state.active_member_id == Some(id) {
            self.state.active_member_id = self.state.team_members.first().map(|m| m.id);
        }
    }

    pub fn set_active_member(&mut self, id: Uuid) -> Result<()> {
        if !self.state.team_members.iter().any(|m| m.id == id) {
            bail!("no such team member");
        }
        self.state.active_member_id = Some(id);
        Ok(())
    }

    // --- Step 1: analysis ---

    /// Extract setting and characters from the script and advance to the
    /// context step. Analysis output is reset on failure so a half-parsed
    /// result never leaks into the wizard.
    pub async fn analyze_script(&mut self) -> Result<()> {
        if self.state.script.trim().is_empty() {
            bail!("the script is empty");
        }
        self.ensure_can_start()?;

        match self
            .client
            .extract_structured_details(&self.state.script)
            .await
        {
            Ok(analysis) => {
                self.state.context_prompt = analysis.setting.context_prompt();
                self.state.setting = Some(analysis.setting);
                self.state.characters = analysis
                    .characters
                    .into_iter()
                    .map(Character::from_profile)
                    .collect();
                self.state.current_step = 2;
                Ok(())
            }
            Err(err) => {
                self.state.setting = None;
                self.state.characters.clear();
                self.record_failure(&err);
                Err(err.into())
            }
        }
    }

    // --- Step 2: context preview ---

    pub async fn generate_context(&mut self) -> Result<BatchOutcome> {
        if self.state.context_prompt.trim().is_empty() {
            bail!("the context prompt is empty");
        }
        self.ensure_can_start()?;

        let mut item = self
            .state
            .context_preview
            .take()
            .unwrap_or_else(WorkItem::singleton);
        let generator = PlainImageGenerator {
            client: self.client.clone(),
            prompts: HashMap::from([(item.id, self.state.context_prompt.clone())]),
        };
        let outcome = self.orchestrator().run_one(&mut item, &generator).await;
        self.state.context_preview = Some(item);
        self.note_outcome(outcome);
        Ok(outcome)
    }

    // --- Step 3: character portraits ---

    pub fn add_character(&mut self, name: &str) -> Uuid {
        let character = Character::blank(name);
        let id = character.id;
        self.state.characters.push(character);
        id
    }

    /// Generate previews for every character that does not already have a
    /// successful one, as one sequential batch.
    pub async fn generate_character_previews(&mut self) -> Result<BatchOutcome> {
        self.ensure_can_start()?;

        let mut items = Vec::new();
        let mut prompts = HashMap::new();
        for character in &mut self.state.characters {
            let prompt = character_prompt(character, &self.state.context_prompt);
            let preview = character
                .preview
                .get_or_insert_with(|| WorkItem::new(Some(character.id), None));
            prompts.insert(preview.id, prompt);
            items.push(preview.clone());
        }
        if items.is_empty() {
            return Ok(BatchOutcome::Completed);
        }

        let generator = PlainImageGenerator {
            client: self.client.clone(),
            prompts,
        };
        let outcome = self.orchestrator().run_batch(&mut items, &generator).await;
        self.write_back_previews(items);
        self.note_outcome(outcome);
        Ok(outcome)
    }

    /// Manual regenerate for one character, independent of any batch.
    pub async fn generate_single_character(&mut self, character_id: Uuid) -> Result<BatchOutcome> {
        self.ensure_can_start()?;

        let (prompt, mut item) = {
            let character = self
                .state
                .characters
                .iter_mut()
                .find(|c| c.id == character_id)
                .context("no such character")?;
            let prompt = character_prompt(character, &self.state.context_prompt);
            let preview = character
                .preview
                .get_or_insert_with(|| WorkItem::new(Some(character_id), None));
            (prompt, preview.clone())
        };

        let generator = PlainImageGenerator {
            client: self.client.clone(),
            prompts: HashMap::from([(item.id, prompt)]),
        };
        let outcome = self.orchestrator().run_one(&mut item, &generator).await;
        self.write_back_previews(vec![item]);
        self.note_outcome(outcome);
        Ok(outcome)
    }

    /// Pin or unpin a preview asset as the reference image for a character.
    pub fn toggle_reference_image(&mut self, character_id: Uuid, asset: &str) -> Result<()> {
        let character = self
            .state
            .characters
            .iter_mut()
            .find(|c| c.id == character_id)
            .context("no such character")?;
        if character.reference_image.as_deref() == Some(asset) {
            character.reference_image = None;
        } else {
            character.reference_image = Some(asset.to_string());
        }
        Ok(())
    }

    // --- Step 5: image series ---

    /// Split the script into one prompt per line and move to the series step.
    pub fn proceed_to_series(&mut self) {
        if self.state.series_prompts.is_empty() {
            self.state.series_prompts = prompts_from_script(&self.state.script);
        }
        self.state.current_step = 5;
    }

    /// Generate frames for every prompt that does not already have a
    /// successful one. Placeholders are seeded in presentation order before
    /// the run so the result list keeps script order regardless of
    /// completion order.
    pub async fn generate_series(&mut self) -> Result<BatchOutcome> {
        self.ensure_can_start()?;
        let pending = self.pending_series_prompts(|frame| !frame.is_success());
        if pending.is_empty() {
            return Ok(BatchOutcome::Completed);
        }
        self.run_series_batch(pending).await
    }

    /// Re-run only the frames that ended in `Error` or `Cancelled`.
    /// Explicitly retrying clears the quota halt first.
    pub async fn retry_failed_series(&mut self) -> Result<BatchOutcome> {
        self.quota.clear();
        self.last_notice = None;
        self.cancel.reset();

        let failed = self.pending_series_prompts(|frame| {
            matches!(frame.status, WorkStatus::Error | WorkStatus::Cancelled)
        });
        if failed.is_empty() {
            return Ok(BatchOutcome::Completed);
        }
        self.run_series_batch(failed).await
    }

    /// Generate or regenerate a single frame from its prompt.
    pub async fn generate_single_series_image(&mut self, prompt_id: Uuid) -> Result<BatchOutcome> {
        self.ensure_can_start()?;

        let (seq, prompt) = self
            .state
            .series_prompts
            .iter()
            .enumerate()
            .find(|(_, p)| p.id == prompt_id)
            .map(|(seq, p)| (seq, p.clone()))
            .context("original prompt not found")?;

        let mut item = self.seed_frame(seq, &prompt);
        let generator = self.series_generator(HashMap::from([(
            item.id,
            series_prompt_text(&prompt, &self.state.context_prompt),
        )]));
        let outcome = self.orchestrator().run_one(&mut item, &generator).await;
        insert_ordered(&mut self.state.series_images, item);
        self.note_outcome(outcome);
        Ok(outcome)
    }

    /// Regenerate a frame identified by its image id.
    pub async fn regenerate_series_image(&mut self, image_id: Uuid) -> Result<BatchOutcome> {
        let prompt_id = self
            .state
            .series_images
            .iter()
            .find(|i| i.id == image_id)
            .and_then(|i| i.source_ref)
            .context("no prompt recorded for this image")?;
        self.generate_single_series_image(prompt_id).await
    }

    async fn run_series_batch(&mut self, pending: Vec<(usize, SeriesPrompt)>) -> Result<BatchOutcome> {
        let mut items = Vec::new();
        let mut prompts = HashMap::new();
        for (seq, prompt) in &pending {
            let item = self.seed_frame(*seq, prompt);
            prompts.insert(item.id, series_prompt_text(prompt, &self.state.context_prompt));
            insert_ordered(&mut self.state.series_images, item.clone());
            items.push(item);
        }

        let generator = self.series_generator(prompts);
        let outcome = self.orchestrator().run_batch(&mut items, &generator).await;
        for item in items {
            insert_ordered(&mut self.state.series_images, item);
        }
        self.note_outcome(outcome);
        Ok(outcome)
    }

    /// Prompts whose current frame matches the predicate, or that have no
    /// frame yet, in presentation order.
    fn pending_series_prompts(
        &self,
        retryable: impl Fn(&WorkItem) -> bool,
    ) -> Vec<(usize, SeriesPrompt)> {
        self.state
            .series_prompts
            .iter()
            .enumerate()
            .filter(|(_, p)| match self.frame_for(p.id) {
                Some(frame) => retryable(frame) && !frame.is_success(),
                None => true,
            })
            .map(|(seq, p)| (seq, p.clone()))
            .collect()
    }

    fn frame_for(&self, prompt_id: Uuid) -> Option<&WorkItem> {
        self.state
            .series_images
            .iter()
            .find(|i| i.source_ref == Some(prompt_id))
    }

    /// Reuse the existing frame for this prompt, or create a fresh one
    /// carrying the prompt's sequence position for ordered insertion.
    fn seed_frame(&self, seq: usize, prompt: &SeriesPrompt) -> WorkItem {
        match self.frame_for(prompt.id) {
            Some(existing) => {
                let mut item = existing.clone();
                item.seq = Some(seq);
                item
            }
            None => WorkItem::new(Some(prompt.id), Some(seq)),
        }
    }

    fn series_generator(&self, prompts: HashMap<Uuid, String>) -> ReferenceImageGenerator {
        let references: Vec<Character> = self
            .state
            .characters
            .iter()
            .filter(|c| c.is_main && c.reference_image.is_some())
            .cloned()
            .collect();
        ReferenceImageGenerator {
            client: self.client.clone(),
            prompts,
            references,
        }
    }

    // --- Step 6: video prompts ---

    pub async fn generate_video_prompts(&mut self) -> Result<()> {
        self.ensure_can_start()?;
        let main_characters: Vec<Character> = self
            .state
            .characters
            .iter()
            .filter(|c| c.is_main)
            .cloned()
            .collect();
        match self
            .client
            .generate_video_prompts(&self.state.script, &main_characters)
            .await
        {
            Ok(prompts) => {
                self.state.video_prompts = prompts;
                Ok(())
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err.into())
            }
        }
    }

    // --- Step 7: thumbnail ---

    pub async fn generate_thumbnail(&mut self) -> Result<BatchOutcome> {
        if self.state.thumbnail_topic.trim().is_empty() {
            bail!("the thumbnail topic is empty");
        }
        self.ensure_can_start()?;

        let mut item = self
            .state
            .thumbnail
            .take()
            .unwrap_or_else(WorkItem::singleton);
        let generator = ThumbnailGenerator {
            client: self.client.clone(),
            topic: self.state.thumbnail_topic.clone(),
            script: self.state.script.clone(),
        };
        let outcome = self.orchestrator().run_one(&mut item, &generator).await;
        self.state.thumbnail = Some(item);
        self.note_outcome(outcome);
        Ok(outcome)
    }

    // --- Image editing ---

    /// Edit a successful item's image per a text instruction. The asset is
    /// replaced atomically on success; the item is untouched on failure.
    pub async fn edit_image(&mut self, item_id: Uuid, instruction: &str) -> Result<()> {
        self.ensure_can_start()?;

        let asset = self
            .find_item(item_id)
            .and_then(|i| i.asset.clone())
            .context("this item has no generated image to edit")?;
        let payload = ImagePayload::from_data_uri(&asset)
            .context("the stored asset is not an editable image")?;
        let editor = match self.state.active_member_name() {
            Some(name) => format!("Edited by {}", name),
            None => "Edited".to_string(),
        };

        match self
            .client
            .edit_image(instruction, &payload, &self.language)
            .await
        {
            Ok(new_asset) => {
                let item = self
                    .find_item_mut(item_id)
                    .context("the item disappeared during the edit")?;
                item.replace_asset(new_asset, editor);
                Ok(())
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err.into())
            }
        }
    }

    fn find_item(&self, id: Uuid) -> Option<&WorkItem> {
        self.state
            .context_preview
            .iter()
            .chain(self.state.thumbnail.iter())
            .chain(self.state.characters.iter().filter_map(|c| c.preview.as_ref()))
            .chain(self.state.series_images.iter())
            .find(|i| i.id == id)
    }

    fn find_item_mut(&mut self, id: Uuid) -> Option<&mut WorkItem> {
        self.state
            .context_preview
            .iter_mut()
            .chain(self.state.thumbnail.iter_mut())
            .chain(
                self.state
                    .characters
                    .iter_mut()
                    .filter_map(|c| c.preview.as_mut()),
            )
            .chain(self.state.series_images.iter_mut())
            .find(|i| i.id == id)
    }

    // --- Persistence ---

    pub fn save_to(&mut self, path: &Path) -> Result<()> {
        let saved_by = self
            .state
            .active_member_name()
            .unwrap_or("Unknown")
            .to_string();
        let bytes = project::serialize(&self.state, &saved_by)?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write project file {:?}", path))?;
        // A fresh save clears the quota halt: the file can now travel to a
        // teammate with remaining quota.
        self.quota.clear();
        self.last_notice = None;
        Ok(())
    }

    /// All-or-nothing load: the current state is replaced only after the
    /// snapshot parsed and validated.
    pub fn load_from(&mut self, path: &Path) -> Result<SaveMetadata> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read project file {:?}", path))?;
        let file = project::deserialize(&bytes)?;
        self.state = file.app_state;
        self.quota.clear();
        self.cancel.reset();
        self.last_notice = None;
        Ok(file.metadata)
    }

    // --- Internals ---

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.cancel.clone(), self.quota.clone())
            .with_pacing(self.pacing)
            .with_actor(self.state.active_member_name().map(str::to_string))
    }

    /// Every batch-initiating action is refused while the quota halt is in
    /// effect, and starts with a fresh stop flag otherwise.
    fn ensure_can_start(&mut self) -> Result<()> {
        if self.quota.is_exhausted() {
            bail!("{}", QUOTA_NOTICE);
        }
        self.cancel.reset();
        Ok(())
    }

    fn record_failure(&mut self, err: &GenerateError) {
        if err.is_rate_limit() {
            self.quota.mark_exhausted();
            self.last_notice = Some(QUOTA_NOTICE.to_string());
        }
    }

    fn note_outcome(&mut self, outcome: BatchOutcome) {
        if outcome == BatchOutcome::QuotaHalted {
            self.last_notice = Some(QUOTA_NOTICE.to_string());
        }
    }

    fn write_back_previews(&mut self, items: Vec<WorkItem>) {
        for item in items {
            if let Some(character) = self
                .state
                .characters
                .iter_mut()
                .find(|c| c.preview.as_ref().map(|p| p.id) == Some(item.id))
            {
                character.preview = Some(item);
            }
        }
    }
}

fn character_prompt(character: &Character, context_prompt: &str) -> String {
    format!(
        "{}. Setting: {}",
        character.appearance_and_behavior, context_prompt
    )
}

fn series_prompt_text(prompt: &SeriesPrompt, context_prompt: &str) -> String {
    format!("{}. Setting: {}", prompt.value, context_prompt)
}

/// Plain image generation, one prepared prompt per item id.
struct PlainImageGenerator {
    client: Arc<dyn GenerationClient>,
    prompts: HashMap<Uuid, String>,
}

#[async_trait]
impl ItemGenerator for PlainImageGenerator {
    async fn generate(&self, item: &WorkItem) -> Result<String, GenerateError> {
        let prompt = self
            .prompts
            .get(&item.id)
            .ok_or_else(|| GenerateError::GenerationFailed("no prompt bound for item".into()))?;
        self.client.generate_image(prompt).await
    }
}

/// Series frames: prepared prompt per item id plus the main-character
/// references pinned by the user.
struct ReferenceImageGenerator {
    client: Arc<dyn GenerationClient>,
    prompts: HashMap<Uuid, String>,
    references: Vec<Character>,
}

#[async_trait]
impl ItemGenerator for ReferenceImageGenerator {
    async fn generate(&self, item: &WorkItem) -> Result<String, GenerateError> {
        let prompt = self
            .prompts
            .get(&item.id)
            .ok_or_else(|| GenerateError::GenerationFailed("no prompt bound for item".into()))?;
        self.client
            .generate_image_with_references(prompt, &self.references)
            .await
    }
}

struct ThumbnailGenerator {
    client: Arc<dyn GenerationClient>,
    topic: String,
    script: String,
}

#[async_trait]
impl ItemGenerator for ThumbnailGenerator {
    async fn generate(&self, _item: &WorkItem) -> Result<String, GenerateError> {
        self.client
            .generate_thumbnail(&self.topic, &self.script)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeminiConfig;
    use crate::model::{CharacterProfile, ScriptAnalysis, Setting, Theme};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct MockClient {
        image_results: Mutex<VecDeque<Result<String, GenerateError>>>,
        image_calls: Mutex<Vec<String>>,
        reference_counts: Mutex<Vec<usize>>,
    }

    impl MockClient {
        fn with_images(results: Vec<Result<String, GenerateError>>) -> Self {
            Self {
                image_results: Mutex::new(results.into()),
                ..Default::default()
            }
        }

        fn next_image(&self, prompt: &str) -> Result<String, GenerateError> {
            self.image_calls.lock().unwrap().push(prompt.to_string());
            self.image_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("data:image/png;base64,REVGQVVMVA==".to_string()))
        }

        fn image_call_count(&self) -> usize {
            self.image_calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GenerationClient for MockClient {
        async fn generate_image(&self, prompt: &str) -> Result<String, GenerateError> {
            self.next_image(prompt)
        }

        async fn generate_image_with_references(
            &self,
            prompt: &str,
            references: &[Character],
        ) -> Result<String, GenerateError> {
            self.reference_counts.lock().unwrap().push(references.len());
            self.next_image(prompt)
        }

        async fn extract_structured_details(
            &self,
            _script: &str,
        ) -> Result<ScriptAnalysis, GenerateError> {
            Ok(ScriptAnalysis {
                setting: Setting {
                    place: "Louisville airport".into(),
                    time: "night".into(),
                    weather: "rain".into(),
                    season: "autumn".into(),
                    mood: "tense".into(),
                    social_context: "modern aviation".into(),
                    theme: Theme {
                        central_idea: "mechanical failure".into(),
                        thematic_question: "who is accountable?".into(),
                    },
                },
                characters: vec![
                    CharacterProfile {
                        name: "Flight 214".into(),
                        is_main: true,
                        appearance_and_behavior: "wide-body cargo jet".into(),
                        ..Default::default()
                    },
                    CharacterProfile {
                        name: "Tower controller".into(),
                        ..Default::default()
                    },
                ],
            })
        }

        async fn generate_video_prompts(
            &self,
            _script: &str,
            _characters: &[Character],
        ) -> Result<Vec<String>, GenerateError> {
            Ok(vec!["Shot 1".into(), "Shot 2".into()])
        }

        async fn generate_thumbnail(
            &self,
            _topic: &str,
            _script: &str,
        ) -> Result<String, GenerateError> {
            self.next_image("thumbnail")
        }

        async fn edit_image(
            &self,
            _instruction: &str,
            _source: &ImagePayload,
            _language: &str,
        ) -> Result<String, GenerateError> {
            Ok("data:image/png;base64,RURJVEVE".to_string())
        }
    }

    fn test_config() -> Config {
        Config {
            output_folder: "output".into(),
            language: "English".into(),
            api_call_delay_ms: 0,
            gemini: GeminiConfig {
                api_key: "test".into(),
                ..Default::default()
            },
        }
    }

    fn session_with(client: MockClient) -> (WizardSession, Arc<MockClient>) {
        let client = Arc::new(client);
        let session = WizardSession::new(client.clone(), &test_config());
        (session, client)
    }

    fn seeded_session(client: MockClient, script: &str) -> (WizardSession, Arc<MockClient>) {
        let (mut session, client) = session_with(client);
        session.state_mut().script = script.to_string();
        session.state_mut().context_prompt = "a rainy runway at night".to_string();
        session.proceed_to_series();
        (session, client)
    }

    #[tokio::test]
    async fn analyze_script_populates_setting_and_characters() {
        let (mut session, _) = session_with(MockClient::default());
        session.state_mut().script = "scene one".to_string();

        session.analyze_script().await.unwrap();

        let state = session.state();
        assert_eq!(state.current_step, 2);
        assert_eq!(state.characters.len(), 2);
        assert!(state.characters[0].is_main);
        assert!(state.context_prompt.contains("Louisville airport"));
    }

    #[tokio::test]
    async fn series_batch_continues_past_non_quota_failure() {
        let (mut session, client) = seeded_session(
            MockClient::with_images(vec![
                Ok("data:image/png;base64,QQ==".into()),
                Err(GenerateError::GenerationFailed("Error: model overloaded".into())),
                Ok("data:image/png;base64,Qw==".into()),
            ]),
            "scene one\nscene two\nscene three",
        );

        let outcome = session.generate_series().await.unwrap();

        assert_eq!(outcome, BatchOutcome::Completed);
        let frames = &session.state().series_images;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].status, WorkStatus::Success);
        assert_eq!(frames[1].status, WorkStatus::Error);
        assert_eq!(frames[2].status, WorkStatus::Success);
        assert_eq!(
            frames[1].failure_reason.as_deref(),
            Some("Error: model overloaded")
        );
        // Presentation order follows the script regardless of outcome.
        assert_eq!(frames[0].seq, Some(0));
        assert_eq!(frames[2].seq, Some(2));
        assert_eq!(client.image_call_count(), 3);
    }

    #[tokio::test]
    async fn quota_failure_halts_series_and_blocks_new_batches() {
        let (mut session, client) = seeded_session(
            MockClient::with_images(vec![Err(GenerateError::RateLimitExceeded(
                "Error: quota exceeded for today".into(),
            ))]),
            "scene one\nscene two\nscene three",
        );

        let outcome = session.generate_series().await.unwrap();

        assert_eq!(outcome, BatchOutcome::QuotaHalted);
        assert!(session.is_quota_exhausted());
        assert_eq!(session.last_notice(), Some(QUOTA_NOTICE));
        let frames = &session.state().series_images;
        assert_eq!(frames[0].status, WorkStatus::Error);
        assert_eq!(frames[1].status, WorkStatus::Cancelled);
        assert_eq!(frames[2].status, WorkStatus::Cancelled);
        assert_eq!(client.image_call_count(), 1);

        // Batch-initiating actions are refused until the halt is cleared.
        assert!(session.generate_series().await.is_err());
        assert!(session.generate_context().await.is_err());
    }

    #[tokio::test]
    async fn retry_failed_clears_quota_halt_and_targets_only_the_gap() {
        let (mut session, client) = seeded_session(
            MockClient::with_images(vec![
                Ok("data:image/png;base64,QQ==".into()),
                Err(GenerateError::RateLimitExceeded("quota exceeded".into())),
            ]),
            "scene one\nscene two\nscene three",
        );

        session.generate_series().await.unwrap();
        assert!(session.is_quota_exhausted());
        assert_eq!(client.image_call_count(), 2);

        let outcome = session.retry_failed_series().await.unwrap();

        assert_eq!(outcome, BatchOutcome::Completed);
        assert!(!session.is_quota_exhausted());
        // Only the errored and the two cancelled frames minus the one that
        // already succeeded: two retry calls.
        assert_eq!(client.image_call_count(), 4);
        assert!(session.state().series_images.iter().all(|f| f.is_success()));
        // The frame that succeeded before the halt kept its original asset.
        assert_eq!(
            session.state().series_images[0].asset.as_deref(),
            Some("data:image/png;base64,QQ==")
        );
    }

    #[tokio::test]
    async fn single_series_retry_is_independent_of_batches() {
        let (mut session, client) = seeded_session(
            MockClient::with_images(vec![
                Err(GenerateError::GenerationFailed("Error: model overloaded".into())),
                Ok("data:image/png;base64,Tks=".into()),
            ]),
            "scene one",
        );
        let prompt_id = session.state().series_prompts[0].id;

        session.generate_single_series_image(prompt_id).await.unwrap();
        assert_eq!(session.state().series_images[0].status, WorkStatus::Error);

        session.generate_single_series_image(prompt_id).await.unwrap();
        let frame = &session.state().series_images[0];
        assert_eq!(frame.status, WorkStatus::Success);
        assert_eq!(frame.asset.as_deref(), Some("data:image/png;base64,Tks="));
        // Retrying replaced the frame in place rather than appending.
        assert_eq!(session.state().series_images.len(), 1);
        assert_eq!(client.image_call_count(), 2);
        assert!(!session.is_quota_exhausted());
    }

    #[tokio::test]
    async fn series_generation_passes_pinned_main_characters() {
        let (mut session, client) = seeded_session(MockClient::default(), "scene one");
        let mut pinned = Character::blank("Flight 214");
        pinned.is_main = true;
        pinned.reference_image = Some("data:image/png;base64,QUJD".into());
        let unpinned_main = Character::blank("Captain");
        session.state_mut().characters = vec![pinned, unpinned_main];

        session.generate_series().await.unwrap();

        assert_eq!(*client.reference_counts.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn character_previews_attribute_the_active_member() {
        let (mut session, _) = session_with(MockClient::default());
        session.state_mut().context_prompt = "a runway".into();
        session.add_character("Flight 214");
        let member_id = session.add_member("Alice");
        session.set_active_member(member_id).unwrap();

        session.generate_character_previews().await.unwrap();

        let preview = session.state().characters[0].preview.as_ref().unwrap();
        assert!(preview.is_success());
        assert_eq!(preview.attributed_to.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn removing_the_active_member_falls_back_to_the_first_remaining() {
        let (mut session, _) = session_with(MockClient::default());
        let alice = session.add_member("Alice");
        let bob = session.add_member("Bob");
        session.set_active_member(alice).unwrap();

        session.remove_member(alice);

        // "Member 1" was seeded first and becomes active again.
        assert_eq!(session.state().active_member_name(), Some("Member 1"));
        assert_eq!(session.state().team_members.len(), 2);

        // Removing a non-active member leaves the active one alone.
        session.remove_member(bob);
        assert_eq!(session.state().active_member_name(), Some("Member 1"));
    }

    #[tokio::test]
    async fn edit_image_replaces_asset_atomically_with_edit_attribution() {
        let (mut session, _) = session_with(MockClient::default());
        session.state_mut().context_prompt = "a runway".into();
        session.generate_context().await.unwrap();
        let item_id = session.state().context_preview.as_ref().unwrap().id;

        session.edit_image(item_id, "add rain").await.unwrap();

        let item = session.state().context_preview.as_ref().unwrap();
        assert_eq!(item.asset.as_deref(), Some("data:image/png;base64,RURJVEVE"));
        assert_eq!(item.attributed_to.as_deref(), Some("Edited by Member 1"));
        assert!(item.is_success());
    }

    #[tokio::test]
    async fn thumbnail_and_video_prompts_flow() {
        let (mut session, _) = session_with(MockClient::default());
        session.state_mut().script = "scene one".into();
        session.state_mut().thumbnail_topic = "Disaster at Louisville".into();

        session.generate_video_prompts().await.unwrap();
        assert_eq!(session.state().video_prompts.len(), 2);

        session.generate_thumbnail().await.unwrap();
        assert!(session.state().thumbnail.as_ref().unwrap().is_success());
    }

    #[tokio::test]
    async fn save_and_load_round_trip_preserves_resume_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.s2b");

        let (mut session, _) = seeded_session(
            MockClient::with_images(vec![
                Ok("data:image/png;base64,QQ==".into()),
                Err(GenerateError::GenerationFailed("boom".into())),
            ]),
            "scene one\nscene two",
        );
        session.generate_series().await.unwrap();
        session.save_to(&path).unwrap();

        let (mut restored, client) =
            seeded_session(MockClient::default(), "placeholder");
        let metadata = restored.load_from(&path).unwrap();
        assert_eq!(metadata.saved_by, "Member 1");
        assert_eq!(restored.state().series_images.len(), 2);

        // Resuming the batch only regenerates the failed frame.
        restored.generate_series().await.unwrap();
        assert_eq!(client.image_call_count(), 1);
        assert!(restored.state().series_images.iter().all(|f| f.is_success()));
    }

    #[tokio::test]
    async fn load_failure_leaves_current_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.s2b");
        std::fs::write(&path, b"{\"current_step\": 3}").unwrap();

        let (mut session, _) = seeded_session(MockClient::default(), "scene one");
        let before = session.state().clone();

        assert!(session.load_from(&path).is_err());
        assert_eq!(session.state(), &before);
    }

    #[tokio::test]
    async fn stop_request_cancels_remaining_series_frames() {
        let (mut session, client) = seeded_session(
            MockClient::with_images(vec![Ok("data:image/png;base64,QQ==".into())]),
            "scene one\nscene two\nscene three",
        );
        // Stop requested while the first call is in flight: the mock client
        // triggers it from inside the call via the shared token.
        struct StopOnFirstCall {
            inner: Arc<MockClient>,
            token: CancelToken,
        }
        #[async_trait]
        impl GenerationClient for StopOnFirstCall {
            async fn generate_image(&self, prompt: &str) -> Result<String, GenerateError> {
                self.token.request_stop();
                self.inner.generate_image(prompt).await
            }
            async fn generate_image_with_references(
                &self,
                prompt: &str,
                _references: &[Character],
            ) -> Result<String, GenerateError> {
                self.token.request_stop();
                self.inner.generate_image(prompt).await
            }
            async fn extract_structured_details(
                &self,
                script: &str,
            ) -> Result<ScriptAnalysis, GenerateError> {
                self.inner.extract_structured_details(script).await
            }
            async fn generate_video_prompts(
                &self,
                script: &str,
                characters: &[Character],
            ) -> Result<Vec<String>, GenerateError> {
                self.inner.generate_video_prompts(script, characters).await
            }
            async fn generate_thumbnail(
                &self,
                topic: &str,
                script: &str,
            ) -> Result<String, GenerateError> {
                self.inner.generate_thumbnail(topic, script).await
            }
            async fn edit_image(
                &self,
                instruction: &str,
                source: &ImagePayload,
                language: &str,
            ) -> Result<String, GenerateError> {
                self.inner.edit_image(instruction, source, language).await
            }
        }
        impl std::fmt::Debug for StopOnFirstCall {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("StopOnFirstCall")
            }
        }

        let wrapped = Arc::new(StopOnFirstCall {
            inner: client.clone(),
            token: session.cancel_token(),
        });
        let mut session = {
            let mut replacement = WizardSession::new(wrapped, &test_config());
            std::mem::swap(replacement.state_mut(), session.state_mut());
            replacement.cancel = session.cancel.clone();
            replacement.quota = session.quota.clone();
            replacement
        };

        let outcome = session.generate_series().await.unwrap();

        assert_eq!(outcome, BatchOutcome::Cancelled);
        let frames = &session.state().series_images;
        // The in-flight call finished and its result was recorded.
        assert_eq!(frames[0].status, WorkStatus::Success);
        assert_eq!(frames[1].status, WorkStatus::Cancelled);
        assert_eq!(frames[2].status, WorkStatus::Cancelled);
        assert_eq!(frames[1].failure_reason.as_deref(), Some("stopped by user"));
        assert_eq!(client.image_call_count(), 1);
    }
}
