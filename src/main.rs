use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use inquire::{Confirm, Select, Text};
use log::info;
use script2storyboard::config::Config;
use script2storyboard::gemini::{GeminiClient, ImagePayload};
use script2storyboard::model::{WorkItem, WorkStatus};
use script2storyboard::wizard::{WizardSession, TOTAL_STEPS};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with a gemini api_key.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let client = Arc::new(GeminiClient::new(&config.gemini, &config.language));
    let mut session = WizardSession::new(client, &config);

    // Ctrl-C requests a cooperative stop: the call in flight finishes and
    // its result is recorded before the batch halts.
    let stop = session.cancel_token();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!("stop requested; finishing the item in flight");
            stop.request_stop();
        }
    });

    println!("script2storyboard — guided storyboard production");
    loop {
        if let Some(notice) = session.last_notice() {
            println!("\n! {}", notice);
        }
        if let Some(name) = session.state().active_member_name() {
            println!("\nActive member: {}", name);
        }

        let step = session.state().current_step;
        let header = format!("Step {}/{} — {}", step, TOTAL_STEPS, step_name(step));
        let mut actions = step_actions(step, &session);
        actions.extend([
            "Save project",
            "Load project",
            "Team roster",
            "Next step",
            "Previous step",
            "Quit",
        ]);

        let choice = Select::new(&header, actions).prompt()?;
        if choice == "Quit" {
            break;
        }
        if let Err(e) = dispatch(&mut session, &config, choice).await {
            eprintln!("{:#}", e);
        }
    }

    Ok(())
}

fn step_name(step: u8) -> &'static str {
    match step {
        1 => "Script",
        2 => "Context",
        3 => "Characters",
        4 => "Prompt review",
        5 => "Image series",
        6 => "Video prompts",
        _ => "Thumbnail",
    }
}

fn step_actions(step: u8, session: &WizardSession) -> Vec<&'static str> {
    match step {
        1 => vec!["Load script from file", "Analyze script"],
        2 => vec!["Edit context prompt", "Generate context preview", "Edit context image"],
        3 => vec![
            "Generate character previews",
            "Regenerate one character",
            "Pin reference image",
            "Add character",
        ],
        4 => vec!["Review prompts", "Proceed to image series"],
        5 => {
            let mut actions = vec!["Generate all frames"];
            if session
                .state()
                .series_images
                .iter()
                .any(|f| matches!(f.status, WorkStatus::Error | WorkStatus::Cancelled))
            {
                actions.push("Retry failed frames");
            }
            actions.extend(["Regenerate one frame", "Edit a frame", "Export frames"]);
            actions
        }
        6 => vec!["Generate video prompts", "Export video prompts"],
        _ => vec!["Set thumbnail topic", "Generate thumbnail", "Edit thumbnail"],
    }
}

async fn dispatch(session: &mut WizardSession, config: &Config, choice: &str) -> Result<()> {
    match choice {
        "Load script from file" => {
            let path = Text::new("Path to the script text file:").prompt()?;
            let script = fs::read_to_string(path.trim())
                .with_context(|| format!("failed to read {}", path.trim()))?;
            session.state_mut().script = script;
            println!("Script loaded ({} lines).", session.state().script.lines().count());
        }
        "Analyze script" => {
            println!("Analyzing script...");
            session.analyze_script().await?;
            let state = session.state();
            println!(
                "Found {} characters. Context prompt:\n  {}",
                state.characters.len(),
                state.context_prompt
            );
        }
        "Edit context prompt" => {
            let current = session.state().context_prompt.clone();
            let edited = Text::new("Context prompt:").with_initial_value(&current).prompt()?;
            session.state_mut().context_prompt = edited;
        }
        "Generate context preview" => {
            println!("Generating context preview...");
            session.generate_context().await?;
            report_item("context preview", session.state().context_preview.as_ref());
        }
        "Edit context image" => {
            let id = session
                .state()
                .context_preview
                .as_ref()
                .filter(|i| i.is_success())
                .map(|i| i.id)
                .context("no successful context preview to edit")?;
            let instruction = Text::new("Edit instruction:").prompt()?;
            session.edit_image(id, &instruction).await?;
            println!("Context image updated.");
        }
        "Generate character previews" => {
            println!("Generating character previews...");
            session.generate_character_previews().await?;
            for character in &session.state().characters {
                report_item(&character.name, character.preview.as_ref());
            }
        }
        "Regenerate one character" => {
            let names: Vec<String> = session
                .state()
                .characters
                .iter()
                .map(|c| c.name.clone())
                .collect();
            if names.is_empty() {
                println!("No characters yet; run the analysis first.");
                return Ok(());
            }
            let name = Select::new("Character:", names).prompt()?;
            let id = session
                .state()
                .characters
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.id)
                .context("character not found")?;
            session.generate_single_character(id).await?;
        }
        "Pin reference image" => {
            let candidates: Vec<(String, uuid::Uuid, String)> = session
                .state()
                .characters
                .iter()
                .filter_map(|c| {
                    let asset = c.preview.as_ref().and_then(|p| p.asset.clone())?;
                    Some((c.name.clone(), c.id, asset))
                })
                .collect();
            if candidates.is_empty() {
                println!("No successful previews to pin.");
                return Ok(());
            }
            let names: Vec<String> = candidates.iter().map(|(n, _, _)| n.clone()).collect();
            let name = Select::new("Pin/unpin reference for:", names).prompt()?;
            if let Some((_, id, asset)) = candidates.into_iter().find(|(n, _, _)| *n == name) {
                session.toggle_reference_image(id, &asset)?;
            }
        }
        "Add character" => {
            let name = Text::new("Character name:").prompt()?;
            session.add_character(name.trim());
        }
        "Review prompts" => {
            session.proceed_to_series();
            session.go_to_step(4);
            for (n, prompt) in session.state().series_prompts.iter().enumerate() {
                println!("{:>3}. {}", n + 1, prompt.value);
            }
        }
        "Proceed to image series" => {
            session.proceed_to_series();
        }
        "Generate all frames" => {
            println!("Generating frames (Ctrl-C to stop after the current one)...");
            session.generate_series().await?;
            print_series_summary(session);
        }
        "Retry failed frames" => {
            println!("Retrying failed frames...");
            session.retry_failed_series().await?;
            print_series_summary(session);
        }
        "Regenerate one frame" => {
            let frame_id = pick_frame(session)?;
            session.regenerate_series_image(frame_id).await?;
        }
        "Edit a frame" => {
            let frame_id = pick_frame(session)?;
            let instruction = Text::new("Edit instruction:").prompt()?;
            session.edit_image(frame_id, &instruction).await?;
            println!("Frame updated.");
        }
        "Export frames" => {
            export_frames(session, Path::new(&config.output_folder))?;
        }
        "Generate video prompts" => {
            println!("Generating video prompts...");
            session.generate_video_prompts().await?;
            for (n, prompt) in session.state().video_prompts.iter().enumerate() {
                println!("{:>3}. {}", n + 1, prompt);
            }
        }
        "Export video prompts" => {
            let path = PathBuf::from(&config.output_folder).join("video_prompts.txt");
            fs::write(&path, session.state().video_prompts.join("\n\n"))
                .with_context(|| format!("failed to write {:?}", path))?;
            println!("Wrote {:?}.", path);
        }
        "Set thumbnail topic" => {
            let current = session.state().thumbnail_topic.clone();
            let topic = Text::new("Thumbnail topic:").with_initial_value(&current).prompt()?;
            session.state_mut().thumbnail_topic = topic;
        }
        "Generate thumbnail" => {
            println!("Generating thumbnail...");
            session.generate_thumbnail().await?;
            report_item("thumbnail", session.state().thumbnail.as_ref());
            if let Some(item) = session.state().thumbnail.clone() {
                if item.is_success() {
                    write_asset(&item, Path::new(&config.output_folder), "thumbnail")?;
                }
            }
        }
        "Edit thumbnail" => {
            let id = session
                .state()
                .thumbnail
                .as_ref()
                .filter(|i| i.is_success())
                .map(|i| i.id)
                .context("no successful thumbnail to edit")?;
            let instruction = Text::new("Edit instruction:").prompt()?;
            session.edit_image(id, &instruction).await?;
            println!("Thumbnail updated.");
        }
        "Save project" => {
            let path = Text::new("Save to:")
                .with_initial_value("project.s2b")
                .prompt()?;
            session.save_to(Path::new(path.trim()))?;
            println!("Project saved.");
        }
        "Load project" => {
            if !session.state().script.is_empty() {
                let overwrite = Confirm::new("Replace the current project?")
                    .with_default(false)
                    .prompt()?;
                if !overwrite {
                    return Ok(());
                }
            }
            let path = Text::new("Load from:")
                .with_initial_value("project.s2b")
                .prompt()?;
            let metadata = session.load_from(Path::new(path.trim()))?;
            match metadata.saved_at {
                Some(at) => println!("Loaded (saved by {} at {}).", metadata.saved_by, at),
                None => println!("Loaded (saved by {}).", metadata.saved_by),
            }
        }
        "Team roster" => {
            team_menu(session)?;
        }
        "Next step" => session.next_step(),
        "Previous step" => session.prev_step(),
        _ => {}
    }
    Ok(())
}

fn team_menu(session: &mut WizardSession) -> Result<()> {
    let action = Select::new(
        "Team:",
        vec!["Switch active member", "Add member", "Remove member"],
    )
    .prompt()?;
    match action {
        "Switch active member" => {
            let members: Vec<String> = session
                .state()
                .team_members
                .iter()
                .map(|m| m.name.clone())
                .collect();
            let name = Select::new("Active member:", members).prompt()?;
            let id = session
                .state()
                .team_members
                .iter()
                .find(|m| m.name == name)
                .map(|m| m.id)
                .context("member not found")?;
            session.set_active_member(id)?;
        }
        "Add member" => {
            let name = Text::new("Member name:").prompt()?;
            session.add_member(name.trim());
        }
        "Remove member" => {
            if session.state().team_members.len() < 2 {
                println!("Cannot remove the last member.");
                return Ok(());
            }
            let members: Vec<String> = session
                .state()
                .team_members
                .iter()
                .map(|m| m.name.clone())
                .collect();
            let name = Select::new("Remove member:", members).prompt()?;
            let id = session
                .state()
                .team_members
                .iter()
                .find(|m| m.name == name)
                .map(|m| m.id)
                .context("member not found")?;
            session.remove_member(id);
        }
        _ => {}
    }
    Ok(())
}

fn pick_frame(session: &WizardSession) -> Result<uuid::Uuid> {
    let frames = &session.state().series_images;
    if frames.is_empty() {
        anyhow::bail!("no frames yet; generate the series first");
    }
    let labels: Vec<String> = frames
        .iter()
        .enumerate()
        .map(|(n, f)| format!("{:>3}. {:?}", n + 1, f.status))
        .collect();
    let label = Select::new("Frame:", labels.clone()).prompt()?;
    let idx = labels
        .iter()
        .position(|l| *l == label)
        .context("frame not found")?;
    Ok(frames[idx].id)
}

fn report_item(label: &str, item: Option<&WorkItem>) {
    match item {
        Some(item) => match &item.failure_reason {
            Some(reason) => println!("{}: {:?} ({})", label, item.status, reason),
            None => println!("{}: {:?}", label, item.status),
        },
        None => println!("{}: not generated", label),
    }
}

fn print_series_summary(session: &WizardSession) {
    let frames = &session.state().series_images;
    let done = frames.iter().filter(|f| f.is_success()).count();
    println!("{}/{} frames generated.", done, frames.len());
    for (n, frame) in frames.iter().enumerate() {
        if let Some(reason) = &frame.failure_reason {
            println!("{:>3}. {:?}: {}", n + 1, frame.status, reason);
        }
    }
}

fn export_frames(session: &WizardSession, output: &Path) -> Result<()> {
    let mut written = 0usize;
    for (n, frame) in session.state().series_images.iter().enumerate() {
        if frame.is_success() {
            write_asset(frame, output, &format!("frame_{:03}", n + 1))?;
            written += 1;
        }
    }
    println!("Exported {} frames to {:?}.", written, output);
    Ok(())
}

fn write_asset(item: &WorkItem, output: &Path, stem: &str) -> Result<()> {
    let asset = item.asset.as_deref().context("item has no asset")?;
    let payload = ImagePayload::from_data_uri(asset).context("asset is not an image")?;
    let extension = payload.mime_type.rsplit('/').next().unwrap_or("png");
    let bytes = STANDARD
        .decode(payload.data.as_bytes())
        .context("asset payload is not valid base64")?;
    let path = output.join(format!("{}.{}", stem, extension));
    fs::write(&path, bytes).with_context(|| format!("failed to write {:?}", path))?;
    println!("Wrote {:?}.", path);
    Ok(())
}
