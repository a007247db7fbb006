use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info};
use serde::Serialize;

use crate::{
    comfy::ComfyClient,
    config::ConfigModule,
    db::{DatabaseModule, ModelType, UserCounts, UserRole},
    gallery::{Gallery, StorageStats},
    patcher::GenerationOptions,
    permissions::CharacterAccess,
    prompt::{OllamaClient, PromptMode},
    studio::Studio,
};

mod catalog;
mod characters;
mod comfy;
mod config;
mod db;
mod dispatcher;
mod error;
mod gallery;
mod metadata;
mod patcher;
mod permissions;
mod prompt;
mod serializer;
mod storage;
mod studio;
mod utils;
mod workflow;

#[derive(Parser, Debug)]
struct CommandLineFlags {
    #[arg(long, short, default_value = "config.toml")]
    pub config_path: PathBuf,
    /// Who is asking. Permissions are looked up for this account.
    #[arg(long, short, default_value = "admin")]
    pub user: String,
    /// Key for the temporary workflow kept between `options` and `generate`. Defaults to the user name.
    #[arg(long, short)]
    pub session: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate images of a character.
    Generate {
        #[arg(long, short)]
        character: String,
        /// Use this prompt as-is.
        #[arg(long, short, conflicts_with = "enhance")]
        prompt: Option<String>,
        /// Have the LLM write a prompt around this idea.
        #[arg(long, short)]
        enhance: Option<String>,
        /// JSON file with advanced options to apply first.
        #[arg(long, short)]
        options: Option<PathBuf>,
    },
    /// Run the latest prompt again.
    Regenerate {
        #[arg(long, short)]
        character: String,
    },
    /// Apply advanced options for the next generation.
    Options {
        #[arg(long, short)]
        character: String,
        /// JSON file with the options.
        options: PathBuf,
    },
    /// Forget the advanced options; the next generation uses the template.
    Reset {
        #[arg(long, short)]
        character: String,
    },
    /// List checkpoints and LoRAs.
    Models,
    /// List configured characters.
    Characters,
    /// List a folder of the image archive.
    Browse {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Delete images from a folder of the archive.
    Delete {
        path: String,
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Image count, storage used and account numbers. Admins only.
    Stats,
    LastSeed,
    /// Print a character's template workflow.
    Workflow {
        #[arg(long, short)]
        character: String,
        /// Print it as an editor document instead.
        #[arg(long)]
        viewer: bool,
    },
    /// Print the prompt and workflow embedded in a PNG.
    Inspect { file: PathBuf },
    /// Account management. Admins only, except for creating the first admin.
    #[command(subcommand)]
    User(UserCommand),
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    Add {
        username: String,
        email: String,
        #[arg(long)]
        admin: bool,
    },
    List,
    Show { username: String },
    /// Approve a pending user, granting every model and character.
    Approve { username: String },
    Reject { username: String },
    Remove { username: String },
    ToggleDelete { username: String },
    /// Replace a user's character permissions.
    Characters {
        username: String,
        #[arg(long)]
        generate: Vec<String>,
        #[arg(long)]
        browse: Vec<String>,
    },
    /// Replace a user's checkpoint or LoRA permissions.
    Models {
        username: String,
        #[arg(value_parser = ["checkpoint", "lora"])]
        kind: String,
        names: Vec<String>,
    },
    /// Show the character access approval grants.
    Defaults,
    /// Replace the character access approval grants. Characters not named get full access.
    SetDefaults {
        #[arg(long)]
        no_generate: Vec<String>,
        #[arg(long)]
        no_browse: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
struct Dashboard {
    storage: StorageStats,
    users: UserCounts,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_options(path: &PathBuf) -> Result<GenerationOptions> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Error reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Error parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();
    let args = CommandLineFlags::parse();

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    // Initialize context.
    let config = ConfigModule::new(&args.config_path).context("failed to initialize config")?;
    let snapshot = config.snapshot().await;
    debug!("Loaded config: {:?}", snapshot);
    let db = DatabaseModule::open(&snapshot.paths.database())?;
    let studio = Studio::new(
        config.clone(),
        db.clone(),
        Arc::new(ComfyClient::new(&snapshot.backend)),
        Arc::new(OllamaClient::new(&snapshot.llm)),
    );
    let user = args.user.as_str();
    let session = args.session.as_deref().unwrap_or(user);

    match args.command {
        Command::Generate {
            character,
            prompt,
            enhance,
            options,
        } => {
            let mode = match (prompt, enhance) {
                (Some(text), _) => PromptMode::Manual(text),
                (None, Some(idea)) => PromptMode::Enhanced(idea),
                (None, None) => PromptMode::Auto,
            };
            let options = options.as_ref().map(read_options).transpose()?;
            let outcome = studio
                .generate(user, session, &character, &mode, options.as_ref())
                .await?;
            println!("Prompt: {}", outcome.prompt);
            if let Some(seed) = outcome.seed {
                println!("Seed: {}", seed);
            }
            println!("Latest: {}", outcome.latest.display());
            for path in &outcome.archived {
                println!("Saved: {}", path.display());
            }
            if outcome.failed_images > 0 {
                println!("Failed: {} image(s)", outcome.failed_images);
            }
        }
        Command::Regenerate { character } => {
            let outcome = studio.regenerate(user, session, &character).await?;
            println!("Latest: {}", outcome.latest.display());
        }
        Command::Options { character, options } => {
            let path = studio
                .update_options(user, session, &character, &read_options(&options)?)
                .await?;
            println!("Saved: {}", path.display());
        }
        Command::Reset { character } => {
            if !studio.reset_options(user, session, &character).await? {
                println!("Nothing to reset");
            }
        }
        Command::Models => print_json(&studio.models().await)?,
        Command::Characters => print_json(&studio.characters().await?)?,
        Command::Browse { path } => {
            let permissions = db.permissions(user).await?;
            print_json(&Gallery::new(snapshot.paths.images()).list(&permissions, &path)?)?;
        }
        Command::Delete { path, files } => {
            let permissions = db.permissions(user).await?;
            print_json(&Gallery::new(snapshot.paths.images()).delete(&permissions, &path, &files)?)?;
        }
        Command::Stats => {
            db.require_admin(user).await?;
            print_json(&Dashboard {
                storage: gallery::stats(&[snapshot.paths.images(), snapshot.paths.latest()]),
                users: db.user_counts().await?,
            })?;
        }
        Command::LastSeed => println!("{}", studio.last_seed().await),
        Command::Workflow { character, viewer } => {
            let workflow = studio.default_workflow(user, &character).await?;
            if viewer {
                println!("{}", serializer::serialize(&workflow).to_json()?);
            } else {
                println!("{}", workflow.to_json_pretty()?);
            }
        }
        Command::Inspect { file } => {
            let bytes = std::fs::read(&file).with_context(|| format!("Error reading {}", file.display()))?;
            print_json(&metadata::read(&bytes)?)?;
        }
        Command::User(command) => {
            authorize(&db, user, &command).await?;
            run_user_command(&studio, &db, command).await?
        }
    }
    Ok(())
}

/// Only admins manage accounts. While there are no accounts at all, anyone may create the first admin.
async fn authorize(db: &DatabaseModule, user: &str, command: &UserCommand) -> Result<()> {
    if let UserCommand::Add { admin: true, .. } = command {
        if db.user_counts().await?.total == 0 {
            info!("Creating the first admin account");
            return Ok(());
        }
    }
    db.require_admin(user).await
}

async fn run_user_command(studio: &Studio, db: &DatabaseModule, command: UserCommand) -> Result<()> {
    match command {
        UserCommand::Add { username, email, admin } => {
            let role = if admin { UserRole::Admin } else { UserRole::User };
            print_json(&db.add_user(&username, &email, role).await?)?;
        }
        UserCommand::List => print_json(&db.list_users().await?)?,
        UserCommand::Show { username } => match db.user(&username).await? {
            Some(user) => print_json(&user)?,
            None => bail!("no such user: {}", username),
        },
        UserCommand::Approve { username } => {
            let catalog = studio.models().await;
            let characters = studio.characters().await?;
            db.approve(&username, &catalog, &characters).await?;
        }
        UserCommand::Reject { username } => db.reject(&username).await?,
        UserCommand::Remove { username } => {
            if !db.delete_user(&username).await? {
                bail!("no such user: {}", username);
            }
        }
        UserCommand::ToggleDelete { username } => {
            let allowed = db.toggle_delete(&username).await?;
            println!("{} {} delete files", username, if allowed { "can" } else { "cannot" });
        }
        UserCommand::Characters {
            username,
            generate,
            browse,
        } => {
            let mut access: BTreeMap<String, CharacterAccess> = BTreeMap::new();
            for name in generate {
                access.entry(name).or_default().can_generate = true;
            }
            for name in browse {
                access.entry(name).or_default().can_browse = true;
            }
            db.set_character_permissions(&username, &access).await?;
        }
        UserCommand::Models { username, kind, names } => {
            let kind = if kind == "lora" { ModelType::Lora } else { ModelType::Checkpoint };
            db.set_model_permissions(&username, kind, &names).await?;
        }
        UserCommand::Defaults => {
            let characters = studio.characters().await?;
            print_json(&db.default_character_permissions(&characters).await?)?;
        }
        UserCommand::SetDefaults {
            no_generate,
            no_browse,
        } => {
            let mut access: BTreeMap<String, CharacterAccess> = BTreeMap::new();
            for name in no_generate {
                access.entry(name).or_insert(CharacterAccess::FULL).can_generate = false;
            }
            for name in no_browse {
                access.entry(name).or_insert(CharacterAccess::FULL).can_browse = false;
            }
            db.set_default_character_permissions(&access).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StudioError;

    fn add(username: &str, admin: bool) -> UserCommand {
        UserCommand::Add {
            username: username.to_string(),
            email: format!("{}@example.com", username),
            admin,
        }
    }

    fn denied(result: Result<()>) -> bool {
        matches!(
            result.unwrap_err().downcast_ref::<StudioError>(),
            Some(StudioError::PermissionDenied(_))
        )
    }

    #[tokio::test]
    async fn test_first_admin_needs_no_account() {
        let db = DatabaseModule::in_memory().unwrap();
        assert!(denied(authorize(&db, "anyone", &add("carol", false)).await));
        authorize(&db, "anyone", &add("root", true)).await.unwrap();

        db.add_user("root", "root@example.com", UserRole::Admin).await.unwrap();
        assert!(denied(authorize(&db, "anyone", &add("eve", true)).await));
        authorize(&db, "root", &add("eve", true)).await.unwrap();
    }

    #[tokio::test]
    async fn test_only_admins_manage_accounts() {
        let db = DatabaseModule::in_memory().unwrap();
        db.add_user("root", "root@example.com", UserRole::Admin).await.unwrap();
        db.add_user("carol", "carol@example.com", UserRole::User).await.unwrap();
        let grant = UserCommand::Models {
            username: "carol".to_string(),
            kind: "checkpoint".to_string(),
            names: vec!["anything.safetensors".to_string()],
        };
        let approve = UserCommand::Approve {
            username: "carol".to_string(),
        };

        // Pending, then approved: still not an admin.
        assert!(denied(authorize(&db, "carol", &approve).await));
        db.approve("carol", &Default::default(), &[]).await.unwrap();
        assert!(denied(authorize(&db, "carol", &grant).await));
        assert!(denied(authorize(&db, "carol", &UserCommand::List).await));

        authorize(&db, "root", &grant).await.unwrap();
        authorize(&db, "root", &UserCommand::SetDefaults {
            no_generate: vec![],
            no_browse: vec![],
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_command_line() {
        let flags = CommandLineFlags::try_parse_from([
            "charactergen",
            "--user",
            "carol",
            "generate",
            "--character",
            "Alice Liddell",
            "--prompt",
            "Alice at tea",
        ])
        .unwrap();
        assert_eq!(flags.user, "carol");
        assert!(matches!(flags.command, Command::Generate { prompt: Some(_), .. }));
        assert!(CommandLineFlags::try_parse_from(["charactergen", "user", "models", "carol", "vae"]).is_err());
    }
}
